//! End-to-end compilation and hot-swap scenarios.

use signet_jit::{
    AddNode, ConstantNode, ContextOptions, DelayNode, GlobalRefNode, Graph,
    GraphExecutionContext, GraphProcessor, MulNode, NodeId, ReferenceNode, SentinelNode,
    StaticValueNode,
};

fn context() -> (GraphExecutionContext, GraphProcessor) {
    GraphExecutionContext::with_default_engine(ContextOptions::default()).expect("host supported")
}

fn context_with_instances(instance_count: usize) -> (GraphExecutionContext, GraphProcessor) {
    GraphExecutionContext::with_default_engine(ContextOptions {
        instance_count,
        ..ContextOptions::default()
    })
    .expect("host supported")
}

fn input_node(graph: &mut Graph) -> NodeId {
    graph.insert(Box::new(SentinelNode::new(0, 1)))
}

fn output_node(graph: &mut Graph) -> NodeId {
    graph.insert(Box::new(SentinelNode::new(1, 0)))
}

#[test]
fn input_to_output() {
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let output = output_node(&mut graph);
    graph.connect(input, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[42.0], &mut out);
    assert_eq!(out[0], 42.0);
}

#[test]
fn output_alone_yields_zero() {
    let mut graph = Graph::new();
    let output = output_node(&mut graph);

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [42.0f32];
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 0.0);
}

#[test]
fn binary_add() {
    let mut graph = Graph::new();
    let in1 = input_node(&mut graph);
    let in2 = input_node(&mut graph);
    let add = graph.insert(Box::new(AddNode));
    let output = output_node(&mut graph);
    graph.connect(in1, 0, add, 0).unwrap();
    graph.connect(in2, 0, add, 1).unwrap();
    graph.connect(add, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[in1, in2], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[1.0, 10.0], &mut out);
    assert_eq!(out[0], 11.0);
}

#[test]
fn constant_and_multiply() {
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let half = graph.insert(Box::new(ConstantNode::new(0.5)));
    let mul = graph.insert(Box::new(MulNode));
    let output = output_node(&mut graph);
    graph.connect(input, 0, mul, 0).unwrap();
    graph.connect(half, 0, mul, 1).unwrap();
    graph.connect(mul, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[8.0], &mut out);
    assert_eq!(out[0], 4.0);
}

#[test]
fn integrator_via_feedback_cycle() {
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let add = graph.insert(Box::new(AddNode));
    let output = output_node(&mut graph);
    graph.connect(input, 0, add, 0).unwrap();
    // Feedback: the cycle gets exactly one sample of delay.
    graph.connect(add, 0, add, 1).unwrap();
    graph.connect(add, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    for expected in [1.0, 2.0] {
        proc.process(0, &[1.0], &mut out);
        assert_eq!(out[0], expected);
    }

    // Recompiling without structural changes preserves the feedback state.
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());
    for expected in [3.0, 4.0] {
        proc.process(0, &[1.0], &mut out);
        assert_eq!(out[0], expected);
    }

    // Removing the feedback edge turns the integrator back into a
    // passthrough.
    graph.disconnect(add, 1).unwrap();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out[0], 1.0);
}

#[test]
fn one_sample_delay() {
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let delay = graph.insert(Box::new(DelayNode));
    let output = output_node(&mut graph);
    graph.connect(input, 0, delay, 0).unwrap();
    graph.connect(delay, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());
    proc.initialize_state(0);

    let mut out = [0.0f32];
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out[0], 0.0);
    proc.process(0, &[2.0], &mut out);
    assert_eq!(out[0], 1.0);
    proc.process(0, &[2.0], &mut out);
    assert_eq!(out[0], 2.0);

    // Re-initializing resets the delay line.
    proc.initialize_state(0);
    proc.process(0, &[2.0], &mut out);
    assert_eq!(out[0], 0.0);
}

#[test]
fn delay_breaks_a_cycle_without_extra_delay() {
    // in -> add -> delay -> add (feedback): a z^-1 integrator. The delay's
    // non-dependant emission provides the loop's sample of delay, so the
    // sum still advances on every call.
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let add = graph.insert(Box::new(AddNode));
    let delay = graph.insert(Box::new(DelayNode));
    let output = output_node(&mut graph);
    graph.connect(input, 0, add, 0).unwrap();
    graph.connect(add, 0, delay, 0).unwrap();
    graph.connect(delay, 0, add, 1).unwrap();
    graph.connect(add, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());
    proc.initialize_state(0);

    let mut out = [0.0f32];
    for expected in [1.0, 2.0, 3.0, 4.0] {
        proc.process(0, &[1.0], &mut out);
        assert_eq!(out[0], expected);
    }
}

#[test]
fn memoised_node_is_emitted_once() {
    // Both output slots read the same integrator; if it were emitted twice
    // the feedback would advance twice per call.
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let add = graph.insert(Box::new(AddNode));
    let output = graph.insert(Box::new(SentinelNode::new(2, 0)));
    graph.connect(input, 0, add, 0).unwrap();
    graph.connect(add, 0, add, 1).unwrap();
    graph.connect(add, 0, output, 0).unwrap();
    graph.connect(add, 0, output, 1).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32; 2];
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out, [1.0, 1.0]);
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out, [2.0, 2.0]);
}

#[test]
fn instances_have_independent_state() {
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let add = graph.insert(Box::new(AddNode));
    let output = output_node(&mut graph);
    graph.connect(input, 0, add, 0).unwrap();
    graph.connect(add, 0, add, 1).unwrap();
    graph.connect(add, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context_with_instances(2);
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[1.0], &mut out);
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out[0], 2.0);

    proc.process(1, &[1.0], &mut out);
    assert_eq!(out[0], 1.0);
}

#[test]
fn reference_node_reads_the_client_float() {
    let cell = Box::new(1.25f32);

    let mut graph = Graph::new();
    let reference = graph.insert(Box::new(ReferenceNode::new(&*cell)));
    let output = output_node(&mut graph);
    graph.connect(reference, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 1.25);
    drop(cell);
}

#[test]
fn global_constant_binds_at_compile_time() {
    let mut graph = Graph::new();
    let gain = graph.insert(Box::new(GlobalRefNode::new("gain")));
    let output = output_node(&mut graph);
    graph.connect(gain, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.set_global_constant("gain", 2.0);
    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 2.0);

    // The running program keeps the old value until recompiled.
    ctx.set_global_constant("gain", 3.0);
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 2.0);

    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 3.0);
}

#[test]
fn static_memory_hot_swap() {
    let mut graph = Graph::new();
    let node = graph.insert(Box::new(StaticValueNode));
    let output = output_node(&mut graph);
    graph.connect(node, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.register_static_memory_chunk(&graph, node, 42.0f32.to_ne_bytes().to_vec())
        .unwrap();
    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 42.0);

    // A replacement chunk only takes effect on the next compilation; the
    // old bytes stay alive for the running program.
    ctx.register_static_memory_chunk(&graph, node, 11.0f32.to_ne_bytes().to_vec())
        .unwrap();
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 42.0);

    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 11.0);

    // Without a chunk the node degrades to a zero output.
    ctx.free_static_memory_chunk(node);
    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());
    proc.process(0, &[], &mut out);
    assert_eq!(out[0], 0.0);
}

#[test]
fn update_program_is_idempotent_on_an_empty_queue() {
    let mut graph = Graph::new();
    let output = output_node(&mut graph);

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[], &[output]).unwrap();
    assert!(proc.update_program());
    assert!(!proc.update_program());
    assert!(!proc.update_program());
}

#[test]
fn state_survives_while_the_node_stays_in_use() {
    // Compile thread and audio thread running concurrently: the program
    // is recompiled while the audio side keeps processing and swapping.
    let mut graph = Graph::new();
    let input = input_node(&mut graph);
    let add = graph.insert(Box::new(AddNode));
    let output = output_node(&mut graph);
    graph.connect(input, 0, add, 0).unwrap();
    graph.connect(add, 0, add, 1).unwrap();
    graph.connect(add, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();

    let audio = std::thread::spawn(move || {
        let mut out = [0.0f32];
        let mut last = 0.0f32;
        for _ in 0..20_000 {
            proc.update_program();
            proc.process(0, &[1.0], &mut out);
            // The running sum never decreases and never skips more than
            // one step per call, whichever program is in place.
            assert!(out[0] >= last && out[0] <= last + 1.0 + f32::EPSILON);
            last = out[0];
        }
        last
    });

    for _ in 0..50 {
        ctx.compile(&graph, &[input], &[output]).unwrap();
    }

    let last = audio.join().unwrap();
    assert!(last > 0.0);
}
