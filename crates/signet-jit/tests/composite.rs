//! Composite node splicing.

use signet_jit::{
    AddNode, Composite, ContextOptions, DelayNode, Graph, GraphExecutionContext, GraphProcessor,
    SentinelNode,
};

fn context() -> (GraphExecutionContext, GraphProcessor) {
    GraphExecutionContext::with_default_engine(ContextOptions::default()).expect("host supported")
}

#[test]
fn composite_doubles_through_its_body() {
    let mut graph = Graph::new();
    let input = graph.insert(Box::new(SentinelNode::new(0, 1)));
    let output = graph.insert(Box::new(SentinelNode::new(1, 0)));

    // Body: inner input fans out to both add inputs, add feeds the inner
    // output.
    let composite = Composite::create(&mut graph, 1, 1);
    let add = graph.insert(Box::new(AddNode));
    graph.connect(composite.input, 0, add, 0).unwrap();
    graph.connect(composite.input, 0, add, 1).unwrap();
    graph.connect(add, 0, composite.output, 0).unwrap();

    graph.connect(input, 0, composite.node, 0).unwrap();
    graph.connect(composite.node, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out[0], 2.0);

    // Unplugging the body from the inner output silences the composite.
    graph.disconnect(composite.output, 0).unwrap();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());
    proc.process(0, &[1.0], &mut out);
    assert_eq!(out[0], 0.0);
}

#[test]
fn composite_with_stateful_body() {
    // A delay inside the composite keeps its state across outer samples.
    let mut graph = Graph::new();
    let input = graph.insert(Box::new(SentinelNode::new(0, 1)));
    let output = graph.insert(Box::new(SentinelNode::new(1, 0)));

    let composite = Composite::create(&mut graph, 1, 1);
    let delay = graph.insert(Box::new(DelayNode));
    graph.connect(composite.input, 0, delay, 0).unwrap();
    graph.connect(delay, 0, composite.output, 0).unwrap();

    graph.connect(input, 0, composite.node, 0).unwrap();
    graph.connect(composite.node, 0, output, 0).unwrap();

    let (mut ctx, mut proc) = context();
    ctx.compile(&graph, &[input], &[output]).unwrap();
    assert!(proc.update_program());

    let mut out = [0.0f32];
    proc.process(0, &[3.0], &mut out);
    assert_eq!(out[0], 0.0);
    proc.process(0, &[5.0], &mut out);
    assert_eq!(out[0], 3.0);
}

#[test]
fn composite_arity_edits_propagate_to_sentinels() {
    let mut graph = Graph::new();
    let composite = Composite::create(&mut graph, 1, 1);

    composite.add_input(&mut graph).unwrap();
    assert_eq!(graph.input_count(composite.node).unwrap(), 2);
    assert_eq!(graph.output_count(composite.input).unwrap(), 2);

    composite.add_output(&mut graph).unwrap();
    assert_eq!(graph.output_count(composite.node).unwrap(), 2);
    assert_eq!(graph.input_count(composite.output).unwrap(), 2);

    composite.remove_input(&mut graph).unwrap();
    assert_eq!(graph.input_count(composite.node).unwrap(), 1);
    assert_eq!(graph.output_count(composite.input).unwrap(), 1);
}
