use signet_ir as ir;

use crate::compiler::GraphCompiler;
use crate::error::{CompileError, GraphError};
use crate::graph::{CompileNode, Graph, NodeId, SentinelNode};

/// A node whose implementation is an internal sub-graph.
///
/// The composite owns two sentinel nodes living in the same arena: an input
/// sentinel with one output per composite input, and an output sentinel
/// with one input per composite output. On emission the composite assigns
/// its caller-provided input values to the input sentinel in a fresh memo
/// scope, asks the compiler for the values feeding the output sentinel, and
/// returns those as its own outputs, splicing the sub-graph transparently
/// into the surrounding compilation. Each emission re-evaluates the body in
/// its own scope, so the internal wiring may reference any node of the
/// arena without leaking memoised values across scopes.
///
/// [`Composite::create`] returns a cheap handle carrying the three node
/// ids; use it for arity edits so outer and sentinel arities stay in step.
#[derive(Debug, Clone, Copy)]
pub struct Composite {
    /// The composite node itself.
    pub node: NodeId,
    /// Inner input sentinel (0 inputs, I outputs).
    pub input: NodeId,
    /// Inner output sentinel (O inputs, 0 outputs).
    pub output: NodeId,
}

impl Composite {
    /// Insert a composite of the given arity into `graph`.
    pub fn create(graph: &mut Graph, input_count: u32, output_count: u32) -> Composite {
        let input = graph.insert(Box::new(SentinelNode::new(0, input_count)));
        let output = graph.insert(Box::new(SentinelNode::new(output_count, 0)));
        let node = graph.insert(Box::new(CompositeNode {
            input,
            output,
            input_count,
            output_count,
        }));
        Composite { node, input, output }
    }

    /// Add an outer input, growing the inner input sentinel to match.
    pub fn add_input(&self, graph: &mut Graph) -> Result<(), GraphError> {
        graph.add_input(self.node)?;
        graph.add_output(self.input)
    }

    /// Remove the last outer input and the matching sentinel output.
    pub fn remove_input(&self, graph: &mut Graph) -> Result<(), GraphError> {
        graph.remove_input(self.node)?;
        graph.remove_output(self.input)
    }

    /// Add an outer output, growing the inner output sentinel to match.
    pub fn add_output(&self, graph: &mut Graph) -> Result<(), GraphError> {
        graph.add_output(self.node)?;
        graph.add_input(self.output)
    }

    /// Remove the last outer output and the matching sentinel input.
    pub fn remove_output(&self, graph: &mut Graph) -> Result<(), GraphError> {
        graph.remove_output(self.node)?;
        graph.remove_input(self.output)
    }
}

struct CompositeNode {
    input: NodeId,
    output: NodeId,
    input_count: u32,
    output_count: u32,
}

impl CompileNode for CompositeNode {
    fn input_count(&self) -> u32 {
        self.input_count
    }

    fn output_count(&self) -> u32 {
        self.output_count
    }

    fn emit_outputs(
        &self,
        compiler: &mut GraphCompiler<'_, '_>,
        graph: &Graph,
        inputs: &[ir::Value],
        _mutable_state: Option<ir::Value>,
        _static_memory: Option<ir::Value>,
    ) -> Result<Vec<ir::Value>, CompileError> {
        let mut inner = compiler.sub_compiler();
        inner.assign_values(self.input, inputs.to_vec());

        let output_count = graph.input_count(self.output)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for i in 0..output_count {
            let source = graph.input(self.output, i)?;
            outputs.push(inner.node_value(graph, source)?);
        }
        inner.flush_pushes(graph)?;
        Ok(outputs)
    }
}
