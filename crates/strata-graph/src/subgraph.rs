use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use strata_checkpoint::command::CommandGraph;

use crate::compiled::{CompiledStateGraph, NestedOutput};
use crate::node::{NodeContext, NodeFn, NodeOutput};

fn remap(source: &Value, mapping: &HashMap<String, String>) -> Value {
    let mut out = Map::new();
    if let Value::Object(fields) = source {
        for (from, to) in mapping {
            if let Some(val) = fields.get(from) {
                out.insert(to.clone(), val.clone());
            }
        }
    }
    Value::Object(out)
}

/// Create a `NodeFn` that executes a sub-graph as a node in a parent graph.
///
/// - `name`: the node name in the parent graph
/// - `inner_graph`: the compiled sub-graph to execute
/// - `input_mapping`: maps parent state keys to sub-graph input keys
///   e.g., `{"parent_messages" => "messages"}` means the parent's "parent_messages"
///   channel value is passed as "messages" to the sub-graph input.
/// - `output_mapping`: maps sub-graph output keys to parent state update keys
///   e.g., `{"result" => "sub_result"}` means the sub-graph's "result" output
///   is written to the parent's "sub_result" channel.
///
/// If input_mapping is empty, the entire parent state is passed as sub-graph input.
/// If output_mapping is empty, the entire sub-graph output is returned as-is.
///
/// Supersteps of the sub-graph count against the parent run's recursion
/// limit. When a node inside the sub-graph returns a command addressed to
/// the parent, the sub-graph stops and this node emits that command (update
/// and goto) as its own output.
pub fn subgraph_node(
    name: impl Into<String>,
    inner_graph: Arc<CompiledStateGraph>,
    input_mapping: HashMap<String, String>,
    output_mapping: HashMap<String, String>,
) -> NodeFn {
    let input_mapping = Arc::new(input_mapping);
    let output_mapping = Arc::new(output_mapping);
    NodeFn::new(name, move |state: Value, ctx: NodeContext| {
        let graph = Arc::clone(&inner_graph);
        let in_map = Arc::clone(&input_mapping);
        let out_map = Arc::clone(&output_mapping);
        async move {
            let sub_input = if in_map.is_empty() {
                state
            } else {
                remap(&state, &in_map)
            };

            match graph.invoke_nested(sub_input, &ctx).await? {
                NestedOutput::State(sub_state) if out_map.is_empty() => {
                    Ok(NodeOutput::Update(sub_state))
                }
                NestedOutput::State(sub_state) => Ok(NodeOutput::Update(remap(&sub_state, &out_map))),
                NestedOutput::Parent(mut cmd) => {
                    cmd.graph = CommandGraph::Current;
                    Ok(NodeOutput::Command(cmd))
                }
            }
        }
    })
}
