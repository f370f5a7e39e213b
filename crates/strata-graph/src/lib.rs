pub mod channel;
pub mod compiled;
pub mod constants;
pub mod edge;
pub mod node;
mod run_loop;
pub mod state_graph;
pub mod stream;
pub mod subgraph;
pub mod time_travel;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use strata_checkpoint::prelude::{
        CheckpointConfigExt, Command, GraphOutput, Goto, SendDirective,
    };

    pub use crate::channel::{
        AggregateOp, AppendChannel, BinaryOperatorAggregate, Channel, ChannelSpec, EphemeralValue,
        LastValue, TopicChannel,
    };
    pub use crate::compiled::{CompiledStateGraph, NestedOutput};
    pub use crate::constants::{END, START};
    pub use crate::edge::{ConditionalEdge, Edge};
    pub use crate::node::{NodeContext, NodeFn, NodeOutput};
    pub use crate::state_graph::StateGraph;
    pub use crate::stream::{StreamEvent, StreamMode, TaskUpdate};
    pub use crate::subgraph::subgraph_node;
    pub use crate::time_travel::{fork_from_checkpoint, StateSnapshot};
}
