pub mod checkpointer;
pub mod command;
pub mod config_ext;
pub mod memory;
pub mod send;
pub mod sqlite;
pub mod types;

pub mod prelude {
    pub use crate::checkpointer::Checkpointer;
    pub use crate::command::{Command, CommandGraph, Goto};
    pub use crate::config_ext::{config_keys, CheckpointConfigExt};
    pub use crate::memory::MemoryCheckpointer;
    pub use crate::send::SendDirective;
    pub use crate::sqlite::SqliteCheckpointer;
    pub use crate::types::{
        Checkpoint, CheckpointMetadata, CheckpointSource, GraphOutput, PendingWrite,
    };
}
