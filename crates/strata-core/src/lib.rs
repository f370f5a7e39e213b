pub mod config;
pub mod error;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::RunnableConfig;
    pub use crate::error::{GraphError, Result, StoreError, StrataError};
}
