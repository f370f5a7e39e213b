pub mod base;
pub mod memory;

pub mod prelude {
    pub use crate::base::{BaseStore, Item, SearchQuery};
    pub use crate::memory::InMemoryStore;
}
