pub mod memory;
pub mod types;
pub use memory::InMemoryDraftStore;
pub use types::{DraftStore, StoreError};
