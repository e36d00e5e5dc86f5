pub mod elasticsearch;
pub mod in_memory_store;

pub use elasticsearch::{ElasticsearchClient, RefreshPolicy};
pub use in_memory_store::InMemoryDocumentStore;
