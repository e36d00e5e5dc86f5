// Module declarations
pub mod bootstrap;
pub mod config;
pub mod persistence;
pub mod store;
pub mod telemetry;

// Re-export the backends and their wiring
pub use bootstrap::{build_account_repository, build_document_store};
pub use config::{BackendKind, ConfigError, Credentials, StoreConfig};
pub use persistence::{ACCOUNT_INDEX, DocumentAccountRepository, InMemoryAccountRepository};
pub use store::{ElasticsearchClient, InMemoryDocumentStore, RefreshPolicy};
pub use telemetry::init_tracing;
