pub mod document_account_repository;
pub mod in_memory_account_repository;

pub use document_account_repository::{ACCOUNT_INDEX, DocumentAccountRepository};
pub use in_memory_account_repository::InMemoryAccountRepository;
