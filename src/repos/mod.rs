pub mod document_repo;
pub mod error;
pub mod record_repo;
