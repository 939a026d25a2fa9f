pub mod persist_queue;
pub mod record;
pub mod service;
pub mod store;
pub mod sweeper;

pub use persist_queue::{PersistOptions, PersistQueue, PersistStats};
pub use record::PersistentRecord;
pub use service::{
    FallbackMode, StorageError, StorageOptions, StorageResult, StorageService, StorageStatus,
    StorageStrategy,
};
pub use store::{PostgresRecordStore, RecordStore, SqliteDocumentStore, StoreError};
pub use sweeper::spawn_expiry_sweeper;
