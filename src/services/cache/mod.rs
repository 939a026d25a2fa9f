pub mod client;
pub mod groups;
pub mod keys;
pub mod memory;
pub mod noop;
pub mod service;
pub mod valkey;

pub use client::{CacheClient, CacheError, CacheResult};
pub use keys::{KeyPattern, KeyScheme};
pub use memory::MemoryClient;
pub use noop::NoopClient;
pub use service::{CacheService, CacheStats};
pub use valkey::ValkeyClient;
