pub mod accessor;
pub mod cache;
pub mod connection;
pub(crate) mod lock;
pub mod retry;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;
