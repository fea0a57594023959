//! Tollgate Storage - Key-Value Store Backends
//!
//! The [`KeyValueStore`] contract the guard is built on, a process-local
//! [`InMemoryStore`], a Redis adapter behind the `redis` feature, and the
//! factory and registry used to select one from configuration.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod registry;
pub mod traits;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisStore;
pub use registry::{default_store, open_store, BackendKind, StoreProvider, StoreRegistry};
pub use traits::{KeyValueStore, SlidingWindowLog, WindowAdmission};
