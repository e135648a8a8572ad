//! lens3-state: shared state for Lens3.
//!
//! Every Mux and Manager process coordinates only through a key-value
//! store with Redis semantics (GET/SET/SETNX/DEL/EXPIRE/SCAN). This crate
//! wraps it with typed records and the pool state machine.
//!
//! # Architecture
//!
//! The store is split into five namespaces (see [`tables::Namespace`]),
//! each a separate Redis logical database. Keys are a short prefix plus an
//! entity id (`po:{pool_id}`, `bk:{bucket}`); values are JSON.
//!
//! [`Tables`] is `Clone` + `Send` + `Sync` and can be shared across async
//! tasks. [`MemoryKv`] implements the same contract in-process, including
//! key expiry, for tests.

pub mod error;
pub mod kv;
pub mod pool_state;
pub mod redis_kv;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use kv::{KvStore, MemoryKv};
pub use redis_kv::RedisKv;
pub use pool_state::{awaken_suspended, check_pool_state, reason, recompute, update_pool_state};
pub use store::Tables;
pub use types::*;
