//! lens3-registry: the pool registry for Lens3.
//!
//! Create, list, and delete pools, buckets, and access-keys on top of
//! [`lens3_state::Tables`]. Uniqueness of pool-ids, buckets-directories,
//! bucket names, and access-keys is enforced by set-if-absent claims;
//! partially built records are rolled back explicitly.
//!
//! # Components
//!
//! - **Registry**: the CRUD operations and their rollbacks
//! - **Access checks**: user, pool-state, key, and bucket-policy checks
//!   shared with the Mux
//! - **Backend admin**: the [`BackendAdmin`] contract for provisioning
//!   buckets and keys inside a running backend, and [`McAdmin`], its
//!   implementation over the `mc` CLI

pub mod access;
pub mod admin;
pub mod error;
pub mod registry;

pub use admin::{BackendAdmin, BackendConnector, LiveSecret, McAdmin};
pub use error::{RegistryError, RegistryResult};
pub use registry::{PoolDescription, Registry};
