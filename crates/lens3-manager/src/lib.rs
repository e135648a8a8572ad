//! lens3-manager: backend supervision for Lens3.
//!
//! One Manager process runs per pool activation. It takes the pool's
//! manager record as a mutex, starts the backend on a free port, reconciles
//! its buckets and keys, publishes its endpoint, and then watches it until
//! a termination condition, after which it removes what it published.
//!
//! The Mux side of the handoff lives here too: [`Spawner`] starts a
//! Manager process and reads its one-line answer, and [`Activator`] wraps
//! that as a [`lens3_registry::BackendConnector`].

pub mod activation;
pub mod backend;
pub mod checker;
pub mod error;
pub mod manager;
pub mod setup;
pub mod spawner;

pub use activation::Activator;
pub use error::{ManagerError, ManagerResult};
pub use manager::{Manager, ManagerArgs, Outcome, Termination};
pub use spawner::Spawner;
