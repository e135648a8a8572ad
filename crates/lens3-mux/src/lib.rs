//! lens3-mux: the S3 request router.
//!
//! Every request goes to one fallback handler, which finds the pool from
//! the bucket (or the direct hostname), runs the access checks, stamps the
//! pool's access time, makes sure a backend runs, and relays the request.
//!
//! # Status codes
//!
//! | Condition | Status |
//! |---|---|
//! | untrusted peer, disabled user or pool, foreign or expired key | 403 |
//! | method outside the key or bucket policy, probe key on a bucket | 403 |
//! | missing key on a private bucket, unknown key, bad probe key | 401 |
//! | bad bucket name | 400 |
//! | unknown bucket or pool | 404 |
//! | pool not set up, suspended, backend unreachable | 503 |
//! | pool inoperable, backend protocol error | 500 |
//!
//! Error statuses returned by a backend are relayed unchanged.

pub mod error;
pub mod forward;
pub mod handler;
pub mod peers;
pub mod registration;

use std::sync::Arc;

use axum::Router;
use lens3_core::MuxConf;
use lens3_registry::BackendConnector;
use lens3_state::Tables;

pub use error::{MuxError, MuxResult};
pub use forward::Forwarder;
pub use handler::ACCESS_LOG;
pub use peers::TrustedPeers;
pub use registration::run_registration;

/// Shared state of the request handler.
pub struct Mux {
    tables: Tables,
    conf: MuxConf,
    peers: TrustedPeers,
    connector: Arc<dyn BackendConnector>,
    forwarder: Forwarder,
}

impl Mux {
    pub fn new(
        tables: Tables,
        conf: MuxConf,
        peers: TrustedPeers,
        connector: Arc<dyn BackendConnector>,
    ) -> MuxResult<Self> {
        let forwarder = Forwarder::new(&conf.front_host, conf.forwarding_timeout())?;
        Ok(Self {
            tables,
            conf,
            peers,
            connector,
            forwarder,
        })
    }
}

/// Build the router. Serve it with connect info so the handler sees the
/// peer address.
pub fn build_router(mux: Arc<Mux>) -> Router {
    Router::new().fallback(handler::handle).with_state(mux)
}
