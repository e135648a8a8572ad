//! Backend liveness probe and heartbeat miss counting.

use std::time::Duration;

use tracing::{debug, warn};

/// Path answered by a live MinIO.
pub const LIVENESS_PATH: &str = "/minio/health/live";

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Counts consecutive missed heartbeats against a tolerance.
#[derive(Debug)]
pub struct HeartbeatTracker {
    misses: u32,
    tolerance: u32,
}

impl HeartbeatTracker {
    pub fn new(tolerance: u32) -> Self {
        Self { misses: 0, tolerance }
    }

    /// Records a probe. Returns true once misses exceed the tolerance.
    pub fn record(&mut self, result: ProbeResult) -> bool {
        match result {
            ProbeResult::Healthy => {
                if self.misses > 0 {
                    debug!(misses = self.misses, "backend heartbeat recovered");
                }
                self.misses = 0;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.misses += 1;
                warn!(misses = self.misses, tolerance = self.tolerance, "backend heartbeat missed");
            }
        }
        self.exceeded()
    }

    pub fn exceeded(&self) -> bool {
        self.misses > self.tolerance
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "lens3-manager/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}
