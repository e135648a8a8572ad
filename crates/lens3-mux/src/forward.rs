//! Relaying a request to a backend.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::header::HOST;
use http::{HeaderValue, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{MuxError, MuxResult};

/// A pooled HTTP/1 client that rewrites `Host` to the front host name,
/// which is the name the backends see in signed requests.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    front_host: HeaderValue,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(front_host: &str, timeout: Duration) -> MuxResult<Self> {
        let front_host = HeaderValue::from_str(front_host)
            .map_err(|e| MuxError::Protocol(format!("bad front host {front_host}: {e}")))?;
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            front_host,
            timeout,
        })
    }

    /// Sends `req` to `http://{endpoint}` with its path and query. Error
    /// statuses from the backend are relayed as is.
    pub async fn forward(&self, mut req: Request, endpoint: &str) -> MuxResult<Response> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{endpoint}{path}")
            .parse()
            .map_err(|e| MuxError::Protocol(format!("bad upstream uri: {e}")))?;
        *req.uri_mut() = uri;
        req.headers_mut().insert(HOST, self.front_host.clone());

        let response = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_connect() => return Err(MuxError::Unreachable(e.to_string())),
            Ok(Err(e)) => return Err(MuxError::Protocol(e.to_string())),
            Err(_) => return Err(MuxError::Unreachable("forwarding timed out".to_string())),
        };
        debug!(%endpoint, status = %response.status(), "backend answered");
        Ok(response.map(Body::new))
    }
}
