//! The request pipeline.
//!
//! ```text
//! peer check ─▶ direct hostname? ─yes─▶ owner ─▶ state ─────────────────┐
//!                     │no                                               │
//!                     ▼                                                 ▼
//!              path "/" ─▶ probe key ─▶ owner ─▶ state ─▶ activate ─▶ 200
//!                     │
//!                     ▼
//!              bucket ─▶ owner ─▶ state ─▶ key ─▶ method ─▶ policy ─▶ timestamp ─▶ activate ─▶ forward
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use lens3_core::{S3Auth, check_bucket_naming, parse_s3_auth};
use lens3_registry::RegistryError;
use lens3_registry::access::{
    ensure_bucket_policy, ensure_key_permission, ensure_pool_state, ensure_probe_key,
    ensure_secret_owner, ensure_user_is_authorized,
};
use lens3_state::{awaken_suspended, check_pool_state};
use tracing::{debug, info};

use crate::Mux;
use crate::error::{MuxError, MuxResult};

/// Target of the per-request access lines.
pub const ACCESS_LOG: &str = "lens3::access";

/// How the request identifies itself, for the access log.
fn access_user(auth: &S3Auth) -> String {
    match auth {
        S3Auth::Key(key) => format!("user-with-{key}"),
        S3Auth::Absent | S3Auth::Malformed => "public-access-user".to_string(),
    }
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// The `Host` header without its port, lowercased.
fn request_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(HOST)?.to_str().ok()?;
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    Some(name.to_ascii_lowercase())
}

/// The first path segment, or `None` for the root path.
fn bucket_of(uri: &Uri) -> Option<&str> {
    uri.path().trim_start_matches('/').split('/').next().filter(|s| !s.is_empty())
}

/// Axum fallback handler for every S3 request.
pub async fn handle(
    State(mux): State<Arc<Mux>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let upstream_bytes = content_length(req.headers());
    let auth = parse_s3_auth(req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()));
    let user = access_user(&auth);

    let response = match mux.serve(peer, auth, req).await {
        Ok(response) => response,
        Err(e) => {
            debug!(%peer, %method, %uri, error = %e, "request rejected");
            let delay = mux.conf.bad_response_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            e.into_response()
        }
    };

    log_access(&response, peer, &user, &method, &uri, upstream_bytes);
    response
}

fn log_access(response: &Response, peer: SocketAddr, user: &str, method: &Method, uri: &Uri, upstream: u64) {
    let downstream = content_length(response.headers());
    info!(
        target: ACCESS_LOG,
        status = response.status().as_u16(),
        client = %peer.ip(),
        %user,
        %method,
        url = %uri,
        upstream,
        downstream,
        "access"
    );
}

impl Mux {
    async fn serve(&self, peer: SocketAddr, auth: S3Auth, req: Request) -> MuxResult<Response> {
        if !self.peers.is_trusted(&self.tables, peer.ip()).await? {
            return Err(RegistryError::forbidden(format!("Bad access from remote host: {}", peer.ip())).into());
        }

        if let Some(host) = request_host(req.headers())
            && let Some(pool_id) = self.tables.get_direct_hostname(&host).await?
        {
            debug!(%host, %pool_id, "direct hostname access");
            self.ensure_pool_usable(&pool_id, false).await?;
            self.tables.set_access_timestamp(&pool_id).await?;
            let endpoint = self.connector.activate(&pool_id).await?;
            return self.forwarder.forward(req, &endpoint).await;
        }

        let access_key = match &auth {
            S3Auth::Key(key) => Some(key.as_str()),
            S3Auth::Absent => None,
            S3Auth::Malformed => {
                return Err(RegistryError::unauthorized("Malformed authorization").into());
            }
        };

        let Some(bucket) = bucket_of(req.uri()) else {
            return self.probe(access_key).await;
        };
        if !check_bucket_naming(bucket) {
            return Err(RegistryError::bad_request(format!("Bad bucket name: {bucket}")).into());
        }
        let Some(bucket) = self.tables.get_bucket(bucket).await? else {
            return Err(RegistryError::not_found(format!("No bucket: {bucket}")).into());
        };
        let pool_id = bucket.pool_id.as_str();

        self.ensure_pool_usable(pool_id, false).await?;
        if let Some(secret) = ensure_secret_owner(&self.tables, access_key, pool_id).await? {
            if secret.is_probe() {
                return Err(RegistryError::forbidden(format!(
                    "Probe key used for data access: {}",
                    secret.access_key
                ))
                .into());
            }
            ensure_key_permission(req.method().as_str(), secret.key_policy)?;
        }
        ensure_bucket_policy(&bucket, access_key, req.method().as_str())?;

        self.tables.set_access_timestamp(pool_id).await?;
        let endpoint = self.connector.activate(pool_id).await?;
        self.forwarder.forward(req, &endpoint).await
    }

    /// Root path: wakes the backend for a probe key and forwards nothing.
    async fn probe(&self, access_key: Option<&str>) -> MuxResult<Response> {
        let pool_id = ensure_probe_key(&self.tables, access_key).await?;
        self.ensure_pool_usable(&pool_id, true).await?;
        self.tables.set_access_timestamp(&pool_id).await?;
        let endpoint = self.connector.activate(&pool_id).await?;
        debug!(%pool_id, %endpoint, "probe access");
        Ok((StatusCode::OK, Body::empty()).into_response())
    }

    /// Owner enabled and pool state acceptable. A long-suspended pool is
    /// given another chance first.
    async fn ensure_pool_usable(&self, pool_id: &str, allow_initial: bool) -> MuxResult<()> {
        let Some(pool) = self.tables.get_pool(pool_id).await? else {
            return Err(MuxError::from(RegistryError::not_found(format!("No pool: {pool_id}"))));
        };
        ensure_user_is_authorized(&self.tables, &pool.owner_uid).await?;
        awaken_suspended(&self.tables, pool_id, self.conf.busy_suspension_time).await?;
        let (state, _) = check_pool_state(&self.tables, pool_id).await?;
        ensure_pool_state(state, allow_initial)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_host(host: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(HOST, HeaderValue::from_str(host).unwrap());
        h
    }

    #[test]
    fn host_without_port() {
        assert_eq!(request_host(&headers_with_host("WWW.Example.org:8080")).as_deref(), Some("www.example.org"));
        assert_eq!(request_host(&headers_with_host("lens3.local")).as_deref(), Some("lens3.local"));
        assert_eq!(request_host(&headers_with_host("[::1]:8080")).as_deref(), Some("[::1]"));
        assert_eq!(request_host(&HeaderMap::new()), None);
    }

    #[test]
    fn bucket_is_first_segment() {
        let uri: Uri = "/photos/2024/cat.jpg?versionId=1".parse().unwrap();
        assert_eq!(bucket_of(&uri), Some("photos"));
        assert_eq!(bucket_of(&"/".parse().unwrap()), None);
        assert_eq!(bucket_of(&"/photos".parse().unwrap()), Some("photos"));
    }

    #[test]
    fn access_user_names() {
        assert_eq!(access_user(&S3Auth::Absent), "public-access-user");
        assert_eq!(access_user(&S3Auth::Key("k1".into())), "user-with-k1");
    }
}
