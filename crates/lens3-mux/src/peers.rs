//! Which hosts may talk to the Mux.
//!
//! Configured front proxies are resolved once at startup. Fellow Mux
//! instances come from the `mx:` records and are cached; a miss refreshes
//! the cache before rejecting, so a newly started Mux is admitted on its
//! first request.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

use lens3_state::{StateResult, Tables};
use tracing::{debug, warn};

pub struct TrustedPeers {
    proxies: HashSet<IpAddr>,
    muxs: RwLock<HashSet<IpAddr>>,
}

impl TrustedPeers {
    pub fn new(proxies: HashSet<IpAddr>) -> Self {
        Self {
            proxies,
            muxs: RwLock::new(HashSet::new()),
        }
    }

    /// Resolves host names to addresses. Unresolvable names are skipped.
    pub async fn resolve(hosts: &[String]) -> HashSet<IpAddr> {
        let mut out = HashSet::new();
        for host in hosts {
            if let Ok(ip) = host.parse::<IpAddr>() {
                out.insert(ip);
                continue;
            }
            match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => out.extend(addrs.map(|a| a.ip())),
                Err(e) => warn!(%host, error = %e, "cannot resolve trusted host"),
            }
        }
        out
    }

    fn is_known(&self, ip: IpAddr) -> bool {
        self.proxies.contains(&ip) || self.muxs.read().unwrap_or_else(PoisonError::into_inner).contains(&ip)
    }

    /// Checks the caches, then refreshes the Mux list once on a miss.
    pub async fn is_trusted(&self, tables: &Tables, ip: IpAddr) -> StateResult<bool> {
        let ip = canonical(ip);
        if self.is_known(ip) {
            return Ok(true);
        }
        self.refresh(tables).await?;
        Ok(self.is_known(ip))
    }

    async fn refresh(&self, tables: &Tables) -> StateResult<()> {
        let hosts: Vec<String> = tables.list_muxs().await?.into_iter().map(|m| m.host).collect();
        let resolved = Self::resolve(&hosts).await;
        debug!(count = resolved.len(), "mux peers refreshed");
        *self.muxs.write().unwrap_or_else(PoisonError::into_inner) = resolved;
        Ok(())
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
