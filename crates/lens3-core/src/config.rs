//! lens3.toml configuration parser.
//!
//! One file is shared by the Mux and the Manager. Every field has a
//! default, so a section may be left out entirely. Durations are whole
//! seconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Lens3Config {
    pub redis: RedisConf,
    pub mux: MuxConf,
    pub manager: ManagerConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConf {
    /// Base URL without a database number, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    pub connect_retries: u32,
    pub connect_retry_interval: u64,
}

impl Default for RedisConf {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_retries: 30,
            connect_retry_interval: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConf {
    /// Value placed in the `Host` header of forwarded requests.
    pub front_host: String,
    /// Hosts allowed to connect besides other Mux instances.
    pub trusted_proxies: Vec<String>,
    pub mux_expiry: u64,
    pub mux_heartbeat_interval: u64,
    pub forwarding_timeout: u64,
    pub bad_response_delay: u64,
    pub busy_suspension_time: u64,
    pub max_pool_expiry: u64,
    /// Executable started to run a Manager (normally `lens3d` itself).
    pub manager_command: PathBuf,
    pub spawn_extra_timeout: u64,
}

impl Default for MuxConf {
    fn default() -> Self {
        Self {
            front_host: "localhost".to_string(),
            trusted_proxies: vec!["localhost".to_string()],
            mux_expiry: 180,
            mux_heartbeat_interval: 60,
            forwarding_timeout: 60,
            bad_response_delay: 1,
            busy_suspension_time: 180,
            max_pool_expiry: 365 * 24 * 3600,
            manager_command: PathBuf::from("lens3d"),
            spawn_extra_timeout: 15,
        }
    }
}

impl MuxConf {
    pub fn forwarding_timeout(&self) -> Duration {
        Duration::from_secs(self.forwarding_timeout)
    }

    pub fn mux_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.mux_heartbeat_interval)
    }

    pub fn bad_response_delay(&self) -> Duration {
        Duration::from_secs(self.bad_response_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConf {
    /// Privilege-drop command; empty runs the backend as the current user.
    pub sudo: String,
    pub minio: PathBuf,
    pub mc: PathBuf,
    pub port_min: u16,
    pub port_max: u16,
    pub minio_awake_duration: u64,
    pub minio_setup_at_start: bool,
    pub heartbeat_interval: u64,
    pub heartbeat_miss_tolerance: u32,
    pub heartbeat_timeout: u64,
    pub minio_start_timeout: u64,
    pub minio_setup_timeout: u64,
    pub minio_stop_timeout: u64,
    pub minio_mc_timeout: u64,
}

impl Default for ManagerConf {
    fn default() -> Self {
        Self {
            sudo: "/usr/bin/sudo".to_string(),
            minio: PathBuf::from("/usr/local/bin/minio"),
            mc: PathBuf::from("/usr/local/bin/mc"),
            port_min: 28000,
            port_max: 28999,
            minio_awake_duration: 900,
            minio_setup_at_start: true,
            heartbeat_interval: 60,
            heartbeat_miss_tolerance: 3,
            heartbeat_timeout: 30,
            minio_start_timeout: 60,
            minio_setup_timeout: 60,
            minio_stop_timeout: 30,
            minio_mc_timeout: 10,
        }
    }
}

impl ManagerConf {
    /// TTL put on the manager, process, and endpoint records. Long enough
    /// to survive `heartbeat_miss_tolerance` missed heartbeats plus slack.
    pub fn manager_expiry(&self) -> Duration {
        let cycles = u64::from(self.heartbeat_miss_tolerance) + 1 + 2;
        Duration::from_secs(cycles * (self.heartbeat_interval + self.heartbeat_timeout))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.minio_start_timeout)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.minio_setup_timeout)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.minio_stop_timeout)
    }

    pub fn mc_timeout(&self) -> Duration {
        Duration::from_secs(self.minio_mc_timeout)
    }

    /// How long a waiter polls for another Manager's endpoint.
    pub fn activation_wait(&self) -> Duration {
        self.start_timeout() + self.setup_timeout()
    }
}

impl Lens3Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Lens3Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let m = &self.manager;
        anyhow::ensure!(
            m.port_min > 0 && m.port_min <= m.port_max,
            "bad port range: {}..{}",
            m.port_min,
            m.port_max
        );
        anyhow::ensure!(m.heartbeat_interval > 0, "heartbeat_interval must be positive");
        anyhow::ensure!(self.mux.mux_expiry > 0, "mux_expiry must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Lens3Config::from_toml("").unwrap();
        assert_eq!(config.manager.port_min, 28000);
        assert_eq!(config.mux.spawn_extra_timeout, 15);
    }

    #[test]
    fn manager_expiry_formula() {
        let toml_str = r#"
[manager]
heartbeat_interval = 10
heartbeat_timeout = 5
heartbeat_miss_tolerance = 2
"#;
        let config = Lens3Config::from_toml(toml_str).unwrap();
        // (2 + 3) * (10 + 5)
        assert_eq!(config.manager.manager_expiry(), Duration::from_secs(75));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let toml_str = r#"
[manager]
port_min = 9000
port_max = 8000
"#;
        assert!(Lens3Config::from_toml(toml_str).is_err());
    }

    #[test]
    fn reads_file_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lens3.toml");
        let mut config = Lens3Config::default();
        config.mux.front_host = "lens3.example.org".to_string();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = Lens3Config::from_file(&path).unwrap();
        assert_eq!(loaded.mux.front_host, "lens3.example.org");
    }

    #[test]
    fn shipped_sample_parses() {
        let config = Lens3Config::from_toml(include_str!("../../../conf/lens3.toml")).unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6378");
        assert_eq!(config.mux.manager_command, PathBuf::from("/usr/local/bin/lens3d"));
        assert_eq!(config.manager.port_max, 28999);
    }
}
