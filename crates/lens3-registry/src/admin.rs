//! Provisioning inside a running backend.
//!
//! The registry and the Manager's setup step drive a backend through
//! [`BackendAdmin`]. [`McAdmin`] implements it by running the `mc` CLI with
//! `--json`, one command per call, against a private config directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use lens3_core::random_str;
use lens3_state::{BktPolicy, KeyPolicy};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};

/// An access-key as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSecret {
    pub access_key: String,
    pub key_policy: Option<String>,
}

/// Admin operations against one running backend.
#[async_trait]
pub trait BackendAdmin: Send + Sync {
    async fn list_buckets(&self) -> RegistryResult<Vec<String>>;

    /// Creates the bucket (an existing one is kept) and sets its policy.
    async fn make_bucket(&self, name: &str, policy: BktPolicy) -> RegistryResult<()>;

    async fn set_bucket_policy(&self, name: &str, policy: BktPolicy) -> RegistryResult<()>;

    /// Makes a bucket inaccessible. Contents are never removed.
    async fn delete_bucket(&self, name: &str) -> RegistryResult<()> {
        self.set_bucket_policy(name, BktPolicy::None).await
    }

    async fn list_secrets(&self) -> RegistryResult<Vec<LiveSecret>>;

    /// Adds the user, attaches the policy, and enables it.
    async fn make_secret(&self, key: &str, secret: &str, policy: KeyPolicy) -> RegistryResult<()>;

    async fn delete_secret(&self, key: &str) -> RegistryResult<()>;

    /// Asks the backend to shut itself down.
    async fn stop(&self) -> RegistryResult<()>;

    /// Deletes every access-key and closes every bucket. Failures are logged.
    async fn clean(&self, pool_id: &str) {
        match self.list_secrets().await {
            Ok(keys) => {
                for k in keys {
                    if let Err(e) = self.delete_secret(&k.access_key).await {
                        warn!(%pool_id, key = %k.access_key, error = %e, "cleaning key failed (ignored)");
                    }
                }
            }
            Err(e) => warn!(%pool_id, error = %e, "listing keys for cleaning failed (ignored)"),
        }
        match self.list_buckets().await {
            Ok(buckets) => {
                for b in buckets {
                    if let Err(e) = self.delete_bucket(&b).await {
                        warn!(%pool_id, bucket = %b, error = %e, "cleaning bucket failed (ignored)");
                    }
                }
            }
            Err(e) => warn!(%pool_id, error = %e, "listing buckets for cleaning failed (ignored)"),
        }
    }
}

/// Reaches the backend of a pool, starting one if none runs.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Ensures a backend runs for the pool and returns its endpoint.
    async fn activate(&self, pool_id: &str) -> RegistryResult<String>;

    /// Activates the pool and opens an admin session on its backend.
    async fn connect(&self, pool_id: &str) -> RegistryResult<Box<dyn BackendAdmin>>;
}

/// An `mc` session bound to one backend through a random alias.
pub struct McAdmin {
    mc: PathBuf,
    alias: String,
    pool_id: String,
    timeout: Duration,
    // Removed on drop, taking the alias with it.
    config_dir: TempDir,
}

impl McAdmin {
    /// Registers an alias for `http://{endpoint}` with the root credential.
    pub async fn open(
        mc: &Path,
        endpoint: &str,
        root_user: &str,
        root_secret: &str,
        pool_id: &str,
        timeout: Duration,
    ) -> RegistryResult<Self> {
        let config_dir = tempfile::Builder::new()
            .prefix("lens3-mc")
            .tempdir()
            .map_err(|e| RegistryError::internal(format!("mc config dir: {e}")))?;
        let admin = Self {
            mc: mc.to_path_buf(),
            alias: format!("{pool_id}{}", random_str(12).to_lowercase()),
            pool_id: pool_id.to_string(),
            timeout,
            config_dir,
        };
        let url = format!("http://{endpoint}");
        admin
            .run("alias_set", &["alias", "set", &admin.alias, &url, root_user, root_secret, "--api", "S3v4"])
            .await?;
        debug!(%pool_id, %endpoint, "mc alias set");
        Ok(admin)
    }

    fn target(&self, bucket: &str) -> String {
        format!("{}/{bucket}", self.alias)
    }

    /// Runs one command and returns its JSON lines, failing on any
    /// `"status": "error"` entry.
    async fn run(&self, name: &str, args: &[&str]) -> RegistryResult<Vec<Value>> {
        let mut cmd = tokio::process::Command::new(&self.mc);
        cmd.arg("--json")
            .arg(format!("--config-dir={}", self.config_dir.path().display()))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RegistryError::internal(format!("mc {name} failed to run: {e}")));
            }
            Err(_) => {
                return Err(RegistryError::internal(format!("mc {name} timed out")));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines = parse_mc_output(&stdout)
            .map_err(|e| RegistryError::internal(format!("mc {name}: bad output: {e}")))?;
        if let Some(message) = mc_error_message(&lines) {
            debug!(pool_id = %self.pool_id, %name, %message, "mc command failed");
            return Err(RegistryError::internal(format!("mc {name} failed: {message}")));
        }
        debug!(pool_id = %self.pool_id, %name, "mc command ok");
        Ok(lines)
    }
}

/// One JSON value per non-empty line.
fn parse_mc_output(stdout: &str) -> Result<Vec<Value>, serde_json::Error> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// The most specific message of the first failed entry, if any.
fn mc_error_message(lines: &[Value]) -> Option<String> {
    let failed = lines
        .iter()
        .find(|v| v.get("status").and_then(Value::as_str).is_some_and(|s| s != "success"))?;
    let code = failed.pointer("/error/cause/error/Code").and_then(Value::as_str);
    let message = failed.pointer("/error/message").and_then(Value::as_str);
    Some(code.or(message).unwrap_or("unknown error").to_string())
}

#[async_trait]
impl BackendAdmin for McAdmin {
    async fn list_buckets(&self) -> RegistryResult<Vec<String>> {
        let lines = self.run("list_buckets", &["ls", &self.alias]).await?;
        Ok(lines
            .iter()
            .filter_map(|v| v.get("key").and_then(Value::as_str))
            .map(|k| k.trim_end_matches('/').to_string())
            .collect())
    }

    async fn make_bucket(&self, name: &str, policy: BktPolicy) -> RegistryResult<()> {
        // Buckets are never removed, so one may already exist.
        if let Err(e) = self.run("make_bucket", &["mb", &self.target(name)]).await {
            info!(pool_id = %self.pool_id, bucket = %name, error = %e, "mb failed, assuming it exists");
        }
        self.set_bucket_policy(name, policy).await
    }

    async fn set_bucket_policy(&self, name: &str, policy: BktPolicy) -> RegistryResult<()> {
        self.run("policy_set", &["policy", "set", policy.as_str(), &self.target(name)])
            .await?;
        Ok(())
    }

    async fn list_secrets(&self) -> RegistryResult<Vec<LiveSecret>> {
        let lines = self
            .run("admin_user_list", &["admin", "user", "list", &self.alias])
            .await?;
        Ok(lines
            .iter()
            .filter_map(|v| {
                let key = v.get("accessKey").and_then(Value::as_str)?;
                Some(LiveSecret {
                    access_key: key.to_string(),
                    key_policy: v
                        .get("policyName")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            })
            .collect())
    }

    async fn make_secret(&self, key: &str, secret: &str, policy: KeyPolicy) -> RegistryResult<()> {
        self.run("admin_user_add", &["admin", "user", "add", &self.alias, key, secret])
            .await?;
        self.run(
            "admin_policy_set",
            &["admin", "policy", "set", &self.alias, policy.as_str(), &format!("user={key}")],
        )
        .await?;
        self.run("admin_user_enable", &["admin", "user", "enable", &self.alias, key])
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> RegistryResult<()> {
        self.run("admin_user_remove", &["admin", "user", "remove", &self.alias, key])
            .await?;
        Ok(())
    }

    async fn stop(&self) -> RegistryResult<()> {
        self.run("admin_service_stop", &["admin", "service", "stop", &self.alias])
            .await?;
        Ok(())
    }
}
