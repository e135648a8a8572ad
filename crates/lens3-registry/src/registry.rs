//! Registry: pools, buckets, and access-keys.
//!
//! Multi-record operations claim names first and write dependent records
//! after; a failure part way undoes the earlier steps in reverse order.
//! Deletions are best-effort per record so one stuck record never blocks
//! the rest.

use std::sync::Arc;

use lens3_core::{check_bucket_naming, epoch_secs, normalize_path, random_str};
use lens3_state::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::access::{ensure_bucket_owner, ensure_secret_owner, pool_owner_for_messages};
use crate::admin::BackendConnector;
use crate::error::{RegistryError, RegistryResult};

/// Length of generated secret keys.
const SECRET_LENGTH: usize = 48;

/// Slack accepted for an expiration time in the past.
const EXPIRATION_SLACK: i64 = 10;

/// A pool with everything that hangs off it, for display.
#[derive(Debug, Clone, Serialize)]
pub struct PoolDescription {
    pub pool: PoolRecord,
    pub state: Option<PoolStateRecord>,
    pub buckets: Vec<BucketRecord>,
    /// Access-keys excluding the probe key.
    pub secrets: Vec<SecretRecord>,
    pub direct_hostnames: Vec<String>,
}

#[derive(Clone)]
pub struct Registry {
    tables: Tables,
    connector: Arc<dyn BackendConnector>,
    max_pool_expiry: u64,
}

/// Logs a failed best-effort step and carries on.
fn ignore_failure<T, E: std::fmt::Display>(what: &str, pool_id: &str, r: Result<T, E>) {
    if let Err(e) = r {
        warn!(%pool_id, error = %e, "{what} failed (ignored)");
    }
}

impl Registry {
    pub fn new(tables: Tables, connector: Arc<dyn BackendConnector>, max_pool_expiry: u64) -> Self {
        Self {
            tables,
            connector,
            max_pool_expiry,
        }
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Creates a pool owned by `owner_uid`/`owner_gid` on `buckets_directory`.
    pub async fn make_pool(
        &self,
        owner_uid: &str,
        owner_gid: &str,
        buckets_directory: &str,
    ) -> RegistryResult<PoolRecord> {
        let Some(user) = self.tables.get_user(owner_uid).await? else {
            return Err(RegistryError::forbidden(format!("User not registered: {owner_uid}")));
        };
        if !user.groups.iter().any(|g| g == owner_gid) {
            return Err(RegistryError::forbidden(format!("Bad group: {owner_gid}")));
        }
        let Some(path) = normalize_path(buckets_directory) else {
            return Err(RegistryError::bad_request(format!(
                "Buckets-directory is not absolute: {buckets_directory}"
            )));
        };

        let now = epoch_secs();
        let expiration_time = now + self.max_pool_expiry as i64;

        let pool_id = self
            .tables
            .make_unique_id(&UniqueId::Pool {
                owner: owner_uid.to_string(),
                modification_time: now,
            })
            .await?;

        let probe = UniqueId::Akey {
            owner: pool_id.clone(),
            secret_key: String::new(),
            key_policy: KeyPolicy::Readwrite,
            expiration_time,
            modification_time: now,
        };
        let probe_key = match self.tables.make_unique_id(&probe).await {
            Ok(k) => k,
            Err(e) => {
                ignore_failure("undo pool id", &pool_id, self.tables.delete_id(&pool_id).await);
                return Err(e.into());
            }
        };

        match self.tables.set_ex_buckets_directory(&path, &pool_id).await {
            Ok(true) => {}
            Ok(false) => {
                let holder = self.tables.get_buckets_directory(&path).await.ok().flatten();
                let owner = pool_owner_for_messages(&self.tables, holder.as_deref()).await;
                self.undo_ids(&pool_id, &probe_key).await;
                return Err(RegistryError::conflict(format!(
                    "Buckets-directory is already used: path={path}, holder={owner}"
                )));
            }
            Err(e) => {
                self.undo_ids(&pool_id, &probe_key).await;
                return Err(e.into());
            }
        }

        let pool = PoolRecord {
            pool_id: pool_id.clone(),
            owner_uid: owner_uid.to_string(),
            owner_gid: owner_gid.to_string(),
            buckets_directory: path.clone(),
            probe_key: probe_key.clone(),
            expiration_time,
            online_status: true,
            modification_time: now,
        };
        let stored = async {
            self.tables.set_pool(&pool).await?;
            self.tables
                .set_pool_state(&pool_id, PoolState::Initial, reason::NORMAL)
                .await
        };
        if let Err(e) = stored.await {
            ignore_failure("undo pool", &pool_id, self.tables.delete_pool(&pool_id).await);
            ignore_failure(
                "undo buckets-directory",
                &pool_id,
                self.tables.delete_buckets_directory(&path).await,
            );
            self.undo_ids(&pool_id, &probe_key).await;
            return Err(e.into());
        }

        info!(%pool_id, %owner_uid, directory = %path, "pool created");

        // Pre-warm. The pool state records any failure.
        if let Err(e) = self.connector.activate(&pool_id).await {
            warn!(%pool_id, error = %e, "initial activation failed");
        }
        Ok(pool)
    }

    async fn undo_ids(&self, pool_id: &str, probe_key: &str) {
        ignore_failure("undo probe key", pool_id, self.tables.delete_id(probe_key).await);
        ignore_failure("undo pool id", pool_id, self.tables.delete_id(pool_id).await);
    }

    /// Removes a pool and everything that refers to it. Idempotent.
    pub async fn delete_pool(&self, pool_id: &str) -> RegistryResult<()> {
        if self.tables.get_pool(pool_id).await?.is_some() {
            self.clean_backend(pool_id).await;
        }
        self.erase_backend_records(pool_id).await;
        self.erase_pool_data(pool_id).await;
        info!(%pool_id, "pool deleted");
        Ok(())
    }

    /// Empties the live backend of keys and bucket access. Failures are logged.
    async fn clean_backend(&self, pool_id: &str) {
        match self.connector.connect(pool_id).await {
            Ok(admin) => admin.clean(pool_id).await,
            Err(e) => warn!(%pool_id, error = %e, "backend cleaning skipped"),
        }
    }

    async fn erase_backend_records(&self, pool_id: &str) {
        ignore_failure("delete endpoint", pool_id, self.tables.delete_endpoint(pool_id).await);
        ignore_failure("delete process", pool_id, self.tables.delete_process(pool_id).await);
    }

    async fn erase_pool_data(&self, pool_id: &str) {
        match self.tables.get_buckets_directory_of_pool(pool_id).await {
            Ok(Some(path)) => ignore_failure(
                "delete buckets-directory",
                pool_id,
                self.tables.delete_buckets_directory(&path).await,
            ),
            Ok(None) => {}
            Err(e) => warn!(%pool_id, error = %e, "buckets-directory lookup failed (ignored)"),
        }
        match self.tables.list_buckets(Some(pool_id)).await {
            Ok(buckets) => {
                for b in buckets {
                    ignore_failure("delete bucket", pool_id, self.tables.delete_bucket(&b.name).await);
                }
            }
            Err(e) => warn!(%pool_id, error = %e, "bucket listing failed (ignored)"),
        }
        match self.tables.list_secrets(pool_id).await {
            Ok(secrets) => {
                for s in secrets {
                    ignore_failure("delete key", pool_id, self.tables.delete_id(&s.access_key).await);
                }
            }
            Err(e) => warn!(%pool_id, error = %e, "key listing failed (ignored)"),
        }
        match self.tables.list_direct_hostnames(pool_id).await {
            Ok(hosts) => {
                for h in hosts {
                    ignore_failure(
                        "delete direct hostname",
                        pool_id,
                        self.tables.delete_direct_hostname(&h).await,
                    );
                }
            }
            Err(e) => warn!(%pool_id, error = %e, "direct hostname listing failed (ignored)"),
        }
        ignore_failure("delete access timestamp", pool_id, self.tables.delete_access_timestamp(pool_id).await);
        ignore_failure("delete pool state", pool_id, self.tables.delete_pool_state(pool_id).await);
        ignore_failure("delete pool", pool_id, self.tables.delete_pool(pool_id).await);
        ignore_failure("delete pool id", pool_id, self.tables.delete_id(pool_id).await);
    }

    pub async fn describe_pool(&self, pool_id: &str) -> RegistryResult<PoolDescription> {
        let Some(pool) = self.tables.get_pool(pool_id).await? else {
            return Err(RegistryError::not_found(format!("Non-existing pool: {pool_id}")));
        };
        let state = self.tables.get_pool_state(pool_id).await?;
        let buckets = self.tables.list_buckets(Some(pool_id)).await?;
        let secrets = self
            .tables
            .list_secrets(pool_id)
            .await?
            .into_iter()
            .filter(|s| !s.is_probe())
            .collect();
        let direct_hostnames = self.tables.list_direct_hostnames(pool_id).await?;
        Ok(PoolDescription {
            pool,
            state,
            buckets,
            secrets,
            direct_hostnames,
        })
    }

    /// Turns a pool on or off. This is the only in-place pool update.
    pub async fn set_online_status(&self, pool_id: &str, online: bool) -> RegistryResult<()> {
        let Some(mut pool) = self.tables.get_pool(pool_id).await? else {
            return Err(RegistryError::not_found(format!("Non-existing pool: {pool_id}")));
        };
        pool.online_status = online;
        pool.modification_time = epoch_secs();
        self.tables.set_pool(&pool).await?;
        Ok(())
    }

    /// Binds `hostname` to the pool for keyless direct access.
    pub async fn claim_direct_hostname(&self, pool_id: &str, hostname: &str) -> RegistryResult<()> {
        let host = hostname.to_ascii_lowercase();
        if self.tables.get_pool(pool_id).await?.is_none() {
            return Err(RegistryError::not_found(format!("Non-existing pool: {pool_id}")));
        }
        if !self.tables.set_ex_direct_hostname(&host, pool_id).await? {
            let holder = self.tables.get_direct_hostname(&host).await.ok().flatten();
            let owner = pool_owner_for_messages(&self.tables, holder.as_deref()).await;
            return Err(RegistryError::conflict(format!(
                "Hostname taken: host={host}, owner={owner}"
            )));
        }
        Ok(())
    }

    // ── Buckets ────────────────────────────────────────────────────

    pub async fn make_bucket(
        &self,
        pool_id: &str,
        name: &str,
        policy: BktPolicy,
    ) -> RegistryResult<BucketRecord> {
        if !check_bucket_naming(name) {
            return Err(RegistryError::bad_request(format!("Bad bucket name: {name}")));
        }
        if self.tables.get_pool(pool_id).await?.is_none() {
            return Err(RegistryError::not_found(format!("Non-existing pool: {pool_id}")));
        }

        let bucket = BucketRecord {
            name: name.to_string(),
            pool_id: pool_id.to_string(),
            bkt_policy: policy,
            modification_time: epoch_secs(),
        };
        if !self.tables.set_ex_bucket(&bucket).await? {
            let holder = self.tables.get_bucket(name).await.ok().flatten();
            let owner =
                pool_owner_for_messages(&self.tables, holder.as_ref().map(|b| b.pool_id.as_str()))
                    .await;
            return Err(RegistryError::conflict(format!(
                "Bucket name taken: owner={owner}"
            )));
        }

        let provisioned = async {
            let admin = self.connector.connect(pool_id).await?;
            admin.make_bucket(name, policy).await
        };
        if let Err(e) = provisioned.await {
            error!(%pool_id, bucket = %name, error = %e, "bucket provisioning failed");
            ignore_failure("release bucket name", pool_id, self.tables.delete_bucket(name).await);
            return Err(e);
        }

        info!(%pool_id, bucket = %name, policy = policy.as_str(), "bucket created");
        Ok(bucket)
    }

    pub async fn delete_bucket(&self, pool_id: &str, name: &str) -> RegistryResult<()> {
        ensure_bucket_owner(&self.tables, name, pool_id).await?;
        match self.connector.connect(pool_id).await {
            Ok(admin) => {
                match admin.list_buckets().await {
                    Ok(live) if !live.iter().any(|b| b == name) => {
                        warn!(%pool_id, bucket = %name, "bucket missing in backend");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%pool_id, error = %e, "bucket listing failed (ignored)"),
                }
                ignore_failure("backend bucket deletion", pool_id, admin.delete_bucket(name).await);
            }
            Err(e) => warn!(%pool_id, bucket = %name, error = %e, "backend unreachable for deletion"),
        }
        self.tables.delete_bucket(name).await?;
        debug!(%pool_id, bucket = %name, "bucket deleted");
        Ok(())
    }

    // ── Access-keys ────────────────────────────────────────────────

    pub async fn make_secret(
        &self,
        pool_id: &str,
        policy: KeyPolicy,
        expiration_time: i64,
    ) -> RegistryResult<SecretRecord> {
        let now = epoch_secs();
        if !(now - EXPIRATION_SLACK <= expiration_time
            && expiration_time <= now + self.max_pool_expiry as i64)
        {
            return Err(RegistryError::bad_request(format!(
                "Bad expiration time: {expiration_time}"
            )));
        }
        if self.tables.get_pool(pool_id).await?.is_none() {
            return Err(RegistryError::not_found(format!("Non-existing pool: {pool_id}")));
        }

        let secret_key = random_str(SECRET_LENGTH);
        let access_key = self
            .tables
            .make_unique_id(&UniqueId::Akey {
                owner: pool_id.to_string(),
                secret_key: secret_key.clone(),
                key_policy: policy,
                expiration_time,
                modification_time: now,
            })
            .await
            .map_err(|e| match e {
                StateError::Exhausted(n) => {
                    RegistryError::internal(format!("Access-key exhausted after {n} retries"))
                }
                e => e.into(),
            })?;

        let provisioned = async {
            let admin = self.connector.connect(pool_id).await?;
            admin.make_secret(&access_key, &secret_key, policy).await
        };
        if let Err(e) = provisioned.await {
            error!(%pool_id, error = %e, "access-key provisioning failed");
            ignore_failure("release access-key", pool_id, self.tables.delete_id(&access_key).await);
            return Err(e);
        }

        info!(%pool_id, %access_key, policy = policy.as_str(), "access-key created");
        Ok(SecretRecord {
            access_key,
            owner: pool_id.to_string(),
            secret_key,
            key_policy: policy,
            expiration_time,
            modification_time: now,
        })
    }

    pub async fn delete_secret(&self, pool_id: &str, access_key: &str) -> RegistryResult<()> {
        match self.tables.get_secret(access_key).await? {
            Some(s) if s.owner == pool_id && !s.is_probe() => {}
            _ => {
                return Err(RegistryError::forbidden(format!(
                    "Wrong access-key: {access_key}"
                )));
            }
        }
        match self.connector.connect(pool_id).await {
            Ok(admin) => {
                match admin.list_secrets().await {
                    Ok(live) if !live.iter().any(|s| s.access_key == access_key) => {
                        warn!(%pool_id, %access_key, "access-key missing in backend");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%pool_id, error = %e, "key listing failed (ignored)"),
                }
                ignore_failure("backend key deletion", pool_id, admin.delete_secret(access_key).await);
            }
            Err(e) => warn!(%pool_id, %access_key, error = %e, "backend unreachable for deletion"),
        }
        self.tables.delete_id(access_key).await?;
        debug!(%pool_id, %access_key, "access-key deleted");
        Ok(())
    }

    /// Checks a key may be used with a pool. Mirrors the Mux check.
    pub async fn check_secret(&self, pool_id: &str, access_key: &str) -> RegistryResult<()> {
        ensure_secret_owner(&self.tables, Some(access_key), pool_id).await.map(|_| ())
    }
}

/// Desired buckets of a pool, as reconciled into its backend at setup.
pub async fn gather_buckets(tables: &Tables, pool_id: &str) -> RegistryResult<Vec<BucketRecord>> {
    Ok(tables.list_buckets(Some(pool_id)).await?)
}

/// Desired access-keys of a pool. Probe keys never reach the backend.
pub async fn gather_secrets(tables: &Tables, pool_id: &str) -> RegistryResult<Vec<SecretRecord>> {
    Ok(tables
        .list_secrets(pool_id)
        .await?
        .into_iter()
        .filter(|s| !s.is_probe())
        .collect())
}
