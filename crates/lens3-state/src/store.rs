//! Tables: typed access to the five namespaces.
//!
//! Each method is a single store operation (or a scan followed by gets),
//! so callers compose multi-record changes themselves and undo them
//! explicitly on failure.

use std::sync::Arc;
use std::time::Duration;

use lens3_core::{RedisConf, epoch_secs, random_id};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::kv::{KvStore, MemoryKv};
use crate::redis_kv::RedisKv;
use crate::tables::{self, Namespace, key};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Collision retries for random ids before giving up.
pub const UNIQUE_ID_RETRIES: usize = 30;

/// Shared handle to all namespaces.
#[derive(Clone)]
pub struct Tables {
    setting: Arc<dyn KvStore>,
    storage: Arc<dyn KvStore>,
    process: Arc<dyn KvStore>,
    routing: Arc<dyn KvStore>,
    monokey: Arc<dyn KvStore>,
}

impl Tables {
    /// Connect every namespace to its Redis database.
    pub async fn connect(conf: &RedisConf) -> StateResult<Self> {
        let interval = Duration::from_secs(conf.connect_retry_interval);
        let mut dbs: Vec<Arc<dyn KvStore>> = Vec::with_capacity(Namespace::ALL.len());
        for ns in Namespace::ALL {
            let kv = RedisKv::connect(&conf.url, ns.db(), conf.connect_retries, interval).await?;
            dbs.push(Arc::new(kv));
        }
        let [setting, storage, process, routing, monokey]: [Arc<dyn KvStore>; 5] = dbs
            .try_into()
            .map_err(|_| StateError::Connect("namespace count mismatch".to_string()))?;
        Ok(Self {
            setting,
            storage,
            process,
            routing,
            monokey,
        })
    }

    /// Ephemeral in-memory tables (for testing).
    pub fn in_memory() -> Self {
        Self {
            setting: Arc::new(MemoryKv::new()),
            storage: Arc::new(MemoryKv::new()),
            process: Arc::new(MemoryKv::new()),
            routing: Arc::new(MemoryKv::new()),
            monokey: Arc::new(MemoryKv::new()),
        }
    }

    /// Swaps the store behind one namespace, keeping the others.
    pub fn with_namespace(mut self, ns: Namespace, kv: Arc<dyn KvStore>) -> Self {
        let slot = match ns {
            Namespace::Setting => &mut self.setting,
            Namespace::Storage => &mut self.storage,
            Namespace::Process => &mut self.process,
            Namespace::Routing => &mut self.routing,
            Namespace::Monokey => &mut self.monokey,
        };
        *slot = kv;
        self
    }

    fn db(&self, ns: Namespace) -> &dyn KvStore {
        match ns {
            Namespace::Setting => self.setting.as_ref(),
            Namespace::Storage => self.storage.as_ref(),
            Namespace::Process => self.process.as_ref(),
            Namespace::Routing => self.routing.as_ref(),
            Namespace::Monokey => self.monokey.as_ref(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, ns: Namespace, k: &str) -> StateResult<Option<T>> {
        match self.db(ns).get(k).await? {
            Some(v) => Ok(Some(serde_json::from_str(&v).map_err(map_err!(Deserialize))?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, ns: Namespace, k: &str, value: &T) -> StateResult<()> {
        let v = serde_json::to_string(value).map_err(map_err!(Serialize))?;
        self.db(ns).set(k, &v).await
    }

    async fn set_nx_json<T: Serialize>(&self, ns: Namespace, k: &str, value: &T) -> StateResult<bool> {
        let v = serde_json::to_string(value).map_err(map_err!(Serialize))?;
        self.db(ns).set_nx(k, &v).await
    }

    /// Ids under `prefix`, in no particular order.
    async fn scan_ids(&self, ns: Namespace, prefix: &str) -> StateResult<Vec<String>> {
        let keys = self.db(ns).scan_prefix(prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| tables::id_of(prefix, k))
            .map(str::to_string)
            .collect())
    }

    // ── Users ──────────────────────────────────────────────────────

    pub async fn set_user(&self, user: &UserRecord) -> StateResult<()> {
        self.set_json(Namespace::Setting, &key(tables::USER, &user.uid), user)
            .await?;
        if !user.claim.is_empty() {
            self.set_json(Namespace::Setting, &key(tables::CLAIM, &user.claim), &user.uid)
                .await?;
        }
        debug!(uid = %user.uid, "user stored");
        Ok(())
    }

    pub async fn get_user(&self, uid: &str) -> StateResult<Option<UserRecord>> {
        self.get_json(Namespace::Setting, &key(tables::USER, uid)).await
    }

    pub async fn get_claim_user(&self, claim: &str) -> StateResult<Option<String>> {
        self.get_json(Namespace::Setting, &key(tables::CLAIM, claim)).await
    }

    pub async fn delete_user(&self, uid: &str) -> StateResult<bool> {
        if let Some(user) = self.get_user(uid).await?
            && !user.claim.is_empty()
        {
            self.db(Namespace::Setting)
                .delete(&key(tables::CLAIM, &user.claim))
                .await?;
        }
        self.db(Namespace::Setting).delete(&key(tables::USER, uid)).await
    }

    pub async fn list_users(&self) -> StateResult<Vec<String>> {
        self.scan_ids(Namespace::Setting, tables::USER).await
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub async fn set_pool(&self, pool: &PoolRecord) -> StateResult<()> {
        self.set_json(Namespace::Storage, &key(tables::POOL, &pool.pool_id), pool)
            .await?;
        debug!(pool_id = %pool.pool_id, "pool stored");
        Ok(())
    }

    pub async fn get_pool(&self, pool_id: &str) -> StateResult<Option<PoolRecord>> {
        self.get_json(Namespace::Storage, &key(tables::POOL, pool_id)).await
    }

    pub async fn delete_pool(&self, pool_id: &str) -> StateResult<bool> {
        self.db(Namespace::Storage).delete(&key(tables::POOL, pool_id)).await
    }

    pub async fn list_pools(&self) -> StateResult<Vec<String>> {
        self.scan_ids(Namespace::Storage, tables::POOL).await
    }

    pub async fn set_pool_state(&self, pool_id: &str, state: PoolState, reason: &str) -> StateResult<()> {
        let record = PoolStateRecord {
            state,
            reason: reason.to_string(),
            modification_time: epoch_secs(),
        };
        self.set_json(Namespace::Storage, &key(tables::POOL_STATE, pool_id), &record)
            .await?;
        debug!(%pool_id, %state, %reason, "pool state stored");
        Ok(())
    }

    pub async fn get_pool_state(&self, pool_id: &str) -> StateResult<Option<PoolStateRecord>> {
        self.get_json(Namespace::Storage, &key(tables::POOL_STATE, pool_id))
            .await
    }

    pub async fn delete_pool_state(&self, pool_id: &str) -> StateResult<bool> {
        self.db(Namespace::Storage)
            .delete(&key(tables::POOL_STATE, pool_id))
            .await
    }

    // ── Buckets-directories ────────────────────────────────────────

    /// Claims `path` for `pool_id`. False if another pool holds it.
    pub async fn set_ex_buckets_directory(&self, path: &str, pool_id: &str) -> StateResult<bool> {
        self.set_nx_json(Namespace::Storage, &key(tables::BUCKETS_DIRECTORY, path), &pool_id)
            .await
    }

    pub async fn get_buckets_directory(&self, path: &str) -> StateResult<Option<String>> {
        self.get_json(Namespace::Storage, &key(tables::BUCKETS_DIRECTORY, path))
            .await
    }

    /// Reverse lookup by scanning the claims.
    pub async fn get_buckets_directory_of_pool(&self, pool_id: &str) -> StateResult<Option<String>> {
        for (path, holder) in self.list_buckets_directories().await? {
            if holder == pool_id {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    pub async fn delete_buckets_directory(&self, path: &str) -> StateResult<bool> {
        self.db(Namespace::Storage)
            .delete(&key(tables::BUCKETS_DIRECTORY, path))
            .await
    }

    /// All (path, pool_id) claims.
    pub async fn list_buckets_directories(&self) -> StateResult<Vec<(String, String)>> {
        let mut out = Vec::new();
        for path in self.scan_ids(Namespace::Storage, tables::BUCKETS_DIRECTORY).await? {
            if let Some(pool_id) = self.get_buckets_directory(&path).await? {
                out.push((path, pool_id));
            }
        }
        Ok(out)
    }

    // ── Manager records ────────────────────────────────────────────

    /// Creates the manager record if absent. True means the caller holds
    /// the pool's mutex.
    pub async fn set_ex_manager(&self, pool_id: &str, record: &ManagerRecord) -> StateResult<bool> {
        self.set_nx_json(Namespace::Process, &key(tables::MANAGER, pool_id), record)
            .await
    }

    /// Refreshes the manager record TTL. False if it is gone.
    pub async fn set_manager_expiry(&self, pool_id: &str, ttl: Duration) -> StateResult<bool> {
        self.db(Namespace::Process)
            .expire(&key(tables::MANAGER, pool_id), ttl)
            .await
    }

    pub async fn get_manager(&self, pool_id: &str) -> StateResult<Option<ManagerRecord>> {
        self.get_json(Namespace::Process, &key(tables::MANAGER, pool_id)).await
    }

    pub async fn delete_manager(&self, pool_id: &str) -> StateResult<bool> {
        self.db(Namespace::Process)
            .delete(&key(tables::MANAGER, pool_id))
            .await
    }

    // ── Backend process records ────────────────────────────────────

    pub async fn set_process(&self, pool_id: &str, record: &ProcessRecord) -> StateResult<()> {
        self.set_json(Namespace::Process, &key(tables::PROCESS, pool_id), record)
            .await
    }

    pub async fn set_process_expiry(&self, pool_id: &str, ttl: Duration) -> StateResult<bool> {
        self.db(Namespace::Process)
            .expire(&key(tables::PROCESS, pool_id), ttl)
            .await
    }

    pub async fn get_process(&self, pool_id: &str) -> StateResult<Option<ProcessRecord>> {
        self.get_json(Namespace::Process, &key(tables::PROCESS, pool_id)).await
    }

    pub async fn delete_process(&self, pool_id: &str) -> StateResult<bool> {
        self.db(Namespace::Process)
            .delete(&key(tables::PROCESS, pool_id))
            .await
    }

    /// All (pool_id, record) pairs; records that vanish mid-scan are skipped.
    pub async fn list_processes(&self) -> StateResult<Vec<(String, ProcessRecord)>> {
        let mut out = Vec::new();
        for pool_id in self.scan_ids(Namespace::Process, tables::PROCESS).await? {
            if let Some(record) = self.get_process(&pool_id).await? {
                out.push((pool_id, record));
            }
        }
        Ok(out)
    }

    // ── Mux records ────────────────────────────────────────────────

    pub async fn set_mux(&self, mux_ep: &str, record: &MuxRecord, ttl: Duration) -> StateResult<()> {
        let k = key(tables::MUX, mux_ep);
        self.set_json(Namespace::Process, &k, record).await?;
        self.db(Namespace::Process).expire(&k, ttl).await?;
        Ok(())
    }

    pub async fn get_mux(&self, mux_ep: &str) -> StateResult<Option<MuxRecord>> {
        self.get_json(Namespace::Process, &key(tables::MUX, mux_ep)).await
    }

    pub async fn delete_mux(&self, mux_ep: &str) -> StateResult<bool> {
        self.db(Namespace::Process).delete(&key(tables::MUX, mux_ep)).await
    }

    pub async fn list_muxs(&self) -> StateResult<Vec<MuxRecord>> {
        let mut out = Vec::new();
        for ep in self.scan_ids(Namespace::Process, tables::MUX).await? {
            if let Some(record) = self.get_mux(&ep).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    // ── Endpoints ──────────────────────────────────────────────────

    pub async fn set_endpoint(&self, pool_id: &str, ep: &str) -> StateResult<()> {
        self.set_json(Namespace::Routing, &key(tables::ENDPOINT, pool_id), &ep)
            .await
    }

    pub async fn set_endpoint_expiry(&self, pool_id: &str, ttl: Duration) -> StateResult<bool> {
        self.db(Namespace::Routing)
            .expire(&key(tables::ENDPOINT, pool_id), ttl)
            .await
    }

    pub async fn get_endpoint(&self, pool_id: &str) -> StateResult<Option<String>> {
        self.get_json(Namespace::Routing, &key(tables::ENDPOINT, pool_id))
            .await
    }

    pub async fn delete_endpoint(&self, pool_id: &str) -> StateResult<bool> {
        self.db(Namespace::Routing)
            .delete(&key(tables::ENDPOINT, pool_id))
            .await
    }

    // ── Buckets ────────────────────────────────────────────────────

    /// Claims the bucket name. False if it is taken.
    pub async fn set_ex_bucket(&self, bucket: &BucketRecord) -> StateResult<bool> {
        self.set_nx_json(Namespace::Routing, &key(tables::BUCKET, &bucket.name), bucket)
            .await
    }

    /// Overwrites an existing bucket record (policy change).
    pub async fn set_bucket(&self, bucket: &BucketRecord) -> StateResult<()> {
        self.set_json(Namespace::Routing, &key(tables::BUCKET, &bucket.name), bucket)
            .await
    }

    pub async fn get_bucket(&self, name: &str) -> StateResult<Option<BucketRecord>> {
        self.get_json(Namespace::Routing, &key(tables::BUCKET, name)).await
    }

    pub async fn delete_bucket(&self, name: &str) -> StateResult<bool> {
        self.db(Namespace::Routing).delete(&key(tables::BUCKET, name)).await
    }

    pub async fn list_buckets(&self, pool_id: Option<&str>) -> StateResult<Vec<BucketRecord>> {
        let mut out = Vec::new();
        for name in self.scan_ids(Namespace::Routing, tables::BUCKET).await? {
            if let Some(b) = self.get_bucket(&name).await?
                && pool_id.is_none_or(|p| p == b.pool_id)
            {
                out.push(b);
            }
        }
        Ok(out)
    }

    // ── Access timestamps ──────────────────────────────────────────

    pub async fn set_access_timestamp(&self, pool_id: &str) -> StateResult<()> {
        self.set_json(
            Namespace::Routing,
            &key(tables::ACCESS_TIMESTAMP, pool_id),
            &epoch_secs(),
        )
        .await
    }

    pub async fn get_access_timestamp(&self, pool_id: &str) -> StateResult<Option<i64>> {
        self.get_json(Namespace::Routing, &key(tables::ACCESS_TIMESTAMP, pool_id))
            .await
    }

    pub async fn delete_access_timestamp(&self, pool_id: &str) -> StateResult<bool> {
        self.db(Namespace::Routing)
            .delete(&key(tables::ACCESS_TIMESTAMP, pool_id))
            .await
    }

    // ── Direct hostnames ───────────────────────────────────────────

    pub async fn set_ex_direct_hostname(&self, host: &str, pool_id: &str) -> StateResult<bool> {
        self.set_nx_json(Namespace::Routing, &key(tables::DIRECT_HOSTNAME, host), &pool_id)
            .await
    }

    pub async fn get_direct_hostname(&self, host: &str) -> StateResult<Option<String>> {
        self.get_json(Namespace::Routing, &key(tables::DIRECT_HOSTNAME, host))
            .await
    }

    pub async fn delete_direct_hostname(&self, host: &str) -> StateResult<bool> {
        self.db(Namespace::Routing)
            .delete(&key(tables::DIRECT_HOSTNAME, host))
            .await
    }

    pub async fn list_direct_hostnames(&self, pool_id: &str) -> StateResult<Vec<String>> {
        let mut out = Vec::new();
        for host in self.scan_ids(Namespace::Routing, tables::DIRECT_HOSTNAME).await? {
            if self.get_direct_hostname(&host).await?.as_deref() == Some(pool_id) {
                out.push(host);
            }
        }
        Ok(out)
    }

    // ── Unique ids ─────────────────────────────────────────────────

    /// Claims `id` with `record`. False if it is already taken.
    pub async fn set_ex_id(&self, id: &str, record: &UniqueId) -> StateResult<bool> {
        self.set_nx_json(Namespace::Monokey, &key(tables::UNIQUE_ID, id), record)
            .await
    }

    /// Generates and claims a fresh random id for `record`.
    pub async fn make_unique_id(&self, record: &UniqueId) -> StateResult<String> {
        for attempt in 1..=UNIQUE_ID_RETRIES {
            let id = random_id();
            if self.set_ex_id(&id, record).await? {
                return Ok(id);
            }
            warn!(attempt, "unique id collision");
        }
        Err(StateError::Exhausted(UNIQUE_ID_RETRIES))
    }

    pub async fn get_id(&self, id: &str) -> StateResult<Option<UniqueId>> {
        self.get_json(Namespace::Monokey, &key(tables::UNIQUE_ID, id)).await
    }

    pub async fn delete_id(&self, id: &str) -> StateResult<bool> {
        self.db(Namespace::Monokey)
            .delete(&key(tables::UNIQUE_ID, id))
            .await
    }

    pub async fn get_secret(&self, access_key: &str) -> StateResult<Option<SecretRecord>> {
        Ok(self
            .get_id(access_key)
            .await?
            .and_then(|id| SecretRecord::from_id(access_key, id)))
    }

    /// Access-keys owned by a pool, probe key included.
    pub async fn list_secrets(&self, pool_id: &str) -> StateResult<Vec<SecretRecord>> {
        let mut out = Vec::new();
        for id in self.scan_ids(Namespace::Monokey, tables::UNIQUE_ID).await? {
            if let Some(secret) = self.get_secret(&id).await?
                && secret.owner == pool_id
            {
                out.push(secret);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(pool_id: &str, dir: &str) -> PoolRecord {
        PoolRecord {
            pool_id: pool_id.to_string(),
            owner_uid: "alice".to_string(),
            owner_gid: "grp1".to_string(),
            buckets_directory: dir.to_string(),
            probe_key: "k0000000000000000000".to_string(),
            expiration_time: epoch_secs() + 3600,
            online_status: true,
            modification_time: 0,
        }
    }

    fn test_bucket(name: &str, pool_id: &str) -> BucketRecord {
        BucketRecord {
            name: name.to_string(),
            pool_id: pool_id.to_string(),
            bkt_policy: BktPolicy::None,
            modification_time: 0,
        }
    }

    #[tokio::test]
    async fn pool_put_and_get() {
        let t = Tables::in_memory();
        let pool = test_pool("p1", "/data/alice");
        t.set_pool(&pool).await.unwrap();
        assert_eq!(t.get_pool("p1").await.unwrap(), Some(pool));
        assert_eq!(t.list_pools().await.unwrap(), vec!["p1"]);
        assert!(t.delete_pool("p1").await.unwrap());
        assert!(t.get_pool("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn buckets_directory_claim_is_exclusive() {
        let t = Tables::in_memory();
        assert!(t.set_ex_buckets_directory("/data/a", "p1").await.unwrap());
        assert!(!t.set_ex_buckets_directory("/data/a", "p2").await.unwrap());
        assert_eq!(t.get_buckets_directory("/data/a").await.unwrap().as_deref(), Some("p1"));
        assert_eq!(
            t.get_buckets_directory_of_pool("p1").await.unwrap().as_deref(),
            Some("/data/a")
        );
        t.delete_buckets_directory("/data/a").await.unwrap();
        assert!(t.set_ex_buckets_directory("/data/a", "p2").await.unwrap());
    }

    #[tokio::test]
    async fn bucket_listing_filters_by_pool() {
        let t = Tables::in_memory();
        assert!(t.set_ex_bucket(&test_bucket("photos", "p1")).await.unwrap());
        assert!(!t.set_ex_bucket(&test_bucket("photos", "p2")).await.unwrap());
        assert!(t.set_ex_bucket(&test_bucket("docs", "p2")).await.unwrap());

        let p1 = t.list_buckets(Some("p1")).await.unwrap();
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].name, "photos");
        assert_eq!(t.list_buckets(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn manager_record_is_a_mutex() {
        let t = Tables::in_memory();
        let a = ManagerRecord {
            mux_host: "h1".to_string(),
            mux_port: 8000,
            start_time: 1,
        };
        let b = ManagerRecord {
            mux_host: "h2".to_string(),
            ..a.clone()
        };
        assert!(t.set_ex_manager("p1", &a).await.unwrap());
        assert!(!t.set_ex_manager("p1", &b).await.unwrap());
        assert_eq!(t.get_manager("p1").await.unwrap(), Some(a));
        assert!(t.set_manager_expiry("p1", Duration::from_secs(5)).await.unwrap());
        assert!(!t.set_manager_expiry("p9", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_expires_without_refresh() {
        let t = Tables::in_memory();
        t.set_endpoint("p1", "127.0.0.1:9000").await.unwrap();
        t.set_endpoint_expiry("p1", Duration::from_secs(30)).await.unwrap();
        assert_eq!(
            t.get_endpoint("p1").await.unwrap().as_deref(),
            Some("127.0.0.1:9000")
        );
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(t.get_endpoint("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_ids_and_secrets() {
        let t = Tables::in_memory();
        let pool_id = t
            .make_unique_id(&UniqueId::Pool {
                owner: "alice".to_string(),
                modification_time: 0,
            })
            .await
            .unwrap();
        let key = t
            .make_unique_id(&UniqueId::Akey {
                owner: pool_id.clone(),
                secret_key: "s3cr3t".to_string(),
                key_policy: KeyPolicy::Readonly,
                expiration_time: 0,
                modification_time: 0,
            })
            .await
            .unwrap();
        assert_ne!(pool_id, key);

        // A pool id is not a secret.
        assert!(t.get_secret(&pool_id).await.unwrap().is_none());
        let secrets = t.list_secrets(&pool_id).await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].access_key, key);
        assert_eq!(secrets[0].key_policy, KeyPolicy::Readonly);
    }

    #[tokio::test]
    async fn user_claim_mapping() {
        let t = Tables::in_memory();
        let user = UserRecord {
            uid: "alice".to_string(),
            claim: "alice@example.org".to_string(),
            groups: vec!["grp1".to_string()],
            enabled: true,
            modification_time: 0,
        };
        t.set_user(&user).await.unwrap();
        assert_eq!(
            t.get_claim_user("alice@example.org").await.unwrap().as_deref(),
            Some("alice")
        );
        t.delete_user("alice").await.unwrap();
        assert!(t.get_claim_user("alice@example.org").await.unwrap().is_none());
        assert!(t.list_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_tables_operations() {
        let t = Tables::in_memory();
        assert!(t.get_pool("nope").await.unwrap().is_none());
        assert!(t.get_pool_state("nope").await.unwrap().is_none());
        assert!(!t.delete_bucket("nope").await.unwrap());
        assert!(t.list_processes().await.unwrap().is_empty());
        assert!(t.list_muxs().await.unwrap().is_empty());
    }
}
