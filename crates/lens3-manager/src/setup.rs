//! Bringing a fresh backend in line with the registry.
//!
//! Buckets and access-keys recorded for the pool are the desired set; the
//! backend's own listing is the live set. Desired-only items are created,
//! live-only items are closed or removed, and items in both get their
//! policy refreshed where it differs.

use std::collections::{HashMap, HashSet};

use lens3_core::epoch_secs;
use lens3_registry::{BackendAdmin, RegistryResult};
use lens3_state::Tables;
use tracing::{debug, info};

/// What a reconcile changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetupReport {
    pub buckets_added: usize,
    pub buckets_refreshed: usize,
    pub buckets_closed: usize,
    pub keys_added: usize,
    pub keys_refreshed: usize,
    pub keys_removed: usize,
}

/// Reconciles the backend's buckets and keys with the pool's records.
/// Stops at the first failing backend call.
pub async fn reconcile(
    admin: &dyn BackendAdmin,
    tables: &Tables,
    pool_id: &str,
) -> RegistryResult<SetupReport> {
    let mut report = SetupReport::default();

    let desired_buckets = tables.list_buckets(Some(pool_id)).await?;
    let live_buckets: HashSet<String> = admin.list_buckets().await?.into_iter().collect();
    let desired_names: HashSet<&str> = desired_buckets.iter().map(|b| b.name.as_str()).collect();

    for bucket in &desired_buckets {
        if live_buckets.contains(&bucket.name) {
            admin.set_bucket_policy(&bucket.name, bucket.bkt_policy).await?;
            report.buckets_refreshed += 1;
        } else {
            admin.make_bucket(&bucket.name, bucket.bkt_policy).await?;
            report.buckets_added += 1;
        }
    }
    for name in live_buckets.iter().filter(|n| !desired_names.contains(n.as_str())) {
        debug!(%pool_id, bucket = %name, "closing unrecorded bucket");
        admin.delete_bucket(name).await?;
        report.buckets_closed += 1;
    }

    let now = epoch_secs();
    let desired_keys: Vec<_> = tables
        .list_secrets(pool_id)
        .await?
        .into_iter()
        .filter(|s| !s.is_probe() && s.expiration_time >= now)
        .collect();
    let live_keys: HashMap<String, Option<String>> = admin
        .list_secrets()
        .await?
        .into_iter()
        .map(|s| (s.access_key, s.key_policy))
        .collect();
    let desired_ids: HashSet<&str> = desired_keys.iter().map(|s| s.access_key.as_str()).collect();

    for secret in &desired_keys {
        match live_keys.get(&secret.access_key) {
            Some(Some(policy)) if policy == secret.key_policy.as_str() => {}
            Some(_) => {
                admin
                    .make_secret(&secret.access_key, &secret.secret_key, secret.key_policy)
                    .await?;
                report.keys_refreshed += 1;
            }
            None => {
                admin
                    .make_secret(&secret.access_key, &secret.secret_key, secret.key_policy)
                    .await?;
                report.keys_added += 1;
            }
        }
    }
    for key in live_keys.keys().filter(|k| !desired_ids.contains(k.as_str())) {
        debug!(%pool_id, %key, "removing unrecorded access-key");
        admin.delete_secret(key).await?;
        report.keys_removed += 1;
    }

    info!(%pool_id, ?report, "backend setup done");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lens3_registry::{LiveSecret, RegistryError};
    use lens3_state::{BktPolicy, BucketRecord, KeyPolicy, UniqueId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeAdmin {
        buckets: Mutex<HashMap<String, BktPolicy>>,
        keys: Mutex<HashMap<String, String>>,
        fail: bool,
    }

    #[async_trait]
    impl BackendAdmin for FakeAdmin {
        async fn list_buckets(&self) -> RegistryResult<Vec<String>> {
            if self.fail {
                return Err(RegistryError::internal("mc failed"));
            }
            Ok(self.buckets.lock().unwrap().keys().cloned().collect())
        }

        async fn make_bucket(&self, name: &str, policy: BktPolicy) -> RegistryResult<()> {
            self.buckets.lock().unwrap().insert(name.to_string(), policy);
            Ok(())
        }

        async fn set_bucket_policy(&self, name: &str, policy: BktPolicy) -> RegistryResult<()> {
            self.buckets.lock().unwrap().insert(name.to_string(), policy);
            Ok(())
        }

        async fn list_secrets(&self) -> RegistryResult<Vec<LiveSecret>> {
            Ok(self
                .keys
                .lock()
                .unwrap()
                .iter()
                .map(|(k, p)| LiveSecret {
                    access_key: k.clone(),
                    key_policy: Some(p.clone()),
                })
                .collect())
        }

        async fn make_secret(&self, key: &str, _secret: &str, policy: KeyPolicy) -> RegistryResult<()> {
            self.keys
                .lock()
                .unwrap()
                .insert(key.to_string(), policy.as_str().to_string());
            Ok(())
        }

        async fn delete_secret(&self, key: &str) -> RegistryResult<()> {
            self.keys.lock().unwrap().remove(key);
            Ok(())
        }

        async fn stop(&self) -> RegistryResult<()> {
            Ok(())
        }
    }

    async fn add_key(tables: &Tables, key: &str, secret: &str, policy: KeyPolicy) {
        tables
            .set_ex_id(
                key,
                &UniqueId::Akey {
                    owner: "p1".to_string(),
                    secret_key: secret.to_string(),
                    key_policy: policy,
                    expiration_time: epoch_secs() + 3600,
                    modification_time: 0,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn three_way_reconcile() {
        let tables = Tables::in_memory();
        for (name, policy) in [("photos", BktPolicy::None), ("www", BktPolicy::Download)] {
            tables
                .set_bucket(&BucketRecord {
                    name: name.to_string(),
                    pool_id: "p1".to_string(),
                    bkt_policy: policy,
                    modification_time: 0,
                })
                .await
                .unwrap();
        }
        add_key(&tables, "kaaaaaaaaaaaaaaaaaa1", "s1", KeyPolicy::Readwrite).await;
        add_key(&tables, "kaaaaaaaaaaaaaaaaaa2", "s2", KeyPolicy::Readonly).await;
        // Probe keys never reach the backend.
        add_key(&tables, "kaaaaaaaaaaaaaaaaaa3", "", KeyPolicy::Readwrite).await;

        let admin = FakeAdmin::default();
        admin
            .buckets
            .lock()
            .unwrap()
            .extend([("www".to_string(), BktPolicy::None), ("stale".to_string(), BktPolicy::Public)]);
        admin.keys.lock().unwrap().extend([
            ("kaaaaaaaaaaaaaaaaaa2".to_string(), "readwrite".to_string()),
            ("kstale".to_string(), "readwrite".to_string()),
        ]);

        let report = reconcile(&admin, &tables, "p1").await.unwrap();
        assert_eq!(
            report,
            SetupReport {
                buckets_added: 1,
                buckets_refreshed: 1,
                buckets_closed: 1,
                keys_added: 1,
                keys_refreshed: 1,
                keys_removed: 1,
            }
        );

        let buckets = admin.buckets.lock().unwrap();
        assert_eq!(buckets["www"], BktPolicy::Download);
        assert_eq!(buckets["stale"], BktPolicy::None);
        let keys = admin.keys.lock().unwrap();
        assert_eq!(keys["kaaaaaaaaaaaaaaaaaa2"], "readonly");
        assert!(!keys.contains_key("kaaaaaaaaaaaaaaaaaa3"));
        assert!(!keys.contains_key("kstale"));
    }

    #[tokio::test]
    async fn backend_failure_aborts() {
        let tables = Tables::in_memory();
        let admin = FakeAdmin {
            fail: true,
            ..FakeAdmin::default()
        };
        assert!(reconcile(&admin, &tables, "p1").await.is_err());
    }
}
