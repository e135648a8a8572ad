//! Access checks shared by the registry and the Mux.
//!
//! Each check returns `Ok(())` or the error to send back as is.

use lens3_core::epoch_secs;
use lens3_state::{BktPolicy, BucketRecord, KeyPolicy, PoolState, SecretRecord, Tables};

use crate::error::{RegistryError, RegistryResult};

/// Owner name for messages only. Never use it for access control.
pub async fn pool_owner_for_messages(tables: &Tables, pool_id: Option<&str>) -> String {
    const UNKNOWN: &str = "unknown-user";
    let Some(pool_id) = pool_id else {
        return UNKNOWN.to_string();
    };
    match tables.get_pool(pool_id).await {
        Ok(Some(pool)) => pool.owner_uid,
        _ => UNKNOWN.to_string(),
    }
}

pub async fn ensure_user_is_authorized(tables: &Tables, uid: &str) -> RegistryResult<()> {
    match tables.get_user(uid).await? {
        None => Err(RegistryError::forbidden(format!("User not registered: {uid}"))),
        Some(u) if !u.enabled => Err(RegistryError::forbidden(format!("User disabled: {uid}"))),
        Some(_) => Ok(()),
    }
}

/// READY passes. INITIAL passes only when `allow_initial` (probe access).
pub fn ensure_pool_state(state: PoolState, allow_initial: bool) -> RegistryResult<()> {
    match state {
        PoolState::Ready => Ok(()),
        PoolState::Initial if allow_initial => Ok(()),
        PoolState::Initial => Err(RegistryError::unavailable("Pool is not set up yet")),
        PoolState::Suspended => Err(RegistryError::unavailable("Pool suspended")),
        PoolState::Disabled => Err(RegistryError::forbidden("Pool disabled")),
        PoolState::Inoperable => Err(RegistryError::internal("Pool inoperable")),
    }
}

/// How a request method touches a bucket. Methods outside the S3 set
/// map to `None` and are refused everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn of_method(method: &str) -> Option<Self> {
        match method {
            "GET" | "HEAD" => Some(Operation::Read),
            "PUT" | "POST" | "DELETE" => Some(Operation::Write),
            _ => None,
        }
    }
}

/// A missing key passes with `None`; a given key must exist (401), belong
/// to the pool and be unexpired (403).
pub async fn ensure_secret_owner(
    tables: &Tables,
    access_key: Option<&str>,
    pool_id: &str,
) -> RegistryResult<Option<SecretRecord>> {
    let Some(access_key) = access_key else {
        return Ok(None);
    };
    let Some(secret) = tables.get_secret(access_key).await? else {
        return Err(RegistryError::unauthorized(format!(
            "Non-existing access-key: {access_key}"
        )));
    };
    if secret.owner != pool_id {
        return Err(RegistryError::forbidden(format!("Wrong access-key: {access_key}")));
    }
    if secret.expiration_time < epoch_secs() {
        return Err(RegistryError::forbidden(format!("Expired access-key: {access_key}")));
    }
    Ok(Some(secret))
}

/// The key's policy must cover the method.
pub fn ensure_key_permission(method: &str, key_policy: KeyPolicy) -> RegistryResult<()> {
    let allowed = match Operation::of_method(method) {
        Some(Operation::Read) => matches!(key_policy, KeyPolicy::Readwrite | KeyPolicy::Readonly),
        Some(Operation::Write) => matches!(key_policy, KeyPolicy::Readwrite | KeyPolicy::Writeonly),
        None => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(RegistryError::forbidden(format!("No permission: {method}")))
    }
}

/// Keyed requests are judged by [`ensure_key_permission`]. Keyless ones
/// need a public policy covering the method.
pub fn ensure_bucket_policy(
    bucket: &BucketRecord,
    access_key: Option<&str>,
    method: &str,
) -> RegistryResult<()> {
    if access_key.is_some() {
        return Ok(());
    }
    if !bucket.bkt_policy.is_public() {
        return Err(RegistryError::unauthorized("Access-key missing"));
    }
    let allowed = match Operation::of_method(method) {
        Some(Operation::Read) => matches!(bucket.bkt_policy, BktPolicy::Public | BktPolicy::Download),
        Some(Operation::Write) => matches!(bucket.bkt_policy, BktPolicy::Public | BktPolicy::Upload),
        None => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(RegistryError::forbidden(format!(
            "No permission: {method} on {}",
            bucket.name
        )))
    }
}

pub async fn ensure_bucket_owner(tables: &Tables, bucket: &str, pool_id: &str) -> RegistryResult<()> {
    match tables.get_bucket(bucket).await? {
        None => Err(RegistryError::forbidden(format!("Non-existing bucket: {bucket}"))),
        Some(b) if b.pool_id != pool_id => Err(RegistryError::forbidden(format!(
            "Bucket for a wrong pool: {bucket}"
        ))),
        Some(_) => Ok(()),
    }
}

/// The root path is only for waking a backend with the pool's probe key.
pub async fn ensure_probe_key(tables: &Tables, access_key: Option<&str>) -> RegistryResult<String> {
    let Some(access_key) = access_key else {
        return Err(RegistryError::unauthorized("Access-key missing"));
    };
    match tables.get_secret(access_key).await? {
        Some(secret) if !secret.is_probe() => {
            Err(RegistryError::unauthorized(format!("Bad probe key: {access_key}")))
        }
        Some(secret) if secret.expiration_time < epoch_secs() => {
            Err(RegistryError::forbidden(format!("Expired probe key: {access_key}")))
        }
        Some(secret) => Ok(secret.owner),
        None => Err(RegistryError::unauthorized(format!("Bad probe key: {access_key}"))),
    }
}
