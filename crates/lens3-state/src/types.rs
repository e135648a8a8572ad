//! Records stored as JSON values.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Setting ────────────────────────────────────────────────────

/// A user account. A disabled user disables every pool it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub uid: String,
    #[serde(default)]
    pub claim: String,
    pub groups: Vec<String>,
    pub enabled: bool,
    pub modification_time: i64,
}

// ── Storage ────────────────────────────────────────────────────

/// A tenant's storage namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolRecord {
    pub pool_id: String,
    pub owner_uid: String,
    pub owner_gid: String,
    pub buckets_directory: String,
    pub probe_key: String,
    pub expiration_time: i64,
    pub online_status: bool,
    pub modification_time: i64,
}

/// Lifecycle state of a pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Initial,
    Ready,
    Suspended,
    Disabled,
    Inoperable,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Initial => "initial",
            PoolState::Ready => "ready",
            PoolState::Suspended => "suspended",
            PoolState::Disabled => "disabled",
            PoolState::Inoperable => "inoperable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolStateRecord {
    pub state: PoolState,
    pub reason: String,
    pub modification_time: i64,
}

// ── Process ────────────────────────────────────────────────────

/// The distributed mutex for a pool. Its holder drives the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerRecord {
    pub mux_host: String,
    pub mux_port: u16,
    pub start_time: i64,
}

/// A running backend, published by its Manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRecord {
    pub minio_ep: String,
    pub minio_pid: u32,
    pub admin: String,
    pub password: String,
    pub mux_host: String,
    pub mux_port: u16,
    pub manager_pid: u32,
    pub modification_time: i64,
}

/// A live Mux instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MuxRecord {
    pub host: String,
    pub port: u16,
    pub start_time: i64,
    pub modification_time: i64,
}

// ── Routing ────────────────────────────────────────────────────

/// Public-access policy of a bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BktPolicy {
    None,
    Upload,
    Download,
    Public,
}

impl BktPolicy {
    /// Whether keyless access is accepted at all.
    pub fn is_public(self) -> bool {
        !matches!(self, BktPolicy::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BktPolicy::None => "none",
            BktPolicy::Upload => "upload",
            BktPolicy::Download => "download",
            BktPolicy::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketRecord {
    pub name: String,
    #[serde(rename = "pool")]
    pub pool_id: String,
    pub bkt_policy: BktPolicy,
    pub modification_time: i64,
}

// ── Monokey ────────────────────────────────────────────────────

/// Access policy of a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeyPolicy {
    Readwrite,
    Readonly,
    Writeonly,
}

impl KeyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyPolicy::Readwrite => "readwrite",
            KeyPolicy::Readonly => "readonly",
            KeyPolicy::Writeonly => "writeonly",
        }
    }
}

/// A claimed unique id. Pool-ids and access-keys share one id space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "use", rename_all = "lowercase")]
pub enum UniqueId {
    Pool {
        owner: String,
        modification_time: i64,
    },
    Akey {
        owner: String,
        secret_key: String,
        key_policy: KeyPolicy,
        expiration_time: i64,
        modification_time: i64,
    },
}

impl UniqueId {
    pub fn owner(&self) -> &str {
        match self {
            UniqueId::Pool { owner, .. } | UniqueId::Akey { owner, .. } => owner,
        }
    }
}

/// An access-key as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretRecord {
    pub access_key: String,
    /// The owning pool.
    pub owner: String,
    pub secret_key: String,
    pub key_policy: KeyPolicy,
    pub expiration_time: i64,
    pub modification_time: i64,
}

impl SecretRecord {
    /// A probe key has no usable secret; it only wakes a backend up.
    pub fn is_probe(&self) -> bool {
        self.secret_key.is_empty()
    }

    pub fn from_id(access_key: &str, id: UniqueId) -> Option<Self> {
        match id {
            UniqueId::Akey {
                owner,
                secret_key,
                key_policy,
                expiration_time,
                modification_time,
            } => Some(Self {
                access_key: access_key.to_string(),
                owner,
                secret_key,
                key_policy,
                expiration_time,
                modification_time,
            }),
            UniqueId::Pool { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_is_tagged_by_use() {
        let id = UniqueId::Akey {
            owner: "p1".to_string(),
            secret_key: String::new(),
            key_policy: KeyPolicy::Readwrite,
            expiration_time: 10,
            modification_time: 1,
        };
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["use"], "akey");
        assert_eq!(json["key_policy"], "readwrite");

        let secret = SecretRecord::from_id("k1", id).unwrap();
        assert!(secret.is_probe());
    }

    #[test]
    fn bucket_record_uses_pool_field() {
        let b = BucketRecord {
            name: "photos".to_string(),
            pool_id: "p1".to_string(),
            bkt_policy: BktPolicy::Public,
            modification_time: 0,
        };
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["pool"], "p1");
        assert!(b.bkt_policy.is_public());
        assert!(!BktPolicy::None.is_public());
    }

    #[test]
    fn pool_state_display_matches_serde() {
        let s = serde_json::to_string(&PoolState::Inoperable).unwrap();
        assert_eq!(s, format!("\"{}\"", PoolState::Inoperable));
    }
}
