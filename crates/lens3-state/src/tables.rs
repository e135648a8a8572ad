//! Namespaces and key prefixes.
//!
//! A key is `{prefix}{id}`. Prefixes are distinct across namespaces even
//! though each namespace lives in its own database, so a key alone says
//! what it holds.

/// Logical databases of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Users and claims.
    Setting,
    /// Pools, pool states, buckets-directories.
    Storage,
    /// Manager, backend process, and Mux records.
    Process,
    /// Endpoints, buckets, access timestamps, direct hostnames.
    Routing,
    /// Unique pool-ids and access-keys.
    Monokey,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Setting,
        Namespace::Storage,
        Namespace::Process,
        Namespace::Routing,
        Namespace::Monokey,
    ];

    /// Redis database number.
    pub fn db(self) -> u8 {
        match self {
            Namespace::Setting => 0,
            Namespace::Storage => 1,
            Namespace::Process => 2,
            Namespace::Routing => 3,
            Namespace::Monokey => 4,
        }
    }
}

// ── Setting ────────────────────────────────────────────────────

/// `uu:{uid}` → `UserRecord`
pub const USER: &str = "uu:";
/// `um:{claim}` → uid
pub const CLAIM: &str = "um:";

// ── Storage ────────────────────────────────────────────────────

/// `po:{pool_id}` → `PoolRecord`
pub const POOL: &str = "po:";
/// `ps:{pool_id}` → `PoolStateRecord`
pub const POOL_STATE: &str = "ps:";
/// `bd:{path}` → pool_id (claimed by set-if-absent)
pub const BUCKETS_DIRECTORY: &str = "bd:";

// ── Process ────────────────────────────────────────────────────

/// `ma:{pool_id}` → `ManagerRecord` (mutex, with TTL)
pub const MANAGER: &str = "ma:";
/// `mn:{pool_id}` → `ProcessRecord` (with TTL)
pub const PROCESS: &str = "mn:";
/// `mx:{host:port}` → `MuxRecord` (with TTL)
pub const MUX: &str = "mx:";

// ── Routing ────────────────────────────────────────────────────

/// `ep:{pool_id}` → "host:port" (with TTL)
pub const ENDPOINT: &str = "ep:";
/// `bk:{bucket}` → `BucketRecord` (claimed by set-if-absent)
pub const BUCKET: &str = "bk:";
/// `ts:{pool_id}` → epoch seconds of the last access
pub const ACCESS_TIMESTAMP: &str = "ts:";
/// `dh:{hostname}` → pool_id (claimed by set-if-absent)
pub const DIRECT_HOSTNAME: &str = "dh:";

// ── Monokey ────────────────────────────────────────────────────

/// `id:{id}` → `UniqueId`
pub const UNIQUE_ID: &str = "id:";

pub fn key(prefix: &str, id: &str) -> String {
    format!("{prefix}{id}")
}

/// Strips `prefix` from a scanned key.
pub fn id_of<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}
