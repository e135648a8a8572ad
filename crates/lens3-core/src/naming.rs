//! Naming rules for pools, buckets, access-keys, and users, and the
//! extraction of an access-key from an S3 `Authorization` header.

use std::sync::LazyLock;

use regex::Regex;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9]{19}$").expect("id pattern"));

static BUCKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{3,63}$").expect("bucket pattern"));

// Names that are syntactically fine but reserved or confusing to S3 clients.
static BUCKET_RESERVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9.]*$|^.*-$|^xn--.*$|^.*-s3alias$|^aws$|^amazon$|^minio$|^goog.*$|^g00g.*$")
        .expect("reserved bucket pattern")
});

static USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][-a-z0-9_.]{0,31}$").expect("user pattern"));

/// Length of generated pool-ids and access-keys.
pub const ID_LENGTH: usize = 20;

pub fn check_pool_naming(id: &str) -> bool {
    ID_RE.is_match(id)
}

pub fn check_access_key_naming(key: &str) -> bool {
    ID_RE.is_match(key)
}

pub fn check_bucket_naming(name: &str) -> bool {
    BUCKET_RE.is_match(name) && !BUCKET_RESERVED_RE.is_match(name)
}

pub fn check_user_naming(uid: &str) -> bool {
    USER_RE.is_match(uid)
}

/// Outcome of looking at an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Auth {
    /// No header, or one this router does not interpret.
    Absent,
    /// A well-formed SigV4 header naming a valid access-key.
    Key(String),
    /// A SigV4 header whose credential is unparsable.
    Malformed,
}

/// Extracts the access-key from `AWS4-HMAC-SHA256 Credential=<key>/...`.
/// The signature itself is checked by the backend.
pub fn parse_s3_auth(header: Option<&str>) -> S3Auth {
    let Some(header) = header else {
        return S3Auth::Absent;
    };
    let mut parts = header.split(' ').filter(|s| !s.is_empty());
    if parts.next() != Some("AWS4-HMAC-SHA256") {
        return S3Auth::Absent;
    }
    let Some(credential) = parts.find_map(|p| p.strip_prefix("Credential=")) else {
        return S3Auth::Malformed;
    };
    let key = credential.split('/').next().unwrap_or("");
    if check_access_key_naming(key) {
        S3Auth::Key(key.to_string())
    } else {
        S3Auth::Malformed
    }
}

/// Builds a header that `parse_s3_auth` accepts. Used for probe access.
pub fn forge_s3_auth(access_key: &str) -> String {
    format!("AWS4-HMAC-SHA256 Credential={access_key}////")
}

/// Makes a buckets-directory absolute and free of `.`/`..` components.
/// Returns `None` for relative paths.
pub fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    Some(format!("/{}", parts.join("/")))
}
