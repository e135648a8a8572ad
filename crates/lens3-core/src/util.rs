//! Clock and randomness helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;

use crate::naming::ID_LENGTH;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A random alphanumeric string of `len` characters.
pub fn random_str(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A random pool-id or access-key: a letter followed by alphanumerics.
pub fn random_id() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    let first = LETTERS.choose(&mut rng).copied().unwrap_or(b'a') as char;
    let mut id = String::with_capacity(ID_LENGTH);
    id.push(first);
    id.push_str(&random_str(ID_LENGTH - 1));
    id
}

/// Adds up to `base / 8` of random delay so that many loops with the
/// same period do not hit the store in lockstep.
pub fn jittered(base: Duration) -> Duration {
    let max = base.as_millis() as u64 / 8;
    if max == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// `host:port`, bracketing IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::check_pool_naming;

    #[test]
    fn random_ids_are_valid() {
        for _ in 0..100 {
            assert!(check_pool_naming(&random_id()));
        }
    }

    #[test]
    fn jitter_stays_bounded() {
        let base = Duration::from_secs(8);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d >= base && d <= base + Duration::from_secs(1));
        }
    }

    #[test]
    fn host_port_formats() {
        assert_eq!(host_port("node1", 8000), "node1:8000");
        assert_eq!(host_port("::1", 8000), "[::1]:8000");
    }
}
