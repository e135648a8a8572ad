//! The pool state machine.
//!
//! `recompute` derives a pool's state from its record, its owner, and the
//! previously stored state. The Mux only reads the result; the Manager
//! persists it.
//!
//! ```text
//! INITIAL ──▶ READY ──▶ DISABLED | SUSPENDED | INOPERABLE
//!    ▲                      │
//!    └──────────────────────┘ (condition cleared)
//! ```

use lens3_core::epoch_secs;
use tracing::info;

use crate::error::StateResult;
use crate::store::Tables;
use crate::types::*;

/// Reason strings stored next to a state.
pub mod reason {
    pub const NORMAL: &str = "-";

    pub const USER_INACTIVE: &str = "user inactive";
    pub const POOL_EXPIRED: &str = "pool expired";
    pub const POOL_OFFLINE: &str = "pool offline";

    pub const SERVER_BUSY: &str = "server busy";
    pub const START_TIMEOUT: &str = "backend start timeout";

    pub const POOL_REMOVED: &str = "pool removed";
    pub const EXEC_FAILED: &str = "exec failed";
    pub const SETUP_FAILED: &str = "backend setup fails";
    pub const PIPE_CLOSED: &str = "pipe closed";

    /// A fatal message printed by the backend.
    pub fn backend_output(message: &str) -> String {
        format!("Backend outputs: {message}")
    }
}

/// Computes the current state. Pure in its arguments.
///
/// SUSPENDED and INOPERABLE are sticky here: the first is cleared by
/// [`awaken_suspended`], the second only by an operator.
pub fn recompute(
    pool: Option<&PoolRecord>,
    user: Option<&UserRecord>,
    previous: Option<&PoolStateRecord>,
    now: i64,
) -> (PoolState, String) {
    let (Some(pool), Some(previous)) = (pool, previous) else {
        return (PoolState::Inoperable, reason::POOL_REMOVED.to_string());
    };

    match previous.state {
        PoolState::Suspended | PoolState::Inoperable => {
            return (previous.state, previous.reason.clone());
        }
        PoolState::Initial | PoolState::Ready | PoolState::Disabled => {}
    }

    if !user.is_some_and(|u| u.enabled) {
        return (PoolState::Disabled, reason::USER_INACTIVE.to_string());
    }
    if pool.expiration_time < now {
        return (PoolState::Disabled, reason::POOL_EXPIRED.to_string());
    }
    if !pool.online_status {
        return (PoolState::Disabled, reason::POOL_OFFLINE.to_string());
    }

    match previous.state {
        PoolState::Disabled => (PoolState::Initial, reason::NORMAL.to_string()),
        state => (state, previous.reason.clone()),
    }
}

async fn load(
    tables: &Tables,
    pool_id: &str,
) -> StateResult<(Option<PoolRecord>, Option<UserRecord>, Option<PoolStateRecord>)> {
    let pool = tables.get_pool(pool_id).await?;
    let user = match &pool {
        Some(p) => tables.get_user(&p.owner_uid).await?,
        None => None,
    };
    let previous = tables.get_pool_state(pool_id).await?;
    Ok((pool, user, previous))
}

/// Read-only evaluation, as done by the Mux before forwarding.
pub async fn check_pool_state(tables: &Tables, pool_id: &str) -> StateResult<(PoolState, String)> {
    let (pool, user, previous) = load(tables, pool_id).await?;
    Ok(recompute(pool.as_ref(), user.as_ref(), previous.as_ref(), epoch_secs()))
}

/// Evaluates and stores a changed state, as done by the Manager.
pub async fn update_pool_state(tables: &Tables, pool_id: &str) -> StateResult<(PoolState, String)> {
    let (pool, user, previous) = load(tables, pool_id).await?;
    let (state, why) = recompute(pool.as_ref(), user.as_ref(), previous.as_ref(), epoch_secs());
    // A removed pool has nothing left to annotate.
    if pool.is_some() && previous.as_ref().is_none_or(|p| p.state != state || p.reason != why) {
        info!(%pool_id, %state, reason = %why, "pool state changed");
        tables.set_pool_state(pool_id, state, &why).await?;
    }
    Ok((state, why))
}

/// Returns a SUSPENDED pool to INITIAL once it has been suspended for
/// longer than `busy_suspension_time` seconds. True if it was awakened.
pub async fn awaken_suspended(
    tables: &Tables,
    pool_id: &str,
    busy_suspension_time: u64,
) -> StateResult<bool> {
    let Some(record) = tables.get_pool_state(pool_id).await? else {
        return Ok(false);
    };
    let age = epoch_secs() - record.modification_time;
    if record.state == PoolState::Suspended && age > busy_suspension_time as i64 {
        info!(%pool_id, age, "suspended pool awakened");
        tables
            .set_pool_state(pool_id, PoolState::Initial, reason::NORMAL)
            .await?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn pool() -> PoolRecord {
        PoolRecord {
            pool_id: "p1".to_string(),
            owner_uid: "alice".to_string(),
            owner_gid: "grp1".to_string(),
            buckets_directory: "/data/alice".to_string(),
            probe_key: "k1".to_string(),
            expiration_time: NOW + 3600,
            online_status: true,
            modification_time: NOW,
        }
    }

    fn user(enabled: bool) -> UserRecord {
        UserRecord {
            uid: "alice".to_string(),
            claim: String::new(),
            groups: vec!["grp1".to_string()],
            enabled,
            modification_time: NOW,
        }
    }

    fn prev(state: PoolState, why: &str) -> PoolStateRecord {
        PoolStateRecord {
            state,
            reason: why.to_string(),
            modification_time: NOW,
        }
    }

    #[test]
    fn missing_pool_is_inoperable() {
        let (state, why) = recompute(None, Some(&user(true)), Some(&prev(PoolState::Ready, "-")), NOW);
        assert_eq!(state, PoolState::Inoperable);
        assert_eq!(why, reason::POOL_REMOVED);
    }

    #[test]
    fn recompute_is_deterministic() {
        let p = pool();
        let u = user(true);
        let s = prev(PoolState::Ready, reason::NORMAL);
        let a = recompute(Some(&p), Some(&u), Some(&s), NOW);
        let b = recompute(Some(&p), Some(&u), Some(&s), NOW);
        assert_eq!(a, b);
        assert_eq!(a.0, PoolState::Ready);
    }

    #[test]
    fn user_disable_and_reenable() {
        let p = pool();
        let ready = prev(PoolState::Ready, reason::NORMAL);
        let (state, why) = recompute(Some(&p), Some(&user(false)), Some(&ready), NOW);
        assert_eq!(state, PoolState::Disabled);
        assert_eq!(why, reason::USER_INACTIVE);

        let disabled = prev(state, &why);
        let (state, _) = recompute(Some(&p), Some(&user(true)), Some(&disabled), NOW);
        assert_eq!(state, PoolState::Initial);
    }

    #[test]
    fn expiry_and_offline_disable() {
        let mut p = pool();
        p.expiration_time = NOW - 1;
        let s = prev(PoolState::Initial, reason::NORMAL);
        assert_eq!(
            recompute(Some(&p), Some(&user(true)), Some(&s), NOW).1,
            reason::POOL_EXPIRED
        );

        let mut p = pool();
        p.online_status = false;
        assert_eq!(
            recompute(Some(&p), Some(&user(true)), Some(&s), NOW).1,
            reason::POOL_OFFLINE
        );
    }

    #[test]
    fn sticky_states_survive() {
        let p = pool();
        let s = prev(PoolState::Inoperable, reason::SETUP_FAILED);
        let (state, why) = recompute(Some(&p), Some(&user(true)), Some(&s), NOW);
        assert_eq!(state, PoolState::Inoperable);
        assert_eq!(why, reason::SETUP_FAILED);

        let s = prev(PoolState::Suspended, reason::SERVER_BUSY);
        assert_eq!(
            recompute(Some(&p), Some(&user(false)), Some(&s), NOW).0,
            PoolState::Suspended
        );
    }

    #[tokio::test]
    async fn update_persists_transitions() {
        let t = Tables::in_memory();
        let mut p = pool();
        p.expiration_time = epoch_secs() + 3600;
        t.set_pool(&p).await.unwrap();
        t.set_user(&user(false)).await.unwrap();
        t.set_pool_state("p1", PoolState::Ready, reason::NORMAL).await.unwrap();

        let (state, _) = update_pool_state(&t, "p1").await.unwrap();
        assert_eq!(state, PoolState::Disabled);
        assert_eq!(
            t.get_pool_state("p1").await.unwrap().unwrap().state,
            PoolState::Disabled
        );

        // The read-only check agrees without writing.
        t.set_user(&user(true)).await.unwrap();
        let (state, _) = check_pool_state(&t, "p1").await.unwrap();
        assert_eq!(state, PoolState::Initial);
        assert_eq!(
            t.get_pool_state("p1").await.unwrap().unwrap().state,
            PoolState::Disabled
        );
    }

    #[tokio::test]
    async fn awaken_only_after_suspension_time() {
        let t = Tables::in_memory();
        t.set_pool_state("p1", PoolState::Suspended, reason::SERVER_BUSY)
            .await
            .unwrap();
        assert!(!awaken_suspended(&t, "p1", 3600).await.unwrap());
        // Ages are whole seconds.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(awaken_suspended(&t, "p1", 0).await.unwrap());
        assert_eq!(
            t.get_pool_state("p1").await.unwrap().unwrap().state,
            PoolState::Initial
        );
    }
}
