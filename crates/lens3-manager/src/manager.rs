//! The Manager: one per pool activation.
//!
//! ```text
//! set_ex_manager ──lost──▶ wait for the holder's endpoint ──▶ Yielded
//!       │won
//!       ▼
//! check pool state ──▶ start backend ──▶ setup ──▶ publish ──▶ READY
//!                                                            │
//!                          teardown ◀── Termination ◀── watch loop
//! ```
//!
//! The manager record is the pool's mutex. It and the records published
//! for the backend carry a TTL that only the heartbeat extends, so a
//! crashed Manager's records fall out of the store on their own.

use std::fmt;
use std::time::Duration;

use lens3_core::{ManagerConf, epoch_secs, jittered, random_id, random_str};
use lens3_registry::{BackendAdmin, McAdmin, RegistryResult};
use lens3_state::{
    ManagerRecord, PoolState, ProcessRecord, StateResult, Tables, reason, update_pool_state,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Launch, free_ports};
use crate::checker::{HeartbeatTracker, LIVENESS_PATH, http_probe};
use crate::error::ManagerResult;
use crate::setup::reconcile;

/// Interval for polling another Manager's endpoint.
const ENDPOINT_POLL: Duration = Duration::from_secs(1);

/// Command-line arguments of a Manager process.
#[derive(Debug, Clone)]
pub struct ManagerArgs {
    pub mux_host: String,
    pub mux_port: u16,
    pub pool_id: String,
    pub port_min: u16,
    pub port_max: u16,
    pub trace_id: String,
}

/// Why a running backend was stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The pool state left READY. Carries the state's reason.
    Ineligible(String),
    /// Another Manager's record replaced this one.
    Overtaken,
    /// A published record expired or was deleted.
    RecordsVanished,
    HeartbeatFailure,
    IdleTimeout,
    BackendExited,
    Signal,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Ineligible(why) => write!(f, "pool ineligible ({why})"),
            Termination::Overtaken => write!(f, "entry overtaken"),
            Termination::RecordsVanished => write!(f, "entry expired"),
            Termination::HeartbeatFailure => write!(f, "heartbeat failure"),
            Termination::IdleTimeout => write!(f, "idle timeout"),
            Termination::BackendExited => write!(f, "backend exited"),
            Termination::Signal => write!(f, "signal"),
        }
    }
}

/// How a Manager run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Another Manager holds the pool. Carries its endpoint if one showed
    /// up in time.
    Yielded(Option<String>),
    /// The pool may not run now. Carries the state's reason.
    Refused(String),
    /// The backend could not be brought up.
    Failed(String),
    /// The backend served and was stopped.
    Terminated(Termination),
}

impl Outcome {
    /// Whether an endpoint was handed to the caller.
    pub fn delivered(&self) -> bool {
        matches!(self, Outcome::Yielded(Some(_)) | Outcome::Terminated(_))
    }
}

/// A backend that is up and published.
struct Running {
    backend: Backend,
    admin: Option<McAdmin>,
    process: ProcessRecord,
}

/// True when the pool has seen no access for longer than `awake` seconds.
/// A missing or older timestamp counts from the Manager's start.
pub fn idle_expired(last_access: Option<i64>, start_time: i64, now: i64, awake: u64) -> bool {
    let last = last_access.unwrap_or(start_time).max(start_time);
    now - last > awake as i64
}

pub struct Manager {
    tables: Tables,
    conf: ManagerConf,
    args: ManagerArgs,
}

impl Manager {
    pub fn new(tables: Tables, conf: ManagerConf, args: ManagerArgs) -> Self {
        Self { tables, conf, args }
    }

    /// Runs one activation to its end.
    ///
    /// The endpoint is written to `out` as a single line as soon as it is
    /// known, and `out` is shut down after it. Setting `shutdown` stops a
    /// running backend through the normal teardown.
    pub async fn run<W>(&self, out: &mut W, shutdown: watch::Receiver<bool>) -> ManagerResult<Outcome>
    where
        W: AsyncWrite + Unpin,
    {
        let pool_id = self.args.pool_id.as_str();
        let trace_id = self.args.trace_id.as_str();
        let mine = ManagerRecord {
            mux_host: self.args.mux_host.clone(),
            mux_port: self.args.mux_port,
            start_time: epoch_secs(),
        };

        if !self.tables.set_ex_manager(pool_id, &mine).await? {
            let endpoint = self.wait_for_endpoint().await?;
            match &endpoint {
                Some(ep) => {
                    info!(%pool_id, %trace_id, endpoint = %ep, "another manager serves the pool");
                    send_endpoint(out, ep).await;
                }
                None => warn!(%pool_id, %trace_id, "another manager did not publish an endpoint in time"),
            }
            return Ok(Outcome::Yielded(endpoint));
        }
        if let Err(e) = self
            .tables
            .set_manager_expiry(pool_id, self.conf.manager_expiry())
            .await
        {
            error!(%pool_id, %trace_id, error = %e, "manager record without expiry, releasing it");
            self.release_manager(&mine).await;
            return Err(e.into());
        }
        info!(%pool_id, %trace_id, "manager record taken");

        let mut running = match self.bring_up().await {
            Ok(running) => running,
            Err(outcome) => {
                self.release_manager(&mine).await;
                return Ok(outcome);
            }
        };

        send_endpoint(out, &running.process.minio_ep).await;

        let termination = self.watch(&mut running, &mine, shutdown).await;
        info!(%pool_id, %trace_id, %termination, "stopping backend");
        self.teardown(running, &mine).await;
        Ok(Outcome::Terminated(termination))
    }

    async fn wait_for_endpoint(&self) -> StateResult<Option<String>> {
        let deadline = Instant::now() + self.conf.activation_wait();
        loop {
            if let Some(ep) = self.tables.get_endpoint(&self.args.pool_id).await? {
                return Ok(Some(ep));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(ENDPOINT_POLL).await;
        }
    }

    /// Starts, sets up, and publishes the backend. On failure the pool
    /// state is already recorded and nothing is left running.
    async fn bring_up(&self) -> Result<Running, Outcome> {
        let pool_id = self.args.pool_id.as_str();
        let store_failure = |e: lens3_state::StateError| {
            error!(%pool_id, error = %e, "store failure at startup");
            Outcome::Failed(e.to_string())
        };

        let (state, why) = update_pool_state(&self.tables, pool_id)
            .await
            .map_err(store_failure)?;
        if !matches!(state, PoolState::Initial | PoolState::Ready) {
            info!(%pool_id, %state, reason = %why, "pool not eligible to run");
            return Err(Outcome::Refused(why));
        }
        let pool = self
            .tables
            .get_pool(pool_id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| Outcome::Refused(reason::POOL_REMOVED.to_string()))?;

        self.clear_stale_records().await;

        let root_user = random_id();
        let root_password = random_str(48);
        let ports = free_ports(&self.tables, self.args.port_min, self.args.port_max)
            .await
            .map_err(store_failure)?;
        let launch = Launch {
            conf: &self.conf,
            pool: &pool,
            host: &self.args.mux_host,
            root_user: &root_user,
            root_password: &root_password,
        };
        let backend = match Backend::start(&launch, &ports).await {
            Ok(backend) => backend,
            Err(e) => {
                let (state, why) = e.pool_state();
                warn!(%pool_id, error = %e, %state, "backend did not start");
                self.record_state(state, &why).await;
                return Err(Outcome::Failed(why));
            }
        };

        if state == PoolState::Initial || self.conf.minio_setup_at_start {
            let setup = self.setup(&backend.endpoint, &root_user, &root_password);
            let result = tokio::time::timeout(self.conf.setup_timeout(), setup).await;
            let message = match result {
                Ok(Ok(admin)) => {
                    return self
                        .finish_bring_up(backend, Some(admin), root_user, root_password)
                        .await;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "timed out".to_string(),
            };
            error!(%pool_id, %message, "backend setup failed");
            self.record_state(PoolState::Inoperable, reason::SETUP_FAILED).await;
            backend.stop(None, self.conf.stop_timeout()).await;
            return Err(Outcome::Failed(reason::SETUP_FAILED.to_string()));
        }
        self.finish_bring_up(backend, None, root_user, root_password).await
    }

    /// Publishes the backend's records and marks the pool READY.
    async fn finish_bring_up(
        &self,
        backend: Backend,
        admin: Option<McAdmin>,
        root_user: String,
        root_password: String,
    ) -> Result<Running, Outcome> {
        let pool_id = self.args.pool_id.as_str();
        let process = ProcessRecord {
            minio_ep: backend.endpoint.clone(),
            minio_pid: backend.pid,
            admin: root_user,
            password: root_password,
            mux_host: self.args.mux_host.clone(),
            mux_port: self.args.mux_port,
            manager_pid: std::process::id(),
            modification_time: epoch_secs(),
        };
        if let Err(e) = self.publish(&process).await {
            error!(%pool_id, error = %e, "publishing backend failed");
            let admin_ref = admin.as_ref().map(|a| a as &dyn BackendAdmin);
            backend.stop(admin_ref, self.conf.stop_timeout()).await;
            return Err(Outcome::Failed(e.to_string()));
        }
        info!(%pool_id, endpoint = %process.minio_ep, "backend ready");

        Ok(Running {
            backend,
            admin,
            process,
        })
    }

    async fn setup(&self, endpoint: &str, root_user: &str, root_password: &str) -> RegistryResult<McAdmin> {
        let admin = McAdmin::open(
            &self.conf.mc,
            endpoint,
            root_user,
            root_password,
            &self.args.pool_id,
            self.conf.mc_timeout(),
        )
        .await?;
        reconcile(&admin, &self.tables, &self.args.pool_id).await?;
        Ok(admin)
    }

    async fn publish(&self, process: &ProcessRecord) -> StateResult<()> {
        let pool_id = self.args.pool_id.as_str();
        let expiry = self.conf.manager_expiry();
        self.tables.set_process(pool_id, process).await?;
        self.tables.set_process_expiry(pool_id, expiry).await?;
        self.tables.set_endpoint(pool_id, &process.minio_ep).await?;
        self.tables.set_endpoint_expiry(pool_id, expiry).await?;
        self.tables
            .set_pool_state(pool_id, PoolState::Ready, reason::NORMAL)
            .await
    }

    /// Records left by a dead Manager. Holding the manager record makes
    /// them stale by definition.
    async fn clear_stale_records(&self) {
        let pool_id = self.args.pool_id.as_str();
        if let Ok(true) = self.tables.delete_process(pool_id).await {
            warn!(%pool_id, "stale process record removed");
        }
        if let Ok(true) = self.tables.delete_endpoint(pool_id).await {
            warn!(%pool_id, "stale endpoint record removed");
        }
    }

    async fn record_state(&self, state: PoolState, why: &str) {
        if let Err(e) = self.tables.set_pool_state(&self.args.pool_id, state, why).await {
            warn!(pool_id = %self.args.pool_id, error = %e, "storing pool state failed");
        }
    }

    async fn watch(
        &self,
        running: &mut Running,
        mine: &ManagerRecord,
        mut shutdown: watch::Receiver<bool>,
    ) -> Termination {
        let mut tracker = HeartbeatTracker::new(self.conf.heartbeat_miss_tolerance);
        if *shutdown.borrow() {
            return Termination::Signal;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(jittered(self.conf.heartbeat_interval())) => {}
                _ = shutdown.changed() => return Termination::Signal,
                status = running.backend.wait() => {
                    warn!(pool_id = %self.args.pool_id, ?status, "backend exited on its own");
                    return Termination::BackendExited;
                }
            }
            if let Some(termination) = self.heartbeat(&mut tracker, &running.process, mine).await {
                return termination;
            }
        }
    }

    /// One watch cycle. Store errors are logged and retried next cycle;
    /// the record TTLs bound how long that can go on.
    async fn heartbeat(
        &self,
        tracker: &mut HeartbeatTracker,
        process: &ProcessRecord,
        mine: &ManagerRecord,
    ) -> Option<Termination> {
        let pool_id = self.args.pool_id.as_str();

        match update_pool_state(&self.tables, pool_id).await {
            Ok((PoolState::Ready, _)) => {}
            Ok((state, why)) => {
                info!(%pool_id, %state, reason = %why, "pool no longer ready");
                return Some(Termination::Ineligible(why));
            }
            Err(e) => warn!(%pool_id, error = %e, "pool state check failed"),
        }

        match self.tables.get_manager(pool_id).await {
            Ok(Some(current)) if current == *mine => {}
            Ok(Some(current)) => {
                warn!(%pool_id, holder = %current.mux_host, start_time = current.start_time, "manager record overtaken");
                return Some(Termination::Overtaken);
            }
            Ok(None) => {
                warn!(%pool_id, "manager record expired");
                return Some(Termination::RecordsVanished);
            }
            Err(e) => warn!(%pool_id, error = %e, "manager record check failed"),
        }

        match self.refresh_expiry().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%pool_id, "published record vanished");
                return Some(Termination::RecordsVanished);
            }
            Err(e) => warn!(%pool_id, error = %e, "refreshing expiry failed"),
        }

        let probe = http_probe(&process.minio_ep, LIVENESS_PATH, self.conf.heartbeat_timeout()).await;
        if tracker.record(probe) {
            return Some(Termination::HeartbeatFailure);
        }

        match self.tables.get_access_timestamp(pool_id).await {
            Ok(last) => {
                if idle_expired(last, mine.start_time, epoch_secs(), self.conf.minio_awake_duration) {
                    return Some(Termination::IdleTimeout);
                }
            }
            Err(e) => warn!(%pool_id, error = %e, "access timestamp check failed"),
        }

        debug!(%pool_id, "heartbeat ok");
        None
    }

    /// Extends all three records. False if any was gone.
    async fn refresh_expiry(&self) -> StateResult<bool> {
        let pool_id = self.args.pool_id.as_str();
        let expiry = self.conf.manager_expiry();
        let manager = self.tables.set_manager_expiry(pool_id, expiry).await?;
        let process = self.tables.set_process_expiry(pool_id, expiry).await?;
        let endpoint = self.tables.set_endpoint_expiry(pool_id, expiry).await?;
        Ok(manager && process && endpoint)
    }

    async fn teardown(&self, running: Running, mine: &ManagerRecord) {
        let Running {
            backend,
            admin,
            process,
        } = running;
        let admin = match admin {
            Some(admin) => Some(admin),
            None => McAdmin::open(
                &self.conf.mc,
                &process.minio_ep,
                &process.admin,
                &process.password,
                &self.args.pool_id,
                self.conf.mc_timeout(),
            )
            .await
            .inspect_err(|e| warn!(pool_id = %self.args.pool_id, error = %e, "no admin session for stop"))
            .ok(),
        };
        let admin_ref = admin.as_ref().map(|a| a as &dyn BackendAdmin);
        backend.stop(admin_ref, self.conf.stop_timeout()).await;

        let pool_id = self.args.pool_id.as_str();
        if still_mine("process", pool_id, self.tables.get_process(pool_id).await, &process) {
            log_delete("process", pool_id, self.tables.delete_process(pool_id).await);
        }
        let endpoint = self.tables.get_endpoint(pool_id).await;
        if still_mine("endpoint", pool_id, endpoint, &process.minio_ep) {
            log_delete("endpoint", pool_id, self.tables.delete_endpoint(pool_id).await);
        }
        self.release_manager(mine).await;
    }

    async fn release_manager(&self, mine: &ManagerRecord) {
        let pool_id = self.args.pool_id.as_str();
        if still_mine("manager", pool_id, self.tables.get_manager(pool_id).await, mine) {
            log_delete("manager", pool_id, self.tables.delete_manager(pool_id).await);
        }
    }
}

/// Compares a stored record with this Manager's copy. A replaced record
/// belongs to someone else and is left in place.
fn still_mine<T: PartialEq>(what: &str, pool_id: &str, current: StateResult<Option<T>>, mine: &T) -> bool {
    match current {
        Ok(Some(current)) if current == *mine => true,
        Ok(Some(_)) => {
            warn!(%pool_id, record = %what, "record replaced by another manager, left in place");
            false
        }
        Ok(None) => {
            debug!(%pool_id, record = %what, "record already gone");
            false
        }
        Err(e) => {
            warn!(%pool_id, record = %what, error = %e, "record check failed");
            false
        }
    }
}

/// A failed delete leaves the record to its TTL.
fn log_delete(what: &str, pool_id: &str, result: StateResult<bool>) {
    match result {
        Ok(_) => debug!(%pool_id, record = %what, "record deleted"),
        Err(e) => warn!(%pool_id, record = %what, error = %e, "deleting record failed, left to expire"),
    }
}

/// Writes the endpoint line and closes the writer. The reader may have
/// gone away already, which only costs a warning.
async fn send_endpoint<W: AsyncWrite + Unpin>(out: &mut W, endpoint: &str) {
    let line = format!("{endpoint}\n");
    let result = async {
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        out.shutdown().await
    }
    .await;
    if let Err(e) = result {
        warn!(%endpoint, error = %e, "reporting endpoint failed");
    }
}
