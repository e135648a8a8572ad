//! Launching a MinIO process for a pool.
//!
//! A start tries free ports in random order. Each attempt reads the
//! backend's stdout until it either prints its S3 banner or a fatal line,
//! which is sorted into a [`StartError`]. A busy port moves on to the next
//! one; everything else ends the start.

use std::collections::HashSet;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use lens3_core::{ManagerConf, host_port};
use lens3_registry::BackendAdmin;
use lens3_state::{PoolRecord, PoolState, StateResult, Tables, reason};
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const BANNER: &str = "S3-API:";
const PORT_IN_USE: &str = "Specified port is already in use";
const UNWRITABLE: &str = "Unable to write to the backend";

/// Why a backend did not come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// Every candidate port was taken.
    Busy,
    Timeout,
    Exec(String),
    Unwritable(String),
    Failed(String),
    PipeClosed,
}

impl StartError {
    /// The pool state recorded for this failure.
    pub fn pool_state(&self) -> (PoolState, String) {
        match self {
            StartError::Busy => (PoolState::Suspended, reason::SERVER_BUSY.to_string()),
            StartError::Timeout => (PoolState::Suspended, reason::START_TIMEOUT.to_string()),
            StartError::Exec(_) => (PoolState::Inoperable, reason::EXEC_FAILED.to_string()),
            StartError::Unwritable(m) | StartError::Failed(m) => {
                (PoolState::Inoperable, reason::backend_output(m))
            }
            StartError::PipeClosed => (PoolState::Inoperable, reason::PIPE_CLOSED.to_string()),
        }
    }
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Busy => write!(f, "no free port"),
            StartError::Timeout => write!(f, "backend start timed out"),
            StartError::Exec(e) => write!(f, "backend exec failed: {e}"),
            StartError::Unwritable(m) => write!(f, "backend storage unwritable: {m}"),
            StartError::Failed(m) => write!(f, "backend failed: {m}"),
            StartError::PipeClosed => write!(f, "backend closed its output"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Banner {
    Started,
    PortInUse,
    Unwritable(String),
    Failed(String),
}

/// Classifies one stdout line. `None` for ordinary chatter.
fn diagnose_line(line: &str) -> Option<Banner> {
    if line.contains(BANNER) || line.starts_with("API: ") {
        return Some(Banner::Started);
    }
    if !(line.contains("FATAL") || line.contains("ERROR")) {
        return None;
    }
    let message = line_message(line);
    if line.contains(PORT_IN_USE) {
        Some(Banner::PortInUse)
    } else if line.contains(UNWRITABLE) {
        Some(Banner::Unwritable(message))
    } else {
        Some(Banner::Failed(message))
    }
}

/// The `message` field of a JSON log line, or the trimmed line itself.
fn line_message(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| line.trim().to_string())
}

async fn read_banner<R>(lines: &mut Lines<R>) -> Option<Banner>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(banner) = diagnose_line(&line) {
                    return Some(banner);
                }
                debug!(%line, "backend output before banner");
            }
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "reading backend output failed");
                return None;
            }
        }
    }
}

/// Logs what a backend prints until its pipe closes.
fn drain<R>(pool_id: &str, stream: &'static str, lines: Lines<R>)
where
    R: tokio::io::AsyncBufRead + Unpin + Send + 'static,
{
    let pool_id = pool_id.to_string();
    tokio::spawn(async move {
        let mut lines = lines;
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%pool_id, %stream, %line, "backend output");
        }
        debug!(%pool_id, %stream, "backend output closed");
    });
}

fn drain_reader<R>(pool_id: &str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    drain(pool_id, stream, BufReader::new(reader).lines());
}

/// Ports in `[port_min, port_max]` not held by any published backend,
/// shuffled.
pub async fn free_ports(tables: &Tables, port_min: u16, port_max: u16) -> StateResult<Vec<u16>> {
    let used: HashSet<u16> = tables
        .list_processes()
        .await?
        .into_iter()
        .filter_map(|(_, p)| port_of(&p.minio_ep))
        .collect();
    let mut ports: Vec<u16> = (port_min..=port_max).filter(|p| !used.contains(p)).collect();
    ports.shuffle(&mut rand::thread_rng());
    Ok(ports)
}

fn port_of(endpoint: &str) -> Option<u16> {
    endpoint.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
}

/// Everything needed to start a pool's backend.
pub struct Launch<'a> {
    pub conf: &'a ManagerConf,
    pub pool: &'a PoolRecord,
    /// Host part of the published endpoint.
    pub host: &'a str,
    pub root_user: &'a str,
    pub root_password: &'a str,
}

impl Launch<'_> {
    /// The command line, with the privilege drop when `sudo` is set.
    pub fn argv(&self, port: u16) -> Vec<String> {
        let mut argv = Vec::new();
        if !self.conf.sudo.is_empty() {
            argv.extend([
                self.conf.sudo.clone(),
                "-n".to_string(),
                "-u".to_string(),
                self.pool.owner_uid.clone(),
                "-g".to_string(),
                self.pool.owner_gid.clone(),
                "--preserve-env=MINIO_ROOT_USER,MINIO_ROOT_PASSWORD,MINIO_BROWSER".to_string(),
            ]);
        }
        argv.extend([
            self.conf.minio.display().to_string(),
            "--json".to_string(),
            "--anonymous".to_string(),
            "server".to_string(),
            "--address".to_string(),
            format!(":{port}"),
            self.pool.buckets_directory.clone(),
        ]);
        argv
    }

    fn command(&self, port: u16) -> Command {
        let argv = self.argv(port);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("MINIO_ROOT_USER", self.root_user)
            .env("MINIO_ROOT_PASSWORD", self.root_password)
            .env("MINIO_BROWSER", "off")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// A running backend process.
#[derive(Debug)]
pub struct Backend {
    child: Child,
    pub endpoint: String,
    pub port: u16,
    pub pid: u32,
}

impl Backend {
    /// Tries `ports` in order until one start succeeds. The whole attempt
    /// is bounded by the start timeout.
    pub async fn start(launch: &Launch<'_>, ports: &[u16]) -> Result<Self, StartError> {
        let pool_id = launch.pool.pool_id.as_str();
        let deadline = Instant::now() + launch.conf.start_timeout();

        for &port in ports {
            let mut child = launch
                .command(port)
                .spawn()
                .map_err(|e| StartError::Exec(e.to_string()))?;
            let pid = child.id().unwrap_or(0);
            let stdout: ChildStdout = child
                .stdout
                .take()
                .ok_or_else(|| StartError::Exec("stdout not captured".to_string()))?;
            if let Some(stderr) = child.stderr.take() {
                drain_reader(pool_id, "stderr", stderr);
            }
            let mut lines = BufReader::new(stdout).lines();

            let banner = match tokio::time::timeout_at(deadline, read_banner(&mut lines)).await {
                Ok(banner) => banner,
                Err(_) => {
                    warn!(%pool_id, port, "backend start timed out");
                    kill(&mut child).await;
                    return Err(StartError::Timeout);
                }
            };

            match banner {
                Some(Banner::Started) => {
                    drain(pool_id, "stdout", lines);
                    let endpoint = host_port(launch.host, port);
                    info!(%pool_id, %endpoint, pid, "backend started");
                    return Ok(Self {
                        child,
                        endpoint,
                        port,
                        pid,
                    });
                }
                Some(Banner::PortInUse) => {
                    debug!(%pool_id, port, "port in use, trying next");
                    kill(&mut child).await;
                }
                Some(Banner::Unwritable(m)) => {
                    kill(&mut child).await;
                    return Err(StartError::Unwritable(m));
                }
                Some(Banner::Failed(m)) => {
                    kill(&mut child).await;
                    return Err(StartError::Failed(m));
                }
                None => {
                    kill(&mut child).await;
                    return Err(StartError::PipeClosed);
                }
            }
        }
        Err(StartError::Busy)
    }

    /// Resolves when the process exits.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Asks the backend to stop through `admin`, then kills it if it is
    /// still running after `timeout`.
    pub async fn stop(mut self, admin: Option<&dyn BackendAdmin>, timeout: Duration) {
        if let Some(admin) = admin {
            match tokio::time::timeout(timeout, admin.stop()).await {
                Ok(Ok(())) => debug!(endpoint = %self.endpoint, "backend stop requested"),
                Ok(Err(e)) => warn!(endpoint = %self.endpoint, error = %e, "backend stop failed"),
                Err(_) => warn!(endpoint = %self.endpoint, "backend stop timed out"),
            }
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => info!(endpoint = %self.endpoint, %status, "backend exited"),
            _ => {
                warn!(endpoint = %self.endpoint, pid = self.pid, "backend still running, killing");
                kill(&mut self.child).await;
            }
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &str) -> PoolRecord {
        PoolRecord {
            pool_id: "p1".to_string(),
            owner_uid: "alice".to_string(),
            owner_gid: "grp1".to_string(),
            buckets_directory: dir.to_string(),
            probe_key: "k1".to_string(),
            expiration_time: i64::MAX,
            online_status: true,
            modification_time: 0,
        }
    }

    #[test]
    fn diagnoses_banner_lines() {
        assert_eq!(
            diagnose_line(r#"{"level":"INFO","message":"S3-API: http://127.0.0.1:9000"}"#),
            Some(Banner::Started)
        );
        assert_eq!(diagnose_line("API: http://10.0.0.1:9000"), Some(Banner::Started));
        assert_eq!(
            diagnose_line("ERROR Specified port is already in use"),
            Some(Banner::PortInUse)
        );
        assert_eq!(
            diagnose_line(r#"{"level":"FATAL","message":"Unable to write to the backend: denied"}"#),
            Some(Banner::Unwritable("Unable to write to the backend: denied".to_string()))
        );
        assert_eq!(
            diagnose_line("FATAL something else"),
            Some(Banner::Failed("FATAL something else".to_string()))
        );
        assert_eq!(diagnose_line("Status: 1 Online"), None);
    }

    #[test]
    fn start_errors_map_to_states() {
        assert_eq!(StartError::Busy.pool_state().0, PoolState::Suspended);
        assert_eq!(
            StartError::Timeout.pool_state(),
            (PoolState::Suspended, reason::START_TIMEOUT.to_string())
        );
        assert_eq!(StartError::Exec("x".into()).pool_state().0, PoolState::Inoperable);
        assert_eq!(
            StartError::Unwritable("disk".into()).pool_state().1,
            "Backend outputs: disk"
        );
    }

    #[test]
    fn argv_with_and_without_sudo() {
        let p = pool("/data/alice");
        let argv_for = |conf: &ManagerConf| {
            Launch {
                conf,
                pool: &p,
                host: "127.0.0.1",
                root_user: "u",
                root_password: "pw",
            }
            .argv(28001)
        };

        let argv = argv_for(&ManagerConf::default());
        assert_eq!(&argv[..6], ["/usr/bin/sudo", "-n", "-u", "alice", "-g", "grp1"]);
        assert_eq!(argv.last().map(String::as_str), Some("/data/alice"));
        assert!(argv.contains(&":28001".to_string()));

        let plain = ManagerConf {
            sudo: String::new(),
            ..ManagerConf::default()
        };
        assert_eq!(argv_for(&plain)[0], "/usr/local/bin/minio");
    }

    #[test]
    fn port_of_endpoint() {
        assert_eq!(port_of("127.0.0.1:28001"), Some(28001));
        assert_eq!(port_of("[::1]:9000"), Some(9000));
        assert_eq!(port_of("nohost"), None);
    }

    #[tokio::test]
    async fn free_ports_skip_published_ones() {
        let tables = Tables::in_memory();
        tables
            .set_process(
                "p9",
                &lens3_state::ProcessRecord {
                    minio_ep: "127.0.0.1:28002".to_string(),
                    minio_pid: 1,
                    admin: "a".to_string(),
                    password: "b".to_string(),
                    mux_host: "127.0.0.1".to_string(),
                    mux_port: 8003,
                    manager_pid: 2,
                    modification_time: 0,
                },
            )
            .await
            .unwrap();
        let mut ports = free_ports(&tables, 28000, 28003).await.unwrap();
        ports.sort();
        assert_eq!(ports, vec![28000, 28001, 28003]);
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn conf(minio: PathBuf, start_timeout: u64) -> ManagerConf {
            ManagerConf {
                sudo: String::new(),
                minio,
                minio_start_timeout: start_timeout,
                ..ManagerConf::default()
            }
        }

        async fn start_with(conf: &ManagerConf, ports: &[u16]) -> Result<Backend, StartError> {
            let p = pool("/tmp");
            let launch = Launch {
                conf,
                pool: &p,
                host: "127.0.0.1",
                root_user: "u",
                root_password: "pw",
            };
            Backend::start(&launch, ports).await
        }

        #[tokio::test]
        async fn starts_and_stops() {
            let dir = tempfile::tempdir().unwrap();
            let minio = script(dir.path(), "minio", "echo \"S3-API: http://127.0.0.1\"\nexec sleep 30");
            let conf = conf(minio, 5);
            let backend = start_with(&conf, &[28100]).await.unwrap();
            assert_eq!(backend.endpoint, "127.0.0.1:28100");
            backend.stop(None, Duration::from_millis(200)).await;
        }

        #[tokio::test]
        async fn retries_a_busy_port() {
            let dir = tempfile::tempdir().unwrap();
            let mark = dir.path().join("tried");
            let body = format!(
                "if [ -f {m} ]; then echo \"S3-API: up\"; exec sleep 30; fi\n\
                 touch {m}\necho \"ERROR Specified port is already in use\"\nexit 1",
                m = mark.display()
            );
            let conf = conf(script(dir.path(), "minio", &body), 5);
            let backend = start_with(&conf, &[28101, 28102]).await.unwrap();
            assert_eq!(backend.port, 28102);
            backend.stop(None, Duration::from_millis(200)).await;
        }

        #[tokio::test]
        async fn all_ports_busy() {
            let dir = tempfile::tempdir().unwrap();
            let body = "echo \"ERROR Specified port is already in use\"\nexit 1";
            let conf = conf(script(dir.path(), "minio", body), 5);
            assert_eq!(start_with(&conf, &[28103, 28104]).await.unwrap_err(), StartError::Busy);
        }

        #[tokio::test]
        async fn unwritable_storage() {
            let dir = tempfile::tempdir().unwrap();
            let body = "echo \"FATAL Unable to write to the backend\"\nexit 1";
            let conf = conf(script(dir.path(), "minio", body), 5);
            let err = start_with(&conf, &[28105]).await.unwrap_err();
            assert!(matches!(err, StartError::Unwritable(_)));
        }

        #[tokio::test]
        async fn silent_exit_is_pipe_closed() {
            let dir = tempfile::tempdir().unwrap();
            let conf = conf(script(dir.path(), "minio", "exit 0"), 5);
            assert_eq!(start_with(&conf, &[28106]).await.unwrap_err(), StartError::PipeClosed);
        }

        #[tokio::test]
        async fn no_banner_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let conf = conf(script(dir.path(), "minio", "exec sleep 30"), 1);
            assert_eq!(start_with(&conf, &[28107]).await.unwrap_err(), StartError::Timeout);
        }

        #[tokio::test]
        async fn missing_binary_is_exec_failure() {
            let conf = conf(PathBuf::from("/nonexistent/minio"), 1);
            let err = start_with(&conf, &[28108]).await.unwrap_err();
            assert!(matches!(err, StartError::Exec(_)));
        }
    }
}
