//! Starting a Manager process and reading its answer.
//!
//! The Manager is started in its own process group so that it outlives
//! the Mux request that started it. It answers with one line on stdout,
//! the backend endpoint, and then keeps running on its own.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use lens3_core::{Lens3Config, random_str};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ManagerResult};

#[derive(Debug, Clone)]
pub struct Spawner {
    command: PathBuf,
    conf_path: PathBuf,
    mux_host: String,
    mux_port: u16,
    port_min: u16,
    port_max: u16,
    wait: Duration,
}

impl Spawner {
    pub fn new(
        command: PathBuf,
        conf_path: PathBuf,
        mux_host: String,
        mux_port: u16,
        port_min: u16,
        port_max: u16,
        wait: Duration,
    ) -> Self {
        Self {
            command,
            conf_path,
            mux_host,
            mux_port,
            port_min,
            port_max,
            wait,
        }
    }

    /// Waits as long as a Manager may take to start and set up a backend,
    /// plus slack for the process start itself.
    pub fn from_config(config: &Lens3Config, conf_path: &Path, mux_host: &str, mux_port: u16) -> Self {
        let wait = config.manager.activation_wait()
            + Duration::from_secs(config.mux.spawn_extra_timeout);
        Self::new(
            config.mux.manager_command.clone(),
            conf_path.to_path_buf(),
            mux_host.to_string(),
            mux_port,
            config.manager.port_min,
            config.manager.port_max,
            wait,
        )
    }

    fn command(&self, pool_id: &str, trace_id: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("manager")
            .arg(&self.mux_host)
            .arg(self.mux_port.to_string())
            .arg(self.port_min.to_string())
            .arg(self.port_max.to_string())
            .arg(pool_id)
            .arg("--conf")
            .arg(&self.conf_path)
            .arg("--traceid")
            .arg(trace_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Starts a Manager for the pool and returns the endpoint it reports.
    pub async fn spawn(&self, pool_id: &str) -> ManagerResult<String> {
        let trace_id = random_str(12);
        let mut child = self
            .command(pool_id, &trace_id)
            .spawn()
            .map_err(|e| ManagerError::Spawn(format!("{}: {e}", self.command.display())))?;
        debug!(%pool_id, %trace_id, pid = ?child.id(), "manager started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ManagerError::Spawn("manager stdout not captured".to_string()))?;
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        match tokio::time::timeout(self.wait, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 && !line.trim().is_empty() => {
                let endpoint = line.trim().to_string();
                info!(%pool_id, %trace_id, %endpoint, "backend activated");
                Ok(endpoint)
            }
            Ok(Ok(_)) => {
                // No answer: the Manager is done, so collect its status.
                let status = child.wait().await?;
                warn!(%pool_id, %trace_id, %status, "manager exited without an endpoint");
                Err(ManagerError::Spawn(format!("manager exited: {status}")))
            }
            Ok(Err(e)) => Err(ManagerError::Io(e)),
            Err(_) => {
                warn!(%pool_id, %trace_id, wait = ?self.wait, "manager did not answer in time");
                Err(ManagerError::Spawn("manager timed out".to_string()))
            }
        }
    }
}
