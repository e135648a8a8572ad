//! Manager mode: supervises one pool's backend.
//!
//! The Mux that started this process reads the first stdout line as the
//! backend endpoint. Everything else goes to the log on stderr.

use std::path::PathBuf;

use anyhow::Context;
use lens3_core::Lens3Config;
use lens3_manager::{Manager, ManagerArgs, Outcome};
use lens3_state::Tables;
use tokio::sync::watch;
use tracing::{info, warn};

/// Returns whether an endpoint was handed to the Mux.
pub async fn run_manager(conf_path: PathBuf, args: ManagerArgs) -> anyhow::Result<bool> {
    let pool_id = args.pool_id.clone();
    let trace_id = args.trace_id.clone();
    info!(%pool_id, %trace_id, pid = std::process::id(), "Lens3 manager starting");

    let config = Lens3Config::from_file(&conf_path)
        .with_context(|| format!("reading {}", conf_path.display()))?;
    let tables = Tables::connect(&config.redis).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(crate::forward_signals(shutdown_tx));

    let manager = Manager::new(tables, config.manager, args);
    let mut stdout = tokio::io::stdout();
    let outcome = manager.run(&mut stdout, shutdown_rx).await?;

    match &outcome {
        Outcome::Terminated(why) => info!(%pool_id, %trace_id, reason = %why, "manager done"),
        Outcome::Yielded(endpoint) => {
            info!(%pool_id, %trace_id, endpoint = ?endpoint, "another manager holds the pool")
        }
        Outcome::Refused(why) | Outcome::Failed(why) => {
            warn!(%pool_id, %trace_id, reason = %why, "backend not started")
        }
    }
    Ok(outcome.delivered())
}
