//! lens3d: the Lens3 daemon.
//!
//! One binary, two roles:
//! - `mux`: the S3 request router, one per front host
//! - `manager`: one backend's supervisor, started by a Mux on demand
//!
//! # Usage
//!
//! ```text
//! lens3d mux --conf /etc/lens3/lens3.toml --host 127.0.0.1 --port 8003
//! lens3d manager 127.0.0.1 8003 28000 28999 <pool-id> --conf /etc/lens3/lens3.toml --traceid <id>
//! ```
//!
//! Logs always go to stderr. A Manager's stdout carries only the endpoint
//! line read by the Mux that started it.

mod manager_mode;
mod mux_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "lens3d", about = "Lens3 daemon")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the S3 request router.
    Mux {
        /// Configuration file.
        #[arg(long, default_value = "/etc/lens3/lens3.toml")]
        conf: PathBuf,

        /// Host name this Mux registers and Managers report endpoints on.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on.
        #[arg(long, default_value = "8003")]
        port: u16,
    },
    /// Run a backend Manager for one pool (started by a Mux).
    Manager {
        mux_host: String,
        mux_port: u16,
        port_min: u16,
        port_max: u16,
        pool_id: String,

        /// Configuration file.
        #[arg(long)]
        conf: PathBuf,

        /// Id tying the Manager's logs to the Mux request that started it.
        #[arg(long, default_value = "-")]
        traceid: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lens3=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Sets `tx` on Ctrl-C or SIGTERM.
async fn forward_signals(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    let _ = tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Mux { conf, host, port } => mux_mode::run_mux(conf, host, port).await,
        Command::Manager {
            mux_host,
            mux_port,
            port_min,
            port_max,
            pool_id,
            conf,
            traceid,
        } => {
            let args = lens3_manager::ManagerArgs {
                mux_host,
                mux_port,
                pool_id,
                port_min,
                port_max,
                trace_id: traceid,
            };
            let delivered = manager_mode::run_manager(conf, args).await?;
            if !delivered {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_manager_command_line() {
        let cli = Cli::try_parse_from([
            "lens3d", "manager", "10.0.0.5", "8003", "28000", "28999", "a1234567890123456789",
            "--conf", "/etc/lens3/lens3.toml", "--traceid", "x7Yq2",
        ])
        .unwrap();
        match cli.command {
            Command::Manager {
                mux_host,
                mux_port,
                port_min,
                port_max,
                pool_id,
                conf,
                traceid,
            } => {
                assert_eq!(mux_host, "10.0.0.5");
                assert_eq!((mux_port, port_min, port_max), (8003, 28000, 28999));
                assert_eq!(pool_id, "a1234567890123456789");
                assert_eq!(conf, PathBuf::from("/etc/lens3/lens3.toml"));
                assert_eq!(traceid, "x7Yq2");
            }
            Command::Mux { .. } => panic!("expected manager"),
        }
    }

    #[test]
    fn mux_defaults_and_json_flag() {
        let cli = Cli::try_parse_from(["lens3d", "mux", "--log-json"]).unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Mux { host, port, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8003);
            }
            Command::Manager { .. } => panic!("expected mux"),
        }
    }

    #[test]
    fn manager_requires_a_config() {
        assert!(Cli::try_parse_from(["lens3d", "manager", "h", "1", "2", "3", "p"]).is_err());
    }
}
