//! Keeps this Mux's `mx:` record alive while it runs.

use lens3_core::{MuxConf, epoch_secs, host_port, jittered};
use lens3_state::{MuxRecord, Tables};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Writes the record every `mux_heartbeat_interval` (jittered) with a TTL
/// of `mux_expiry`, and deletes it once `shutdown` fires.
pub async fn run_registration(
    tables: Tables,
    conf: MuxConf,
    host: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let mux_ep = host_port(&host, port);
    let start_time = epoch_secs();
    let ttl = Duration::from_secs(conf.mux_expiry);
    info!(%mux_ep, "mux registration started");

    loop {
        let record = MuxRecord {
            host: host.clone(),
            port,
            start_time,
            modification_time: epoch_secs(),
        };
        match tables.set_mux(&mux_ep, &record, ttl).await {
            Ok(()) => debug!(%mux_ep, "mux record refreshed"),
            Err(e) => warn!(%mux_ep, error = %e, "mux record refresh failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(jittered(conf.mux_heartbeat_interval())) => {}
            _ = shutdown.changed() => break,
        }
    }

    if let Err(e) = tables.delete_mux(&mux_ep).await {
        warn!(%mux_ep, error = %e, "mux record removal failed");
    }
    info!(%mux_ep, "mux registration stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn record_lives_until_shutdown() {
        let tables = Tables::in_memory();
        let conf = MuxConf {
            mux_expiry: 30,
            mux_heartbeat_interval: 10,
            ..MuxConf::default()
        };
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_registration(
            tables.clone(),
            conf,
            "127.0.0.1".to_string(),
            8003,
            rx,
        ));

        // Well past one TTL: only the refreshes keep it alive.
        tokio::time::sleep(Duration::from_secs(95)).await;
        let record = tables.get_mux("127.0.0.1:8003").await.unwrap().unwrap();
        assert_eq!(record.port, 8003);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(tables.get_mux("127.0.0.1:8003").await.unwrap().is_none());
    }
}
