use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::services::maintainer::Maintainer;

/// Drive maintainer ticks until `shutdown` fires
///
/// The first tick runs immediately so work left over from a previous process
/// is recovered on startup.
pub fn start_maintainer_job(maintainer: Arc<Maintainer>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(maintainer.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Operation maintainer started (every {}s)",
            maintainer.tick_interval().as_secs()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Operation maintainer stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = maintainer.tick().await {
                        tracing::error!("Maintainer tick failed: {}", e);
                    }
                }
            }
        }
    })
}
