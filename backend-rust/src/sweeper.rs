use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

use crate::hub::Hub;

// ── Liveness Sweeper ─────────────────────────────────────────────────────────

/// Runs [`Hub::sweep`] every heartbeat interval, starting one interval from
/// now. Never returns.
pub async fn run_liveness_sweeper(hub: Hub) {
    let period = hub.config().heartbeat_interval();
    info!("Liveness sweep every {}s", period.as_secs());

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        hub.sweep().await;
    }
}
