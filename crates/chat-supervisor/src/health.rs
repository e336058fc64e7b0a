//! Periodic connection health probe
//!
//! Catches sessions that died without a close event. Each tick asks the
//! supervisor to compare its state with the transport; a connected state
//! with a dead transport, or a disconnected state, starts a reconnect.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span};

use crate::supervisor::SupervisorHandle;

pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the probe loop. The first probe fires one `interval` after start.
/// The loop ends once the supervisor has stopped.
pub fn spawn_health_probe(
    handle: SupervisorHandle,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "chat health probe started");

            loop {
                ticker.tick().await;
                if handle.probe().await.is_err() {
                    debug!("supervisor stopped, ending health probe");
                    break;
                }
            }
        }
        .instrument(info_span!("health_probe")),
    )
}
