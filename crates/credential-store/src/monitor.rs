//! Per-class background monitor
//!
//! One perpetual task per credential class. The first tick fires at startup
//! to seed or validate credentials; later ticks refresh tokens that have
//! entered their refresh window. Foreground callers see a fresh token on the
//! fast path almost all the time.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use twitch_auth::CredentialClass;

use crate::store::CredentialStore;

/// What a single monitor tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotConfigured,
    /// Token is outside its refresh window
    Fresh,
    Refreshed,
    Validated,
    /// Refresh failed but an older token is still cached
    Degraded,
    Failed,
}

/// Spawn the monitor loop for `class`, ticking every `interval`.
///
/// Errors are logged and never end the loop. Each tick runs on its own task
/// so a panic inside a tick is logged and the next tick still fires.
pub fn spawn_monitor_task(
    store: Arc<CredentialStore>,
    class: CredentialClass,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let span = info_span!("monitor", task = %format!("monitor-{class}"));
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "credential monitor started");

            loop {
                ticker.tick().await;
                let tick_store = store.clone();
                let tick = tokio::spawn(
                    async move { monitor_tick(&tick_store, class).await }.in_current_span(),
                );
                match tick.await {
                    Ok(outcome) => debug!(?outcome, "monitor tick finished"),
                    Err(e) => error!(error = %e, "monitor tick aborted"),
                }
            }
        }
        .instrument(span),
    )
}

/// Run one monitor pass for `class`.
pub async fn monitor_tick(store: &CredentialStore, class: CredentialClass) -> TickOutcome {
    if !store.is_configured(class) {
        debug!(class = %class, "class not configured, skipping");
        return TickOutcome::NotConfigured;
    }

    match store.expiry(class).await {
        Some(expires_at) if !store.needs_refresh(class, expires_at) => {
            debug!(
                class = %class,
                remaining_secs = expires_at.saturating_sub(store.now_millis()) / 1000,
                "token outside refresh window"
            );
            TickOutcome::Fresh
        }
        Some(_) => match store.scheduled_token(class).await {
            Ok(token) if token.degraded => TickOutcome::Degraded,
            Ok(_) => TickOutcome::Refreshed,
            Err(e) => {
                warn!(class = %class, error = %e, "scheduled refresh failed");
                TickOutcome::Failed
            }
        },
        None => match store.validate(class).await {
            Ok(true) => TickOutcome::Validated,
            Ok(false) => TickOutcome::Degraded,
            Err(e) => {
                warn!(class = %class, error = %e, "scheduled validation failed");
                TickOutcome::Failed
            }
        },
    }
}
