//! Background pruning of expired session state.

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error};

use super::handlers::auth::AuthState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub revocations: u64,
    pub refresh_tokens: u64,
    pub rate_limit_windows: usize,
}

/// Prune revocation entries, refresh records and elapsed throttle windows once.
pub async fn sweep_once(auth_state: &AuthState) -> SweepReport {
    let rate_limit_windows = auth_state.rate_limiter().prune();
    let mut report = SweepReport {
        rate_limit_windows,
        ..SweepReport::default()
    };
    match auth_state.service().prune_expired(Utc::now()).await {
        Ok(pruned) => {
            report.revocations = pruned.revocations;
            report.refresh_tokens = pruned.refresh_tokens;
        }
        Err(err) => error!("session sweep failed: {err}"),
    }
    report
}

pub fn spawn_sweeper(auth_state: Arc<AuthState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let report = sweep_once(&auth_state).await;
            debug!(
                revocations = report.revocations,
                refresh_tokens = report.refresh_tokens,
                rate_limit_windows = report.rate_limit_windows,
                "session sweep complete"
            );
        }
    })
}
