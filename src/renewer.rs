//! Certificate-renewal singleton job.
//!
//! Every cycle takes the process-wide `renewer_lock` advisory lock without
//! blocking; a held lock means another replica is already renewing and this
//! cycle is skipped. The ACME client itself is deployment-specific and runs
//! outside the core; it drives `SessionStore::publish_txt_challenge` to
//! place `_acme-challenge` TXT records through the normal resolver buckets.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use echotrap_store::SessionStore;

/// Cadence of renewal checks.
const RENEW_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);

/// Lock TTL: an abandoned holder decays after an hour.
const LOCK_TTL: Duration = Duration::from_secs(60 * 60);

const LOCK_NAME: &str = "renewer_lock";

/// Run renewal cycles until shutdown. The first cycle fires immediately.
pub async fn run(sessions: SessionStore, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(RENEW_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = cycle(&sessions).await {
                    warn!(%err, "renewal cycle failed");
                }
            }
        }
    }
}

async fn cycle(sessions: &SessionStore) -> echotrap_core::Result<()> {
    let Some(lock) = sessions.store().try_lock(LOCK_NAME, LOCK_TTL).await? else {
        debug!("renewal cycle skipped; lock held elsewhere");
        return Ok(());
    };
    info!("acquired renewer lock");

    // Certificate inspection and ACME ordering run out-of-process; the
    // in-core contract is this lock cycle plus the TXT challenge write path.

    lock.release().await?;
    info!("released renewer lock");
    Ok(())
}
