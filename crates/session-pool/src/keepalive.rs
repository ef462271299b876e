//! Background keepalive for idle sessions
//!
//! Periodically pings every idle session, evicts the ones the server no longer
//! recognizes and tops the pool back up to `min`. Runs independently of the
//! acquire path and exits once the pool is closed.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pool::SessionPool;

/// Spawn a background task that keeps idle sessions alive.
///
/// Runs every `interval`. A session whose ping fails is dropped from the pool;
/// a failed refill is logged and retried on the next cycle.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_keepalive_task(pool: SessionPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Sessions were just authenticated
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if pool.is_closed() {
                debug!(user = %pool.user(), "pool closed, keepalive stopping");
                break;
            }
            keepalive_cycle(&pool).await;
        }
    })
}

/// Run one keepalive cycle: ping idle sessions, then refill to `min`.
pub(crate) async fn keepalive_cycle(pool: &SessionPool) {
    let sessions = pool.take_idle_for_check();
    let checked = sessions.len();
    let mut alive = Vec::with_capacity(checked);

    for mut handle in sessions {
        match handle.ping().await {
            Ok(()) => alive.push(handle),
            Err(e) => {
                warn!(
                    session_id = %handle.id(),
                    error = %e,
                    "idle session failed keepalive, evicting"
                );
            }
        }
    }
    let evicted = checked - alive.len();
    pool.return_checked(alive, checked);

    let mut refilled = 0;
    while pool.reserve_refill_slot() {
        match pool.fill_reserved_slot().await {
            Ok(()) => refilled += 1,
            Err(e) => {
                warn!(user = %pool.user(), error = %e, "pool refill failed, will retry next cycle");
                break;
            }
        }
    }

    if evicted > 0 || refilled > 0 {
        info!(user = %pool.user(), checked, evicted, refilled, "keepalive cycle complete");
    } else {
        debug!(user = %pool.user(), checked, "keepalive cycle complete");
    }
}
