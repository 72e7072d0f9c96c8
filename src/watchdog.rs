//! Idle watchdog
//!
//! Periodically scans the registry and queues a stop for every instance that
//! has been idle longer than the sleep timeout.

use crate::supervisor::Supervisor;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Spawn the watchdog loop
///
/// Holds only a weak reference so a dropped supervisor ends the loop.
pub fn spawn(
    supervisor: Weak<Supervisor>,
    sleep_timeout: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(supervisor) = supervisor.upgrade() else {
                        break;
                    };
                    if supervisor.is_closing() {
                        break;
                    }
                    check_sleep_timeouts(&supervisor, sleep_timeout);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Watchdog stopped");
    })
}

/// Queue eviction for idle records not already being evicted
fn check_sleep_timeouts(supervisor: &Arc<Supervisor>, sleep_timeout: Duration) {
    for record in supervisor.registry().records() {
        let idle = record.idle_for();
        if idle > sleep_timeout && record.begin_eviction() {
            info!(
                topic = record.topic(),
                idle_secs = idle.as_secs(),
                "Stopping instance due to inactivity"
            );
            supervisor.enqueue_eviction(&record, sleep_timeout);
        }
    }
}
