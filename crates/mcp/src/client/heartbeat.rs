//! Background heartbeat task.
//!
//! Every enabled server has its own schedule. Due servers are checked concurrently and a
//! slow server never delays the others: a server whose check is still running is simply not
//! scheduled again until it finishes.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::time::Duration;

use futures_util::StreamExt as _;
use futures_util::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::{ClientManager, ManagerInner};
use crate::config::ManagerOptions;

/// Lower bound on any server's interval.
const MIN_INTERVAL: Duration = Duration::from_millis(10);
/// Growth of a healthy server's interval per successful check.
const GROWTH: f64 = 1.2;
/// Share of the base interval used while a server is unreachable.
const UNREACHABLE_SHARE: f64 = 0.5;

/// What one heartbeat check of a server observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatOutcome {
    /// Connected and answered the ping.
    Healthy,
    /// Connected but the ping failed.
    Unhealthy,
    /// Was disconnected and the heartbeat reconnected it.
    Reconnected,
    /// Disconnected and not reconnected.
    Unreachable,
    /// Nothing to do (connecting elsewhere, or removed meanwhile).
    Idle,
}

/// Interval until the next check of a server after `outcome`.
pub(crate) fn next_interval(current: Duration, outcome: HeartbeatOutcome, options: &ManagerOptions) -> Duration {
    let base = options.heartbeat_interval.max(MIN_INTERVAL);
    if !options.heartbeat_adaptive {
        return base;
    }
    let scaled = |duration: Duration, factor: f64| {
        Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    };

    let interval = match outcome {
        HeartbeatOutcome::Healthy => {
            let ceiling = scaled(base, options.heartbeat_max_multiplier.max(1.0));
            scaled(current.max(base), GROWTH).min(ceiling)
        }
        HeartbeatOutcome::Unreachable => scaled(base, UNREACHABLE_SHARE),
        HeartbeatOutcome::Unhealthy | HeartbeatOutcome::Reconnected | HeartbeatOutcome::Idle => base,
    };
    interval.max(MIN_INTERVAL)
}

struct Slot {
    interval: Duration,
    due: Instant,
}

/// Handle to a running heartbeat loop.
pub(crate) struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn the loop. It holds only a weak reference so a dropped manager ends it.
    pub(crate) fn spawn(manager: Weak<ManagerInner>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            info!("heartbeat started");
            run(manager, token).await;
            debug!("heartbeat stopped");
        });
        Self { cancel, task }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the loop and wait for it to exit. Checks already running are finished, not
    /// interrupted.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await
            && error.is_panic()
        {
            tracing::warn!("heartbeat task panicked: {error}");
        }
    }
}

async fn run(manager: Weak<ManagerInner>, token: CancellationToken) {
    let mut slots: HashMap<String, Slot> = HashMap::new();
    let mut running: HashSet<String> = HashSet::new();
    let mut checks = FuturesUnordered::new();

    loop {
        let Some(inner) = manager.upgrade() else { break };
        let handle = ClientManager::from_inner(inner);
        let options = handle.options().await;
        let base = next_interval(options.heartbeat_interval, HeartbeatOutcome::Idle, &options);
        let now = Instant::now();

        let targets = handle.heartbeat_targets().await;
        slots.retain(|name, _| targets.contains(name));
        for name in targets {
            let slot = slots.entry(name.clone()).or_insert(Slot {
                interval: base,
                due: now + base,
            });
            if slot.due <= now && running.insert(name.clone()) {
                let manager = handle.clone();
                checks.push(async move {
                    let outcome = manager.heartbeat_server(&name).await;
                    (name, outcome)
                });
            }
        }
        drop(handle);

        let next_due = slots
            .iter()
            .filter(|(name, _)| !running.contains(*name))
            .map(|(_, slot)| slot.due)
            .min()
            .unwrap_or(now + base);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(next_due) => {}
            Some((name, outcome)) = checks.next(), if !checks.is_empty() => {
                running.remove(&name);
                if let Some(slot) = slots.get_mut(&name) {
                    slot.interval = next_interval(slot.interval, outcome, &options);
                    slot.due = Instant::now() + slot.interval;
                    debug!(server = %name, ?outcome, "next heartbeat in {:?}", slot.interval);
                }
            }
        }
    }

    while checks.next().await.is_some() {}
}
