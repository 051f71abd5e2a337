//! The asset manager: latch timeouts and shutdown.
//!
//! Every process registers with the office's [`AssetManager`], which holds
//! it weakly. A periodic check (or an explicit [`AssetManager::check_timeouts`])
//! fails every latch whose oldest waiter has waited longer than the
//! configured timeout; [`AssetManager::shutdown`] fails every pending waiter
//! with [`ResourceError::ShuttingDown`](keel_system::error::ResourceError::ShuttingDown).
//! Late completions after either are ignored by the latches themselves.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use keel_system::context::AssetHost;
use keel_system::error::ResourceError;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Tracks live execution contexts for timeouts and shutdown.
pub struct AssetManager {
    timeout: Duration,
    hosts: Mutex<Vec<Weak<dyn AssetHost>>>,
    shut_down: AtomicBool,
}

impl AssetManager {
    /// Creates a manager failing waiters older than `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            hosts: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the latch timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts tracking `host`.
    ///
    /// # Errors
    ///
    /// [`ResourceError::ShuttingDown`] once shutdown has begun; the host is
    /// abandoned and not tracked.
    pub fn register(&self, host: Weak<dyn AssetHost>) -> Result<(), ResourceError> {
        let mut hosts = self.hosts.lock();
        if self.is_shut_down() {
            drop(hosts);
            if let Some(host) = host.upgrade() {
                host.abandon();
            }
            return Err(ResourceError::ShuttingDown("asset manager".to_owned()));
        }
        hosts.push(host);
        Ok(())
    }

    /// Returns the number of tracked hosts that have not finished.
    #[must_use]
    pub fn live(&self) -> usize {
        self.collect_live().len()
    }

    /// Fails waiters registered more than the timeout before `now`.
    ///
    /// Returns the number of hosts checked.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        let live = self.collect_live();
        for host in &live {
            host.check_timeouts(now, self.timeout);
        }
        live.len()
    }

    /// Fails every pending waiter and refuses new work.
    pub fn shutdown(&self) {
        {
            // Flipped under the host lock so no registration slips in unseen.
            let _hosts = self.hosts.lock();
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let live = self.collect_live();
        tracing::info!(hosts = live.len(), "asset manager shutting down");
        for host in live {
            host.abandon();
        }
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Checks timeouts every `interval` on `runtime` until the manager is
    /// dropped or shut down.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration, runtime: &Handle) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.is_shut_down() {
                    break;
                }
                let checked = manager.check_timeouts(Instant::now());
                tracing::trace!(checked, "timeout check");
            }
            tracing::debug!("timeout monitor stopped");
        })
    }

    /// Upgrades live hosts and forgets finished ones.
    fn collect_live(&self) -> Vec<Arc<dyn AssetHost>> {
        let mut hosts = self.hosts.lock();
        let mut live = Vec::with_capacity(hosts.len());
        hosts.retain(|weak| match weak.upgrade() {
            Some(host) if !host.is_finished() => {
                live.push(host);
                true
            }
            _ => false,
        });
        live
    }
}

impl core::fmt::Debug for AssetManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AssetManager")
            .field("timeout", &self.timeout)
            .field("hosts", &self.hosts.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Host {
        checks: AtomicUsize,
        abandoned: AtomicBool,
        finished: AtomicBool,
    }

    impl AssetHost for Host {
        fn check_timeouts(&self, _now: Instant, _timeout: Duration) {
            self.checks.fetch_add(1, Ordering::SeqCst);
        }

        fn abandon(&self) {
            self.abandoned.store(true, Ordering::SeqCst);
        }

        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
    }

    fn register(manager: &AssetManager, host: &Arc<Host>) -> Result<(), ResourceError> {
        let weak: Weak<dyn AssetHost> = Arc::downgrade(host) as Weak<dyn AssetHost>;
        manager.register(weak)
    }

    #[test]
    fn finished_and_dropped_hosts_are_pruned() {
        let manager = AssetManager::new(Duration::from_secs(1));
        let kept = Arc::new(Host::default());
        let finished = Arc::new(Host::default());
        let dropped = Arc::new(Host::default());
        for host in [&kept, &finished, &dropped] {
            register(&manager, host).unwrap();
        }

        finished.finished.store(true, Ordering::SeqCst);
        drop(dropped);

        assert_eq!(manager.check_timeouts(Instant::now()), 1);
        assert_eq!(kept.checks.load(Ordering::SeqCst), 1);
        assert_eq!(finished.checks.load(Ordering::SeqCst), 0);
        assert_eq!(manager.live(), 1);
    }

    #[test]
    fn shutdown_abandons_current_and_late_hosts() {
        let manager = AssetManager::new(Duration::from_secs(1));
        let early = Arc::new(Host::default());
        register(&manager, &early).unwrap();

        manager.shutdown();
        assert!(early.abandoned.load(Ordering::SeqCst));

        let late = Arc::new(Host::default());
        assert!(matches!(
            register(&manager, &late),
            Err(ResourceError::ShuttingDown(_))
        ));
        assert!(late.abandoned.load(Ordering::SeqCst));
        assert_eq!(manager.live(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn monitor_checks_periodically_and_stops_on_shutdown() {
        let manager = Arc::new(AssetManager::new(Duration::from_secs(1)));
        let host = Arc::new(Host::default());
        register(&manager, &host).unwrap();

        let monitor = manager.spawn_monitor(Duration::from_millis(5), &Handle::current());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(host.checks.load(Ordering::SeqCst) >= 2);

        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor stops")
            .unwrap();
    }
}
