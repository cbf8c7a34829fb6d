//! Session Reaper
//!
//! Background task that periodically evicts abandoned sessions: entries that
//! are still marked active long after their stream should have finished
//! (a stuck runner, a transport that never reported the disconnect).
//!
//! Eviction is observable to a stream that is still running: its next
//! `record_token` fails and it ends with a `SESSION_TIMEOUT` error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SessionRegistry;

/// Handle to a running reaper task
#[derive(Debug)]
pub struct SessionReaper {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl SessionReaper {
    /// Start sweeping `registry` every `interval`, removing active sessions
    /// older than `timeout`
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(registry: SessionRegistry, interval: Duration, timeout: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = Arc::clone(&shutdown);
        let interval = interval.max(Duration::from_millis(1));

        tracing::info!(
            interval_secs = interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "Session reaper started"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown_rx.notified() => break,
                    _ = ticker.tick() => {
                        let removed = registry.reap_expired(timeout);
                        tracing::debug!(removed, remaining = registry.count(), "Reaper sweep");
                    }
                }
            }

            tracing::info!("Session reaper stopped");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the reaper and wait for its task to finish
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Session reaper task failed");
            }
        }
    }

    /// Whether the reaper task is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SessionReaper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_abandoned_sessions() {
        let registry = SessionRegistry::new();
        let stale = registry.register(Some("c1"), 0);

        let reaper = SessionReaper::spawn(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
        );

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(registry.contains(&stale));

        let fresh = registry.register(Some("c2"), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!registry.contains(&stale));
        assert!(registry.contains(&fresh));

        reaper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_shutdown_stops_task() {
        let registry = SessionRegistry::new();
        let reaper = SessionReaper::spawn(registry.clone(), Duration::from_secs(1), Duration::ZERO);
        assert!(reaper.is_running());
        reaper.shutdown().await;

        // No sweeps after shutdown
        let id = registry.register(None, 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.contains(&id));
    }
}
