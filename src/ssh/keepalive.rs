//! Advisory keepalive loop
//!
//! Sends a liveness probe every interval and stops itself on the first
//! failed probe. It never closes the connection: the shell or transport
//! actually closing is the authoritative signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::handle_owner::{HandleController, PingResult};

/// Something that can be probed for liveness
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self) -> PingResult;
}

#[async_trait]
impl LivenessProbe for HandleController {
    async fn probe(&self) -> PingResult {
        self.ping().await
    }
}

struct RunningKeepalive {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Start/stop are idempotent and safe from any task
#[derive(Default)]
pub struct Keepalive {
    running: Mutex<Option<RunningKeepalive>>,
}

impl Keepalive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start probing every `interval`. Restarts if already running.
    pub fn start(&self, probe: Arc<dyn LivenessProbe>, interval: Duration, label: String) {
        let token = CancellationToken::new();
        let loop_token = token.clone();

        let task = tokio::spawn(async move {
            info!("Keepalive started for {} (interval={:?})", label, interval);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        debug!("Keepalive for {} cancelled", label);
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                match probe.probe().await {
                    PingResult::Ok => debug!("Keepalive OK for {}", label),
                    result => {
                        // Death is detected elsewhere; just stop probing
                        debug!("Keepalive probe for {} failed ({:?}), stopping", label, result);
                        break;
                    }
                }
            }

            info!("Keepalive stopped for {}", label);
        });

        let previous = self.running.lock().replace(RunningKeepalive { token, task });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }

    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.token.cancel();
        }
    }

    /// True while the loop task is alive (it may have stopped itself)
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers Ok for the first `healthy` probes, then times out
    struct ScriptedProbe {
        calls: AtomicUsize,
        healthy: usize,
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn probe(&self) -> PingResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.healthy {
                PingResult::Ok
            } else {
                PingResult::Timeout
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_itself_on_failed_probe() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
            healthy: 2,
        });
        let keepalive = Keepalive::new();
        keepalive.start(probe.clone(), Duration::from_secs(30), "test".into());
        assert!(keepalive.is_running());

        tokio::time::sleep(Duration::from_secs(31 * 4)).await;
        settle().await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(!keepalive.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_each_interval() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
            healthy: usize::MAX,
        });
        let keepalive = Keepalive::new();
        keepalive.start(probe.clone(), Duration::from_secs(10), "test".into());

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(keepalive.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
            healthy: usize::MAX,
        });
        let keepalive = Keepalive::new();

        keepalive.stop();
        keepalive.start(probe.clone(), Duration::from_secs(10), "test".into());
        keepalive.stop();
        keepalive.stop();
        settle().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(!keepalive.is_running());
    }
}
