//! Collector scheduling runtime.
//!
//! One runner task per registered collector, each ticking at the
//! collector's own interval with an immediate first fire. Results fan
//! into a bounded update channel with a non-blocking send: a slow or
//! dead consumer costs dropped refreshes, never a stalled collector.
//! The next tick produces a newer snapshot anyway.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::daemon::health::CollectorStatus;

use super::{CollectResult, Collector};

/// Capacity of the update channel shared by all runners.
pub const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// How long [`CollectorRuntime::stop`] waits for runners to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Identical error messages within this window are suppressed.
const DEDUP_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Emit a summary line every N suppressions.
const DEDUP_SUMMARY_EVERY: u64 = 100;

struct ErrorDedup {
    message: String,
    first_logged: Instant,
    suppressed: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned registry mutex only means a panic elsewhere; the data
    // is plain bookkeeping and stays usable.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Schedules registered collectors and fans their results into one stream.
pub struct CollectorRuntime {
    collectors: Mutex<Vec<Arc<dyn Collector>>>,
    statuses: Mutex<BTreeMap<String, CollectorStatus>>,
    dedup: Mutex<HashMap<String, ErrorDedup>>,
    tx: mpsc::Sender<CollectResult>,
    rx: Mutex<Option<mpsc::Receiver<CollectResult>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CollectorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRuntime")
            .field("collectors", &lock(&self.collectors).len())
            .finish_non_exhaustive()
    }
}

impl CollectorRuntime {
    /// Create a runtime scoped to `cancel`.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            collectors: Mutex::new(Vec::new()),
            statuses: Mutex::new(BTreeMap::new()),
            dedup: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a collector. Must happen before [`CollectorRuntime::start`].
    pub fn register(&self, collector: Arc<dyn Collector>) {
        let name = collector.name();
        lock(&self.statuses).insert(name.to_owned(), CollectorStatus::new(name));
        lock(&self.collectors).push(collector);
        tracing::info!(collector = name, "Registered collector");
    }

    /// Spawn one runner task per registered collector and hand back the
    /// update stream. Each runner collects immediately, then on its
    /// interval.
    ///
    /// # Errors
    ///
    /// Returns an error when called more than once.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<mpsc::Receiver<CollectResult>> {
        let rx = lock(&self.rx)
            .take()
            .ok_or_else(|| anyhow!("collector runtime already started"))?;

        let collectors: Vec<Arc<dyn Collector>> = lock(&self.collectors).clone();
        let mut handles = lock(&self.handles);
        for collector in collectors {
            let runtime = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                runtime.run_loop(collector).await;
            }));
        }

        Ok(rx)
    }

    async fn run_loop(self: Arc<Self>, collector: Arc<dyn Collector>) {
        let mut ticker = tokio::time::interval(collector.interval());
        // Overruns skip missed ticks instead of bursting to catch up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.run_collector(&collector).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(collector = collector.name(), "Runner exited");
    }

    /// Run one collection for `collector`, record the outcome, and
    /// forward the result. The collect itself happens in a spawned task
    /// so a panic is absorbed as a synthetic error.
    async fn run_collector(
        &self,
        collector: &Arc<dyn Collector>,
    ) -> anyhow::Result<serde_json::Value> {
        let name = collector.name();
        let started = Utc::now();
        let begin = Instant::now();

        let task = {
            let collector = Arc::clone(collector);
            let token = self.cancel.child_token();
            tokio::spawn(async move { collector.collect(token).await })
        };

        let outcome: anyhow::Result<CollectResult> = match task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow!("collector panicked: {join_err}")),
        };

        // Shutdown-time cancellations are not health events
        if outcome.is_err() && self.cancel.is_cancelled() {
            return outcome.map(|r| r.data);
        }

        let latency_ms = begin.elapsed().as_millis() as u64;
        {
            let mut statuses = lock(&self.statuses);
            if let Some(status) = statuses.get_mut(name) {
                status.run_count += 1;
                status.last_run = Some(started);
                status.last_latency_ms = latency_ms;
                match &outcome {
                    Ok(_) => {
                        status.healthy = true;
                        status.last_error = None;
                    }
                    Err(e) => {
                        status.healthy = false;
                        status.error_count += 1;
                        status.last_error = Some(format!("{e:#}"));
                    }
                }
            }
        }

        match outcome {
            Ok(result) => {
                if !result.warnings.is_empty() {
                    tracing::debug!(
                        collector = name,
                        warnings = result.warnings.len(),
                        "Collector finished with warnings"
                    );
                }
                let data = result.data.clone();
                self.forward(result);
                Ok(data)
            }
            Err(e) => {
                self.log_deduped(name, &e);
                Err(e)
            }
        }
    }

    /// Non-blocking forward into the update channel; drops on overflow.
    fn forward(&self, result: CollectResult) {
        match self.tx.try_send(result) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(result)) => {
                tracing::warn!(
                    collector = %result.collector,
                    "Update channel full, dropping refresh"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Update consumer gone, dropping refresh");
            }
        }
    }

    /// Log a collector failure, suppressing repeats of the same message
    /// within the dedup window.
    fn log_deduped(&self, name: &str, err: &anyhow::Error) {
        let message = format!("{err:#}");
        let mut dedup = lock(&self.dedup);

        if let Some(entry) = dedup.get_mut(name) {
            if entry.message == message && entry.first_logged.elapsed() < DEDUP_WINDOW {
                entry.suppressed += 1;
                if entry.suppressed % DEDUP_SUMMARY_EVERY == 0 {
                    tracing::warn!(
                        collector = name,
                        suppressed = entry.suppressed,
                        error = %message,
                        "Collector error still recurring"
                    );
                }
                return;
            }
        }

        tracing::error!(collector = name, error = %message, "Collector run failed");
        dedup.insert(
            name.to_owned(),
            ErrorDedup {
                message,
                first_logged: Instant::now(),
                suppressed: 0,
            },
        );
    }

    /// Synchronously execute the named collector, bypassing its schedule.
    ///
    /// Status bookkeeping and update forwarding happen exactly as for a
    /// scheduled run.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown name or a failed collection.
    pub async fn run_once(&self, name: &str) -> anyhow::Result<serde_json::Value> {
        let collector = lock(&self.collectors)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown collector: {name}"))?;
        self.run_collector(&collector).await
    }

    /// Names of all registered collectors, in registration order.
    #[must_use]
    pub fn collector_names(&self) -> Vec<String> {
        lock(&self.collectors)
            .iter()
            .map(|c| c.name().to_owned())
            .collect()
    }

    /// Per-collector health flags.
    #[must_use]
    pub fn health(&self) -> BTreeMap<String, bool> {
        lock(&self.statuses)
            .iter()
            .map(|(name, status)| (name.clone(), status.healthy))
            .collect()
    }

    /// Snapshot of every collector's status record.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, CollectorStatus> {
        lock(&self.statuses).clone()
    }

    /// Cancel all runners and wait up to the shutdown grace period.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Collector runners did not exit within the shutdown grace period");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestCollector {
        name: &'static str,
        interval: Duration,
        runs: AtomicU64,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    impl TestCollector {
        fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                interval: Duration::from_secs(3600),
                runs: AtomicU64::new(0),
                behavior,
            })
        }
    }

    #[async_trait]
    impl Collector for TestCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "test collector"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn collect(&self, _cancel: CancellationToken) -> anyhow::Result<CollectResult> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(CollectResult {
                    collector: self.name.to_owned(),
                    timestamp: Utc::now(),
                    data: serde_json::json!({ "run": run }),
                    warnings: vec![],
                }),
                Behavior::Fail => anyhow::bail!("deliberate failure"),
                Behavior::Panic => panic!("deliberate panic"),
            }
        }
    }

    #[tokio::test]
    async fn test_first_collect_is_immediate() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        runtime.register(TestCollector::new("fast", Behavior::Succeed));

        let mut rx = runtime.start().expect("start");
        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first update within 2s")
            .expect("channel open");

        assert_eq!(result.collector, "fast");
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        let _rx = runtime.start().expect("first start");
        assert!(runtime.start().is_err());
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_failure_flips_health_and_counts() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        runtime.register(TestCollector::new("broken", Behavior::Fail));

        assert!(runtime.run_once("broken").await.is_err());

        let statuses = runtime.statuses();
        let status = &statuses["broken"];
        assert!(!status.healthy);
        assert_eq!(status.run_count, 1);
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.as_deref().unwrap_or("").contains("deliberate"));
    }

    #[tokio::test]
    async fn test_panic_is_absorbed_as_error() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        runtime.register(TestCollector::new("panicky", Behavior::Panic));
        runtime.register(TestCollector::new("steady", Behavior::Succeed));

        let err = runtime.run_once("panicky").await.expect_err("panic becomes error");
        assert!(err.to_string().contains("panicked"));

        // The other collector is untouched
        assert!(runtime.run_once("steady").await.is_ok());
        let health = runtime.health();
        assert!(!health["panicky"]);
        assert!(health["steady"]);
    }

    #[tokio::test]
    async fn test_recovery_clears_error_state() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        let collector = TestCollector::new("flaky", Behavior::Succeed);
        runtime.register(collector);

        runtime.run_once("flaky").await.expect("run");
        let statuses = runtime.statuses();
        assert!(statuses["flaky"].healthy);
        assert!(statuses["flaky"].last_error.is_none());
        assert!(statuses["flaky"].last_run.is_some());
    }

    #[tokio::test]
    async fn test_run_once_unknown_collector() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        let err = runtime.run_once("nope").await.expect_err("unknown");
        assert!(err.to_string().contains("unknown collector"));
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let runtime = Arc::new(CollectorRuntime::new(CancellationToken::new()));
        runtime.register(TestCollector::new("chatty", Behavior::Succeed));
        let mut rx = runtime.start().expect("start");

        // Never drain; overflow the channel well past capacity. Every
        // call must return promptly rather than block on the send.
        for _ in 0..UPDATE_CHANNEL_CAPACITY + 10 {
            runtime.run_once("chatty").await.expect("run_once");
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= UPDATE_CHANNEL_CAPACITY + 1);
        runtime.stop().await;
    }
}
