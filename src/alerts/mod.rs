pub mod log;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::signals::TradingSignal;
pub use log::{AlertLog, AlertRecord, AlertStatistics};

/// Default worker count for the dispatch pool.
const DEFAULT_WORKERS: usize = 2;
/// Default bound on the submission queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Outbound alert transport. Implementations own the wire detail (HTTP
/// webhook, chat embed formatting); the dispatcher only sees an opaque
/// target id and an optional external message id on success.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(&self, signal: &TradingSignal, target: &str) -> anyhow::Result<Option<String>>;
}

struct DispatcherInner {
    routes: HashMap<String, ChannelConfig>,
    transport: Arc<dyn AlertTransport>,
    log: Arc<AlertLog>,
    /// Last successful dispatch per (target, asset), for rate limiting.
    last_sent: DashMap<(String, String), Instant>,
}

impl DispatcherInner {
    fn passes_filters(&self, signal: &TradingSignal, channel: &ChannelConfig) -> bool {
        if signal.confidence < channel.min_confidence {
            tracing::debug!(asset = %signal.asset, "alert below confidence threshold");
            return false;
        }
        if signal.signal_strength.rank() < channel.min_strength.rank() {
            tracing::debug!(asset = %signal.asset, "alert below strength threshold");
            return false;
        }
        if !channel.enabled_assets.contains(&signal.asset) {
            return false;
        }
        if !channel.enabled_signal_types.contains(&signal.signal_type) {
            return false;
        }
        if let Some(sent) = self
            .last_sent
            .get(&(channel.target.clone(), signal.asset.clone()))
        {
            if sent.elapsed() < Duration::from_secs(channel.rate_limit_seconds) {
                tracing::debug!(asset = %signal.asset, "alert rate limited");
                return false;
            }
        }
        true
    }

    async fn send_with_retries(
        &self,
        signal: &TradingSignal,
        channel: &ChannelConfig,
    ) -> std::result::Result<Option<String>, String> {
        let mut last_error = String::from("no attempts made");
        for attempt in 0..channel.max_retries.max(1) {
            match self.transport.send(signal, &channel.target).await {
                Ok(message_id) => return Ok(message_id),
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        asset = %signal.asset,
                        attempt = attempt + 1,
                        error = %last_error,
                        "alert transport attempt failed"
                    );
                    if attempt + 1 < channel.max_retries {
                        tokio::time::sleep(Duration::from_millis(channel.retry_delay_ms)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Full dispatch protocol for one signal: route, filter, log the attempt
    /// failed-first, invoke the transport, record the outcome. Transport and
    /// logging failures are values here, never propagated.
    async fn process(&self, signal: TradingSignal) {
        let Some(channel) = self.routes.get(&signal.strategy_name) else {
            tracing::debug!(strategy = %signal.strategy_name, "no alert route for strategy");
            return;
        };
        if !self.passes_filters(&signal, channel) {
            return;
        }

        let alert_id = {
            let log = self.log.clone();
            let signal = signal.clone();
            let target = channel.target.clone();
            match tokio::task::spawn_blocking(move || {
                log.log_attempt(&signal, &target, "signal_alert")
            })
            .await
            {
                Ok(Ok(id)) => Some(id),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "failed to log alert attempt");
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, "alert logging task failed");
                    None
                }
            }
        };

        let outcome = self.send_with_retries(&signal, channel).await;

        let (success, error_message, message_id) = match &outcome {
            Ok(message_id) => (true, None, message_id.clone()),
            Err(e) => (false, Some(e.clone()), None),
        };
        if success {
            self.last_sent.insert(
                (channel.target.clone(), signal.asset.clone()),
                Instant::now(),
            );
            tracing::info!(asset = %signal.asset, signal_type = %signal.signal_type, "alert sent");
        } else {
            tracing::warn!(asset = %signal.asset, error = ?error_message, "alert failed");
        }

        if let Some(id) = alert_id {
            let log = self.log.clone();
            let result = tokio::task::spawn_blocking(move || {
                log.update_result(id, success, error_message.as_deref(), message_id.as_deref())
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "failed to update alert outcome"),
                Err(e) => tracing::error!(error = %e, "alert update task failed"),
            }
        }
    }
}

/// Alert dispatcher: filters aggregated signals per routed channel and fans
/// them out on a small bounded worker pool. Submission never blocks; workers
/// serialize transport calls and log writes. `shutdown` drains the queue and
/// joins every worker.
pub struct AlertDispatcher {
    sender: mpsc::Sender<TradingSignal>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    inner: Arc<DispatcherInner>,
}

impl AlertDispatcher {
    pub fn new(
        routes: HashMap<String, ChannelConfig>,
        transport: Arc<dyn AlertTransport>,
        log: Arc<AlertLog>,
    ) -> Self {
        Self::with_pool(routes, transport, log, DEFAULT_WORKERS, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_pool(
        routes: HashMap<String, ChannelConfig>,
        transport: Arc<dyn AlertTransport>,
        log: Arc<AlertLog>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<TradingSignal>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let inner = Arc::new(DispatcherInner {
            routes,
            transport,
            log,
            last_sent: DashMap::new(),
        });
        let cancel = CancellationToken::new();

        let worker_count = workers.clamp(1, 4);
        let handles = (0..worker_count)
            .map(|worker| {
                let receiver = receiver.clone();
                let inner = inner.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut guard = receiver.lock().await;
                            tokio::select! {
                                signal = guard.recv() => signal,
                                () = cancel.cancelled() => None,
                            }
                        };
                        let Some(signal) = next else { break };
                        inner.process(signal).await;
                    }
                    tracing::debug!(worker, "alert worker stopped");
                })
            })
            .collect();

        AlertDispatcher {
            sender,
            workers: handles,
            cancel,
            inner,
        }
    }

    /// Non-blocking enqueue. Returns false when the queue is full or the
    /// dispatcher is shutting down; the alert is dropped and logged.
    pub fn submit(&self, signal: TradingSignal) -> bool {
        match self.sender.try_send(signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "alert queue rejected submission");
                false
            }
        }
    }

    /// Submit a batch; returns how many were enqueued.
    pub fn submit_all(&self, signals: impl IntoIterator<Item = TradingSignal>) -> usize {
        signals
            .into_iter()
            .filter(|signal| self.submit(signal.clone()))
            .count()
    }

    pub fn log(&self) -> Arc<AlertLog> {
        self.inner.log.clone()
    }

    /// Drain queued alerts and join the workers. Queued work submitted
    /// before the call is still delivered.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.sender);
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "alert worker panicked");
            }
        }
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{SignalDraft, SignalStrength, SignalType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTransport {
        sent: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(RecordingTransport {
                sent: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            })
        }

        fn failing(times: usize) -> Arc<Self> {
            Arc::new(RecordingTransport {
                sent: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(times),
            })
        }
    }

    #[async_trait]
    impl AlertTransport for RecordingTransport {
        async fn send(
            &self,
            _signal: &TradingSignal,
            _target: &str,
        ) -> anyhow::Result<Option<String>> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("simulated transport outage");
            }
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("msg-{n}")))
        }
    }

    fn signal(asset: &str, confidence: f64) -> TradingSignal {
        SignalDraft::new(
            asset,
            SignalType::Long,
            1_700_000_000_000,
            50_000.0,
            "aggregated",
            SignalStrength::Strong,
            confidence,
            0.02,
        )
        .build()
        .unwrap()
    }

    fn routes(channel: ChannelConfig) -> HashMap<String, ChannelConfig> {
        HashMap::from([("aggregated".to_string(), channel)])
    }

    #[tokio::test]
    async fn dispatch_logs_attempt_and_success() {
        let transport = RecordingTransport::new();
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let dispatcher = AlertDispatcher::new(
            routes(ChannelConfig::new("hook-1")),
            transport.clone(),
            log.clone(),
        );

        assert!(dispatcher.submit(signal("bitcoin", 0.9)));
        dispatcher.shutdown().await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
        let rows = log.recent_alerts(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].success);
        assert_eq!(rows[0].external_message_id.as_deref(), Some("msg-0"));
        assert_eq!(rows[0].webhook_target.as_deref(), Some("hook-1"));
    }

    #[tokio::test]
    async fn transport_failure_is_recorded_not_raised() {
        // Fails more times than max_retries: the alert ends failed.
        let transport = RecordingTransport::failing(10);
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let mut channel = ChannelConfig::new("hook-1");
        channel.retry_delay_ms = 1;
        let dispatcher = AlertDispatcher::new(routes(channel), transport, log.clone());

        dispatcher.submit(signal("bitcoin", 0.9));
        dispatcher.shutdown().await.unwrap();

        let rows = log.recent_alerts(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].success);
        assert!(rows[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("simulated transport outage"));
    }

    #[tokio::test]
    async fn retries_recover_from_transient_failure() {
        let transport = RecordingTransport::failing(2);
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let mut channel = ChannelConfig::new("hook-1");
        channel.retry_delay_ms = 1;
        channel.max_retries = 3;
        let dispatcher = AlertDispatcher::new(routes(channel), transport.clone(), log.clone());

        dispatcher.submit(signal("bitcoin", 0.9));
        dispatcher.shutdown().await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
        assert!(log.recent_alerts(10).unwrap()[0].success);
    }

    #[tokio::test]
    async fn confidence_and_asset_filters_apply() {
        let transport = RecordingTransport::new();
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let dispatcher = AlertDispatcher::new(
            routes(ChannelConfig::new("hook-1")),
            transport.clone(),
            log.clone(),
        );

        // Below min_confidence (0.6 default).
        dispatcher.submit(signal("bitcoin", 0.3));
        // Asset outside the enabled list.
        dispatcher.submit(signal("dogecoin", 0.9));
        dispatcher.shutdown().await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
        assert!(log.recent_alerts(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn strength_floor_filters_weak_signals() {
        let transport = RecordingTransport::new();
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let mut channel = ChannelConfig::new("hook-1");
        channel.min_strength = SignalStrength::Strong;
        let dispatcher = AlertDispatcher::new(routes(channel), transport.clone(), log.clone());

        let mut weak = signal("bitcoin", 0.9);
        weak.signal_strength = SignalStrength::Moderate;
        dispatcher.submit(weak);
        dispatcher.submit(signal("bitcoin", 0.9)); // Strong passes
        dispatcher.shutdown().await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_suppresses_rapid_repeats() {
        let transport = RecordingTransport::new();
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let mut channel = ChannelConfig::new("hook-1");
        channel.rate_limit_seconds = 3600;
        // Single worker so the two submissions process in order.
        let dispatcher =
            AlertDispatcher::with_pool(routes(channel), transport.clone(), log.clone(), 1, 16);

        dispatcher.submit(signal("bitcoin", 0.9));
        dispatcher.submit(signal("bitcoin", 0.9));
        // Different asset is unaffected by bitcoin's limiter.
        dispatcher.submit(signal("ethereum", 0.9));
        dispatcher.shutdown().await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
        let rows = log.recent_alerts(10).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn unrouted_strategy_is_skipped() {
        let transport = RecordingTransport::new();
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let dispatcher = AlertDispatcher::new(
            routes(ChannelConfig::new("hook-1")),
            transport.clone(),
            log.clone(),
        );

        let mut foreign = signal("bitcoin", 0.9);
        foreign.strategy_name = "unrouted".to_string();
        dispatcher.submit(foreign);
        dispatcher.shutdown().await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_queue() {
        let transport = RecordingTransport::new();
        let log = Arc::new(AlertLog::in_memory().unwrap());
        // Single worker keeps the rate-limiter outcome deterministic.
        let dispatcher = AlertDispatcher::with_pool(
            routes(ChannelConfig::new("hook-1")),
            transport.clone(),
            log.clone(),
            1,
            64,
        );

        let submitted = dispatcher.submit_all((0..10).map(|_| signal("bitcoin", 0.9)));
        assert_eq!(submitted, 10);
        dispatcher.shutdown().await.unwrap();

        // Default rate limit (60 s) lets only the first bitcoin alert
        // through, but every queued submission was still processed before
        // shutdown returned.
        let rows = log.recent_alerts(100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }
}
