use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::aggregator::SignalAggregator;
use crate::alerts::AlertDispatcher;
use crate::config::{AggregatorConfig, StrategyConfig};
use crate::data::{MarketSnapshot, MarketStore};
use crate::error::{Error, Result};
use crate::signals::registry::{Strategy, StrategyRegistry};
use crate::signals::TradingSignal;

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOOKBACK_DAYS: u32 = 60;

/// Strategies plus the aggregator: turns one market snapshot into one
/// combined signal stream. Shared by the live orchestrator and the
/// aggregated backtest.
pub struct MultiStrategyGenerator {
    strategies: Vec<Box<dyn Strategy>>,
    aggregator: SignalAggregator,
}

impl MultiStrategyGenerator {
    pub fn new(strategies: Vec<Box<dyn Strategy>>, aggregator: SignalAggregator) -> Result<Self> {
        if strategies.is_empty() {
            return Err(Error::bad_config("at least one strategy is required"));
        }
        Ok(MultiStrategyGenerator {
            strategies,
            aggregator,
        })
    }

    /// Build strategies through the registry from their config records.
    pub fn from_configs(
        registry: &StrategyRegistry,
        strategy_configs: &[StrategyConfig],
        aggregator_config: AggregatorConfig,
    ) -> Result<Self> {
        let strategies = strategy_configs
            .iter()
            .map(|config| registry.build(&config.name, config))
            .collect::<Result<Vec<_>>>()?;
        MultiStrategyGenerator::new(strategies, SignalAggregator::new(aggregator_config)?)
    }

    pub fn strategies(&self) -> &[Box<dyn Strategy>] {
        &self.strategies
    }

    pub fn aggregator(&self) -> &SignalAggregator {
        &self.aggregator
    }

    /// Union of every strategy's asset universe, first occurrence order.
    pub fn all_assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = Vec::new();
        for strategy in &self.strategies {
            for asset in strategy.assets() {
                if !assets.contains(asset) {
                    assets.push(asset.clone());
                }
            }
        }
        assets
    }

    /// Run each strategy against the snapshot. A failing strategy is logged
    /// and contributes nothing.
    pub fn generate_individual(
        &self,
        snapshot: &MarketSnapshot,
    ) -> FxHashMap<String, Vec<TradingSignal>> {
        let mut by_strategy = FxHashMap::default();
        for strategy in &self.strategies {
            match strategy
                .analyze(snapshot)
                .and_then(|report| strategy.generate_signals(&report))
            {
                Ok(signals) => {
                    by_strategy.insert(strategy.name().to_string(), signals);
                }
                Err(e) => {
                    tracing::error!(strategy = strategy.name(), error = %e, "strategy run failed");
                }
            }
        }
        by_strategy
    }

    /// Individual runs followed by aggregation.
    pub fn generate_aggregated(&self, snapshot: &MarketSnapshot) -> Vec<TradingSignal> {
        let individual = self.generate_individual(snapshot);
        self.aggregator.aggregate_signals(&individual)
    }
}

#[derive(Debug, Default)]
struct HealthState {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    signals_emitted: AtomicU64,
    alerts_submitted: AtomicU64,
    last_cycle_ms: AtomicI64,
}

/// Liveness snapshot for the status query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub signals_emitted: u64,
    pub alerts_submitted: u64,
    pub last_cycle_ms: Option<i64>,
}

/// Outcome of one orchestration cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    pub signals: Vec<TradingSignal>,
    pub alerts_submitted: usize,
}

/// Live pipeline driver: pulls a market window, fans strategies out across
/// blocking tasks, aggregates and hands the result to the dispatcher without
/// waiting on transport.
pub struct Orchestrator {
    store: Arc<dyn MarketStore>,
    generator: Arc<MultiStrategyGenerator>,
    dispatcher: Option<Arc<AlertDispatcher>>,
    lookback_days: u32,
    fetch_timeout: Duration,
    health: HealthState,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn MarketStore>, generator: MultiStrategyGenerator) -> Self {
        Orchestrator {
            store,
            generator: Arc::new(generator),
            dispatcher: None,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            health: HealthState::default(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<AlertDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_lookback_days(mut self, lookback_days: u32) -> Self {
        self.lookback_days = lookback_days;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn generator(&self) -> &MultiStrategyGenerator {
        &self.generator
    }

    /// One full pipeline pass: fetch → analyze (parallel) → aggregate →
    /// dispatch. Store access is bounded by the fetch timeout.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let result = self.run_cycle_inner().await;
        match &result {
            Ok(outcome) => {
                self.health.cycles_completed.fetch_add(1, Ordering::Relaxed);
                self.health
                    .signals_emitted
                    .fetch_add(outcome.signals.len() as u64, Ordering::Relaxed);
                self.health
                    .alerts_submitted
                    .fetch_add(outcome.alerts_submitted as u64, Ordering::Relaxed);
                self.health
                    .last_cycle_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            }
            Err(e) => {
                self.health.cycles_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "orchestration cycle failed");
            }
        }
        result
    }

    async fn run_cycle_inner(&self) -> Result<CycleOutcome> {
        let snapshot = Arc::new(self.fetch_snapshot().await?);

        // Strategy execution is CPU-bound and independent per strategy; fan
        // out to the blocking pool and join.
        let tasks = (0..self.generator.strategies().len()).map(|index| {
            let generator = self.generator.clone();
            let snapshot = snapshot.clone();
            tokio::task::spawn_blocking(move || {
                let strategy = &generator.strategies()[index];
                let signals = strategy
                    .analyze(&snapshot)
                    .and_then(|report| strategy.generate_signals(&report));
                (strategy.name().to_string(), signals)
            })
        });

        let mut by_strategy: FxHashMap<String, Vec<TradingSignal>> = FxHashMap::default();
        for joined in join_all(tasks).await {
            match joined {
                Ok((name, Ok(signals))) => {
                    by_strategy.insert(name, signals);
                }
                Ok((name, Err(e))) => {
                    tracing::error!(strategy = %name, error = %e, "strategy run failed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "strategy task panicked");
                }
            }
        }

        let signals = self.generator.aggregator().aggregate_signals(&by_strategy);

        let alerts_submitted = match &self.dispatcher {
            Some(dispatcher) => dispatcher.submit_all(signals.iter().cloned()),
            None => 0,
        };

        tracing::info!(
            signals = signals.len(),
            alerts_submitted,
            "orchestration cycle complete"
        );
        Ok(CycleOutcome {
            signals,
            alerts_submitted,
        })
    }

    async fn fetch_snapshot(&self) -> Result<MarketSnapshot> {
        let store = self.store.clone();
        let assets = self.generator.all_assets();
        let lookback = self.lookback_days;
        let as_of = Utc::now().timestamp_millis();

        let fetch = tokio::task::spawn_blocking(move || {
            MarketSnapshot::from_store(&*store, &assets, lookback, as_of)
        });

        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Err(_) => Err(Error::Timeout(self.fetch_timeout.as_secs())),
            Ok(Err(join_error)) => Err(Error::store("market data fetch task", join_error)),
            Ok(Ok(result)) => result,
        }
    }

    pub fn health(&self) -> HealthStatus {
        let cycles_completed = self.health.cycles_completed.load(Ordering::Relaxed);
        let last = self.health.last_cycle_ms.load(Ordering::Relaxed);
        HealthStatus {
            healthy: cycles_completed > 0,
            cycles_completed,
            cycles_failed: self.health.cycles_failed.load(Ordering::Relaxed),
            signals_emitted: self.health.signals_emitted.load(Ordering::Relaxed),
            alerts_submitted: self.health.alerts_submitted.load(Ordering::Relaxed),
            last_cycle_ms: (last > 0).then_some(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertLog, AlertTransport};
    use crate::config::ChannelConfig;
    use crate::data::memory::MemoryStore;
    use crate::data::VIX;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn d(s: &str) -> NaiveDate {
        crate::data::parse_date(s).unwrap()
    }

    /// Anti-correlated fixture that drives the VIX strategy to a LONG.
    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        let vix: Vec<f64> = (0..40).map(|i| 20.0 + (i as f64 % 10.0)).collect();
        let closes: Vec<f64> = vix
            .iter()
            .enumerate()
            .map(|(i, v)| 50_000.0 - 1_000.0 * (v - 20.0) + i as f64)
            .collect();
        store.add_daily_closes("bitcoin", d("2024-01-01"), &closes);
        store.add_indicator_values(VIX, d("2024-01-01"), &vix);
        store
    }

    fn generator() -> MultiStrategyGenerator {
        let registry = StrategyRegistry::with_builtins();
        let config = StrategyConfig::new("vix_correlation", vec!["bitcoin".into()]);
        let aggregator_config = AggregatorConfig::new(HashMap::from([(
            "vix_correlation".to_string(),
            1.0,
        )]));
        MultiStrategyGenerator::from_configs(&registry, &[config], aggregator_config).unwrap()
    }

    struct CountingTransport {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl AlertTransport for CountingTransport {
        async fn send(
            &self,
            _signal: &TradingSignal,
            _target: &str,
        ) -> anyhow::Result<Option<String>> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn all_assets_deduplicates() {
        let registry = StrategyRegistry::with_builtins();
        let a = StrategyConfig::new("vix_correlation", vec!["bitcoin".into(), "ethereum".into()]);
        let b = StrategyConfig::new("momentum", vec!["bitcoin".into(), "solana".into()]);
        let generator = MultiStrategyGenerator::from_configs(
            &registry,
            &[a, b],
            AggregatorConfig::new(HashMap::from([
                ("vix_correlation".to_string(), 0.5),
                ("momentum".to_string(), 0.5),
            ])),
        )
        .unwrap();
        assert_eq!(generator.all_assets(), ["bitcoin", "ethereum", "solana"]);
    }

    #[test]
    fn empty_strategy_list_is_rejected() {
        let aggregator =
            SignalAggregator::new(AggregatorConfig::new(HashMap::from([(
                "x".to_string(),
                1.0,
            )])))
            .unwrap();
        assert!(MultiStrategyGenerator::new(Vec::new(), aggregator).is_err());
    }

    #[test]
    fn generator_produces_aggregated_signals() {
        let store = seeded_store();
        let generator = generator();
        let snapshot =
            MarketSnapshot::from_store(&store, &generator.all_assets(), 40, 1_700_000_000_000)
                .unwrap();
        let signals = generator.generate_aggregated(&snapshot);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].strategy_name, "aggregated");
        assert_eq!(signals[0].asset, "bitcoin");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_cycle_emits_and_dispatches() {
        let store = Arc::new(seeded_store());
        let log = Arc::new(AlertLog::in_memory().unwrap());
        let transport = Arc::new(CountingTransport {
            sent: AtomicUsize::new(0),
        });
        let mut channel = ChannelConfig::new("hook-1");
        channel.min_confidence = 0.0;
        let dispatcher = Arc::new(AlertDispatcher::new(
            HashMap::from([("aggregated".to_string(), channel)]),
            transport.clone(),
            log,
        ));

        let orchestrator = Orchestrator::new(store, generator())
            .with_lookback_days(40)
            .with_dispatcher(dispatcher.clone());

        let outcome = orchestrator.run_cycle().await.unwrap();
        assert_eq!(outcome.signals.len(), 1);
        assert_eq!(outcome.alerts_submitted, 1);

        let health = orchestrator.health();
        assert!(health.healthy);
        assert_eq!(health.cycles_completed, 1);
        assert_eq!(health.signals_emitted, 1);
        assert_eq!(health.alerts_submitted, 1);
        assert!(health.last_cycle_ms.is_some());

        drop(orchestrator);
        Arc::try_unwrap(dispatcher)
            .map_err(|_| ())
            .unwrap()
            .shutdown()
            .await
            .unwrap();
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cycle_without_dispatcher_still_emits() {
        let orchestrator =
            Orchestrator::new(Arc::new(seeded_store()), generator()).with_lookback_days(40);
        let outcome = orchestrator.run_cycle().await.unwrap();
        assert_eq!(outcome.signals.len(), 1);
        assert_eq!(outcome.alerts_submitted, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_store_means_empty_cycle() {
        let orchestrator = Orchestrator::new(Arc::new(MemoryStore::new()), generator());
        let outcome = orchestrator.run_cycle().await.unwrap();
        assert!(outcome.signals.is_empty());
    }
}
