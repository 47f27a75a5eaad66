use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::analytics::{percentile, population_std};
use crate::data::{day_start_ms, parse_date, MarketSnapshot, MarketStore, DATE_FORMAT};
use crate::error::{Error, Result};
use crate::orchestrator::MultiStrategyGenerator;
use crate::signals::registry::Strategy;
use crate::signals::{SignalType, TradingSignal};

/// Earliest permitted backtest start.
const EARLIEST_START: &str = "2020-01-01";
/// Extra history fetched ahead of the window so indicators can warm up.
const LOOKBACK_BUFFER_DAYS: i64 = 30;
/// Strategy invocation cadence in simulated days.
const GENERATION_CADENCE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Success,
    PartialSuccess,
    Failed,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeLogEntry {
    pub date: String,
    pub asset: String,
    pub action: TradeAction,
    pub shares: f64,
    pub price: f64,
    pub value: f64,
    pub transaction_cost: f64,
    pub signal_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataQuality {
    pub expected_days: i64,
    pub vix_data_completeness: f64,
    pub crypto_data_completeness: BTreeMap<String, f64>,
}

/// Full result of one simulation run.
#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub start_date: String,
    pub end_date: String,
    pub status: BacktestStatus,

    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,

    pub total_trades: usize,
    pub profitable_trades: usize,
    pub losing_trades: usize,
    pub average_trade_return: f64,
    pub average_winning_trade: f64,
    pub average_losing_trade: f64,

    pub volatility: f64,
    pub var_95: f64,
    pub calmar_ratio: f64,

    pub total_signals: usize,
    pub long_signals: usize,
    pub short_signals: usize,
    pub hold_signals: usize,

    pub daily_returns: Vec<f64>,
    pub equity_curve: Vec<f64>,
    pub drawdown_series: Vec<f64>,
    pub trade_log: Vec<TradeLogEntry>,
    pub signals_generated: Vec<TradingSignal>,

    pub execution_time: f64,
    pub data_quality: DataQuality,
}

impl BacktestResult {
    fn empty(
        strategy_name: &str,
        start_date: &str,
        end_date: &str,
        status: BacktestStatus,
        execution_time: f64,
    ) -> Self {
        BacktestResult {
            strategy_name: strategy_name.to_string(),
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            status,
            total_return: 0.0,
            annualized_return: 0.0,
            sharpe_ratio: 0.0,
            max_drawdown: 0.0,
            win_rate: 0.0,
            total_trades: 0,
            profitable_trades: 0,
            losing_trades: 0,
            average_trade_return: 0.0,
            average_winning_trade: 0.0,
            average_losing_trade: 0.0,
            volatility: 0.0,
            var_95: 0.0,
            calmar_ratio: 0.0,
            total_signals: 0,
            long_signals: 0,
            short_signals: 0,
            hold_signals: 0,
            daily_returns: Vec::new(),
            equity_curve: Vec::new(),
            drawdown_series: Vec::new(),
            trade_log: Vec::new(),
            signals_generated: Vec::new(),
            execution_time,
            data_quality: DataQuality::default(),
        }
    }

    /// Wire form: metrics grouped the way downstream consumers expect.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "strategy_name": self.strategy_name,
            "start_date": self.start_date,
            "end_date": self.end_date,
            "status": self.status,
            "performance_metrics": {
                "total_return": self.total_return,
                "annualized_return": self.annualized_return,
                "sharpe_ratio": self.sharpe_ratio,
                "max_drawdown": self.max_drawdown,
                "win_rate": self.win_rate,
                "volatility": self.volatility,
                "var_95": self.var_95,
                "calmar_ratio": self.calmar_ratio,
            },
            "trading_statistics": {
                "total_trades": self.total_trades,
                "profitable_trades": self.profitable_trades,
                "losing_trades": self.losing_trades,
                "win_rate": self.win_rate,
                "average_trade_return": self.average_trade_return,
                "average_winning_trade": self.average_winning_trade,
                "average_losing_trade": self.average_losing_trade,
            },
            "signal_statistics": {
                "total_signals": self.total_signals,
                "long_signals": self.long_signals,
                "short_signals": self.short_signals,
                "hold_signals": self.hold_signals,
            },
            "daily_returns": self.daily_returns,
            "equity_curve": self.equity_curve,
            "drawdown_series": self.drawdown_series,
            "trade_log": self.trade_log,
            "execution_time": self.execution_time,
            "data_quality": self.data_quality,
        })
    }
}

#[derive(Debug, Clone)]
struct Position {
    shares: f64,
    entry_price: f64,
    #[allow(dead_code)]
    entry_date: String,
}

struct Portfolio {
    cash: f64,
    positions: BTreeMap<String, Position>,
    trade_log: Vec<TradeLogEntry>,
}

/// Point-in-time backtest driver: steps the calendar day by day, invokes the
/// signal generator on a weekly cadence against data visible up to that day,
/// executes same-day signals and revalues the book at each close.
/// Single-threaded; two runs over the same store produce equal results.
pub struct BacktestEngine {
    initial_capital: f64,
    transaction_cost: f64,
    today: NaiveDate,
}

impl Default for BacktestEngine {
    fn default() -> Self {
        BacktestEngine {
            initial_capital: 100_000.0,
            transaction_cost: 0.001,
            today: Utc::now().date_naive(),
        }
    }
}

impl BacktestEngine {
    pub fn new() -> Self {
        BacktestEngine::default()
    }

    pub fn with_capital(mut self, initial_capital: f64) -> Self {
        self.initial_capital = initial_capital;
        self
    }

    pub fn with_transaction_cost(mut self, transaction_cost: f64) -> Self {
        self.transaction_cost = transaction_cost;
        self
    }

    /// Inject the clock so date validation is testable.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Backtest a single strategy over `[start_date, end_date]`.
    pub fn backtest_strategy(
        &self,
        store: &dyn MarketStore,
        strategy: &dyn Strategy,
        start_date: &str,
        end_date: &str,
    ) -> Result<BacktestResult> {
        let assets = strategy.assets().to_vec();
        self.run(store, strategy.name(), &assets, start_date, end_date, |pit| {
            let report = strategy.analyze(pit)?;
            strategy.generate_signals(&report)
        })
    }

    /// Backtest a multi-strategy system: every strategy runs, then the
    /// aggregator combines their output before execution.
    pub fn backtest_aggregated(
        &self,
        store: &dyn MarketStore,
        generator: &MultiStrategyGenerator,
        start_date: &str,
        end_date: &str,
    ) -> Result<BacktestResult> {
        let assets = generator.all_assets();
        self.run(
            store,
            "multi_strategy_aggregated",
            &assets,
            start_date,
            end_date,
            |pit| Ok(generator.generate_aggregated(pit)),
        )
    }

    fn run(
        &self,
        store: &dyn MarketStore,
        name: &str,
        assets: &[String],
        start_date: &str,
        end_date: &str,
        generate: impl Fn(&MarketSnapshot) -> Result<Vec<TradingSignal>>,
    ) -> Result<BacktestResult> {
        let started = Instant::now();
        self.validate_range(start_date, end_date)?;

        match self.simulate(store, name, assets, start_date, end_date, generate, started) {
            Ok(result) => {
                tracing::info!(
                    strategy = name,
                    status = ?result.status,
                    total_return = result.total_return,
                    sharpe = result.sharpe_ratio,
                    "backtest complete"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(strategy = name, error = %e, "backtest failed");
                Ok(BacktestResult::empty(
                    name,
                    start_date,
                    end_date,
                    BacktestStatus::Failed,
                    started.elapsed().as_secs_f64(),
                ))
            }
        }
    }

    fn validate_range(&self, start_date: &str, end_date: &str) -> Result<()> {
        let start = parse_date(start_date)
            .map_err(|_| Error::bad_config(format!("invalid start date '{start_date}', use YYYY-MM-DD")))?;
        let end = parse_date(end_date)
            .map_err(|_| Error::bad_config(format!("invalid end date '{end_date}', use YYYY-MM-DD")))?;

        if start >= end {
            return Err(Error::bad_config("start date must be before end date"));
        }
        if end > self.today {
            return Err(Error::bad_config("end date cannot be in the future"));
        }
        let earliest = parse_date(EARLIEST_START).expect("constant parses");
        if start < earliest {
            return Err(Error::bad_config(format!(
                "start date cannot be before {EARLIEST_START}"
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines, clippy::too_many_arguments)]
    fn simulate(
        &self,
        store: &dyn MarketStore,
        name: &str,
        assets: &[String],
        start_date: &str,
        end_date: &str,
        generate: impl Fn(&MarketSnapshot) -> Result<Vec<TradingSignal>>,
        started: Instant,
    ) -> Result<BacktestResult> {
        let start = parse_date(start_date)?;
        let end = parse_date(end_date)?;
        let range_days = (end - start).num_days() + 1;

        let fetch_days = (range_days + LOOKBACK_BUFFER_DAYS) as u32;
        let mut full = MarketSnapshot::from_store(store, assets, fetch_days, day_start_ms(end))?;
        // Nothing after the simulation window is visible to the run.
        full = full.up_to(end);

        if full.is_empty() {
            tracing::warn!(strategy = name, "no market data in window");
            return Ok(BacktestResult::empty(
                name,
                start_date,
                end_date,
                BacktestStatus::InsufficientData,
                started.elapsed().as_secs_f64(),
            ));
        }

        // Close lookup per asset and day for execution and revaluation.
        let mut prices: BTreeMap<&str, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
        for (asset, bars) in &full.series {
            prices.insert(
                asset.as_str(),
                bars.iter().map(|b| (b.date, b.close)).collect(),
            );
        }

        let mut portfolio = Portfolio {
            cash: self.initial_capital,
            positions: BTreeMap::new(),
            trade_log: Vec::new(),
        };
        let mut all_signals: Vec<TradingSignal> = Vec::new();
        let mut equity_curve = Vec::with_capacity(range_days as usize);
        let mut daily_returns = Vec::with_capacity(range_days as usize);
        let mut prev_value = self.initial_capital;
        let mut degraded = false;

        for day_index in 0..range_days {
            let day = start + chrono::Duration::days(day_index);
            let day_ms = day_start_ms(day);

            let mut todays_signals: Vec<TradingSignal> = Vec::new();
            if day_index % GENERATION_CADENCE_DAYS == 0 {
                let pit = full.up_to(day);
                match generate(&pit) {
                    Ok(signals) => {
                        for mut signal in signals {
                            signal.timestamp = day_ms;
                            todays_signals.push(signal);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(strategy = name, %day, error = %e, "signal generation failed");
                        degraded = true;
                    }
                }
            }

            for signal in &todays_signals {
                self.execute_trade(signal, &mut portfolio, &prices, day);
            }
            all_signals.extend(todays_signals);

            let value = portfolio_value(&portfolio, &prices, day);
            let daily_return = if prev_value > 0.0 {
                (value - prev_value) / prev_value
            } else {
                0.0
            };
            daily_returns.push(daily_return);
            equity_curve.push(value);
            prev_value = value;
        }

        let drawdown_series = drawdown_series(&equity_curve);
        let data_quality = assess_data_quality(&full, assets, start, end);

        let mut result = BacktestResult::empty(
            name,
            start_date,
            end_date,
            if degraded {
                BacktestStatus::PartialSuccess
            } else {
                BacktestStatus::Success
            },
            0.0,
        );

        // Return and risk metrics. Daily-return annualization uses 365.
        if equity_curve.len() > 1 && equity_curve[0] > 0.0 {
            result.total_return =
                (equity_curve[equity_curve.len() - 1] - equity_curve[0]) / equity_curve[0];
            result.annualized_return =
                (1.0 + result.total_return).powf(365.0 / equity_curve.len() as f64) - 1.0;
        }
        result.volatility = if daily_returns.len() > 1 {
            population_std(&daily_returns) * 365f64.sqrt()
        } else {
            0.0
        };
        result.sharpe_ratio = if result.volatility > 0.0 {
            result.annualized_return / result.volatility
        } else {
            0.0
        };
        result.max_drawdown = drawdown_series
            .iter()
            .copied()
            .fold(0.0f64, |acc, dd| acc.max(-dd));
        result.calmar_ratio = if result.max_drawdown > 0.0 {
            result.annualized_return / result.max_drawdown
        } else {
            0.0
        };
        result.var_95 = percentile(&daily_returns, 5.0).unwrap_or(0.0);

        // Trade statistics: sells carry P&L, buys do not.
        let with_pnl: Vec<f64> = portfolio
            .trade_log
            .iter()
            .filter_map(|t| t.pnl)
            .collect();
        result.total_trades = portfolio.trade_log.len();
        result.profitable_trades = with_pnl.iter().filter(|p| **p > 0.0).count();
        result.losing_trades = with_pnl.iter().filter(|p| **p < 0.0).count();
        result.win_rate = if result.total_trades > 0 {
            result.profitable_trades as f64 / result.total_trades as f64
        } else {
            0.0
        };
        result.average_trade_return = if with_pnl.is_empty() {
            0.0
        } else {
            with_pnl.iter().sum::<f64>() / with_pnl.len() as f64
        };
        let winners: Vec<f64> = with_pnl.iter().copied().filter(|p| *p > 0.0).collect();
        let losers: Vec<f64> = with_pnl.iter().copied().filter(|p| *p < 0.0).collect();
        result.average_winning_trade = if winners.is_empty() {
            0.0
        } else {
            winners.iter().sum::<f64>() / winners.len() as f64
        };
        result.average_losing_trade = if losers.is_empty() {
            0.0
        } else {
            losers.iter().sum::<f64>() / losers.len() as f64
        };

        result.total_signals = all_signals.len();
        result.long_signals = all_signals
            .iter()
            .filter(|s| s.signal_type == SignalType::Long)
            .count();
        result.short_signals = all_signals
            .iter()
            .filter(|s| s.signal_type == SignalType::Short)
            .count();
        result.hold_signals = all_signals
            .iter()
            .filter(|s| s.signal_type == SignalType::Hold)
            .count();

        result.daily_returns = daily_returns;
        result.equity_curve = equity_curve;
        result.drawdown_series = drawdown_series;
        result.trade_log = portfolio.trade_log;
        result.signals_generated = all_signals;
        result.data_quality = data_quality;
        result.execution_time = started.elapsed().as_secs_f64();
        Ok(result)
    }

    fn execute_trade(
        &self,
        signal: &TradingSignal,
        portfolio: &mut Portfolio,
        prices: &BTreeMap<&str, BTreeMap<NaiveDate, f64>>,
        day: NaiveDate,
    ) {
        let Some(price) = prices
            .get(signal.asset.as_str())
            .and_then(|by_day| by_day.get(&day))
            .copied()
        else {
            return; // no quote for this asset today
        };
        let date_str = day.format(DATE_FORMAT).to_string();

        match signal.signal_type {
            SignalType::Long => {
                let value = portfolio_value(portfolio, prices, day) * signal.position_size;
                let shares = value / price;
                let cost = value * self.transaction_cost;
                if portfolio.cash < value + cost {
                    tracing::debug!(asset = %signal.asset, "insufficient cash, skipping buy");
                    return;
                }
                portfolio.cash -= value + cost;

                portfolio
                    .positions
                    .entry(signal.asset.clone())
                    .and_modify(|p| {
                        // Blend the entry price when adding to the position.
                        let existing_value = p.shares * p.entry_price;
                        p.entry_price = (existing_value + value) / (p.shares + shares);
                        p.shares += shares;
                    })
                    .or_insert(Position {
                        shares,
                        entry_price: price,
                        entry_date: date_str.clone(),
                    });

                portfolio.trade_log.push(TradeLogEntry {
                    date: date_str,
                    asset: signal.asset.clone(),
                    action: TradeAction::Buy,
                    shares,
                    price,
                    value,
                    transaction_cost: cost,
                    signal_confidence: signal.confidence,
                    entry_price: None,
                    pnl: None,
                });
            }
            SignalType::Short | SignalType::Close => {
                let Some(position) = portfolio.positions.remove(&signal.asset) else {
                    return; // nothing to close, no naked shorts
                };
                let sale_value = position.shares * price;
                let cost = sale_value * self.transaction_cost;
                portfolio.cash += sale_value - cost;

                portfolio.trade_log.push(TradeLogEntry {
                    date: date_str,
                    asset: signal.asset.clone(),
                    action: TradeAction::Sell,
                    shares: position.shares,
                    price,
                    value: sale_value,
                    transaction_cost: cost,
                    signal_confidence: signal.confidence,
                    entry_price: Some(position.entry_price),
                    pnl: Some((price - position.entry_price) * position.shares),
                });
            }
            SignalType::Hold => {}
        }
    }
}

fn portfolio_value(
    portfolio: &Portfolio,
    prices: &BTreeMap<&str, BTreeMap<NaiveDate, f64>>,
    day: NaiveDate,
) -> f64 {
    let mut total = portfolio.cash;
    for (asset, position) in &portfolio.positions {
        if let Some(price) = prices.get(asset.as_str()).and_then(|by_day| by_day.get(&day)) {
            total += position.shares * price;
        }
    }
    total
}

fn drawdown_series(equity_curve: &[f64]) -> Vec<f64> {
    let Some(&first) = equity_curve.first() else {
        return Vec::new();
    };
    let mut running_max = first;
    equity_curve
        .iter()
        .map(|&value| {
            running_max = running_max.max(value);
            if running_max > 0.0 {
                (value - running_max) / running_max
            } else {
                0.0
            }
        })
        .collect()
}

fn assess_data_quality(
    snapshot: &MarketSnapshot,
    assets: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> DataQuality {
    let expected_days = (end - start).num_days() + 1;
    let mut quality = DataQuality {
        expected_days,
        ..DataQuality::default()
    };
    if expected_days <= 0 {
        return quality;
    }

    let mut vix_days: std::collections::BTreeSet<NaiveDate> = std::collections::BTreeSet::new();
    for (asset, bars) in &snapshot.series {
        let in_range = bars
            .iter()
            .filter(|b| b.date >= start && b.date <= end)
            .count();
        if assets.contains(asset) {
            quality
                .crypto_data_completeness
                .insert(asset.clone(), in_range as f64 / expected_days as f64);
        }
        for bar in bars {
            if bar.date >= start && bar.date <= end && bar.vix_value.is_some() {
                vix_days.insert(bar.date);
            }
        }
    }
    quality.vix_data_completeness = vix_days.len() as f64 / expected_days as f64;
    quality
}
