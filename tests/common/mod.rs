#![allow(dead_code)]

use chrono::NaiveDate;
use signalforge::data::memory::MemoryStore;
use signalforge::data::VIX;

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Store where the close tracks the VIX inversely:
/// `close_t = 50000 - 1000 * (vix_t - 20) + drift_t`. The VIX cycles through
/// 20..30 so the correlation is strongly negative over every window.
pub fn anti_correlated_store(asset: &str, start: &str, days: usize) -> MemoryStore {
    let mut store = MemoryStore::new();
    let vix: Vec<f64> = (0..days).map(|i| 20.0 + (i as f64 % 10.0)).collect();
    let closes: Vec<f64> = vix
        .iter()
        .enumerate()
        .map(|(i, v)| 50_000.0 - 1_000.0 * (v - 20.0) + i as f64 * 0.5)
        .collect();
    store.add_daily_closes(asset, date(start), &closes);
    store.add_indicator_values(VIX, date(start), &vix);
    store
}

/// Store with a linear decline from 50000 to 42500 (15% drawdown) under an
/// elevated VIX of 30.
pub fn drawdown_store(asset: &str, start: &str) -> MemoryStore {
    let mut store = MemoryStore::new();
    let closes: Vec<f64> = (0..14)
        .map(|i| 50_000.0 - i as f64 * (7_500.0 / 13.0))
        .collect();
    store.add_daily_closes(asset, date(start), &closes);
    store.add_indicator_values(VIX, date(start), &vec![30.0; 14]);
    store
}
