pub mod helpers;
pub mod mean_reversion;
pub mod momentum;
pub mod multi_bucket;
pub mod vix_correlation;
pub mod volatility;
