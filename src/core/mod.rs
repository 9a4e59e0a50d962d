mod backtest;
mod engine;
mod monte_carlo;
mod risk;
mod stats;
mod tax;
mod types;

pub use backtest::{
    BacktestCalculator, BacktestOutcome, BacktestRecord, BacktestSeries, BacktestSummary,
    ReturnObservation, validate_returns,
};
pub use engine::{INITIAL_SHARE_PRICE, MonthlyWealthCalculator};
pub use monte_carlo::{
    DistributionStats, MonteCarloConfig, MonteCarloSimulator, PROGRESS_INTERVAL, PathResult,
    Percentiles, ResultColumn, RoiStats, SimplePathResult, SimulationOutcome, SummaryRow,
    WealthBands,
};
pub use risk::{LiquidationImpact, MarginCallRequirement, RiskEngine, RiskState};
pub use stats::{mean, percentile, sample_std};
pub use tax::{AnnualTaxSummary, DividendTaxOutcome, TaxAccumulator, TaxCalculator};
pub use types::{
    AccountState, CalculatorConfig, DividendFrequency, MonthlyMarketInput, RiskConfig, TaxConfig,
};
