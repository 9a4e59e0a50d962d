use std::ops::ControlFlow;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Serialize;
use statrs::distribution::Normal;
use tracing::{debug, info};

use super::engine::{INITIAL_SHARE_PRICE, MonthlyWealthCalculator};
use super::stats::{mean, percentile, percentile_sorted, sample_std};
use super::tax::TaxAccumulator;
use super::types::MonthlyMarketInput;
use crate::error::{Result, SimError, invalid_config};

/// Paths replayed between two progress checkpoints.
pub const PROGRESS_INTERVAL: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonteCarloConfig {
    /// Expected annual return, as a fraction.
    pub mu: f64,
    /// Annual volatility, as a fraction.
    pub sigma: f64,
    pub initial_capital: f64,
    pub monthly_contribution: f64,
    pub years: u32,
    pub num_simulations: usize,
    pub seed: u64,
}

impl MonteCarloConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.mu.is_finite() {
            return Err(invalid_config("mu must be finite"));
        }
        if !self.sigma.is_finite() || self.sigma < 0.0 {
            return Err(invalid_config("sigma must be >= 0"));
        }
        if !self.initial_capital.is_finite() || self.initial_capital < 0.0 {
            return Err(invalid_config("initial capital must be >= 0"));
        }
        if !self.monthly_contribution.is_finite() || self.monthly_contribution < 0.0 {
            return Err(invalid_config("monthly contribution must be >= 0"));
        }
        if self.years == 0 {
            return Err(invalid_config("years must be > 0"));
        }
        if self.num_simulations == 0 {
            return Err(invalid_config("number of simulations must be > 0"));
        }
        Ok(())
    }

    pub fn months(&self) -> usize {
        self.years as usize * 12
    }

    pub fn total_contribution(&self) -> f64 {
        self.initial_capital + self.monthly_contribution * self.months() as f64
    }
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            mu: 0.08,
            sigma: 0.15,
            initial_capital: 1_000_000.0,
            monthly_contribution: 20_000.0,
            years: 10,
            num_simulations: 1_000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimplePathResult {
    pub simulation: usize,
    pub final_wealth: f64,
    pub total_contribution: f64,
    pub net_profit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub simulation: usize,
    pub final_net_equity: f64,
    pub final_stock_value: f64,
    pub final_loan_amount: f64,
    pub total_contribution: f64,
    pub net_profit: f64,
    pub roi_pct: f64,
    pub ever_liquidated: bool,
    /// 1-based month of the first liquidation.
    pub liquidation_month: Option<usize>,
    pub ever_insolvent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultColumn {
    FinalWealth,
    FinalNetEquity,
    FinalStockValue,
    FinalLoanAmount,
    NetProfit,
    Roi,
}

impl ResultColumn {
    pub fn name(self) -> &'static str {
        match self {
            ResultColumn::FinalWealth => "finalWealth",
            ResultColumn::FinalNetEquity => "finalNetEquity",
            ResultColumn::FinalStockValue => "finalStockValue",
            ResultColumn::FinalLoanAmount => "finalLoanAmount",
            ResultColumn::NetProfit => "netProfit",
            ResultColumn::Roi => "roi",
        }
    }
}

/// A row of simulation output that [`MonteCarloSimulator::analyze_results`]
/// can aggregate. Columns a row type does not carry return `None`.
pub trait SimulationOutcome {
    fn column(&self, column: ResultColumn) -> Option<f64>;

    fn ever_liquidated(&self) -> Option<bool> {
        None
    }
}

impl SimulationOutcome for SimplePathResult {
    fn column(&self, column: ResultColumn) -> Option<f64> {
        match column {
            ResultColumn::FinalWealth => Some(self.final_wealth),
            ResultColumn::NetProfit => Some(self.net_profit),
            _ => None,
        }
    }
}

impl SimulationOutcome for PathResult {
    fn column(&self, column: ResultColumn) -> Option<f64> {
        match column {
            ResultColumn::FinalWealth => None,
            ResultColumn::FinalNetEquity => Some(self.final_net_equity),
            ResultColumn::FinalStockValue => Some(self.final_stock_value),
            ResultColumn::FinalLoanAmount => Some(self.final_loan_amount),
            ResultColumn::NetProfit => Some(self.net_profit),
            ResultColumn::Roi => Some(self.roi_pct),
        }
    }

    fn ever_liquidated(&self) -> Option<bool> {
        Some(self.ever_liquidated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
}

impl Percentiles {
    fn from_sorted(sorted: &[f64]) -> Self {
        Self {
            p5: percentile_sorted(sorted, 5.0),
            p25: percentile_sorted(sorted, 25.0),
            p50: percentile_sorted(sorted, 50.0),
            p75: percentile_sorted(sorted, 75.0),
            p95: percentile_sorted(sorted, 95.0),
        }
    }

    fn labelled(&self) -> [(&'static str, f64); 5] {
        [
            ("P5", self.p5),
            ("P25", self.p25),
            ("P50", self.p50),
            ("P75", self.p75),
            ("P95", self.p95),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiStats {
    pub mean: f64,
    pub std: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStats {
    pub column: ResultColumn,
    pub percentiles: Percentiles,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub roi: Option<RoiStats>,
    pub liquidation_rate_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRow {
    pub percentile: &'static str,
    pub final_wealth: f64,
    pub total_return: f64,
    pub roi_pct: f64,
}

/// P5/P50/P95 of simple-projection wealth sampled at evenly spaced months.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WealthBands {
    pub time_points_years: Vec<f64>,
    pub p5: Vec<f64>,
    pub p50: Vec<f64>,
    pub p95: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct MonteCarloSimulator {
    config: MonteCarloConfig,
    shock: Normal,
}

impl MonteCarloSimulator {
    pub fn new(config: MonteCarloConfig) -> Result<Self> {
        config.validate()?;
        let shock = Normal::new(0.0, 1.0).map_err(|e| invalid_config(e.to_string()))?;
        Ok(Self { config, shock })
    }

    pub fn total_contribution(&self) -> f64 {
        self.config.total_contribution()
    }

    /// GBM price paths, one row per simulation, each starting at 100 and
    /// holding `months + 1` prices.
    pub fn generate_price_paths(&self) -> Vec<Vec<f64>> {
        self.price_paths(self.config.num_simulations)
    }

    pub fn generate_return_paths(&self) -> Vec<Vec<f64>> {
        self.return_paths(self.config.num_simulations)
    }

    fn price_paths(&self, count: usize) -> Vec<Vec<f64>> {
        let months = self.config.months();
        let monthly_mu = self.config.mu / 12.0;
        let monthly_sigma = self.config.sigma / 12f64.sqrt();
        let drift = monthly_mu - 0.5 * monthly_sigma * monthly_sigma;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        (0..count)
            .map(|_| {
                let mut path = Vec::with_capacity(months + 1);
                let mut price = INITIAL_SHARE_PRICE;
                path.push(price);
                for _ in 0..months {
                    let z: f64 = rng.sample(self.shock);
                    price *= (drift + monthly_sigma * z).exp();
                    path.push(price);
                }
                path
            })
            .collect()
    }

    fn return_paths(&self, count: usize) -> Vec<Vec<f64>> {
        self.price_paths(count)
            .into_iter()
            .map(|prices| {
                prices
                    .windows(2)
                    .map(|w| (w[1] - w[0]) / w[0])
                    .collect::<Vec<f64>>()
            })
            .collect()
    }

    /// Contribution-only compounding without leverage or dividends.
    pub fn simulate_simple(&self) -> Vec<SimplePathResult> {
        let total_contribution = self.total_contribution();
        let initial = self.config.initial_capital;
        let contribution = self.config.monthly_contribution;

        self.generate_return_paths()
            .par_iter()
            .enumerate()
            .map(|(idx, returns)| {
                let final_wealth = returns
                    .iter()
                    .fold(initial, |wealth, r| wealth * (1.0 + r) + contribution);
                SimplePathResult {
                    simulation: idx + 1,
                    final_wealth,
                    total_contribution,
                    net_profit: final_wealth - total_contribution,
                }
            })
            .collect()
    }

    /// Replays `calculator` over every generated path. Paths run in parallel
    /// in batches of [`PROGRESS_INTERVAL`]; `progress` is told `(done, total)`
    /// after each batch and may return `Break` to cancel, in which case
    /// nothing is returned.
    pub fn simulate_with_calculator<F>(
        &self,
        calculator: &MonthlyWealthCalculator,
        dividend_yield: f64,
        mut progress: F,
    ) -> Option<Vec<PathResult>>
    where
        F: FnMut(usize, usize) -> ControlFlow<()>,
    {
        let paths = self.generate_return_paths();
        let total = paths.len();
        info!(
            paths = total,
            months = self.config.months(),
            use_leverage = calculator.use_leverage(),
            "starting monte carlo replay"
        );

        let mut results = Vec::with_capacity(total);
        for (batch, chunk) in paths.chunks(PROGRESS_INTERVAL).enumerate() {
            let offset = batch * PROGRESS_INTERVAL;
            let replayed: Vec<PathResult> = chunk
                .par_iter()
                .enumerate()
                .map(|(idx, returns)| {
                    self.replay_path(calculator, offset + idx + 1, returns, dividend_yield)
                })
                .collect();
            results.extend(replayed);

            debug!(done = results.len(), total, "monte carlo progress");
            if progress(results.len(), total).is_break() {
                info!(done = results.len(), total, "monte carlo run cancelled");
                return None;
            }
        }

        let liquidated = results.iter().filter(|r| r.ever_liquidated).count();
        info!(
            paths = total,
            liquidation_rate_pct = liquidated as f64 / total as f64 * 100.0,
            "monte carlo replay finished"
        );
        Some(results)
    }

    fn replay_path(
        &self,
        calculator: &MonthlyWealthCalculator,
        simulation: usize,
        returns: &[f64],
        dividend_yield: f64,
    ) -> PathResult {
        let mut tax = TaxAccumulator::new();
        let mut state = calculator.opening_state(self.config.initial_capital, INITIAL_SHARE_PRICE);
        let mut liquidation_month = None;
        let mut ever_insolvent = false;

        for (month, r) in returns.iter().enumerate() {
            let input = MonthlyMarketInput {
                monthly_return: *r,
                monthly_contribution: self.config.monthly_contribution,
                dividend_yield,
                calendar_year: (month / 12) as i32 + 1,
                month_in_year: (month % 12) as u32 + 1,
            };
            state = calculator.step(&state, &input, &mut tax);

            if state.liquidated && liquidation_month.is_none() {
                liquidation_month = Some(month + 1);
            }
            ever_insolvent |= state.insolvent;
        }

        let total_contribution = self.total_contribution();
        let roi_pct = if total_contribution > 0.0 {
            (state.net_equity / total_contribution - 1.0) * 100.0
        } else {
            0.0
        };

        PathResult {
            simulation,
            final_net_equity: state.net_equity,
            final_stock_value: state.stock_value,
            final_loan_amount: state.loan_amount,
            total_contribution,
            net_profit: state.net_equity - total_contribution,
            roi_pct,
            ever_liquidated: liquidation_month.is_some(),
            liquidation_month,
            ever_insolvent,
        }
    }

    /// Distribution of `column` across `results`. Falls back to final net
    /// equity when the rows do not carry the requested column.
    pub fn analyze_results<R: SimulationOutcome>(
        &self,
        results: &[R],
        column: ResultColumn,
    ) -> Result<DistributionStats> {
        let first = results.first().ok_or(SimError::NoData)?;
        let column = if first.column(column).is_some() {
            column
        } else if first.column(ResultColumn::FinalNetEquity).is_some() {
            ResultColumn::FinalNetEquity
        } else {
            return Err(SimError::MissingColumn(column.name().to_string()));
        };

        let mut values = collect_column(results, column);
        values.sort_by(|a, b| a.total_cmp(b));

        let roi = first.column(ResultColumn::Roi).map(|_| {
            let mut roi = collect_column(results, ResultColumn::Roi);
            RoiStats {
                mean: mean(&roi),
                std: sample_std(&roi),
                p5: percentile(&mut roi, 5.0),
                p50: percentile(&mut roi, 50.0),
                p95: percentile(&mut roi, 95.0),
            }
        });

        let liquidation_rate_pct = first.ever_liquidated().map(|_| {
            let hits = results
                .iter()
                .filter(|r| r.ever_liquidated().unwrap_or(false))
                .count();
            hits as f64 / results.len() as f64 * 100.0
        });

        Ok(DistributionStats {
            column,
            percentiles: Percentiles::from_sorted(&values),
            mean: mean(&values),
            std: sample_std(&values),
            min: values.first().copied().unwrap_or(0.0),
            max: values.last().copied().unwrap_or(0.0),
            roi,
            liquidation_rate_pct,
        })
    }

    pub fn summary_table(&self, stats: &DistributionStats) -> Vec<SummaryRow> {
        let total_contribution = self.total_contribution();
        stats
            .percentiles
            .labelled()
            .into_iter()
            .map(|(label, wealth)| SummaryRow {
                percentile: label,
                final_wealth: wealth,
                total_return: wealth - total_contribution,
                roi_pct: if total_contribution > 0.0 {
                    (wealth / total_contribution - 1.0) * 100.0
                } else {
                    0.0
                },
            })
            .collect()
    }

    /// Share of simple-projection paths ending below total contribution, in
    /// percent.
    pub fn loss_probability(&self, results: &[SimplePathResult]) -> f64 {
        if results.is_empty() {
            return 0.0;
        }
        let total_contribution = self.total_contribution();
        let losses = results
            .iter()
            .filter(|r| r.final_wealth < total_contribution)
            .count();
        losses as f64 / results.len() as f64 * 100.0
    }

    /// Percentile bands over the first `max_paths` paths of the simple
    /// projection. Months are sampled in even steps of `months / max_points`
    /// rounded up, and the first and last month are always included, so at
    /// most `max_points + 1` points come back.
    pub fn wealth_bands(&self, max_paths: usize, max_points: usize) -> WealthBands {
        let months = self.config.months();
        let count = max_paths.clamp(1, self.config.num_simulations);
        let initial = self.config.initial_capital;
        let contribution = self.config.monthly_contribution;

        let wealth_paths: Vec<Vec<f64>> = self
            .return_paths(count)
            .iter()
            .map(|returns| {
                let mut wealth = initial;
                let mut path = Vec::with_capacity(months + 1);
                path.push(wealth);
                for r in returns {
                    wealth = wealth * (1.0 + r) + contribution;
                    path.push(wealth);
                }
                path
            })
            .collect();

        let step = months.div_ceil(max_points.max(1)).max(1);
        let mut sample_months: Vec<usize> = (0..=months).step_by(step).collect();
        if sample_months.last() != Some(&months) {
            sample_months.push(months);
        }

        let mut bands = WealthBands {
            time_points_years: Vec::new(),
            p5: Vec::new(),
            p50: Vec::new(),
            p95: Vec::new(),
        };
        for t in sample_months {
            let mut column: Vec<f64> = wealth_paths.iter().map(|p| p[t]).collect();
            column.sort_by(|a, b| a.total_cmp(b));
            bands.time_points_years.push(t as f64 / 12.0);
            bands.p5.push(percentile_sorted(&column, 5.0));
            bands.p50.push(percentile_sorted(&column, 50.0));
            bands.p95.push(percentile_sorted(&column, 95.0));
        }
        bands
    }
}

fn collect_column<R: SimulationOutcome>(results: &[R], column: ResultColumn) -> Vec<f64> {
    results.iter().filter_map(|r| r.column(column)).collect()
}
