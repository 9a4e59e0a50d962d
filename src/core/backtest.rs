use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::engine::{INITIAL_SHARE_PRICE, MonthlyWealthCalculator};
use super::tax::TaxAccumulator;
use super::types::{AccountState, MonthlyMarketInput};
use crate::error::{Result, SimError, invalid_config};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnObservation {
    pub year: i32,
    pub month: u32,
    pub monthly_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRecord {
    pub year: i32,
    pub month: u32,
    pub share_price: f64,
    pub shares: f64,
    pub stock_value: f64,
    pub loan_amount: f64,
    pub net_equity: f64,
    pub principal: f64,
    pub monthly_return_pct: f64,
    /// Compounded return of the record's calendar year.
    pub annual_return_pct: f64,
    pub cash_dividend: f64,
    pub dividend_tax: f64,
    pub tax_credit: f64,
    pub interest_paid: f64,
    /// `None` when no loan is outstanding.
    pub maintenance_ratio_pct: Option<f64>,
    pub margin_call: bool,
    pub liquidation: bool,
    pub insolvent: bool,
}

impl BacktestRecord {
    fn from_state(
        year: i32,
        month: u32,
        principal: f64,
        monthly_return_pct: f64,
        state: &AccountState,
    ) -> Self {
        Self {
            year,
            month,
            share_price: state.share_price,
            shares: state.shares,
            stock_value: state.stock_value,
            loan_amount: state.loan_amount,
            net_equity: state.net_equity,
            principal,
            monthly_return_pct,
            annual_return_pct: 0.0,
            cash_dividend: state.cash_dividend,
            dividend_tax: state.dividend_tax,
            tax_credit: state.tax_credit,
            interest_paid: state.interest_paid,
            maintenance_ratio_pct: state.maintenance_ratio_pct(),
            margin_call: state.margin_call_triggered,
            liquidation: state.liquidated,
            insolvent: state.insolvent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestSummary {
    pub final_equity: f64,
    pub total_principal: f64,
    pub net_profit: f64,
    pub roi_pct: f64,
    pub margin_calls: usize,
    pub liquidations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestSeries {
    pub records: Vec<BacktestRecord>,
}

impl BacktestSeries {
    pub fn final_record(&self) -> Option<&BacktestRecord> {
        self.records.last()
    }

    pub fn summary(&self) -> Option<BacktestSummary> {
        let last = self.final_record()?;
        let roi_pct = if last.principal > 0.0 {
            (last.net_equity / last.principal - 1.0) * 100.0
        } else {
            0.0
        };
        Some(BacktestSummary {
            final_equity: last.net_equity,
            total_principal: last.principal,
            net_profit: last.net_equity - last.principal,
            roi_pct,
            margin_calls: self.records.iter().filter(|r| r.margin_call).count(),
            liquidations: self.records.iter().filter(|r| r.liquidation).count(),
        })
    }

    fn fill_annual_returns(&mut self) {
        let mut growth: BTreeMap<i32, f64> = BTreeMap::new();
        for record in &self.records {
            *growth.entry(record.year).or_insert(1.0) *= 1.0 + record.monthly_return_pct / 100.0;
        }
        for record in &mut self.records {
            if let Some(g) = growth.get(&record.year) {
                record.annual_return_pct = (g - 1.0) * 100.0;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestOutcome {
    pub unlevered: BacktestSeries,
    pub levered: Option<BacktestSeries>,
}

impl BacktestOutcome {
    /// Levered final equity relative to the unlevered run, in percent.
    pub fn outperformance_pct(&self) -> Option<f64> {
        let base = self.unlevered.summary()?.final_equity;
        let levered = self.levered.as_ref()?.summary()?.final_equity;
        (base > 0.0).then(|| (levered / base - 1.0) * 100.0)
    }
}

pub struct BacktestCalculator {
    calculator: MonthlyWealthCalculator,
    returns: Vec<ReturnObservation>,
}

impl BacktestCalculator {
    pub fn new(calculator: MonthlyWealthCalculator, returns: Vec<ReturnObservation>) -> Self {
        Self {
            calculator,
            returns,
        }
    }

    /// Runs the unlevered baseline and, when `use_leverage` is set, a second
    /// independent levered run over the same history.
    pub fn run_backtest(
        &mut self,
        initial_capital: f64,
        monthly_contribution: f64,
        dividend_yield: f64,
        use_leverage: bool,
    ) -> Result<BacktestOutcome> {
        validate_returns(&self.returns)?;
        validate_amounts(initial_capital, monthly_contribution, dividend_yield)?;

        info!(
            months = self.returns.len(),
            initial_capital,
            monthly_contribution,
            use_leverage,
            "starting backtest"
        );

        self.calculator.set_use_leverage(false);
        let unlevered = self.run_series(initial_capital, monthly_contribution, dividend_yield);

        let levered = if use_leverage {
            self.calculator.set_use_leverage(true);
            Some(self.run_series(initial_capital, monthly_contribution, dividend_yield))
        } else {
            None
        };

        let outcome = BacktestOutcome { unlevered, levered };
        if let Some(summary) = outcome.unlevered.summary() {
            info!(
                final_equity = summary.final_equity,
                roi_pct = summary.roi_pct,
                outperformance_pct = outcome.outperformance_pct(),
                "backtest finished"
            );
        }
        Ok(outcome)
    }

    fn run_series(
        &self,
        initial_capital: f64,
        monthly_contribution: f64,
        dividend_yield: f64,
    ) -> BacktestSeries {
        let Some(first) = self.returns.first() else {
            return BacktestSeries {
                records: Vec::new(),
            };
        };

        let mut tax = TaxAccumulator::new();
        let mut state = self
            .calculator
            .opening_state(initial_capital, INITIAL_SHARE_PRICE);
        let mut principal = initial_capital;

        let mut records = Vec::with_capacity(self.returns.len() + 1);
        records.push(BacktestRecord::from_state(
            first.year - 1,
            12,
            principal,
            0.0,
            &state,
        ));

        for obs in &self.returns {
            principal += monthly_contribution;
            let input = MonthlyMarketInput {
                monthly_return: obs.monthly_return,
                monthly_contribution,
                dividend_yield,
                calendar_year: obs.year,
                month_in_year: obs.month,
            };
            state = self.calculator.step(&state, &input, &mut tax);
            records.push(BacktestRecord::from_state(
                obs.year,
                obs.month,
                principal,
                obs.monthly_return * 100.0,
                &state,
            ));
        }

        let mut series = BacktestSeries { records };
        series.fill_annual_returns();
        series
    }
}

/// Checks a historical series is usable: non-empty, strictly ascending by
/// `(year, month)`, months in 1..=12, finite returns above -100%.
pub fn validate_returns(returns: &[ReturnObservation]) -> Result<()> {
    if returns.is_empty() {
        return Err(SimError::NoData);
    }

    let mut previous: Option<(i32, u32)> = None;
    for (index, obs) in returns.iter().enumerate() {
        let bad = |reason: &str| SimError::InvalidReturnSeries {
            index,
            reason: reason.to_string(),
        };

        if !(1..=12).contains(&obs.month) {
            return Err(bad("month must be between 1 and 12"));
        }
        if !obs.monthly_return.is_finite() {
            return Err(bad("monthly return must be finite"));
        }
        if obs.monthly_return <= -1.0 {
            return Err(bad("monthly return must be above -100%"));
        }

        let key = (obs.year, obs.month);
        if previous.is_some_and(|prev| key <= prev) {
            return Err(bad("observations must be sorted ascending by year and month"));
        }
        previous = Some(key);
    }
    Ok(())
}

fn validate_amounts(
    initial_capital: f64,
    monthly_contribution: f64,
    dividend_yield: f64,
) -> Result<()> {
    if !initial_capital.is_finite() || initial_capital <= 0.0 {
        return Err(invalid_config("initial capital must be > 0"));
    }
    if !monthly_contribution.is_finite() || monthly_contribution < 0.0 {
        return Err(invalid_config("monthly contribution must be >= 0"));
    }
    if !dividend_yield.is_finite() || dividend_yield < 0.0 {
        return Err(invalid_config("dividend yield must be >= 0"));
    }
    Ok(())
}
