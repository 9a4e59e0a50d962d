use serde::Serialize;

use super::types::TaxConfig;

/// Dividend credit used so far in the current tax year.
///
/// Each simulation run owns one of these. Sharing an accumulator between
/// independent paths would let one path consume another path's annual cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaxAccumulator {
    tracking_year: Option<i32>,
    accumulated_credit: f64,
}

impl TaxAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracking_year(&self) -> Option<i32> {
        self.tracking_year
    }

    pub fn accumulated_credit(&self) -> f64 {
        self.accumulated_credit
    }

    fn roll_to_year(&mut self, year: i32) {
        if self.tracking_year != Some(year) {
            self.tracking_year = Some(year);
            self.accumulated_credit = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DividendTaxOutcome {
    pub gross_dividend: f64,
    pub supplementary_premium: f64,
    pub tax_credit: f64,
    pub net_dividend_after_tax: f64,
    pub remaining_credit_cap: f64,
}

impl DividendTaxOutcome {
    pub fn net_tax_impact(&self) -> f64 {
        self.tax_credit - self.supplementary_premium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualTaxSummary {
    pub tracking_year: Option<i32>,
    pub total_tax_credit_used: f64,
    pub remaining_credit_cap: f64,
    pub credit_cap_utilized_pct: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TaxCalculator {
    config: TaxConfig,
}

impl TaxCalculator {
    pub fn new(config: TaxConfig) -> Self {
        Self { config }
    }

    pub fn calculate_dividend_tax(
        &self,
        gross_dividend: f64,
        year: i32,
        accumulator: &mut TaxAccumulator,
    ) -> DividendTaxOutcome {
        accumulator.roll_to_year(year);

        let supplementary_premium = if gross_dividend > self.config.dividend_tax_threshold {
            gross_dividend * self.config.dividend_tax_rate
        } else {
            0.0
        };

        let candidate_credit = (gross_dividend * self.config.dividend_credit_rate).max(0.0);
        let cap_left =
            (self.config.annual_dividend_credit_cap - accumulator.accumulated_credit).max(0.0);
        let tax_credit = candidate_credit.min(cap_left);
        accumulator.accumulated_credit += tax_credit;

        DividendTaxOutcome {
            gross_dividend,
            supplementary_premium,
            tax_credit,
            net_dividend_after_tax: gross_dividend - supplementary_premium + tax_credit,
            remaining_credit_cap: self.remaining_cap(accumulator),
        }
    }

    pub fn annual_summary(&self, accumulator: &TaxAccumulator) -> AnnualTaxSummary {
        let cap = self.config.annual_dividend_credit_cap;
        AnnualTaxSummary {
            tracking_year: accumulator.tracking_year,
            total_tax_credit_used: accumulator.accumulated_credit,
            remaining_credit_cap: self.remaining_cap(accumulator),
            credit_cap_utilized_pct: if cap > 0.0 {
                accumulator.accumulated_credit / cap * 100.0
            } else {
                0.0
            },
        }
    }

    fn remaining_cap(&self, accumulator: &TaxAccumulator) -> f64 {
        (self.config.annual_dividend_credit_cap - accumulator.accumulated_credit).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn calculator() -> TaxCalculator {
        TaxCalculator::new(TaxConfig::default())
    }

    #[test]
    fn small_dividend_pays_no_premium_but_earns_credit() {
        let mut acc = TaxAccumulator::new();
        let outcome = calculator().calculate_dividend_tax(125.0, 2024, &mut acc);

        assert_approx(outcome.supplementary_premium, 0.0);
        assert_approx(outcome.tax_credit, 125.0 * 0.085);
        assert_approx(outcome.net_dividend_after_tax, 125.0 + 125.0 * 0.085);
        assert_approx(outcome.remaining_credit_cap, 80_000.0 - 125.0 * 0.085);
    }

    #[test]
    fn premium_applies_only_above_threshold() {
        let mut acc = TaxAccumulator::new();
        let calc = calculator();

        let at_threshold = calc.calculate_dividend_tax(20_000.0, 2024, &mut acc);
        assert_approx(at_threshold.supplementary_premium, 0.0);

        let above = calc.calculate_dividend_tax(30_000.0, 2024, &mut acc);
        assert_approx(above.supplementary_premium, 30_000.0 * 0.0211);
        assert_approx(above.net_tax_impact(), 30_000.0 * 0.085 - 30_000.0 * 0.0211);
    }

    #[test]
    fn credit_is_clamped_by_annual_cap() {
        let mut acc = TaxAccumulator::new();
        let calc = calculator();

        let first = calc.calculate_dividend_tax(900_000.0, 2024, &mut acc);
        assert_approx(first.tax_credit, 76_500.0);

        let second = calc.calculate_dividend_tax(900_000.0, 2024, &mut acc);
        assert_approx(second.tax_credit, 3_500.0);
        assert_approx(second.remaining_credit_cap, 0.0);

        let third = calc.calculate_dividend_tax(900_000.0, 2024, &mut acc);
        assert_approx(third.tax_credit, 0.0);
    }

    #[test]
    fn year_change_resets_the_cap() {
        let mut acc = TaxAccumulator::new();
        let calc = calculator();

        calc.calculate_dividend_tax(2_000_000.0, 2024, &mut acc);
        assert_approx(acc.accumulated_credit(), 80_000.0);

        let next_year = calc.calculate_dividend_tax(100_000.0, 2025, &mut acc);
        assert_approx(next_year.tax_credit, 8_500.0);
        assert_eq!(acc.tracking_year(), Some(2025));
    }

    #[test]
    fn accumulators_are_independent() {
        let calc = calculator();
        let mut a = TaxAccumulator::new();
        let mut b = TaxAccumulator::new();

        calc.calculate_dividend_tax(2_000_000.0, 2024, &mut a);
        let outcome = calc.calculate_dividend_tax(100_000.0, 2024, &mut b);
        assert_approx(outcome.tax_credit, 8_500.0);
    }

    #[test]
    fn annual_summary_reports_utilisation() {
        let calc = calculator();
        let mut acc = TaxAccumulator::new();
        calc.calculate_dividend_tax(470_588.235_294_117_6, 2024, &mut acc);

        let summary = calc.annual_summary(&acc);
        assert_eq!(summary.tracking_year, Some(2024));
        assert!((summary.credit_cap_utilized_pct - 50.0).abs() < 1e-6);
        assert!((summary.remaining_credit_cap - 40_000.0).abs() < 1e-6);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_credit_never_exceeds_cap_within_a_year(
            dividends in proptest::collection::vec(0u32..2_000_000, 1..12)
        ) {
            let calc = calculator();
            let mut acc = TaxAccumulator::new();
            let mut total_credit = 0.0;
            for d in dividends {
                let outcome = calc.calculate_dividend_tax(d as f64, 2030, &mut acc);
                prop_assert!(outcome.tax_credit >= 0.0);
                prop_assert!(outcome.remaining_credit_cap >= 0.0);
                total_credit += outcome.tax_credit;
            }
            prop_assert!(total_credit <= 80_000.0 + 1e-6);
        }
    }
}
