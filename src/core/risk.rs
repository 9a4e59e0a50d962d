use serde::Serialize;

use super::types::{RiskConfig, maintenance_ratio};

/// Outcome of checking a maintenance ratio against the configured thresholds.
/// A month moves at most one way through these: healthy, margin call, or
/// liquidation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskState {
    Healthy,
    MarginCall,
    Liquidation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiquidationImpact {
    pub shares_sold: f64,
    pub remaining_shares: f64,
    pub cash_from_sale: f64,
    pub loan_repaid: f64,
    /// Loan left over when the whole position could not repay it.
    pub remaining_loan: f64,
    pub transaction_cost: f64,
}

impl LiquidationImpact {
    pub fn has_shortfall(&self) -> bool {
        self.remaining_loan > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginCallRequirement {
    pub required_stock_value: f64,
    pub value_to_add: f64,
    pub cash_used: f64,
    pub shares_to_sell: f64,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn maintenance_ratio(&self, stock_value: f64, loan: f64) -> f64 {
        maintenance_ratio(stock_value, loan)
    }

    pub fn check_liquidation(&self, ratio: f64) -> bool {
        ratio.is_finite() && ratio < self.config.liquidation_ratio_threshold
    }

    pub fn check_margin_call(&self, ratio: f64) -> bool {
        ratio.is_finite()
            && ratio >= self.config.liquidation_ratio_threshold
            && ratio < self.config.maintenance_ratio_threshold
    }

    pub fn check_re_leverage_opportunity(&self, ratio: f64) -> bool {
        ratio.is_finite() && ratio > self.config.re_leverage_threshold
    }

    pub fn assess(&self, ratio: f64) -> RiskState {
        if self.check_liquidation(ratio) {
            RiskState::Liquidation
        } else if self.check_margin_call(ratio) {
            RiskState::MarginCall
        } else {
            RiskState::Healthy
        }
    }

    /// Sell just enough shares to repay `loan` after the sell fee, capped at
    /// the shares held.
    pub fn liquidation_impact(
        &self,
        loan: f64,
        shares: f64,
        price: f64,
        sell_fee_rate: f64,
    ) -> LiquidationImpact {
        let required_shares = loan / (1.0 - sell_fee_rate) / price;
        let covered = required_shares <= shares;
        let shares_sold = required_shares.min(shares).max(0.0);

        let gross_sale_value = shares_sold * price;
        let cash_from_sale = gross_sale_value * (1.0 - sell_fee_rate);
        let loan_repaid = if covered {
            loan
        } else {
            cash_from_sale.min(loan)
        };

        LiquidationImpact {
            shares_sold,
            remaining_shares: (shares - shares_sold).max(0.0),
            cash_from_sale,
            loan_repaid,
            remaining_loan: (loan - loan_repaid).max(0.0),
            transaction_cost: gross_sale_value - cash_from_sale,
        }
    }

    /// Value needed to lift the account back to the maintenance threshold,
    /// drawn from cash first and then from a forced sale grossed up for fees.
    pub fn margin_call_requirement(
        &self,
        stock_value: f64,
        loan: f64,
        available_cash: f64,
        shares: f64,
        price: f64,
        sell_fee_rate: f64,
    ) -> MarginCallRequirement {
        let required_stock_value = loan * self.config.maintenance_ratio_threshold;
        let value_to_add = required_stock_value - stock_value;

        if value_to_add <= 0.0 {
            return MarginCallRequirement {
                required_stock_value,
                value_to_add: 0.0,
                cash_used: 0.0,
                shares_to_sell: 0.0,
                resolved: true,
            };
        }

        let cash_used = available_cash.max(0.0).min(value_to_add);
        let value_from_selling = value_to_add - cash_used;
        let shares_to_sell = if value_from_selling > 0.0 {
            value_from_selling / (1.0 - sell_fee_rate) / price
        } else {
            0.0
        };

        MarginCallRequirement {
            required_stock_value,
            value_to_add,
            cash_used,
            shares_to_sell,
            resolved: shares_to_sell <= shares,
        }
    }

    pub fn re_leverage_amount(&self, stock_value: f64, loan: f64) -> f64 {
        (stock_value * self.config.ltv - loan).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-9;
    const SELL_FEE: f64 = 0.004425;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig::default())
    }

    #[test]
    fn zero_loan_maps_to_infinite_ratio() {
        let engine = engine();
        let ratio = engine.maintenance_ratio(10_000.0, 0.0);
        assert!(ratio.is_infinite());
        assert!(!engine.check_liquidation(ratio));
        assert!(!engine.check_margin_call(ratio));
        assert!(!engine.check_re_leverage_opportunity(ratio));
        assert_eq!(engine.assess(ratio), RiskState::Healthy);
    }

    #[test]
    fn thresholds_partition_the_ratio_line() {
        let engine = engine();
        assert_eq!(engine.assess(1.19), RiskState::Liquidation);
        assert_eq!(engine.assess(1.20), RiskState::MarginCall);
        assert_eq!(engine.assess(1.29), RiskState::MarginCall);
        assert_eq!(engine.assess(1.30), RiskState::Healthy);
        assert!(!engine.check_re_leverage_opportunity(1.80));
        assert!(engine.check_re_leverage_opportunity(1.81));
    }

    #[test]
    fn liquidation_sells_enough_to_clear_the_loan() {
        let engine = engine();
        let impact = engine.liquidation_impact(10_000.0, 110.0, 100.0, SELL_FEE);

        let expected_sold = 10_000.0 / (1.0 - SELL_FEE) / 100.0;
        assert_approx(impact.shares_sold, expected_sold);
        assert_approx(impact.remaining_shares, 110.0 - expected_sold);
        assert_approx(impact.loan_repaid, 10_000.0);
        assert_approx(impact.remaining_loan, 0.0);
        assert!(!impact.has_shortfall());
        assert!(impact.transaction_cost > 0.0);
    }

    #[test]
    fn liquidation_with_insufficient_holdings_flags_shortfall() {
        let engine = engine();
        let impact = engine.liquidation_impact(10_000.0, 50.0, 100.0, SELL_FEE);

        assert_approx(impact.shares_sold, 50.0);
        assert_approx(impact.remaining_shares, 0.0);
        assert_approx(impact.cash_from_sale, 5_000.0 * (1.0 - SELL_FEE));
        assert!(impact.has_shortfall());
        assert_approx(impact.remaining_loan, 10_000.0 - 5_000.0 * (1.0 - SELL_FEE));
    }

    #[test]
    fn margin_call_covered_by_cash() {
        let engine = engine();
        let req =
            engine.margin_call_requirement(12_500.0, 10_000.0, 1_000.0, 125.0, 100.0, SELL_FEE);

        assert_approx(req.required_stock_value, 13_000.0);
        assert_approx(req.value_to_add, 500.0);
        assert_approx(req.cash_used, 500.0);
        assert_approx(req.shares_to_sell, 0.0);
        assert!(req.resolved);
    }

    #[test]
    fn margin_call_falls_back_to_share_sale() {
        let engine = engine();
        let req = engine.margin_call_requirement(12_500.0, 10_000.0, 200.0, 125.0, 100.0, SELL_FEE);

        assert_approx(req.cash_used, 200.0);
        assert_approx(req.shares_to_sell, 300.0 / (1.0 - SELL_FEE) / 100.0);
        assert!(req.resolved);

        let unresolved =
            engine.margin_call_requirement(12_500.0, 10_000.0, 0.0, 1.0, 100.0, SELL_FEE);
        assert!(!unresolved.resolved);
    }

    #[test]
    fn healthy_account_needs_no_margin_top_up() {
        let engine = engine();
        let req = engine.margin_call_requirement(20_000.0, 10_000.0, 0.0, 200.0, 100.0, SELL_FEE);
        assert_approx(req.value_to_add, 0.0);
        assert!(req.resolved);
    }

    #[test]
    fn re_leverage_amount_tops_up_to_ltv() {
        let engine = engine();
        assert_approx(engine.re_leverage_amount(20_000.0, 6_000.0), 6_000.0);
        assert_approx(engine.re_leverage_amount(10_000.0, 8_000.0), 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_assess_matches_individual_checks(ratio_bp in 0u32..40_000) {
            let engine = engine();
            let ratio = ratio_bp as f64 / 10_000.0;
            let state = engine.assess(ratio);
            prop_assert_eq!(state == RiskState::Liquidation, engine.check_liquidation(ratio));
            prop_assert_eq!(state == RiskState::MarginCall, engine.check_margin_call(ratio));
            prop_assert!(!(engine.check_liquidation(ratio) && engine.check_margin_call(ratio)));
        }

        #[test]
        fn prop_liquidation_never_sells_more_than_held(
            loan in 1u32..1_000_000,
            shares in 0u32..20_000,
            price_cents in 100u32..100_000
        ) {
            let engine = engine();
            let price = price_cents as f64 / 100.0;
            let impact = engine.liquidation_impact(loan as f64, shares as f64, price, SELL_FEE);
            prop_assert!(impact.shares_sold <= shares as f64 + 1e-9);
            prop_assert!(impact.remaining_shares >= 0.0);
            prop_assert!(impact.remaining_loan >= 0.0);
            prop_assert!(impact.loan_repaid <= loan as f64 + 1e-9);
        }
    }
}
