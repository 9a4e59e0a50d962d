use serde::{Deserialize, Serialize};

use crate::error::{Result, invalid_config};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DividendFrequency {
    Annual,
    SemiAnnual,
    Quarterly,
    Monthly,
}

impl DividendFrequency {
    pub fn payments_per_year(self) -> u32 {
        match self {
            DividendFrequency::Annual => 1,
            DividendFrequency::SemiAnnual => 2,
            DividendFrequency::Quarterly => 4,
            DividendFrequency::Monthly => 12,
        }
    }

    pub fn from_payments_per_year(payments: u32) -> Result<Self> {
        match payments {
            1 => Ok(DividendFrequency::Annual),
            2 => Ok(DividendFrequency::SemiAnnual),
            4 => Ok(DividendFrequency::Quarterly),
            12 => Ok(DividendFrequency::Monthly),
            other => Err(invalid_config(format!(
                "dividend frequency must be 1, 2, 4 or 12 payments per year, got {other}"
            ))),
        }
    }

    /// Payments land on the last month of each period: 12 for annual,
    /// 6/12 for semi-annual, 3/6/9/12 for quarterly.
    pub fn is_payment_month(self, month_in_year: u32) -> bool {
        month_in_year % (12 / self.payments_per_year()) == 0
    }
}

/// Margin thresholds, all as fractions (1.3 means 130%).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskConfig {
    pub ltv: f64,
    pub maintenance_ratio_threshold: f64,
    pub liquidation_ratio_threshold: f64,
    pub re_leverage_threshold: f64,
}

impl RiskConfig {
    pub fn new(
        ltv: f64,
        maintenance_ratio_threshold: f64,
        liquidation_ratio_threshold: f64,
        re_leverage_threshold: f64,
    ) -> Result<Self> {
        let config = Self {
            ltv,
            maintenance_ratio_threshold,
            liquidation_ratio_threshold,
            re_leverage_threshold,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_percentages(
        ltv: f64,
        maintenance_ratio: f64,
        liquidation_ratio: f64,
        re_leverage_ratio: f64,
    ) -> Result<Self> {
        Self::new(
            ltv / 100.0,
            maintenance_ratio / 100.0,
            liquidation_ratio / 100.0,
            re_leverage_ratio / 100.0,
        )
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("ltv", self.ltv),
            ("maintenance ratio", self.maintenance_ratio_threshold),
            ("liquidation ratio", self.liquidation_ratio_threshold),
            ("re-leverage ratio", self.re_leverage_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid_config(format!("{name} must be a finite value >= 0")));
            }
        }

        if self.ltv > 1.0 {
            return Err(invalid_config("ltv must be between 0 and 100%"));
        }

        if self.liquidation_ratio_threshold >= self.maintenance_ratio_threshold {
            return Err(invalid_config(
                "liquidation ratio must be below the maintenance ratio",
            ));
        }

        if self.maintenance_ratio_threshold >= self.re_leverage_threshold {
            return Err(invalid_config(
                "maintenance ratio must be below the re-leverage ratio",
            ));
        }

        Ok(())
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            ltv: 0.60,
            maintenance_ratio_threshold: 1.30,
            liquidation_ratio_threshold: 1.20,
            re_leverage_threshold: 1.80,
        }
    }
}

/// Dividend withholding and credit rules. Rates are fractions, the threshold
/// and cap are currency amounts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxConfig {
    pub dividend_tax_rate: f64,
    pub dividend_tax_threshold: f64,
    pub dividend_credit_rate: f64,
    pub annual_dividend_credit_cap: f64,
}

impl TaxConfig {
    pub fn new(
        dividend_tax_rate: f64,
        dividend_tax_threshold: f64,
        dividend_credit_rate: f64,
        annual_dividend_credit_cap: f64,
    ) -> Result<Self> {
        let config = Self {
            dividend_tax_rate,
            dividend_tax_threshold,
            dividend_credit_rate,
            annual_dividend_credit_cap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_percentages(
        dividend_tax_rate: f64,
        dividend_tax_threshold: f64,
        dividend_credit_rate: f64,
        annual_dividend_credit_cap: f64,
    ) -> Result<Self> {
        Self::new(
            dividend_tax_rate / 100.0,
            dividend_tax_threshold,
            dividend_credit_rate / 100.0,
            annual_dividend_credit_cap,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.dividend_tax_rate) {
            return Err(invalid_config("dividend tax rate must be between 0 and 100%"));
        }
        if !(0.0..=1.0).contains(&self.dividend_credit_rate) {
            return Err(invalid_config(
                "dividend credit rate must be between 0 and 100%",
            ));
        }
        if !self.dividend_tax_threshold.is_finite() || self.dividend_tax_threshold < 0.0 {
            return Err(invalid_config("dividend tax threshold must be >= 0"));
        }
        if !self.annual_dividend_credit_cap.is_finite() || self.annual_dividend_credit_cap < 0.0 {
            return Err(invalid_config("annual dividend credit cap must be >= 0"));
        }
        Ok(())
    }
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            dividend_tax_rate: 0.0211,
            dividend_tax_threshold: 20_000.0,
            dividend_credit_rate: 0.085,
            annual_dividend_credit_cap: 80_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalculatorConfig {
    pub use_leverage: bool,
    pub risk: RiskConfig,
    pub tax: TaxConfig,
    pub annual_interest_rate: f64,
    pub buy_fee_rate: f64,
    pub sell_fee_rate: f64,
    pub dividend_frequency: DividendFrequency,
}

impl CalculatorConfig {
    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;
        self.tax.validate()?;

        if !self.annual_interest_rate.is_finite() || self.annual_interest_rate < 0.0 {
            return Err(invalid_config("margin interest rate must be >= 0"));
        }

        for (name, rate) in [
            ("buy fee rate", self.buy_fee_rate),
            ("sell fee rate", self.sell_fee_rate),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(invalid_config(format!("{name} must be in [0, 100%)")));
            }
        }

        Ok(())
    }

    /// Compounded monthly equivalent of the annual margin rate.
    pub fn monthly_interest_rate(&self) -> f64 {
        (1.0 + self.annual_interest_rate).powf(1.0 / 12.0) - 1.0
    }
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            use_leverage: false,
            risk: RiskConfig::default(),
            tax: TaxConfig::default(),
            annual_interest_rate: 0.065,
            buy_fee_rate: 0.001425,
            sell_fee_rate: 0.004425,
            dividend_frequency: DividendFrequency::Quarterly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonthlyMarketInput {
    pub monthly_return: f64,
    pub monthly_contribution: f64,
    /// Annualised, as a fraction.
    pub dividend_yield: f64,
    pub calendar_year: i32,
    pub month_in_year: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    pub share_price: f64,
    pub shares: f64,
    pub stock_value: f64,
    pub loan_amount: f64,
    pub net_equity: f64,
    /// `stock_value / loan_amount`; infinite when there is no loan.
    #[serde(skip)]
    pub maintenance_ratio: f64,
    pub margin_call_triggered: bool,
    pub margin_call_unresolved: bool,
    pub liquidated: bool,
    pub insolvent: bool,
    pub cash_dividend: f64,
    pub dividend_tax: f64,
    pub tax_credit: f64,
    pub interest_paid: f64,
    pub unrecovered_loss: f64,
}

impl AccountState {
    pub fn new(share_price: f64, shares: f64, loan_amount: f64) -> Self {
        let stock_value = shares * share_price;
        Self {
            share_price,
            shares,
            stock_value,
            loan_amount,
            net_equity: stock_value - loan_amount,
            maintenance_ratio: maintenance_ratio(stock_value, loan_amount),
            margin_call_triggered: false,
            margin_call_unresolved: false,
            liquidated: false,
            insolvent: false,
            cash_dividend: 0.0,
            dividend_tax: 0.0,
            tax_credit: 0.0,
            interest_paid: 0.0,
            unrecovered_loss: 0.0,
        }
    }

    pub fn has_loan(&self) -> bool {
        self.loan_amount > 0.0
    }

    pub fn maintenance_ratio_pct(&self) -> Option<f64> {
        self.maintenance_ratio
            .is_finite()
            .then_some(self.maintenance_ratio * 100.0)
    }
}

pub(crate) fn maintenance_ratio(stock_value: f64, loan_amount: f64) -> f64 {
    if loan_amount <= 0.0 {
        f64::INFINITY
    } else {
        stock_value / loan_amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarterly_payments_fall_on_quarter_ends() {
        let months = (1..=12)
            .filter(|m| DividendFrequency::Quarterly.is_payment_month(*m))
            .collect::<Vec<_>>();
        assert_eq!(months, vec![3, 6, 9, 12]);
        assert!(DividendFrequency::Annual.is_payment_month(12));
        assert!(!DividendFrequency::Annual.is_payment_month(6));
        assert!(DividendFrequency::Monthly.is_payment_month(1));
    }

    #[test]
    fn dividend_frequency_rejects_unsupported_counts() {
        assert!(DividendFrequency::from_payments_per_year(0).is_err());
        assert!(DividendFrequency::from_payments_per_year(3).is_err());
        assert_eq!(
            DividendFrequency::from_payments_per_year(2),
            Ok(DividendFrequency::SemiAnnual)
        );
    }

    #[test]
    fn risk_config_enforces_threshold_order() {
        assert!(RiskConfig::from_percentages(60.0, 130.0, 120.0, 180.0).is_ok());
        assert!(RiskConfig::from_percentages(60.0, 120.0, 130.0, 180.0).is_err());
        assert!(RiskConfig::from_percentages(60.0, 130.0, 120.0, 125.0).is_err());
        assert!(RiskConfig::from_percentages(60.0, 130.0, 130.0, 180.0).is_err());
        assert!(RiskConfig::from_percentages(-1.0, 130.0, 120.0, 180.0).is_err());
        assert!(RiskConfig::from_percentages(120.0, 130.0, 120.0, 180.0).is_err());
    }

    #[test]
    fn calculator_config_rejects_negative_rates() {
        let mut config = CalculatorConfig {
            annual_interest_rate: -0.01,
            ..CalculatorConfig::default()
        };
        assert!(config.validate().is_err());

        config.annual_interest_rate = 0.065;
        config.sell_fee_rate = 1.0;
        assert!(config.validate().is_err());

        config.sell_fee_rate = 0.004425;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn account_state_without_loan_has_infinite_ratio() {
        let state = AccountState::new(100.0, 100.0, 0.0);
        assert!(state.maintenance_ratio.is_infinite());
        assert_eq!(state.maintenance_ratio_pct(), None);
        assert_eq!(state.net_equity, 10_000.0);

        let levered = AccountState::new(100.0, 160.0, 6_000.0);
        assert!(levered.has_loan());
        assert!((levered.maintenance_ratio - 16_000.0 / 6_000.0).abs() < 1e-12);
    }
}
