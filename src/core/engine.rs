use tracing::{debug, warn};

use super::risk::{RiskEngine, RiskState};
use super::tax::{TaxAccumulator, TaxCalculator};
use super::types::{AccountState, CalculatorConfig, MonthlyMarketInput};
use crate::error::Result;

pub const INITIAL_SHARE_PRICE: f64 = 100.0;

/// Fraction of the pre-crash price kept after a month that loses everything,
/// so later months still have a positive price to trade at.
const WIPEOUT_PRICE_FLOOR: f64 = 1e-9;

/// Balances carried through the steps of a single month. Cash only lives
/// inside the month; whatever is left at the end is reinvested.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MonthLedger {
    share_price: f64,
    shares: f64,
    loan: f64,
    cash: f64,
    cash_dividend: f64,
    dividend_tax: f64,
    tax_credit: f64,
    interest_paid: f64,
    unrecovered_loss: f64,
    margin_call_triggered: bool,
    margin_call_unresolved: bool,
    liquidated: bool,
    insolvent: bool,
    wiped_out: bool,
}

impl MonthLedger {
    fn open(prev: &AccountState) -> Self {
        Self {
            share_price: prev.share_price,
            shares: prev.shares,
            loan: prev.loan_amount,
            cash: 0.0,
            cash_dividend: 0.0,
            dividend_tax: 0.0,
            tax_credit: 0.0,
            interest_paid: 0.0,
            unrecovered_loss: 0.0,
            margin_call_triggered: false,
            margin_call_unresolved: false,
            liquidated: false,
            insolvent: false,
            wiped_out: false,
        }
    }

    fn stock_value(&self) -> f64 {
        self.shares * self.share_price
    }

    fn into_state(self) -> AccountState {
        AccountState {
            margin_call_triggered: self.margin_call_triggered,
            margin_call_unresolved: self.margin_call_unresolved,
            liquidated: self.liquidated,
            insolvent: self.insolvent,
            cash_dividend: self.cash_dividend,
            dividend_tax: self.dividend_tax,
            tax_credit: self.tax_credit,
            interest_paid: self.interest_paid,
            unrecovered_loss: self.unrecovered_loss,
            ..AccountState::new(self.share_price, self.shares, self.loan)
        }
    }
}

/// Steps a margin account forward one month at a time.
///
/// The calculator itself holds no per-run state; the annual tax credit is
/// tracked in the [`TaxAccumulator`] the caller passes to [`Self::step`], so
/// one calculator can drive many independent paths.
#[derive(Debug, Clone)]
pub struct MonthlyWealthCalculator {
    config: CalculatorConfig,
    risk: RiskEngine,
    tax: TaxCalculator,
    monthly_interest_rate: f64,
}

impl MonthlyWealthCalculator {
    pub fn new(config: CalculatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            risk: RiskEngine::new(config.risk),
            tax: TaxCalculator::new(config.tax),
            monthly_interest_rate: config.monthly_interest_rate(),
            config,
        })
    }

    pub fn use_leverage(&self) -> bool {
        self.config.use_leverage
    }

    pub fn set_use_leverage(&mut self, use_leverage: bool) {
        self.config.use_leverage = use_leverage;
    }

    pub fn monthly_interest_rate(&self) -> f64 {
        self.monthly_interest_rate
    }

    /// Month-zero account: `initial_capital` bought net of the buy fee, then
    /// levered up to the LTV straight away when leverage is enabled.
    pub fn opening_state(&self, initial_capital: f64, share_price: f64) -> AccountState {
        let shares = (initial_capital * (1.0 - self.config.buy_fee_rate) / share_price).max(0.0);
        let ledger = MonthLedger::open(&AccountState::new(share_price, shares, 0.0));
        self.bootstrap_leverage(ledger).into_state()
    }

    pub fn step(
        &self,
        prev: &AccountState,
        input: &MonthlyMarketInput,
        tax: &mut TaxAccumulator,
    ) -> AccountState {
        let ledger = MonthLedger::open(prev);
        let ledger = self.apply_price_return(ledger, input.monthly_return);
        let ledger = self.settle_dividend(ledger, input, tax);
        let ledger = self.settle_interest(ledger);
        let ledger = self.enforce_margin(ledger);
        let ledger = self.re_leverage(ledger);
        let ledger = add_contribution(ledger, input.monthly_contribution);
        let ledger = self.reinvest_cash(ledger);
        self.bootstrap_leverage(ledger).into_state()
    }

    fn leveraged_with_loan(&self, ledger: &MonthLedger) -> bool {
        self.config.use_leverage && ledger.loan > 0.0
    }

    fn apply_price_return(&self, mut ledger: MonthLedger, monthly_return: f64) -> MonthLedger {
        let growth = 1.0 + monthly_return;
        if growth > 0.0 {
            ledger.share_price *= growth;
            return ledger;
        }

        // Also catches a NaN return.
        warn!(
            monthly_return,
            shares = ledger.shares,
            "total loss; position wiped out"
        );
        ledger.share_price *= WIPEOUT_PRICE_FLOOR;
        ledger.shares = 0.0;
        ledger.insolvent = true;
        ledger.wiped_out = true;
        ledger
    }

    fn settle_dividend(
        &self,
        mut ledger: MonthLedger,
        input: &MonthlyMarketInput,
        tax: &mut TaxAccumulator,
    ) -> MonthLedger {
        let frequency = self.config.dividend_frequency;
        if !frequency.is_payment_month(input.month_in_year) {
            return ledger;
        }

        let payment_yield = input.dividend_yield / frequency.payments_per_year() as f64;
        let gross_dividend = ledger.shares * ledger.share_price * payment_yield;
        let outcome = self
            .tax
            .calculate_dividend_tax(gross_dividend, input.calendar_year, tax);

        ledger.cash_dividend = gross_dividend;
        ledger.dividend_tax = outcome.supplementary_premium;
        ledger.tax_credit = outcome.tax_credit;
        ledger.cash += outcome.net_dividend_after_tax;
        ledger.share_price /= 1.0 + payment_yield;
        ledger
    }

    fn settle_interest(&self, mut ledger: MonthLedger) -> MonthLedger {
        if !self.leveraged_with_loan(&ledger) {
            return ledger;
        }

        let interest = ledger.loan * self.monthly_interest_rate;
        ledger.interest_paid = interest;
        ledger.cash -= interest;

        if ledger.cash < 0.0 {
            let shortfall = -ledger.cash;
            ledger.cash = 0.0;
            let shares_to_sell = shortfall / (1.0 - self.config.sell_fee_rate) / ledger.share_price;
            if shares_to_sell > ledger.shares {
                warn!(
                    shortfall,
                    shares = ledger.shares,
                    "interest exceeds holdings; position wiped out"
                );
                ledger.shares = 0.0;
                ledger.insolvent = true;
            } else {
                ledger.shares -= shares_to_sell;
            }
        }
        ledger
    }

    fn enforce_margin(&self, mut ledger: MonthLedger) -> MonthLedger {
        if !self.leveraged_with_loan(&ledger) {
            return ledger;
        }

        let stock_value = ledger.stock_value();
        let ratio = self.risk.maintenance_ratio(stock_value, ledger.loan);
        let sell_fee = self.config.sell_fee_rate;

        match self.risk.assess(ratio) {
            RiskState::Healthy => {}
            RiskState::Liquidation => {
                let impact = self.risk.liquidation_impact(
                    ledger.loan,
                    ledger.shares,
                    ledger.share_price,
                    sell_fee,
                );
                debug!(
                    ratio,
                    shares_sold = impact.shares_sold,
                    transaction_cost = impact.transaction_cost,
                    "forced liquidation"
                );
                if impact.has_shortfall() {
                    warn!(
                        unrecovered = impact.remaining_loan,
                        "liquidation could not repay the loan"
                    );
                    ledger.insolvent = true;
                    ledger.unrecovered_loss = impact.remaining_loan;
                }
                ledger.shares = impact.remaining_shares;
                ledger.loan = 0.0;
                ledger.cash = 0.0;
                ledger.liquidated = true;
            }
            RiskState::MarginCall => {
                let requirement = self.risk.margin_call_requirement(
                    stock_value,
                    ledger.loan,
                    ledger.cash,
                    ledger.shares,
                    ledger.share_price,
                    sell_fee,
                );
                let shares_sold = requirement.shares_to_sell.min(ledger.shares);
                let sale_proceeds = shares_sold * ledger.share_price * (1.0 - sell_fee);
                debug!(
                    ratio,
                    cash_used = requirement.cash_used,
                    shares_sold,
                    "margin call"
                );

                ledger.margin_call_triggered = true;
                ledger.cash -= requirement.cash_used;
                ledger.shares -= shares_sold;
                ledger.loan = (ledger.loan - requirement.cash_used - sale_proceeds).max(0.0);
                if !requirement.resolved {
                    warn!(ratio, "margin call could not be met from holdings");
                    ledger.margin_call_unresolved = true;
                }
            }
        }
        ledger
    }

    fn re_leverage(&self, mut ledger: MonthLedger) -> MonthLedger {
        if ledger.liquidated || !self.leveraged_with_loan(&ledger) {
            return ledger;
        }

        let stock_value = ledger.stock_value();
        let ratio = self.risk.maintenance_ratio(stock_value, ledger.loan);
        if self.risk.check_re_leverage_opportunity(ratio) {
            let additional = self.risk.re_leverage_amount(stock_value, ledger.loan);
            if additional > 0.0 {
                debug!(ratio, additional, "re-leveraging");
                ledger.loan += additional;
                ledger.cash += additional;
            }
        }
        ledger
    }

    fn reinvest_cash(&self, mut ledger: MonthLedger) -> MonthLedger {
        if ledger.cash > 0.0 && !ledger.wiped_out {
            ledger.shares += ledger.cash * (1.0 - self.config.buy_fee_rate) / ledger.share_price;
            ledger.cash = 0.0;
        }
        ledger
    }

    fn bootstrap_leverage(&self, mut ledger: MonthLedger) -> MonthLedger {
        if !self.config.use_leverage
            || ledger.liquidated
            || ledger.wiped_out
            || ledger.loan > 0.0
            || ledger.shares <= 0.0
        {
            return ledger;
        }

        let new_loan = ledger.stock_value() * self.config.risk.ltv;
        ledger.loan += new_loan;
        ledger.shares += new_loan * (1.0 - self.config.buy_fee_rate) / ledger.share_price;
        ledger
    }
}

fn add_contribution(mut ledger: MonthLedger, contribution: f64) -> MonthLedger {
    ledger.cash += contribution;
    ledger
}
