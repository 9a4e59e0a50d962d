use axum::{
    Router,
    extract::Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    BacktestCalculator, BacktestOutcome, BacktestRecord, BacktestSeries, BacktestSummary,
    CalculatorConfig, DistributionStats, DividendFrequency, MonteCarloConfig, MonteCarloSimulator,
    MonthlyWealthCalculator, ResultColumn, ReturnObservation, RiskConfig, SummaryRow, TaxConfig,
    WealthBands,
};

const MAX_SIMULATIONS: usize = 5_000;
const MAX_YEARS: u32 = 30;
const BAND_PATHS: usize = 50;
const BAND_POINTS: usize = 20;

#[derive(Parser, Debug)]
#[command(
    name = "levsim",
    about = "Margin-financed dividend portfolio simulator (historical backtest + Monte Carlo)"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a historical monthly return series, with and without leverage.
    Backtest(BacktestArgs),
    /// Project wealth over simulated GBM return paths.
    MonteCarlo(MonteCarloArgs),
    /// Serve the JSON HTTP API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
struct AccountArgs {
    #[arg(long, default_value_t = 1_000_000.0)]
    initial_capital: f64,
    #[arg(long, default_value_t = 20_000.0)]
    monthly_contribution: f64,
    #[arg(long, default_value_t = 4.0, help = "Annual dividend yield in percent")]
    dividend_yield: f64,
    #[arg(
        long,
        default_value_t = 4,
        help = "Dividend payments per year: 1, 2, 4 or 12"
    )]
    dividend_frequency: u32,
    #[arg(long)]
    use_leverage: bool,
    #[arg(long, default_value_t = 60.0, help = "Loan-to-value in percent")]
    ltv: f64,
    #[arg(long, default_value_t = 130.0, help = "Margin-call ratio in percent")]
    maintenance_ratio: f64,
    #[arg(long, default_value_t = 120.0, help = "Forced-liquidation ratio in percent")]
    liquidation_ratio: f64,
    #[arg(long, default_value_t = 180.0, help = "Re-leverage ratio in percent")]
    re_leverage_ratio: f64,
    #[arg(long, default_value_t = 6.5, help = "Annual margin interest in percent")]
    margin_interest_rate: f64,
    #[arg(long, default_value_t = 0.1425, help = "Buy fee in percent")]
    buy_fee: f64,
    #[arg(long, default_value_t = 0.4425, help = "Sell fee in percent")]
    sell_fee: f64,
    #[arg(
        long,
        default_value_t = 2.11,
        help = "Supplementary premium on a single dividend above the threshold, in percent"
    )]
    dividend_tax_rate: f64,
    #[arg(long, default_value_t = 20_000.0)]
    dividend_tax_threshold: f64,
    #[arg(long, default_value_t = 8.5, help = "Dividend tax credit rate in percent")]
    dividend_credit_rate: f64,
    #[arg(long, default_value_t = 80_000.0, help = "Annual dividend credit cap")]
    dividend_credit_cap: f64,
}

#[derive(Args, Debug, Clone)]
struct BacktestArgs {
    #[command(flatten)]
    account: AccountArgs,
    #[arg(
        long,
        help = "JSON file with an array of {year, month, monthlyReturn} records"
    )]
    returns: PathBuf,
}

#[derive(Args, Debug, Clone, PartialEq)]
struct MonteCarloArgs {
    #[command(flatten)]
    account: AccountArgs,
    #[arg(long, default_value_t = 8.0, help = "Expected annual return in percent")]
    mu: f64,
    #[arg(long, default_value_t = 15.0, help = "Annual volatility in percent")]
    sigma: f64,
    #[arg(long, default_value_t = 10)]
    years: u32,
    #[arg(long, default_value_t = 1_000)]
    simulations: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = CliSimulationMode::Simple)]
    mode: CliSimulationMode,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSimulationMode {
    Simple,
    Full,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum ApiSimulationMode {
    #[serde(alias = "basic")]
    Simple,
    #[serde(alias = "calculator", alias = "detailed")]
    Full,
}

impl From<ApiSimulationMode> for CliSimulationMode {
    fn from(value: ApiSimulationMode) -> Self {
        match value {
            ApiSimulationMode::Simple => CliSimulationMode::Simple,
            ApiSimulationMode::Full => CliSimulationMode::Full,
        }
    }
}

impl From<CliSimulationMode> for ApiSimulationMode {
    fn from(value: CliSimulationMode) -> Self {
        match value {
            CliSimulationMode::Simple => ApiSimulationMode::Simple,
            CliSimulationMode::Full => ApiSimulationMode::Full,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AccountPayload {
    initial_capital: Option<f64>,
    monthly_contribution: Option<f64>,
    dividend_yield: Option<f64>,
    dividend_frequency: Option<u32>,
    use_leverage: Option<bool>,
    ltv: Option<f64>,
    maintenance_ratio: Option<f64>,
    liquidation_ratio: Option<f64>,
    re_leverage_ratio: Option<f64>,
    margin_interest_rate: Option<f64>,
    buy_fee: Option<f64>,
    sell_fee: Option<f64>,
    dividend_tax_rate: Option<f64>,
    dividend_tax_threshold: Option<f64>,
    dividend_credit_rate: Option<f64>,
    dividend_credit_cap: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BacktestPayload {
    #[serde(flatten)]
    account: AccountPayload,
    returns: Vec<ReturnObservation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MonteCarloPayload {
    #[serde(flatten)]
    account: AccountPayload,
    mu: Option<f64>,
    sigma: Option<f64>,
    years: Option<u32>,
    simulations: Option<usize>,
    seed: Option<u64>,
    mode: Option<ApiSimulationMode>,
}

#[derive(Debug)]
struct MonteCarloRequest {
    calculator: CalculatorConfig,
    config: MonteCarloConfig,
    dividend_yield: f64,
    mode: CliSimulationMode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SeriesResponse {
    summary: Option<BacktestSummary>,
    records: Vec<BacktestRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BacktestResponse {
    unlevered: SeriesResponse,
    levered: Option<SeriesResponse>,
    outperformance_pct: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MonteCarloResponse {
    mode: ApiSimulationMode,
    simulations: usize,
    years: u32,
    total_contribution: f64,
    statistics: DistributionStats,
    summary_table: Vec<SummaryRow>,
    loss_probability_pct: Option<f64>,
    insolvency_rate_pct: Option<f64>,
    wealth_bands: Option<WealthBands>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Serve { port } => run_http_server(port)
            .await
            .map_err(|e| format!("server error: {e}")),
        Command::Backtest(args) => {
            let raw = std::fs::read_to_string(&args.returns)
                .map_err(|e| format!("failed to read {}: {e}", args.returns.display()))?;
            let returns = serde_json::from_str::<Vec<ReturnObservation>>(&raw)
                .map_err(|e| format!("invalid return series in {}: {e}", args.returns.display()))?;
            let response = run_backtest_request(&args.account, returns)?;
            print_json(&response)
        }
        Command::MonteCarlo(args) => {
            let request = build_monte_carlo_request(&args)?;
            let response = run_monte_carlo_request(&request)?;
            print_json(&response)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{out}");
    Ok(())
}

fn build_calculator_config(args: &AccountArgs) -> Result<CalculatorConfig, String> {
    if !args.initial_capital.is_finite() || args.initial_capital <= 0.0 {
        return Err("--initial-capital must be > 0".to_string());
    }

    if !args.monthly_contribution.is_finite() || args.monthly_contribution < 0.0 {
        return Err("--monthly-contribution must be >= 0".to_string());
    }

    if !(0.0..=100.0).contains(&args.dividend_yield) {
        return Err("--dividend-yield must be between 0 and 100".to_string());
    }

    let dividend_frequency = DividendFrequency::from_payments_per_year(args.dividend_frequency)
        .map_err(|_| "--dividend-frequency must be 1, 2, 4 or 12".to_string())?;

    if !(0.0..=100.0).contains(&args.ltv) {
        return Err("--ltv must be between 0 and 100".to_string());
    }

    if args.liquidation_ratio >= args.maintenance_ratio {
        return Err("--liquidation-ratio must be < --maintenance-ratio".to_string());
    }

    if args.maintenance_ratio >= args.re_leverage_ratio {
        return Err("--maintenance-ratio must be < --re-leverage-ratio".to_string());
    }

    if !args.margin_interest_rate.is_finite() || args.margin_interest_rate < 0.0 {
        return Err("--margin-interest-rate must be >= 0".to_string());
    }

    if !(0.0..100.0).contains(&args.buy_fee) {
        return Err("--buy-fee must be >= 0 and < 100".to_string());
    }

    if !(0.0..100.0).contains(&args.sell_fee) {
        return Err("--sell-fee must be >= 0 and < 100".to_string());
    }

    if !(0.0..=100.0).contains(&args.dividend_tax_rate) {
        return Err("--dividend-tax-rate must be between 0 and 100".to_string());
    }

    if !(0.0..=100.0).contains(&args.dividend_credit_rate) {
        return Err("--dividend-credit-rate must be between 0 and 100".to_string());
    }

    if !args.dividend_tax_threshold.is_finite() || args.dividend_tax_threshold < 0.0 {
        return Err("--dividend-tax-threshold must be >= 0".to_string());
    }

    if !args.dividend_credit_cap.is_finite() || args.dividend_credit_cap < 0.0 {
        return Err("--dividend-credit-cap must be >= 0".to_string());
    }

    let risk = RiskConfig::from_percentages(
        args.ltv,
        args.maintenance_ratio,
        args.liquidation_ratio,
        args.re_leverage_ratio,
    )
    .map_err(|e| e.to_string())?;
    let tax = TaxConfig::from_percentages(
        args.dividend_tax_rate,
        args.dividend_tax_threshold,
        args.dividend_credit_rate,
        args.dividend_credit_cap,
    )
    .map_err(|e| e.to_string())?;

    let config = CalculatorConfig {
        use_leverage: args.use_leverage,
        risk,
        tax,
        annual_interest_rate: args.margin_interest_rate / 100.0,
        buy_fee_rate: args.buy_fee / 100.0,
        sell_fee_rate: args.sell_fee / 100.0,
        dividend_frequency,
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn build_monte_carlo_request(args: &MonteCarloArgs) -> Result<MonteCarloRequest, String> {
    let calculator = build_calculator_config(&args.account)?;

    if args.simulations == 0 || args.simulations > MAX_SIMULATIONS {
        return Err(format!(
            "--simulations must be between 1 and {MAX_SIMULATIONS}"
        ));
    }

    if args.years == 0 || args.years > MAX_YEARS {
        return Err(format!("--years must be between 1 and {MAX_YEARS}"));
    }

    if !args.mu.is_finite() || args.mu <= -100.0 {
        return Err("--mu must be > -100".to_string());
    }

    if !args.sigma.is_finite() || args.sigma < 0.0 {
        return Err("--sigma must be >= 0".to_string());
    }

    let config = MonteCarloConfig {
        mu: args.mu / 100.0,
        sigma: args.sigma / 100.0,
        initial_capital: args.account.initial_capital,
        monthly_contribution: args.account.monthly_contribution,
        years: args.years,
        num_simulations: args.simulations,
        seed: args.seed,
    };
    config.validate().map_err(|e| e.to_string())?;

    Ok(MonteCarloRequest {
        calculator,
        config,
        dividend_yield: args.account.dividend_yield / 100.0,
        mode: args.mode,
    })
}

fn run_backtest_request(
    account: &AccountArgs,
    returns: Vec<ReturnObservation>,
) -> Result<BacktestResponse, String> {
    let config = build_calculator_config(account)?;
    let calculator = MonthlyWealthCalculator::new(config).map_err(|e| e.to_string())?;
    let mut backtester = BacktestCalculator::new(calculator, returns);
    let outcome = backtester
        .run_backtest(
            account.initial_capital,
            account.monthly_contribution,
            account.dividend_yield / 100.0,
            account.use_leverage,
        )
        .map_err(|e| e.to_string())?;
    Ok(build_backtest_response(outcome))
}

fn build_backtest_response(outcome: BacktestOutcome) -> BacktestResponse {
    let outperformance_pct = outcome.outperformance_pct();
    let series = |s: BacktestSeries| SeriesResponse {
        summary: s.summary(),
        records: s.records,
    };
    BacktestResponse {
        unlevered: series(outcome.unlevered),
        levered: outcome.levered.map(series),
        outperformance_pct,
    }
}

fn run_monte_carlo_request(request: &MonteCarloRequest) -> Result<MonteCarloResponse, String> {
    let simulator = MonteCarloSimulator::new(request.config).map_err(|e| e.to_string())?;

    let (statistics, loss_probability_pct, insolvency_rate_pct, wealth_bands) = match request.mode
    {
        CliSimulationMode::Simple => {
            let results = simulator.simulate_simple();
            let stats = simulator
                .analyze_results(&results, ResultColumn::FinalWealth)
                .map_err(|e| e.to_string())?;
            (
                stats,
                Some(simulator.loss_probability(&results)),
                None,
                Some(simulator.wealth_bands(BAND_PATHS, BAND_POINTS)),
            )
        }
        CliSimulationMode::Full => {
            let calculator =
                MonthlyWealthCalculator::new(request.calculator).map_err(|e| e.to_string())?;
            let results = simulator
                .simulate_with_calculator(&calculator, request.dividend_yield, |done, total| {
                    info!(done, total, "paths replayed");
                    ControlFlow::Continue(())
                })
                .ok_or_else(|| "simulation cancelled".to_string())?;
            let stats = simulator
                .analyze_results(&results, ResultColumn::FinalNetEquity)
                .map_err(|e| e.to_string())?;
            let insolvent = results.iter().filter(|r| r.ever_insolvent).count();
            (
                stats,
                None,
                Some(insolvent as f64 / results.len().max(1) as f64 * 100.0),
                None,
            )
        }
    };

    Ok(MonteCarloResponse {
        mode: request.mode.into(),
        simulations: request.config.num_simulations,
        years: request.config.years,
        total_contribution: simulator.total_contribution(),
        summary_table: simulator.summary_table(&statistics),
        statistics,
        loss_probability_pct,
        insolvency_rate_pct,
        wealth_bands,
    })
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "levsim HTTP API listening");

    axum::serve(listener, router()).await
}

fn router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/backtest", post(backtest_handler))
        .route("/api/monte-carlo", post(monte_carlo_handler))
        .fallback(not_found_handler)
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn backtest_handler(Json(payload): Json<BacktestPayload>) -> Response {
    let mut account = default_account_args();
    merge_account(&mut account, payload.account);
    let returns = payload.returns;

    match tokio::task::spawn_blocking(move || run_backtest_request(&account, returns)).await {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(e) => {
            error!(error = %e, "backtest task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "backtest failed")
        }
    }
}

async fn monte_carlo_handler(Json(payload): Json<MonteCarloPayload>) -> Response {
    let request = match monte_carlo_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || run_monte_carlo_request(&request)).await {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(e) => {
            error!(error = %e, "monte carlo task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn monte_carlo_request_from_payload(
    payload: MonteCarloPayload,
) -> Result<MonteCarloRequest, String> {
    let mut args = default_monte_carlo_args();
    merge_account(&mut args.account, payload.account);

    if let Some(v) = payload.mu {
        args.mu = v;
    }
    if let Some(v) = payload.sigma {
        args.sigma = v;
    }
    if let Some(v) = payload.years {
        args.years = v;
    }
    if let Some(v) = payload.simulations {
        args.simulations = v;
    }
    if let Some(v) = payload.seed {
        args.seed = v;
    }
    if let Some(v) = payload.mode {
        args.mode = v.into();
    }

    build_monte_carlo_request(&args)
}

fn merge_account(args: &mut AccountArgs, payload: AccountPayload) {
    if let Some(v) = payload.initial_capital {
        args.initial_capital = v;
    }
    if let Some(v) = payload.monthly_contribution {
        args.monthly_contribution = v;
    }
    if let Some(v) = payload.dividend_yield {
        args.dividend_yield = v;
    }
    if let Some(v) = payload.dividend_frequency {
        args.dividend_frequency = v;
    }
    if let Some(v) = payload.use_leverage {
        args.use_leverage = v;
    }
    if let Some(v) = payload.ltv {
        args.ltv = v;
    }
    if let Some(v) = payload.maintenance_ratio {
        args.maintenance_ratio = v;
    }
    if let Some(v) = payload.liquidation_ratio {
        args.liquidation_ratio = v;
    }
    if let Some(v) = payload.re_leverage_ratio {
        args.re_leverage_ratio = v;
    }
    if let Some(v) = payload.margin_interest_rate {
        args.margin_interest_rate = v;
    }
    if let Some(v) = payload.buy_fee {
        args.buy_fee = v;
    }
    if let Some(v) = payload.sell_fee {
        args.sell_fee = v;
    }
    if let Some(v) = payload.dividend_tax_rate {
        args.dividend_tax_rate = v;
    }
    if let Some(v) = payload.dividend_tax_threshold {
        args.dividend_tax_threshold = v;
    }
    if let Some(v) = payload.dividend_credit_rate {
        args.dividend_credit_rate = v;
    }
    if let Some(v) = payload.dividend_credit_cap {
        args.dividend_credit_cap = v;
    }
}

fn default_account_args() -> AccountArgs {
    AccountArgs {
        initial_capital: 1_000_000.0,
        monthly_contribution: 20_000.0,
        dividend_yield: 4.0,
        dividend_frequency: 4,
        use_leverage: false,
        ltv: 60.0,
        maintenance_ratio: 130.0,
        liquidation_ratio: 120.0,
        re_leverage_ratio: 180.0,
        margin_interest_rate: 6.5,
        buy_fee: 0.1425,
        sell_fee: 0.4425,
        dividend_tax_rate: 2.11,
        dividend_tax_threshold: 20_000.0,
        dividend_credit_rate: 8.5,
        dividend_credit_cap: 80_000.0,
    }
}

fn default_monte_carlo_args() -> MonteCarloArgs {
    MonteCarloArgs {
        account: default_account_args(),
        mu: 8.0,
        sigma: 15.0,
        years: 10,
        simulations: 1_000,
        seed: 42,
        mode: CliSimulationMode::Simple,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_account() -> AccountArgs {
        default_account_args()
    }

    fn monte_carlo_from_json(json: &str) -> Result<MonteCarloRequest, String> {
        let payload = serde_json::from_str::<MonteCarloPayload>(json)
            .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
        monte_carlo_request_from_payload(payload)
    }

    fn history() -> Vec<ReturnObservation> {
        [0.02, -0.01, 0.03, 0.01, 0.0, 0.015]
            .iter()
            .enumerate()
            .map(|(i, r)| ReturnObservation {
                year: 2023,
                month: i as u32 + 1,
                monthly_return: *r,
            })
            .collect()
    }

    #[test]
    fn cli_defaults_match_api_defaults() {
        let cli = Cli::try_parse_from(["levsim", "monte-carlo"]).expect("parses");
        let Command::MonteCarlo(args) = cli.command else {
            panic!("expected monte-carlo subcommand");
        };
        assert_eq!(args, default_monte_carlo_args());
    }

    #[test]
    fn cli_parses_backtest_flags() {
        let cli = Cli::try_parse_from([
            "levsim",
            "backtest",
            "--returns",
            "history.json",
            "--use-leverage",
            "--ltv",
            "50",
        ])
        .expect("parses");
        let Command::Backtest(args) = cli.command else {
            panic!("expected backtest subcommand");
        };
        assert!(args.account.use_leverage);
        assert_approx(args.account.ltv, 50.0);
        assert_eq!(args.returns, PathBuf::from("history.json"));
    }

    #[test]
    fn build_calculator_config_converts_percentages() {
        let config = build_calculator_config(&sample_account()).expect("valid config");
        let defaults = CalculatorConfig::default();

        assert!(!config.use_leverage);
        assert_approx(config.risk.ltv, defaults.risk.ltv);
        assert_approx(
            config.risk.maintenance_ratio_threshold,
            defaults.risk.maintenance_ratio_threshold,
        );
        assert_approx(config.annual_interest_rate, defaults.annual_interest_rate);
        assert_approx(config.buy_fee_rate, defaults.buy_fee_rate);
        assert_approx(config.sell_fee_rate, defaults.sell_fee_rate);
        assert_approx(config.tax.dividend_tax_rate, defaults.tax.dividend_tax_rate);
        assert_approx(config.tax.dividend_credit_rate, defaults.tax.dividend_credit_rate);
        assert_eq!(config.dividend_frequency, DividendFrequency::Quarterly);
    }

    #[test]
    fn build_calculator_config_rejects_bad_threshold_order() {
        let mut account = sample_account();
        account.liquidation_ratio = 140.0;
        let err = build_calculator_config(&account).expect_err("must reject");
        assert!(err.contains("--liquidation-ratio"));

        let mut account = sample_account();
        account.re_leverage_ratio = 125.0;
        let err = build_calculator_config(&account).expect_err("must reject");
        assert!(err.contains("--re-leverage-ratio"));
    }

    #[test]
    fn build_calculator_config_rejects_unsupported_frequency() {
        let mut account = sample_account();
        account.dividend_frequency = 3;
        let err = build_calculator_config(&account).expect_err("must reject");
        assert!(err.contains("--dividend-frequency"));
    }

    #[test]
    fn build_calculator_config_rejects_negative_rates() {
        let mut account = sample_account();
        account.margin_interest_rate = -1.0;
        assert!(build_calculator_config(&account).is_err());

        let mut account = sample_account();
        account.sell_fee = 100.0;
        assert!(build_calculator_config(&account).is_err());
    }

    #[test]
    fn monte_carlo_limits_are_enforced() {
        let err = monte_carlo_from_json(r#"{"simulations": 5001}"#).expect_err("too many");
        assert!(err.contains("--simulations"));

        let err = monte_carlo_from_json(r#"{"years": 31}"#).expect_err("too long");
        assert!(err.contains("--years"));

        assert!(monte_carlo_from_json(r#"{"simulations": 5000, "years": 30}"#).is_ok());
    }

    #[test]
    fn monte_carlo_payload_merges_camel_case_keys_over_defaults() {
        let request = monte_carlo_from_json(
            r#"{
                "initialCapital": 500000,
                "monthlyContribution": 0,
                "useLeverage": true,
                "reLeverageRatio": 200,
                "dividendYield": 5,
                "mu": 6,
                "sigma": 20,
                "mode": "full"
            }"#,
        )
        .expect("valid payload");

        assert_eq!(request.mode, CliSimulationMode::Full);
        assert!(request.calculator.use_leverage);
        assert_approx(request.calculator.risk.re_leverage_threshold, 2.0);
        assert_approx(request.config.initial_capital, 500_000.0);
        assert_approx(request.config.monthly_contribution, 0.0);
        assert_approx(request.config.mu, 0.06);
        assert_approx(request.config.sigma, 0.20);
        assert_approx(request.dividend_yield, 0.05);
        assert_eq!(request.config.num_simulations, 1_000);
        assert_eq!(request.config.seed, 42);
    }

    #[test]
    fn monte_carlo_payload_rejects_unknown_mode() {
        let err = monte_carlo_from_json(r#"{"mode": "quantum"}"#).expect_err("unknown mode");
        assert!(err.contains("Invalid API JSON payload"));
    }

    #[test]
    fn simple_monte_carlo_response_reports_loss_probability_and_bands() {
        let request = monte_carlo_from_json(r#"{"simulations": 200, "years": 5}"#)
            .expect("valid payload");
        let response = run_monte_carlo_request(&request).expect("runs");

        assert_eq!(response.summary_table.len(), 5);
        assert!(response.loss_probability_pct.is_some());
        assert!(response.insolvency_rate_pct.is_none());
        let bands = response.wealth_bands.as_ref().expect("simple mode has bands");
        assert!(bands.time_points_years.len() <= BAND_POINTS + 1);

        let json = serde_json::to_value(&response).expect("serializes");
        assert_eq!(json["mode"], "simple");
        assert!(json.get("summaryTable").is_some());
        assert!(json["statistics"]["percentiles"].get("p50").is_some());
        assert_eq!(json["totalContribution"], 1_000_000.0 + 20_000.0 * 60.0);
    }

    #[test]
    fn full_monte_carlo_response_reports_liquidation_rate() {
        let request = monte_carlo_from_json(
            r#"{"simulations": 120, "years": 3, "mode": "full", "useLeverage": true}"#,
        )
        .expect("valid payload");
        let response = run_monte_carlo_request(&request).expect("runs");

        assert_eq!(response.statistics.column, ResultColumn::FinalNetEquity);
        assert!(response.statistics.liquidation_rate_pct.is_some());
        assert!(response.statistics.roi.is_some());
        assert!(response.insolvency_rate_pct.is_some());
        assert!(response.wealth_bands.is_none());
    }

    #[test]
    fn backtest_without_history_reports_no_data() {
        let err = run_backtest_request(&sample_account(), Vec::new()).expect_err("no data");
        assert!(err.contains("no historical return data"));
    }

    #[test]
    fn backtest_response_carries_both_runs_when_levered() {
        let mut account = sample_account();
        account.use_leverage = true;
        let response = run_backtest_request(&account, history()).expect("runs");

        assert_eq!(response.unlevered.records.len(), 7);
        let levered = response.levered.as_ref().expect("levered run");
        assert_eq!(levered.records.len(), 7);
        assert!(response.outperformance_pct.is_some());

        let json = serde_json::to_value(&response).expect("serializes");
        assert!(json.get("outperformancePct").is_some());
        assert!(json["unlevered"]["summary"].get("roiPct").is_some());
        assert!(json["levered"]["records"][0].get("maintenanceRatioPct").is_some());
        assert_eq!(json["unlevered"]["records"][0]["maintenanceRatioPct"], serde_json::Value::Null);
    }

    #[test]
    fn backtest_payload_parses_returns_and_overrides() {
        let payload = serde_json::from_str::<BacktestPayload>(
            r#"{
                "initialCapital": 250000,
                "dividendFrequency": 12,
                "returns": [
                    {"year": 2024, "month": 1, "monthlyReturn": 0.01},
                    {"year": 2024, "month": 2, "monthlyReturn": -0.02}
                ]
            }"#,
        )
        .expect("parses");

        let mut account = sample_account();
        merge_account(&mut account, payload.account);
        assert_approx(account.initial_capital, 250_000.0);
        assert_eq!(account.dividend_frequency, 12);
        assert_eq!(payload.returns.len(), 2);
        assert_approx(payload.returns[1].monthly_return, -0.02);
    }
}
