//! HTTP API server for the signal-backtest engine.
//!
//! Wraps the library with a JSON wire surface: `/run` and `/optimize` for
//! simulations, fingerprint-keyed result caching, and a monitoring query
//! surface over the execution tracker.

mod cache;
mod monitor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cache::{ResultCache, ResultClass};
use monitor::ExecutionMonitor;
use signal_backtest::{
    CancelToken, Direction, OptimizeKey, Optimizer, ParamGrid, PerformanceMetrics, PriceIndex,
    PriceRow, Signal, SimulationConfig, SimulationResult, Simulator, SizingPolicy, day_ordinal,
    equity_curve, invested_capital_curve, ordinal_date,
};

// Server-specific default values
mod defaults {
    /// Default server port
    pub const SERVER_PORT: u16 = 8000;
    /// Default optimizer worker cap
    pub const MAX_WORKERS: usize = 8;
    /// Default signal capital
    pub const INITIAL_CAPITAL: f64 = 100_000.0;
    /// Default stop loss percent
    pub const STOP_LOSS_PCT: f64 = 5.0;
    /// Default holding period in bars
    pub const HOLDING_PERIOD: usize = 20;
    /// Default per-trade risk percent
    pub const RISK_PER_TRADE: f64 = 2.0;
    /// Default fixed notional per trade
    pub const FIXED_AMOUNT: f64 = 10_000.0;
    /// Default stop assumption for percent-risk sizing
    pub const STOP_ASSUMPTION: f64 = 0.05;
    /// Default volatility target
    pub const VOLATILITY_TARGET: f64 = 0.15;
    /// Default realized-volatility window
    pub const REALIZED_VOL_WINDOW: usize = 60;
    /// Default ATR window
    pub const ATR_WINDOW: usize = 14;
    /// Default Kelly win rate percent
    pub const KELLY_WIN_RATE: f64 = 55.0;
    /// Default Kelly average win percent
    pub const KELLY_AVG_WIN: f64 = 8.0;
    /// Default Kelly average loss percent
    pub const KELLY_AVG_LOSS: f64 = -4.0;
    /// Default user-activity page size
    pub const USER_ACTIVITY_LIMIT: usize = 100;
    /// Default analytics window in days
    pub const ANALYTICS_DAYS: i64 = 7;
    /// Default cleanup cutoff in days
    pub const CLEANUP_DAYS: i64 = 30;
}

#[derive(Clone)]
struct AppState {
    cache: ResultCache,
    monitor: Arc<ExecutionMonitor>,
    max_workers: usize,
}

// ── Error mapping ─────────────────────────────────────────────────────────────

/// Request-level failures, mapped onto the wire contract: validation errors
/// become 422, engine failures 500. Cache and monitoring degradation never
/// surface here; those requests still succeed with a diagnostic in `summary`.
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Engine(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Validation(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            Self::Engine(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<signal_backtest::BacktestError> for ApiError {
    fn from(err: signal_backtest::BacktestError) -> Self {
        match err {
            signal_backtest::BacktestError::Pool(_) => Self::Engine(err.to_string()),
            _ => Self::Validation(err.to_string()),
        }
    }
}

// ── Request types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct SignalRow {
    ticker: String,
    date: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OhlcvRow {
    ticker: String,
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SizingParams {
    risk_per_trade: Option<f64>,
    fixed_amount: Option<f64>,
    stop_loss_assumption: Option<f64>,
    volatility_target: Option<f64>,
    realized_vol_window: Option<usize>,
    atr_window: Option<usize>,
    kelly_win_rate: Option<f64>,
    kelly_avg_win: Option<f64>,
    kelly_avg_loss: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    signals_data: Vec<SignalRow>,
    ohlcv_data: Vec<OhlcvRow>,
    #[serde(default = "default_capital")]
    initial_capital: f64,
    #[serde(default = "default_stop_loss")]
    stop_loss: f64,
    take_profit: Option<f64>,
    #[serde(default = "default_holding_period")]
    holding_period: usize,
    #[serde(default = "default_signal_type")]
    signal_type: String,
    #[serde(default = "default_position_sizing")]
    position_sizing: String,
    #[serde(default)]
    sizing_params: SizingParams,
    #[serde(default)]
    allow_leverage: bool,
    #[serde(default)]
    one_trade_per_instrument: bool,
}

#[derive(Debug, Deserialize)]
struct OptimizeRequest {
    #[serde(flatten)]
    base: RunRequest,
    param_ranges: ParamRanges,
    max_workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct ParamRanges {
    holding_period: Vec<usize>,
    stop_loss: Vec<f64>,
    #[serde(default)]
    take_profit: Vec<f64>,
}

fn default_capital() -> f64 {
    defaults::INITIAL_CAPITAL
}

fn default_stop_loss() -> f64 {
    defaults::STOP_LOSS_PCT
}

fn default_holding_period() -> usize {
    defaults::HOLDING_PERIOD
}

fn default_signal_type() -> String {
    "long".to_string()
}

fn default_position_sizing() -> String {
    "equal_weight".to_string()
}

// ── Request assembly ──────────────────────────────────────────────────────────

fn parse_date(date: &str) -> Result<i64, ApiError> {
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(day_ordinal)
        .map_err(|_| ApiError::Validation(format!("invalid date '{date}', expected YYYY-MM-DD")))
}

fn format_day(day: i64) -> String {
    ordinal_date(day)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| day.to_string())
}

fn parse_direction(signal_type: &str) -> Result<Direction, ApiError> {
    match signal_type {
        "long" => Ok(Direction::Long),
        "short" => Ok(Direction::Short),
        other => Err(ApiError::Validation(format!(
            "invalid signal_type '{other}', expected 'long' or 'short'"
        ))),
    }
}

/// Resolve the wire sizing method + params to a policy, filling documented
/// defaults for absent parameters.
fn build_sizing_policy(method: &str, params: &SizingParams) -> Result<SizingPolicy, ApiError> {
    let policy = match method {
        "equal_weight" => SizingPolicy::EqualWeight,
        "fixed_amount" => SizingPolicy::FixedNotional {
            amount: params.fixed_amount.unwrap_or(defaults::FIXED_AMOUNT),
        },
        "percent_risk" => SizingPolicy::PercentRisk {
            risk_pct: params.risk_per_trade.unwrap_or(defaults::RISK_PER_TRADE),
            stop_assumption_pct: params
                .stop_loss_assumption
                .unwrap_or(defaults::STOP_ASSUMPTION),
        },
        "volatility_target" => SizingPolicy::VolatilityTarget {
            target_annual_vol: params
                .volatility_target
                .unwrap_or(defaults::VOLATILITY_TARGET),
            realized_vol_window: params
                .realized_vol_window
                .unwrap_or(defaults::REALIZED_VOL_WINDOW),
        },
        "atr_based" => SizingPolicy::AtrBased {
            risk_pct: params.risk_per_trade.unwrap_or(defaults::RISK_PER_TRADE),
            atr_window: params.atr_window.unwrap_or(defaults::ATR_WINDOW),
        },
        "kelly_criterion" => SizingPolicy::KellyCriterion {
            win_rate_pct: params.kelly_win_rate.unwrap_or(defaults::KELLY_WIN_RATE),
            avg_win_pct: params.kelly_avg_win.unwrap_or(defaults::KELLY_AVG_WIN),
            avg_loss_pct: params.kelly_avg_loss.unwrap_or(defaults::KELLY_AVG_LOSS),
        },
        other => {
            return Err(ApiError::Validation(format!(
                "unknown position_sizing '{other}'"
            )));
        }
    };
    Ok(policy)
}

struct PreparedRun {
    index: PriceIndex,
    signals: Vec<Signal>,
    config: SimulationConfig,
    /// Canonical parameter record, also used for fingerprinting
    params_record: Value,
}

fn prepare_run(request: &RunRequest, kind: &str, extra_params: Value) -> Result<PreparedRun, ApiError> {
    let mut rows = Vec::with_capacity(request.ohlcv_data.len());
    for row in &request.ohlcv_data {
        rows.push(PriceRow {
            ticker: row.ticker.clone(),
            day: parse_date(&row.date)?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    let index = PriceIndex::from_rows(rows)?;

    let mut signals = Vec::with_capacity(request.signals_data.len());
    for signal in &request.signals_data {
        signals.push(Signal::new(signal.ticker.clone(), parse_date(&signal.date)?));
    }

    let direction = parse_direction(&request.signal_type)?;
    let policy = build_sizing_policy(&request.position_sizing, &request.sizing_params)?;

    let mut builder = SimulationConfig::builder()
        .direction(direction)
        .holding_period_days(request.holding_period)
        .stop_loss_pct(request.stop_loss)
        .sizing_policy(policy.clone())
        .initial_capital(request.initial_capital)
        .allow_leverage(request.allow_leverage)
        .one_trade_per_instrument(request.one_trade_per_instrument);
    if let Some(tp) = request.take_profit {
        builder = builder.take_profit_pct(tp);
    }
    let config = builder.build()?;

    let mut params_record = json!({
        "request": kind,
        "initial_capital": request.initial_capital,
        "stop_loss": request.stop_loss,
        "take_profit": request.take_profit,
        "holding_period": request.holding_period,
        "signal_type": request.signal_type,
        "position_sizing": request.position_sizing,
        "sizing_policy": serde_json::to_value(&policy).unwrap_or(Value::Null),
        "allow_leverage": request.allow_leverage,
        "one_trade_per_instrument": request.one_trade_per_instrument,
    });
    if let (Value::Object(record), Value::Object(extra)) = (&mut params_record, extra_params) {
        record.extend(extra);
    }

    Ok(PreparedRun {
        index,
        signals,
        config,
        params_record,
    })
}

fn validate_param_ranges(ranges: &ParamRanges) -> Result<(), ApiError> {
    if ranges.holding_period.is_empty() {
        return Err(ApiError::Validation(
            "param_ranges.holding_period must not be empty".to_string(),
        ));
    }
    if ranges.stop_loss.is_empty() {
        return Err(ApiError::Validation(
            "param_ranges.stop_loss must not be empty".to_string(),
        ));
    }
    if ranges.holding_period.iter().any(|&hp| hp == 0) {
        return Err(ApiError::Validation(
            "param_ranges.holding_period values must be at least 1".to_string(),
        ));
    }
    if ranges.stop_loss.iter().any(|sl| !sl.is_finite() || *sl <= 0.0) {
        return Err(ApiError::Validation(
            "param_ranges.stop_loss values must be positive finite percentages".to_string(),
        ));
    }
    if ranges
        .take_profit
        .iter()
        .any(|tp| !tp.is_finite() || *tp <= 0.0)
    {
        return Err(ApiError::Validation(
            "param_ranges.take_profit values must be positive finite percentages".to_string(),
        ));
    }
    Ok(())
}

// ── Response assembly ─────────────────────────────────────────────────────────

fn trade_json(trade: &signal_backtest::Trade) -> Value {
    json!({
        "ticker": trade.ticker,
        "direction": trade.direction,
        "entry_date": format_day(trade.entry_day),
        "entry_price": trade.entry_price,
        "exit_date": format_day(trade.exit_day),
        "exit_price": trade.exit_price,
        "shares": trade.shares,
        "notional": trade.notional,
        "pnl_currency": trade.pnl_currency,
        "pnl_pct": trade.pnl_pct,
        "exit_reason": trade.exit_reason,
        "days_held": trade.days_held,
        "portfolio_value_after": trade.portfolio_value_after,
        "leverage_at_entry": trade.leverage_at_entry,
    })
}

/// The cacheable body of a `/run` response (everything except timing and
/// monitoring info, which are stamped per request).
fn run_payload(
    result: &SimulationResult,
    metrics: &PerformanceMetrics,
    initial_capital: f64,
    signals_processed: usize,
    diagnostics: Vec<String>,
) -> Value {
    let equity: Vec<Value> = equity_curve(&result.trades, initial_capital)
        .iter()
        .map(|p| json!({ "date": format_day(p.day), "value": p.value }))
        .collect();
    let invested: Vec<Value> = invested_capital_curve(&result.trades)
        .iter()
        .map(|p| json!({ "date": format_day(p.day), "invested": p.invested }))
        .collect();

    json!({
        "trades": result.trades.iter().map(trade_json).collect::<Vec<_>>(),
        "performance_metrics": serde_json::to_value(metrics).unwrap_or(Value::Null),
        "equity_curve": equity,
        "invested_capital_curve": invested,
        "summary": {
            "initial_capital": initial_capital,
            "final_portfolio_value": result.final_portfolio_value,
            "total_trades": result.trades.len(),
            "leverage_warnings": result.leverage_warnings,
            "diagnostics": diagnostics,
        },
        "signals_processed": signals_processed,
    })
}

fn attach_monitoring(
    mut payload: Value,
    execution_id: &str,
    cache_hit: bool,
    from_cache: bool,
    execution_time: f64,
) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert("execution_time".to_string(), json!(execution_time));
        map.insert(
            "monitoring".to_string(),
            json!({
                "execution_id": execution_id,
                "cache_hit": cache_hit,
                "from_cache": from_cache,
            }),
        );
    }
    payload
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn request_identity(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let user_id = headers
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (user_id, correlation_id)
}

/// POST /run
///
/// Headers: `X-User-ID`, `X-Correlation-ID` (the latter becomes the
/// execution id when present).
async fn run_backtest(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let (user_id, correlation_id) = request_identity(&headers);
    let execution_id = state.monitor.begin(user_id, correlation_id);

    match run_backtest_inner(&state, &execution_id, request, started).await {
        Ok(response) => {
            state.monitor.complete(&execution_id);
            Ok(Json(response))
        }
        Err(err) => {
            state.monitor.fail(&execution_id, err.to_string());
            Err(err)
        }
    }
}

async fn run_backtest_inner(
    state: &AppState,
    execution_id: &str,
    request: RunRequest,
    started: Instant,
) -> Result<Value, ApiError> {
    let prepared = prepare_run(&request, "run", json!({}))?;
    let PreparedRun {
        index,
        signals,
        config,
        params_record,
    } = prepared;

    let fingerprint = signal_backtest::cache_key(&signals, &params_record);
    state
        .monitor
        .log_run_start(execution_id, params_record, signals.len());

    if let Some(cached) = state.cache.get(&fingerprint).await {
        info!(execution_id, %fingerprint, "serving /run from cache");
        let trades_count = cached["trades"].as_array().map(|t| t.len()).unwrap_or(0);
        state.monitor.set_cache_hit(execution_id, true);
        state.monitor.log_run_complete(
            execution_id,
            trades_count,
            cached["performance_metrics"].clone(),
        );
        return Ok(attach_monitoring(
            cached,
            execution_id,
            true,
            true,
            started.elapsed().as_secs_f64(),
        ));
    }

    let initial_capital = config.initial_capital;
    let signals_count = signals.len();
    let worker = tokio::task::spawn_blocking(move || {
        let result = Simulator::new(config).run(&index, &signals);
        let metrics = PerformanceMetrics::calculate(&result.trades, initial_capital);
        (result, metrics)
    });
    let (result, metrics) = worker
        .await
        .map_err(|e| ApiError::Engine(format!("simulation task failed: {e}")))?;

    let mut diagnostics = Vec::new();
    if !state.cache.is_enabled() {
        diagnostics.push("result cache unavailable; response not cached".to_string());
    }

    let payload = run_payload(
        &result,
        &metrics,
        initial_capital,
        signals_count,
        diagnostics,
    );
    state
        .cache
        .set(&fingerprint, &payload, ResultClass::Standard)
        .await;
    state.monitor.log_run_complete(
        execution_id,
        result.trades.len(),
        serde_json::to_value(&metrics).unwrap_or(Value::Null),
    );

    Ok(attach_monitoring(
        payload,
        execution_id,
        false,
        false,
        started.elapsed().as_secs_f64(),
    ))
}

/// POST /optimize
///
/// Same request as `/run` plus `param_ranges` and optional `max_workers`.
async fn run_optimization(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(request): Json<OptimizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let (user_id, correlation_id) = request_identity(&headers);
    let execution_id = state.monitor.begin(user_id, correlation_id);

    match run_optimization_inner(&state, &execution_id, request, started).await {
        Ok(response) => {
            state.monitor.complete(&execution_id);
            Ok(Json(response))
        }
        Err(err) => {
            state.monitor.fail(&execution_id, err.to_string());
            Err(err)
        }
    }
}

async fn run_optimization_inner(
    state: &AppState,
    execution_id: &str,
    request: OptimizeRequest,
    started: Instant,
) -> Result<Value, ApiError> {
    validate_param_ranges(&request.param_ranges)?;
    let ranges = request.param_ranges.clone();
    let extra = json!({
        "param_ranges": {
            "holding_period": ranges.holding_period,
            "stop_loss": ranges.stop_loss,
            "take_profit": ranges.take_profit,
        },
    });
    let prepared = prepare_run(&request.base, "optimize", extra)?;
    let PreparedRun {
        index,
        signals,
        config,
        params_record,
    } = prepared;

    let fingerprint = signal_backtest::cache_key(&signals, &params_record);
    state
        .monitor
        .log_run_start(execution_id, params_record, signals.len());

    if let Some(cached) = state.cache.get(&fingerprint).await {
        info!(execution_id, %fingerprint, "serving /optimize from cache");
        state.monitor.set_cache_hit(execution_id, true);
        state.monitor.log_run_complete(
            execution_id,
            0,
            cached["best_performance"].clone(),
        );
        return Ok(attach_monitoring(
            cached,
            execution_id,
            true,
            true,
            started.elapsed().as_secs_f64(),
        ));
    }

    let grid = ParamGrid {
        holding_periods: request.param_ranges.holding_period.clone(),
        stop_losses: request.param_ranges.stop_loss.clone(),
        take_profits: request.param_ranges.take_profit.clone(),
    };
    let max_workers = request.max_workers.unwrap_or(state.max_workers);
    let signals_count = signals.len();

    let worker = tokio::task::spawn_blocking(move || {
        Optimizer::new(max_workers).run(&index, &signals, &config, &grid, &CancelToken::new())
    });
    let report = worker
        .await
        .map_err(|e| ApiError::Engine(format!("optimization task failed: {e}")))?
        .map_err(ApiError::from)?;

    let all_results: Vec<Value> = report
        .cells
        .iter()
        .map(|cell| {
            let params = json!({
                "holding_period": cell.params.holding_period,
                "stop_loss": cell.params.stop_loss_pct,
                "take_profit": cell.params.take_profit_pct,
            });
            match &cell.summary {
                Some(summary) => json!({
                    "params": params,
                    "performance": serde_json::to_value(summary).unwrap_or(Value::Null),
                    "total_return": summary.total_return_pct,
                    "total_trades": summary.total_trades,
                }),
                None => json!({
                    "params": params,
                    "error": cell.error,
                }),
            }
        })
        .collect();

    let best = report.best(OptimizeKey::TotalReturn);
    let (best_params, best_performance) = match best {
        Some(cell) => (
            json!({
                "holding_period": cell.params.holding_period,
                "stop_loss": cell.params.stop_loss_pct,
                "take_profit": cell.params.take_profit_pct,
            }),
            serde_json::to_value(cell.summary.as_ref().expect("best cell has summary"))
                .unwrap_or(Value::Null),
        ),
        None => (Value::Null, Value::Null),
    };

    let payload = json!({
        "best_params": best_params,
        "best_performance": best_performance,
        "all_results": all_results,
        "combinations": report.cells.len(),
        "failed_combinations": report.failed,
        "signals_processed": signals_count,
    });
    state
        .cache
        .set(&fingerprint, &payload, ResultClass::Optimization)
        .await;
    state
        .monitor
        .log_run_complete(execution_id, 0, payload["best_performance"].clone());

    Ok(attach_monitoring(
        payload,
        execution_id,
        false,
        false,
        started.elapsed().as_secs_f64(),
    ))
}

/// GET /health
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /cache/stats
async fn cache_stats(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let backend = state.cache.stats().await;
    let performance = state.monitor.cache_performance();
    Json(json!({
        "backend": backend,
        "performance": performance,
    }))
}

#[derive(Deserialize)]
struct ClearCacheQuery {
    #[serde(default = "default_pattern")]
    pattern: String,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// DELETE /cache?pattern=*
async fn clear_cache(
    Extension(state): Extension<AppState>,
    Query(params): Query<ClearCacheQuery>,
) -> impl IntoResponse {
    let deleted = state.cache.clear(&params.pattern).await;
    Json(json!({ "deleted": deleted, "pattern": params.pattern }))
}

/// GET /monitoring/health
async fn monitoring_health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    match state.monitor.system_health() {
        Some(sample) => Json(serde_json::to_value(&sample).unwrap_or(Value::Null)),
        None => Json(json!({})),
    }
}

/// GET /monitoring/cache
async fn monitoring_cache(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(serde_json::to_value(state.monitor.cache_performance()).unwrap_or(Value::Null))
}

/// GET /monitoring/active
async fn monitoring_active(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(serde_json::to_value(state.monitor.active_executions()).unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct AnalyticsQuery {
    days: Option<i64>,
}

/// GET /monitoring/analytics?days=N
async fn monitoring_analytics(
    Extension(state): Extension<AppState>,
    Query(params): Query<AnalyticsQuery>,
) -> impl IntoResponse {
    let days = params.days.unwrap_or(defaults::ANALYTICS_DAYS).max(1);
    Json(serde_json::to_value(state.monitor.aggregated(days)).unwrap_or(Value::Null))
}

/// GET /monitoring/stats
async fn monitoring_stats(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.monitor.stats())
}

/// GET /monitoring/export
async fn monitoring_export(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.monitor.export_json())
}

/// GET /monitoring/execution/{id}
async fn monitoring_execution(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.monitor.execution_summary(&id) {
        Some(record) => Json(serde_json::to_value(&record).unwrap_or(Value::Null)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("execution '{id}' not found") })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct UserActivityQuery {
    limit: Option<usize>,
}

/// GET /monitoring/user/{user_id}?limit=N
async fn monitoring_user(
    Extension(state): Extension<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<UserActivityQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(defaults::USER_ACTIVITY_LIMIT);
    let activity = state.monitor.user_activity(Some(&user_id), limit);
    Json(serde_json::to_value(activity).unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct CleanupQuery {
    #[serde(default)]
    confirm: bool,
    days: Option<i64>,
}

/// DELETE /monitoring/data?confirm=true&days=N
async fn delete_monitoring_data(
    Extension(state): Extension<AppState>,
    Query(params): Query<CleanupQuery>,
) -> Result<Json<Value>, ApiError> {
    if !params.confirm {
        return Err(ApiError::Validation(
            "pass confirm=true to delete monitoring data".to_string(),
        ));
    }
    let days = params.days.unwrap_or(defaults::CLEANUP_DAYS).max(1);
    let removed = state.monitor.cleanup(days);
    Ok(Json(json!({ "removed": removed, "days": days })))
}

// ── Wiring ────────────────────────────────────────────────────────────────────

async fn create_app() -> (Router, AppState) {
    let monitor = ExecutionMonitor::with_defaults();
    monitor.start_health_sampler();

    let redis_url = std::env::var("REDIS_URL").ok();
    let cache = ResultCache::new(redis_url.as_deref(), Arc::clone(&monitor)).await;

    let max_workers = std::env::var("MAX_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults::MAX_WORKERS);

    let state = AppState {
        cache,
        monitor,
        max_workers,
    };

    let cors = CorsLayer::new()
        .allow_origin("*".parse::<HeaderValue>().expect("static header value"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any);

    let app = Router::new()
        // POST /run - single simulation
        .route("/run", post(run_backtest))
        // POST /optimize - parameter-grid optimization
        .route("/optimize", post(run_optimization))
        // GET /health - liveness check
        .route("/health", get(health_check))
        // GET /cache/stats, DELETE /cache?pattern=*
        .route("/cache/stats", get(cache_stats))
        .route("/cache", delete(clear_cache))
        // Monitoring query surface
        .route("/monitoring/health", get(monitoring_health))
        .route("/monitoring/cache", get(monitoring_cache))
        .route("/monitoring/active", get(monitoring_active))
        .route("/monitoring/analytics", get(monitoring_analytics))
        .route("/monitoring/stats", get(monitoring_stats))
        .route("/monitoring/export", get(monitoring_export))
        .route("/monitoring/execution/{id}", get(monitoring_execution))
        .route("/monitoring/user/{user_id}", get(monitoring_user))
        .route("/monitoring/data", delete(delete_monitoring_data))
        .layer(Extension(state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    (app, state)
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("signal-backtest server initializing");
    let (app, state) = create_app().await;

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(defaults::SERVER_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("starting signal-backtest server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.monitor.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        // No REDIS_URL in the test environment: cache runs disabled
        let (app, _state) = create_app().await;
        app
    }

    fn run_body() -> Value {
        json!({
            "signals_data": [ { "ticker": "ACME", "date": "2023-01-02" } ],
            "ohlcv_data": [
                { "ticker": "ACME", "date": "2023-01-02", "open": 100.0, "high": 100.0, "low": 99.0, "close": 100.0, "volume": 1000.0 },
                { "ticker": "ACME", "date": "2023-01-03", "open": 110.0, "high": 112.0, "low": 100.0, "close": 110.0, "volume": 1000.0 },
                { "ticker": "ACME", "date": "2023-01-04", "open": 118.0, "high": 120.0, "low": 108.0, "close": 118.0, "volume": 1000.0 },
                { "ticker": "ACME", "date": "2023-01-05", "open": 119.0, "high": 121.0, "low": 117.0, "close": 119.0, "volume": 1000.0 }
            ],
            "initial_capital": 100000.0,
            "stop_loss": 5.0,
            "take_profit": 10.0,
            "holding_period": 3,
            "signal_type": "long",
            "position_sizing": "equal_weight"
        })
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_run_endpoint_happy_path() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::post("/run")
                    .header("content-type", "application/json")
                    .header("X-User-ID", "tester")
                    .header("X-Correlation-ID", "corr-42")
                    .body(Body::from(run_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["monitoring"]["execution_id"], "corr-42");
        assert_eq!(body["monitoring"]["from_cache"], json!(false));
        assert_eq!(body["signals_processed"], json!(1));
        assert_eq!(body["trades"].as_array().unwrap().len(), 1);

        let trade = &body["trades"][0];
        assert_eq!(trade["exit_reason"], "take_profit");
        assert_eq!(trade["shares"], json!(20));
        assert_eq!(trade["exit_date"], "2023-01-03");
        assert_eq!(
            body["summary"]["final_portfolio_value"].as_f64().unwrap(),
            100_200.0
        );
    }

    #[tokio::test]
    async fn test_run_rejects_bad_date() {
        let app = test_app().await;
        let mut body = run_body();
        body["signals_data"][0]["date"] = json!("01/02/2023");
        let response = app
            .oneshot(
                Request::post("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = response_json(response).await;
        assert!(body["detail"].as_str().unwrap().contains("invalid date"));
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_sizing() {
        let app = test_app().await;
        let mut body = run_body();
        body["position_sizing"] = json!("martingale");
        let response = app
            .oneshot(
                Request::post("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_run_rejects_non_finite_capital() {
        let app = test_app().await;
        let mut body = run_body();
        body["initial_capital"] = json!(-5.0);
        let response = app
            .oneshot(
                Request::post("/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_optimize_endpoint_parity_row() {
        let app = test_app().await;
        let mut body = run_body();
        body["param_ranges"] = json!({
            "holding_period": [3],
            "stop_loss": [5.0],
            "take_profit": [10.0]
        });
        let response = app
            .oneshot(
                Request::post("/optimize")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        let results = body["all_results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["total_trades"], json!(1));
        // 0.2% total return, identical to the standalone /run
        let ret = results[0]["total_return"].as_f64().unwrap();
        assert!((ret - 0.2).abs() < 1e-10);
        assert_eq!(body["best_params"]["holding_period"], json!(3));
    }

    #[tokio::test]
    async fn test_optimize_requires_ranges() {
        let app = test_app().await;
        let mut body = run_body();
        body["param_ranges"] = json!({ "holding_period": [], "stop_loss": [5.0] });
        let response = app
            .oneshot(
                Request::post("/optimize")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_monitoring_execution_lookup() {
        let app = test_app().await;
        let run = app
            .clone()
            .oneshot(
                Request::post("/run")
                    .header("content-type", "application/json")
                    .header("X-Correlation-ID", "lookup-1")
                    .body(Body::from(run_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/monitoring/execution/lookup-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["id"], "lookup-1");
        assert_eq!(body["signals_count"], json!(1));
        assert_eq!(body["trades_count"], json!(1));
    }

    #[tokio::test]
    async fn test_monitoring_execution_not_found() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::get("/monitoring/execution/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_monitoring_cleanup_requires_confirm() {
        let app = test_app().await;
        let response = app
            .clone()
            .oneshot(
                Request::delete("/monitoring/data?days=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app
            .oneshot(
                Request::delete("/monitoring/data?confirm=true&days=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_stats_degraded() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/cache/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["backend"]["enabled"], json!(false));
    }
}
