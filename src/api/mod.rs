pub mod cli;

use axum::{
    Router,
    extract::{
        Json, Query,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::core::{
    CombinedTax, FilingStatus, Plan, SimulationResult, SolveError, SpendingSolveConfig,
    SpendingSolveResult, TaxTables, generate_insights, rmd, simulate, social_security,
    solve_max_spending, taxes,
};

const DEFAULT_SEED: u64 = 42;
const MAX_PATHS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error("simulation task failed: {0}")]
    Task(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Solve(_) => StatusCode::BAD_REQUEST,
            ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::warn!("request failed: {self}");
        error_response(self.status(), &self.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("Invalid JSON payload: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(format!("Invalid query: {}", rejection.body_text()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulateRequest {
    #[serde(deserialize_with = "Plan::deserialize_relaxed")]
    pub plan: Plan,
    pub n_paths: Option<u32>,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    #[serde(flatten)]
    pub result: SimulationResult,
    pub insight: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SolveRequest {
    #[serde(deserialize_with = "Plan::deserialize_relaxed")]
    pub plan: Plan,
    pub target_success: Option<f64>,
    pub search_min: Option<f64>,
    pub search_max: Option<f64>,
    pub tolerance: Option<f64>,
    pub max_iterations: Option<u32>,
    pub n_paths: Option<u32>,
    pub final_paths: Option<u32>,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SocialSecurityQuery {
    pia: Option<f64>,
    start_age: Option<u32>,
    fra: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SocialSecurityResponse {
    annual_benefit: f64,
    monthly_benefit: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RmdQuery {
    balance: Option<f64>,
    age: Option<u32>,
    birth_year: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RmdResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    start_age: Option<u32>,
    distribution_period: Option<f64>,
    amount: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TaxQuery {
    income: Option<f64>,
    gains: Option<f64>,
    filing_status: Option<FilingStatus>,
    state: Option<String>,
    year: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaxResponse {
    year: u32,
    filing_status: FilingStatus,
    #[serde(flatten)]
    tax: CombinedTax,
}

pub fn router() -> Router {
    Router::new()
        .route("/api/simulate", post(simulate_handler))
        .route("/api/solve-spending", post(solve_handler))
        .route("/api/social-security", get(social_security_handler))
        .route("/api/rmd", get(rmd_handler))
        .route("/api/tax", get(tax_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    log::info!("nestegg HTTP API listening on http://{addr}");
    log::info!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, router()).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(payload: Result<Json<SimulateRequest>, JsonRejection>) -> Response {
    respond(run_simulate(payload).await)
}

async fn solve_handler(payload: Result<Json<SolveRequest>, JsonRejection>) -> Response {
    respond(run_solve(payload).await)
}

async fn run_simulate(
    payload: Result<Json<SimulateRequest>, JsonRejection>,
) -> Result<SimulateResponse, ApiError> {
    let Json(request) = payload?;
    let (plan, n_paths, seed) = simulate_args(request)?;
    log::info!("simulate: {n_paths} paths, seed {seed}");
    tokio::task::spawn_blocking(move || build_simulate_response(&plan, n_paths, seed))
        .await
        .map_err(|e| ApiError::Task(e.to_string()))
}

async fn run_solve(
    payload: Result<Json<SolveRequest>, JsonRejection>,
) -> Result<SpendingSolveResult, ApiError> {
    let Json(request) = payload?;
    let config = solve_config(&request)?;
    let plan = request.plan;
    log::info!(
        "solve-spending: target {:.3}, {} paths per probe",
        config.target_success,
        config.paths_per_iteration
    );
    let result = tokio::task::spawn_blocking(move || solve_max_spending(&plan, config))
        .await
        .map_err(|e| ApiError::Task(e.to_string()))??;
    Ok(result)
}

async fn social_security_handler(
    query: Result<Query<SocialSecurityQuery>, QueryRejection>,
) -> Response {
    respond(query.map_err(ApiError::from).and_then(|Query(q)| social_security_lookup(q)))
}

async fn rmd_handler(query: Result<Query<RmdQuery>, QueryRejection>) -> Response {
    respond(query.map_err(ApiError::from).and_then(|Query(q)| rmd_lookup(q)))
}

async fn tax_handler(query: Result<Query<TaxQuery>, QueryRejection>) -> Response {
    respond(query.map_err(ApiError::from).and_then(|Query(q)| tax_lookup(q)))
}

fn respond<T: Serialize>(outcome: Result<T, ApiError>) -> Response {
    match outcome {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => err.into_response(),
    }
}

fn simulate_args(request: SimulateRequest) -> Result<(Plan, u32, u64), ApiError> {
    let n_paths = request.n_paths.unwrap_or(request.plan.simulations);
    if n_paths > MAX_PATHS {
        return Err(ApiError::BadRequest(format!(
            "nPaths must be at most {MAX_PATHS}"
        )));
    }
    Ok((request.plan, n_paths, request.seed.unwrap_or(DEFAULT_SEED)))
}

pub fn build_simulate_response(plan: &Plan, n_paths: u32, seed: u64) -> SimulateResponse {
    let result = simulate(plan, n_paths, seed);
    let insight = generate_insights(&result, None);
    SimulateResponse { result, insight }
}

fn solve_config(request: &SolveRequest) -> Result<SpendingSolveConfig, ApiError> {
    let target_success = request
        .target_success
        .ok_or_else(|| ApiError::BadRequest("targetSuccess is required".to_string()))?;
    let defaults = SpendingSolveConfig::default();
    let paths_per_iteration = request.n_paths.unwrap_or(defaults.paths_per_iteration);
    let final_paths = request.final_paths.unwrap_or(defaults.final_paths);
    if paths_per_iteration > MAX_PATHS || final_paths > MAX_PATHS {
        return Err(ApiError::BadRequest(format!(
            "path counts must be at most {MAX_PATHS}"
        )));
    }
    Ok(SpendingSolveConfig {
        target_success,
        search_min: request.search_min.unwrap_or(defaults.search_min),
        search_max: request.search_max.unwrap_or(defaults.search_max),
        tolerance: request.tolerance.unwrap_or(defaults.tolerance),
        max_iterations: request.max_iterations.unwrap_or(defaults.max_iterations),
        paths_per_iteration,
        final_paths,
        seed: request.seed.unwrap_or(defaults.seed),
    })
}

fn social_security_lookup(query: SocialSecurityQuery) -> Result<SocialSecurityResponse, ApiError> {
    log::info!("social-security: {query:?}");
    let pia = query
        .pia
        .ok_or_else(|| ApiError::BadRequest("pia is required".to_string()))?;
    let start_age = query
        .start_age
        .ok_or_else(|| ApiError::BadRequest("startAge is required".to_string()))?;
    let fra = query
        .fra
        .unwrap_or(social_security::DEFAULT_FULL_RETIREMENT_AGE);
    Ok(SocialSecurityResponse {
        annual_benefit: social_security::social_security_benefit(pia, start_age, fra),
        monthly_benefit: social_security::adjusted_monthly_benefit(pia, start_age, fra),
    })
}

fn rmd_lookup(query: RmdQuery) -> Result<RmdResponse, ApiError> {
    log::info!("rmd: {query:?}");
    let balance = query
        .balance
        .ok_or_else(|| ApiError::BadRequest("balance is required".to_string()))?;
    let age = query
        .age
        .ok_or_else(|| ApiError::BadRequest("age is required".to_string()))?;
    let start_age = query.birth_year.map(rmd::rmd_start_age);
    let amount = match start_age {
        Some(start) if age < start => 0.0,
        _ => rmd::compute_rmd(balance, age),
    };
    Ok(RmdResponse {
        start_age,
        distribution_period: rmd::distribution_period(age),
        amount,
    })
}

fn tax_lookup(query: TaxQuery) -> Result<TaxResponse, ApiError> {
    log::info!("tax: {query:?}");
    let income = query
        .income
        .ok_or_else(|| ApiError::BadRequest("income is required".to_string()))?;
    let filing_status = query.filing_status.unwrap_or_default();
    let year = query.year.unwrap_or(taxes::DEFAULT_TAX_YEAR);
    let state = query
        .state
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let tax = TaxTables::embedded().combined_tax(
        income,
        query.gains.unwrap_or(0.0),
        filing_status,
        state,
        year,
    );
    Ok(TaxResponse {
        year,
        filing_status,
        tax,
    })
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
