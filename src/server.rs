use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::account_pool::AccountUpdate;
use crate::driver::SessionDriver;
use crate::error::{AdminError, PoolError, ScrapeError};
use crate::excel_writer::{report_filename, ExcelExporter};
use crate::models::{
    normalize_username, AccountView, Proxy, ProxyId, ProxyProtocol, ProxyView, ReelCollection,
    ReelLimit, Secret,
};
use crate::orchestrator::ScrapeOrchestrator;
use crate::proxy_pool::ProxyUpdate;

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub struct AppState<D> {
    pub orchestrator: ScrapeOrchestrator<D>,
    pub max_reels_limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    target_username: String,
    #[serde(default)]
    max_reels: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccount {
    login: String,
    secret: Secret,
}

#[derive(Debug, Deserialize)]
pub struct ValidityUpdate {
    valid: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateProxy {
    host: String,
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<Secret>,
    #[serde(default)]
    protocol: ProxyProtocol,
}

pub fn router<D>(state: Arc<AppState<D>>) -> Router
where
    D: SessionDriver + 'static,
{
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/instagram/parse", post(parse_reels::<D>))
        .route("/instagram/parse/xlsx", post(parse_reels_xlsx::<D>))
        .route("/accounts", get(list_accounts::<D>).post(create_account::<D>))
        .route(
            "/accounts/{login}",
            get(get_account::<D>)
                .patch(update_account::<D>)
                .delete(delete_account::<D>),
        )
        .route("/accounts/{login}/validity", patch(set_account_validity::<D>))
        .route("/accounts/{login}/test", post(test_account::<D>))
        .route("/proxies", get(list_proxies::<D>).post(create_proxy::<D>))
        .route(
            "/proxies/{id}",
            get(get_proxy::<D>)
                .patch(update_proxy::<D>)
                .delete(delete_proxy::<D>),
        )
        .route("/proxies/{id}/block", post(block_proxy::<D>))
        .route("/proxies/{id}/unblock", post(unblock_proxy::<D>))
        .with_state(state)
}

fn error_body(status: u16, kind: &str, detail: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"kind": kind, "detail": detail.into()}))).into_response()
}

fn bad_request(detail: impl Into<String>) -> Response {
    error_body(400, "invalid_request", detail)
}

fn scrape_error(err: ScrapeError) -> Response {
    error_body(err.status_code(), err.kind(), err.message())
}

fn pool_error(err: PoolError) -> Response {
    error_body(err.status_code(), err.kind(), err.to_string())
}

fn admin_error(err: AdminError) -> Response {
    error_body(err.status_code(), err.kind(), err.detail())
}

fn parse_proxy_id(raw: &str) -> Result<ProxyId, Response> {
    raw.parse::<ProxyId>().map_err(bad_request)
}

/// Validates the request and runs the job.
async fn collect<D: SessionDriver>(
    state: &AppState<D>,
    body: ParseRequest,
) -> Result<ReelCollection, Response> {
    let Some(target) = normalize_username(&body.target_username) else {
        return Err(bad_request("target_username is not an Instagram profile"));
    };
    if let Some(max) = body.max_reels {
        if max > state.max_reels_limit {
            return Err(bad_request(format!(
                "max_reels must be at most {}",
                state.max_reels_limit
            )));
        }
    }

    state
        .orchestrator
        .run(&target, ReelLimit::from_request(body.max_reels))
        .await
        .map_err(scrape_error)
}

async fn parse_reels<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Json(body): Json<ParseRequest>,
) -> Response {
    match collect(&state, body).await {
        Ok(collection) => Json(collection.reels).into_response(),
        Err(response) => response,
    }
}

async fn parse_reels_xlsx<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Json(body): Json<ParseRequest>,
) -> Response {
    let collection = match collect(&state, body).await {
        Ok(collection) => collection,
        Err(response) => return response,
    };

    let bytes = match build_report(&collection) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(username = %collection.target_username, "Failed to build report: {:#}", e);
            return error_body(500, "report_error", "Failed to build the spreadsheet.");
        }
    };

    let filename = report_filename(&collection.target_username);
    info!(file = %filename, reels = collection.reels.len(), "Serving report");
    (
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response()
}

fn build_report(collection: &ReelCollection) -> anyhow::Result<Vec<u8>> {
    let mut exporter = ExcelExporter::new();
    exporter.write_reels(&collection.reels)?;
    exporter.to_bytes()
}

async fn list_accounts<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
) -> Json<Vec<AccountView>> {
    let accounts = state.orchestrator.accounts().list();
    Json(accounts.iter().map(AccountView::from).collect())
}

async fn get_account<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(login): Path<String>,
) -> Response {
    match state.orchestrator.accounts().get(&login) {
        Some(account) => Json(AccountView::from(&account)).into_response(),
        None => pool_error(PoolError::AccountNotFound(login)),
    }
}

async fn create_account<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Json(body): Json<CreateAccount>,
) -> Response {
    if body.login.trim().is_empty() {
        return bad_request("login is empty");
    }
    match state.orchestrator.onboard(body.login.trim(), body.secret).await {
        Ok(account) => (StatusCode::CREATED, Json(AccountView::from(&account))).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn update_account<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(login): Path<String>,
    Json(body): Json<AccountUpdate>,
) -> Response {
    match state.orchestrator.accounts().update(&login, body) {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn set_account_validity<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(login): Path<String>,
    Json(body): Json<ValidityUpdate>,
) -> Response {
    match state.orchestrator.accounts().set_valid(&login, body.valid) {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn test_account<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(login): Path<String>,
) -> Response {
    match state.orchestrator.test_account(&login).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn delete_account<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(login): Path<String>,
) -> Response {
    match state.orchestrator.accounts().delete(&login) {
        Ok(_) => Json(json!({"status": "success"})).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn list_proxies<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
) -> Json<Vec<ProxyView>> {
    let proxies = state.orchestrator.proxies().list();
    Json(proxies.iter().map(ProxyView::from).collect())
}

async fn get_proxy<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_proxy_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.proxies().get(&id) {
        Some(proxy) => Json(ProxyView::from(&proxy)).into_response(),
        None => pool_error(PoolError::ProxyNotFound(id)),
    }
}

async fn create_proxy<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Json(body): Json<CreateProxy>,
) -> Response {
    if body.host.trim().is_empty() {
        return bad_request("host is empty");
    }
    let mut proxy = Proxy::new(body.host.trim(), body.port);
    proxy.username = body.username;
    proxy.password = body.password;
    proxy.protocol = body.protocol;

    match state.orchestrator.proxies().insert(proxy) {
        Ok(proxy) => (StatusCode::CREATED, Json(ProxyView::from(&proxy))).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn update_proxy<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
    Json(body): Json<ProxyUpdate>,
) -> Response {
    let id = match parse_proxy_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.proxies().update(&id, body) {
        Ok(proxy) => Json(ProxyView::from(&proxy)).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn delete_proxy<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_proxy_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.proxies().delete(&id) {
        Ok(_) => Json(json!({"status": "success"})).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn block_proxy<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_proxy_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.proxies().block(&id) {
        Ok(proxy) => Json(ProxyView::from(&proxy)).into_response(),
        Err(e) => pool_error(e),
    }
}

async fn unblock_proxy<D: SessionDriver + 'static>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_proxy_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.proxies().unblock(&id) {
        Ok(proxy) => Json(ProxyView::from(&proxy)).into_response(),
        Err(e) => pool_error(e),
    }
}
