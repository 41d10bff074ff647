use crate::AppState;
use crate::error::AppError;
use crate::model::{ImportAction, ImportRequest, Magnet};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const SESSION_COOKIE: &str = "decypharr_session";

/// §6 "Internal HTTP API". Every route but `/api/auth/login` requires a
/// session cookie or `Authorization: Bearer <apiToken>` (§10.4); the session
/// cookie's value is the same `apiToken` minted at login, so both paths
/// check against the one `AuthStore` (a simplification of §10.4's
/// separately-signed cookie, noted in DESIGN.md).
async fn require_auth(State(state): State<Arc<AppState>>, jar: CookieJar, request: Request, next: Next) -> Response {
    let from_cookie = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    let from_header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let token = from_cookie.or(from_header);
    let authorized = match token {
        Some(token) => state.auth.verify_token(&token).await,
        None => false,
    };

    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error_message": "unauthorized"}))).into_response();
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<Arc<AppState>>, jar: CookieJar, Json(req): Json<LoginRequest>) -> Result<Response, AppError> {
    if !state.auth.verify_password(&req.username, &req.password).await {
        return Ok((StatusCode::UNAUTHORIZED, Json(json!({"error_message": "invalid credentials"}))).into_response());
    }

    let token = state.auth.current_token().await;
    let cookie = Cookie::build((SESSION_COOKIE, token.clone())).path("/").http_only(true).build();
    let jar = jar.add(cookie);
    Ok((jar, Json(json!({ "token": token }))).into_response())
}

async fn arrs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let arrs: Vec<serde_json::Value> = state
        .arrs
        .values()
        .map(|a| json!({ "name": a.name, "host": a.host, "kind": format!("{:?}", a.kind).to_lowercase(), "cleanup": a.cleanup }))
        .collect();
    Json(arrs)
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    magnet: String,
    category: Option<String>,
    debrid: Option<String>,
    arr: Option<String>,
    action: Option<ImportAction>,
    download_uncached: Option<bool>,
    callback_url: Option<String>,
}

async fn add(State(state): State<Arc<AppState>>, Json(req): Json<AddRequest>) -> Result<Response, AppError> {
    let Some(parsed) = crate::helpers::parse_magnet_uri::parse_magnet_uri(&req.magnet) else {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({"error_message": "invalid magnet URI"}))).into_response());
    };

    let import = ImportRequest {
        download_folder: crate::config::get_config().download_folder.to_string_lossy().into_owned(),
        debrid: req.debrid,
        magnet: Magnet {
            info_hash: parsed.hash,
            name: parsed.name,
            size: 0,
            link: req.magnet,
            torrent_bytes: None,
        },
        arr: req.arr,
        action: req.action.unwrap_or(ImportAction::Symlink),
        download_uncached_override: req.download_uncached,
        callback_url: req.callback_url,
        category: req.category,
    };

    let ingest = state.ingest.clone();
    tokio::spawn(async move { ingest.add_torrent(import).await });
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Debug, Deserialize)]
struct StartRepairRequest {
    arrs: Vec<String>,
    media_ids: Option<Vec<u64>>,
    #[serde(default)]
    auto_process: bool,
    #[serde(default)]
    recurrent: bool,
}

async fn start_repair(State(state): State<Arc<AppState>>, Json(req): Json<StartRepairRequest>) -> Result<Response, AppError> {
    let id = state.repair.start_job(req.arrs, req.media_ids, req.auto_process, req.recurrent).await;
    Ok(Json(json!({ "id": id })).into_response())
}

async fn repair_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.repair.jobs().await)
}

async fn process_repair_job(State(state): State<Arc<AppState>>, Path(id): Path<uuid::Uuid>) -> Result<Response, AppError> {
    let ok = state.repair.process_job(id).await;
    Ok(if ok { StatusCode::OK.into_response() } else { StatusCode::NOT_FOUND.into_response() })
}

async fn stop_repair_job(State(state): State<Arc<AppState>>, Path(id): Path<uuid::Uuid>) -> Result<Response, AppError> {
    let ok = state.repair.stop_job(id).await;
    Ok(if ok { StatusCode::OK.into_response() } else { StatusCode::NOT_FOUND.into_response() })
}

async fn torrents(State(state): State<Arc<AppState>>, Query(_params): Query<HashMap<String, String>>) -> impl IntoResponse {
    Json(state.store.all().await)
}

async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = &state;
    Json(crate::config::get_config())
}

async fn refresh_token(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let token = state.auth.refresh_token().await?;
    Ok(Json(json!({ "token": token })).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateAuthRequest {
    username: String,
    password: Option<String>,
}

async fn update_auth(State(state): State<Arc<AppState>>, Json(req): Json<UpdateAuthRequest>) -> Result<Response, AppError> {
    state.auth.update(req.username, req.password).await?;
    Ok(StatusCode::OK.into_response())
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/arrs", get(arrs))
        .route("/api/add", post(add))
        .route("/api/repair", post(start_repair))
        .route("/api/repair/jobs", get(repair_jobs))
        .route("/api/repair/jobs/{id}/process", post(process_repair_job))
        .route("/api/repair/jobs/{id}/stop", post(stop_repair_job))
        .route("/api/torrents", get(torrents))
        .route("/api/config", get(config))
        .route("/api/refresh-token", post(refresh_token))
        .route("/api/update-auth", post(update_auth))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new().route("/api/auth/login", post(login)).merge(protected).with_state(state)
}
