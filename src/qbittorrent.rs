use crate::AppState;
use crate::config::get_config;
use crate::error::AppError;
use crate::helpers::add_trackers_to_magnet_uri::add_trackers_to_magnet_uri;
use crate::helpers::parse_magnet_uri::{magnet_from_torrent_bytes, parse_magnet_uri, strip_trackers};
use crate::model::{ImportAction, ImportRequest, Magnet, Torrent, TorrentState};
use crate::torrent_store::SortField;
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// §6 "qBittorrent v2 API (inbound)". Sonarr/Radarr/etc. never see a real
/// qBittorrent — every route here answers out of F (`TorrentStore`) and D
/// (`IngestOrchestrator`) instead of a database.
pub async fn auth_login() -> impl IntoResponse {
    "Ok."
}

async fn app_version() -> &'static str {
    "v4.3.2"
}

async fn app_webapi_version() -> &'static str {
    "2.7"
}

async fn app_buildinfo() -> impl IntoResponse {
    Json(json!({
        "bitness": 64,
        "boost": "1.75.0",
        "libtorrent": "1.2.11.0",
        "openssl": "1.1.1i",
        "qt": "5.15.2",
        "zlib": "1.2.11"
    }))
}

async fn app_shutdown() -> impl IntoResponse {
    StatusCode::OK
}

async fn app_preferences() -> impl IntoResponse {
    let config = get_config();
    Json(json!({
        "save_path": config.download_folder.to_string_lossy(),
        "max_active_downloads": config.max_downloads,
        "max_active_torrents": config.max_downloads * 2,
        "max_active_uploads": config.max_downloads,
        "dht": true,
    }))
}

async fn app_set_preferences() -> impl IntoResponse {
    StatusCode::OK
}

async fn app_default_save_path() -> impl IntoResponse {
    get_config().download_folder.to_string_lossy().into_owned()
}

#[derive(Debug, Deserialize)]
struct QBTorrentsInfoRequest {
    pub category: Option<String>,
    pub hashes: Option<String>,
    pub filter: Option<String>,
    pub sort: Option<String>,
    #[serde(default)]
    pub reverse: bool,
}

fn parse_sort_field(sort: &str) -> Option<SortField> {
    match sort {
        "name" => Some(SortField::Name),
        "size" => Some(SortField::Size),
        "added_on" => Some(SortField::AddedOn),
        "completion_on" => Some(SortField::CompletedOn),
        "progress" => Some(SortField::Progress),
        "state" => Some(SortField::State),
        "category" => Some(SortField::Category),
        "dlspeed" => Some(SortField::DlSpeed),
        "upspeed" => Some(SortField::UpSpeed),
        "ratio" => Some(SortField::Ratio),
        _ => None,
    }
}

fn parse_state_filter(filter: &str) -> Option<TorrentState> {
    match filter {
        "downloading" => Some(TorrentState::Downloading),
        "completed" | "pausedUP" | "stalledUP" | "uploading" => Some(TorrentState::PausedUP),
        "error" => Some(TorrentState::Error),
        "queuedDL" | "queued" => Some(TorrentState::Queued),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct QBittorrentTorrent {
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub progress: f32,
    #[serde(rename = "dlspeed")]
    pub dl_speed: u64,
    #[serde(rename = "upspeed")]
    pub up_speed: u64,
    #[serde(rename = "eta")]
    pub eta_secs: u64,
    pub state: &'static str,
    pub category: String,
    pub save_path: String,
    pub content_path: String,
    pub ratio: f32,
    pub num_seeds: u32,
    pub added_on: i64,
    pub completion_on: i64,
}

fn to_qbittorrent(t: &Torrent) -> QBittorrentTorrent {
    let save_path = get_config().download_folder.join(t.category.as_deref().unwrap_or_default()).to_string_lossy().into_owned();
    QBittorrentTorrent {
        hash: t.info_hash.clone(),
        name: t.name.clone(),
        size: t.size,
        progress: t.progress,
        dl_speed: t.download_speed,
        up_speed: t.upload_speed,
        eta_secs: t.eta_secs,
        state: t.state.as_qbittorrent_str(),
        category: t.category.clone().unwrap_or_default(),
        content_path: t.torrent_path.clone().unwrap_or_else(|| save_path.clone()),
        save_path,
        ratio: t.ratio as f32,
        num_seeds: t.num_seeds,
        added_on: t.added_on.timestamp(),
        completion_on: t.completed_on.map(|c| c.timestamp()).unwrap_or(-1),
    }
}

async fn torrents_info(State(state): State<Arc<AppState>>, Query(query): Query<QBTorrentsInfoRequest>) -> impl IntoResponse {
    let mut torrents = match query.sort.as_deref().and_then(parse_sort_field) {
        Some(field) => state.store.sorted(field, query.reverse).await,
        None => state.store.all().await,
    };

    if let Some(category) = &query.category {
        torrents.retain(|t| t.category.as_deref() == Some(category.as_str()));
    }
    if let Some(hashes) = &query.hashes {
        let wanted: Vec<String> = hashes.split('|').map(|s| s.to_lowercase()).collect();
        torrents.retain(|t| wanted.contains(&t.info_hash));
    }
    if let Some(filter) = query.filter.as_deref().and_then(parse_state_filter) {
        torrents.retain(|t| t.state == filter);
    }

    Json(torrents.iter().map(to_qbittorrent).collect::<Vec<_>>())
}

#[derive(Debug, Deserialize)]
struct QBTorrentsHashRequest {
    pub hash: String,
}

async fn torrents_files(State(state): State<Arc<AppState>>, Query(query): Query<QBTorrentsHashRequest>) -> Result<Response, AppError> {
    let Some(torrent) = state.store.get(&query.hash, None).await else {
        return Ok((StatusCode::NOT_FOUND, Json(json!({"error": "Torrent contains no files"}))).into_response());
    };

    let files = state
        .caches
        .get(&torrent.debrid)
        .and_then(|cache| cache.get_torrent(&torrent.info_hash))
        .map(|cached| {
            cached
                .torrent
                .files
                .values()
                .map(|f| {
                    json!({
                        "name": f.path,
                        "size": f.size,
                        "progress": torrent.progress,
                        "priority": 1,
                        "piece_range": [0, 0],
                        "availability": 1.0,
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(Json(files).into_response())
}

async fn torrent_properties(State(state): State<Arc<AppState>>, Query(query): Query<QBTorrentsHashRequest>) -> Result<Response, AppError> {
    let Some(torrent) = state.store.get(&query.hash, None).await else {
        return Ok((StatusCode::NOT_FOUND, Json(json!({"error": "Torrent not found"}))).into_response());
    };

    let qb = to_qbittorrent(&torrent);
    Ok(Json(json!({
        "hash": qb.hash,
        "save_path": qb.save_path,
        "content_path": qb.content_path,
        "seeding_time": 0,
        "total_size": qb.size,
        "pieces_have": if torrent.is_ready() { 1 } else { 0 },
        "pieces_num": 1,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct QBTorrentsDeleteRequest {
    pub hashes: String,
    #[serde(default, rename = "deleteFiles")]
    pub delete_files: bool,
}

async fn torrents_delete(State(state): State<Arc<AppState>>, Form(request): Form<QBTorrentsDeleteRequest>) -> Result<Response, AppError> {
    let hashes: Vec<String> = request.hashes.split('|').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    if hashes.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "No hashes provided"}))).into_response());
    }

    for hash in &hashes {
        let Some(torrent) = state.store.get(hash, None).await else { continue };

        if let (Some(client), Some(debrid_id)) = (state.registry.get(&torrent.debrid), &torrent.debrid_id) {
            if let Err(e) = client.delete_torrent(debrid_id).await {
                warn!(hash = %hash, error = %e, "failed to delete remote torrent");
            }
        }
        if let Some(cache) = state.caches.get(&torrent.debrid) {
            cache.remove_torrent(&torrent.info_hash);
        }
        if request.delete_files {
            if let Some(path) = &torrent.torrent_path {
                let _ = tokio::fs::remove_dir_all(path).await;
            }
        }
        state.store.remove(hash, torrent.category.as_deref()).await;
    }

    Ok(StatusCode::OK.into_response())
}

/// Maps a category onto the arr of the same configured name, per the
/// convention that a Sonarr/Radarr download-client category matches its arr
/// config name (§4.D step 3's "arr setting" needs an arr to look one up).
fn arr_for_category<'a>(state: &'a AppState, category: &Option<String>) -> Option<String> {
    let category = category.as_ref()?;
    state.arrs.contains_key(category).then(|| category.clone())
}

async fn add_torrent(state: Arc<AppState>, magnet_uris: Vec<String>, category: Option<String>, download: bool, rm_tracker_urls: bool) -> Result<Response, AppError> {
    if magnet_uris.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "No magnet URIs provided"}))).into_response());
    }

    for magnet_uri in magnet_uris {
        let magnet_uri = if rm_tracker_urls { strip_trackers(&magnet_uri) } else { add_trackers_to_magnet_uri(&magnet_uri) };
        let Some(parsed) = parse_magnet_uri(&magnet_uri) else {
            return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid magnet URI"}))).into_response());
        };

        if state.store.get(&parsed.hash, category.as_deref()).await.is_some() {
            continue;
        }

        let req = ImportRequest {
            download_folder: get_config().download_folder.to_string_lossy().into_owned(),
            debrid: None,
            magnet: Magnet {
                info_hash: parsed.hash,
                name: parsed.name,
                size: 0,
                link: magnet_uri,
                torrent_bytes: None,
            },
            arr: arr_for_category(&state, &category),
            action: if download { ImportAction::Download } else { ImportAction::Symlink },
            download_uncached_override: None,
            callback_url: None,
            category: category.clone(),
        };

        let ingest = state.ingest.clone();
        tokio::spawn(async move { ingest.add_torrent(req).await });
    }

    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
pub struct QBTorrentsAddRequest {
    pub urls: Option<String>,
    pub category: Option<String>,
    #[serde(default, rename = "sequentialDownload")]
    pub sequential_download: bool,
    #[serde(default, rename = "rmTrackerUrls")]
    pub rm_tracker_urls: bool,
}

async fn torrents_add_get(State(state): State<Arc<AppState>>, Query(query): Query<QBTorrentsAddRequest>) -> Result<Response, AppError> {
    let urls = query.urls.as_deref().unwrap_or("");
    let magnet_uris: Vec<String> = urls.split('\n').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    add_torrent(state, magnet_uris, query.category, query.sequential_download, query.rm_tracker_urls).await
}

async fn torrents_add_post(state: State<Arc<AppState>>, parts: Parts, req: Request) -> Result<Response, AppError> {
    let content_type = parts.headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("");

    match content_type.split(';').next().unwrap_or("") {
        "application/x-www-form-urlencoded" => {
            let Form(data) = Form::<QBTorrentsAddRequest>::from_request(req, &state).await.map_err(|e| AppError::bad_request(e.to_string()))?;

            let mut magnet_uris = Vec::new();
            if let Some(urls) = data.urls {
                for url in urls.split('\n') {
                    if !url.trim().is_empty() {
                        magnet_uris.push(url.trim().to_string());
                    }
                }
            }

            add_torrent(state.0, magnet_uris, data.category, data.sequential_download, data.rm_tracker_urls).await
        }
        "multipart/form-data" => {
            let mut magnet_uris = Vec::new();
            let mut category = None;
            let mut sequential_download = false;
            let mut rm_tracker_urls = false;
            let mut multipart = Multipart::from_request(req, &state).await.map_err(|e| AppError::bad_request(e.to_string()))?;

            while let Some(field) = multipart.next_field().await.map_err(|e| AppError::bad_request(e.to_string()))? {
                match field.name().unwrap_or("") {
                    "category" => category = field.text().await.ok(),
                    "sequentialDownload" => sequential_download = field.text().await.map(|t| t == "true").unwrap_or(false),
                    "rmTrackerUrls" => rm_tracker_urls = field.text().await.map(|t| t == "true").unwrap_or(false),
                    "torrents" => {
                        let bytes = field.bytes().await.map_err(|e| AppError::bad_request(e.to_string()))?;
                        if let Ok((_, magnet_uri)) = magnet_from_torrent_bytes(&bytes) {
                            magnet_uris.push(magnet_uri);
                        }
                    }
                    "urls" => {
                        if let Ok(text) = field.text().await {
                            for url in text.split('\n') {
                                if !url.trim().is_empty() {
                                    magnet_uris.push(url.trim().to_string());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            add_torrent(state.0, magnet_uris, category, sequential_download, rm_tracker_urls).await
        }
        _ => Ok((StatusCode::UNSUPPORTED_MEDIA_TYPE, Json(json!({"error": "Unsupported content type"}))).into_response()),
    }
}

/// `pause`/`resume`/`recheck` have no debrid-backed counterpart; they answer
/// 200 and leave state untouched, matching real qBittorrent's tolerance of
/// clients that poll these without checking the body (§11 "thin
/// state-preserving stubs").
async fn torrents_noop() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct QBTorrentsSetCategoryRequest {
    pub hashes: String,
    pub category: String,
}

async fn torrents_set_category(State(state): State<Arc<AppState>>, Form(form): Form<QBTorrentsSetCategoryRequest>) -> Result<Response, AppError> {
    let hashes: Vec<String> = form.hashes.split('|').map(|s| s.trim().to_string()).collect();
    let mut updated = 0;

    for hash in hashes {
        let Some(mut torrent) = state.store.get(&hash, None).await else { continue };
        let old_category = torrent.category.clone();
        state.store.remove(&hash, old_category.as_deref()).await;
        torrent.category = Some(form.category.clone());
        state.store.upsert(torrent).await;
        updated += 1;
    }

    if updated == 0 {
        return Ok((StatusCode::NOT_FOUND, Json(json!({"error": "No torrents found with the provided hashes"}))).into_response());
    }
    Ok(StatusCode::OK.into_response())
}

async fn torrents_categories() -> impl IntoResponse {
    let config = get_config();
    let save_path = config.download_folder.to_string_lossy().into_owned();

    let mut category_map = HashMap::new();
    for category in &config.categories {
        category_map.insert(category.clone(), json!({ "name": category, "savePath": save_path }));
    }
    Json(category_map)
}

#[derive(Debug, Deserialize)]
struct QBTorrentsCreateCategoryRequest {
    pub category: String,
}

async fn torrents_create_category(Form(request): Form<QBTorrentsCreateCategoryRequest>) -> impl IntoResponse {
    warn!("attempted to create torrent category `{}`; categories are configured in config.json", request.category);
    (StatusCode::FORBIDDEN, "Torrent categories are hard coded.")
}

#[derive(Debug, Deserialize)]
struct QBTorrentsRemoveCategoryRequest {
    pub categories: String,
}

async fn torrents_remove_category(Form(request): Form<QBTorrentsRemoveCategoryRequest>) -> impl IntoResponse {
    warn!("attempted to remove torrent categories `{}`; categories are configured in config.json", request.categories);
    (StatusCode::FORBIDDEN, "Torrent categories are hard coded.")
}

/// Tags have no backing model; arrs that add/remove/list tags get a
/// tolerant no-op/empty-list response rather than a 404 (§11).
async fn torrents_tags() -> impl IntoResponse {
    Json(Vec::<String>::new())
}

async fn fallback(uri: Uri, method: Method) -> impl IntoResponse {
    warn!("missing implementation for route `{} {}`", method, uri);
    (StatusCode::NOT_FOUND, Json(json!({"error": "Route not implemented"}))).into_response()
}

pub fn mimic_qbittorrent() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v2/auth/login", get(auth_login).post(auth_login))
        .route("/api/v2/app/buildinfo", get(app_buildinfo))
        .route("/api/v2/app/shutdown", get(app_shutdown))
        .route("/api/v2/app/preferences", get(app_preferences).post(app_set_preferences))
        .route("/api/v2/app/defaultSavePath", get(app_default_save_path))
        .route("/api/v2/app/webapiVersion", get(app_webapi_version))
        .route("/api/v2/app/version", get(app_version))
        .route("/api/v2/torrents/info", get(torrents_info))
        .route("/api/v2/torrents/files", get(torrents_files))
        .route("/api/v2/torrents/properties", get(torrent_properties))
        .route("/api/v2/torrents/delete", get(torrents_delete).post(torrents_delete).delete(torrents_delete))
        .route("/api/v2/torrents/add", get(torrents_add_get).post(torrents_add_post))
        .route("/api/v2/torrents/pause", get(torrents_noop).post(torrents_noop))
        .route("/api/v2/torrents/resume", get(torrents_noop).post(torrents_noop))
        .route("/api/v2/torrents/recheck", get(torrents_noop).post(torrents_noop))
        .route("/api/v2/torrents/setCategory", get(torrents_set_category).post(torrents_set_category))
        .route("/api/v2/torrents/categories", get(torrents_categories))
        .route("/api/v2/torrents/createCategory", post(torrents_create_category))
        .route("/api/v2/torrents/removeCategory", post(torrents_remove_category))
        .route("/api/v2/torrents/addTags", post(torrents_noop))
        .route("/api/v2/torrents/removeTags", post(torrents_noop))
        .route("/api/v2/torrents/createTags", post(torrents_noop))
        .route("/api/v2/torrents/tags", get(torrents_tags))
        .route("/api/v2/{*path}", any(fallback))
}
