use crate::AppState;
use crate::config::get_config;
use crate::error::AppError;
use crate::helpers::add_trackers_to_magnet_uri::add_trackers_to_magnet_uri;
use crate::helpers::parse_magnet_uri::parse_magnet_uri;
use crate::model::{ImportAction, ImportRequest, Magnet, TorrentState};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{any, get};
use axum::Router;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const SAB_VERSION: &str = "4.5.0";

/// §6 "SABnzbd v4 API (inbound, optional)". Every mode that isn't `addurl`/
/// `addfile` is a read-only view over F; the two add modes funnel into the
/// same `AddTorrent` entry point the qBittorrent facade uses, since nothing
/// downstream of D distinguishes the protocol that triggered the import.
async fn api(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Result<axum::response::Response, AppError> {
    let mode = params.get("mode").map(|s| s.as_str()).unwrap_or("");
    match mode {
        "version" => Ok(Json(json!({ "version": SAB_VERSION })).into_response()),
        "queue" => Ok(Json(queue_json(&state).await).into_response()),
        "history" => Ok(Json(history_json(&state).await).into_response()),
        "status" | "fullstatus" => Ok(Json(status_json()).into_response()),
        "get_config" | "config" => Ok(Json(config_json()).into_response()),
        "get_cats" => Ok(Json(json!({ "categories": categories() })).into_response()),
        "get_scripts" => Ok(Json(json!({ "scripts": ["None"] })).into_response()),
        "get_files" => Ok(Json(json!({ "files": [] })).into_response()),
        "addurl" => add(&state, &params).await,
        "addfile" => add(&state, &params).await,
        _ => Ok((axum::http::StatusCode::BAD_REQUEST, Json(json!({ "status": false, "error": format!("unknown mode {mode}") }))).into_response()),
    }
}

fn categories() -> Vec<String> {
    let mut cats = vec!["*".to_string()];
    cats.extend(get_config().categories.iter().cloned());
    cats
}

fn status_json() -> serde_json::Value {
    json!({
        "status": true,
        "version": SAB_VERSION,
        "paused": false,
        "pause_int": "0",
        "diskspace1": "0",
        "diskspace2": "0",
        "speedlimit": "0",
        "have_warnings": "0",
        "uptime": "0:00:00",
    })
}

fn config_json() -> serde_json::Value {
    let config = get_config();
    json!({
        "config": {
            "misc": {
                "complete_dir": config.download_folder.to_string_lossy(),
            },
            "categories": categories().into_iter().map(|name| json!({ "name": name, "priority": 0 })).collect::<Vec<_>>(),
        }
    })
}

fn sab_status(state: TorrentState) -> &'static str {
    match state {
        TorrentState::Queued => "Queued",
        TorrentState::Downloading => "Downloading",
        TorrentState::PausedUP => "Completed",
        TorrentState::Error => "Failed",
    }
}

async fn queue_json(state: &AppState) -> serde_json::Value {
    let torrents = state.store.all().await;
    let slots: Vec<serde_json::Value> = torrents
        .iter()
        .filter(|t| !matches!(t.state, TorrentState::PausedUP | TorrentState::Error))
        .enumerate()
        .map(|(i, t)| {
            let mb_total = t.size as f64 / (1024.0 * 1024.0);
            let mb_left = mb_total * (1.0 - t.progress as f64);
            json!({
                "index": i,
                "nzo_id": t.info_hash,
                "priority": "Normal",
                "filename": t.name,
                "cat": t.category.clone().unwrap_or_default(),
                "mb": format!("{mb_total:.2}"),
                "mbleft": format!("{mb_left:.2}"),
                "percentage": format!("{:.0}", t.progress * 100.0),
                "status": sab_status(t.state),
                "timeleft": "0:00:00",
            })
        })
        .collect();

    json!({
        "queue": {
            "status": "Downloading",
            "speedlimit": "0",
            "noofslots": slots.len(),
            "slots": slots,
        }
    })
}

async fn history_json(state: &AppState) -> serde_json::Value {
    let torrents = state.store.all().await;
    let slots: Vec<serde_json::Value> = torrents
        .iter()
        .filter(|t| matches!(t.state, TorrentState::PausedUP | TorrentState::Error))
        .map(|t| {
            json!({
                "nzo_id": t.info_hash,
                "name": t.name,
                "cat": t.category.clone().unwrap_or_default(),
                "status": sab_status(t.state),
                "fail_message": t.error_message.clone().unwrap_or_default(),
                "storage": t.torrent_path.clone().unwrap_or_default(),
                "bytes": t.size,
                "completed": t.completed_on.map(|c| c.timestamp()).unwrap_or(0),
            })
        })
        .collect();

    json!({
        "history": {
            "noofslots": slots.len(),
            "slots": slots,
        }
    })
}

/// §4.D's arr-setting rung needs an arr name; SAB's `cat` plays the same
/// role a qBittorrent download-client category does.
fn arr_for_category(state: &AppState, category: &Option<String>) -> Option<String> {
    let category = category.as_ref()?;
    state.arrs.contains_key(category).then(|| category.clone())
}

/// `action=download` selects the post-cached-download placement action
/// (spec.md's `addurl`/`addfile` `action` parameter); anything else, including
/// its absence, falls back to the default symlink placement.
fn parse_import_action(params: &HashMap<String, String>) -> ImportAction {
    match params.get("action").map(|s| s.as_str()) {
        Some("download") | Some("Download") => ImportAction::Download,
        _ => ImportAction::Symlink,
    }
}

async fn add(state: &AppState, params: &HashMap<String, String>) -> Result<axum::response::Response, AppError> {
    let Some(raw) = params.get("name") else {
        return Ok((axum::http::StatusCode::BAD_REQUEST, Json(json!({ "status": false, "error": "missing name" }))).into_response());
    };

    let magnet_uri = add_trackers_to_magnet_uri(raw);
    let Some(parsed) = parse_magnet_uri(&magnet_uri) else {
        return Ok((axum::http::StatusCode::BAD_REQUEST, Json(json!({ "status": false, "error": "name is not a magnet URI" }))).into_response());
    };

    let category = params.get("cat").cloned();
    if state.store.get(&parsed.hash, category.as_deref()).await.is_none() {
        let req = ImportRequest {
            download_folder: params
                .get("download_dir")
                .cloned()
                .unwrap_or_else(|| get_config().download_folder.to_string_lossy().into_owned()),
            debrid: None,
            magnet: Magnet {
                info_hash: parsed.hash.clone(),
                name: parsed.name,
                size: 0,
                link: magnet_uri,
                torrent_bytes: None,
            },
            arr: arr_for_category(state, &category),
            action: parse_import_action(params),
            download_uncached_override: None,
            callback_url: None,
            category,
        };

        let ingest = state.ingest.clone();
        tokio::spawn(async move { ingest.add_torrent(req).await });
    }

    Ok(Json(json!({ "status": true, "nzo_ids": [parsed.hash] })).into_response())
}

async fn index() -> impl IntoResponse {
    Json(json!({ "version": SAB_VERSION }))
}

pub fn mimic_sabnzbd() -> Router<Arc<AppState>> {
    Router::new().route("/api", get(api).post(api)).route("/sabnzbd/api", any(index))
}
