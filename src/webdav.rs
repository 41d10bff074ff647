use crate::cache::Cache;
use crate::debrid::DebridRegistry;
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;

/// §4.I — read-only WebDAV surface over a debrid's cache, mounted at
/// `/webdav/<debrid>/<virtualDir>/<torrentFolder>/<file>`. Write methods
/// always answer 405.
#[derive(Clone)]
pub struct WebdavState {
    pub caches: Arc<HashMap<String, Arc<Cache>>>,
    pub registry: Arc<DebridRegistry>,
}

pub fn router(state: WebdavState) -> Router {
    // `any()` falls back to its handler for verbs axum has no named method
    // for (PROPFIND included), which is what lets a single handler dispatch
    // on the raw `Method` below.
    Router::new()
        .route("/webdav/{debrid}", any(dispatch_root))
        .route("/webdav/{debrid}/{*path}", any(dispatch))
        .with_state(state)
}

async fn dispatch_root(State(state): State<WebdavState>, AxumPath(debrid): AxumPath<String>, method: axum::http::Method, headers: HeaderMap) -> Response {
    route_method(&state, &debrid, "", &method, &headers).await
}

async fn dispatch(
    State(state): State<WebdavState>,
    AxumPath((debrid, path)): AxumPath<(String, String)>,
    method: axum::http::Method,
    headers: HeaderMap,
) -> Response {
    route_method(&state, &debrid, &path, &method, &headers).await
}

async fn route_method(state: &WebdavState, debrid: &str, path: &str, method: &axum::http::Method, headers: &HeaderMap) -> Response {
    match method.as_str() {
        "OPTIONS" => options_response(),
        "PROPFIND" => propfind(state, debrid, path).await,
        "GET" | "HEAD" => get_file(state, debrid, path, headers).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn options_response() -> Response {
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert("DAV", "1".parse().unwrap());
    response.headers_mut().insert("Allow", "OPTIONS, GET, PROPFIND".parse().unwrap());
    response
}

async fn propfind(state: &WebdavState, debrid: &str, path: &str) -> Response {
    let Some(cache) = state.caches.get(debrid) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Directory listings come from the cache's precomputed listings (§4.I);
    // an empty path lists virtual directory names, a named listing lists its
    // members, and anything else lists the single matching file.
    let (collection_name, entries): (String, Vec<String>) = if path.is_empty() {
        ("".to_string(), cache.listing_names().await)
    } else {
        let trimmed = path.trim_matches('/').to_string();
        (trimmed.clone(), cache.listing(&trimmed).await)
    };

    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">\n");
    body.push_str(&format!(
        "<D:response><D:href>/webdav/{}/{}</D:href><D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n",
        debrid, collection_name
    ));
    for entry in entries {
        body.push_str(&format!(
            "<D:response><D:href>/webdav/{}/{}</D:href><D:propstat><D:prop><D:displayname>{}</D:displayname></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>\n",
            debrid, entry, entry
        ));
    }
    body.push_str("</D:multistatus>");

    Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header("Content-Type", "application/xml; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

/// Streaming GET (§4.I steps 1-5): locate the file, resolve a download link
/// (minting if absent/expired), forward `Range`, and on 403/404 rotate to a
/// fresh link once before surfacing 502.
async fn get_file(state: &WebdavState, debrid: &str, path: &str, headers: &HeaderMap) -> Response {
    let Some(cache) = state.caches.get(debrid) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(client) = state.registry.get(debrid) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let Some((folder_name, file_name)) = path.rsplit_once('/') else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let Some(cached) = cache.get_torrent_by_name(folder_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(file) = cached.torrent.files.get(file_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers.get(axum::http::header::RANGE).cloned();

    for attempt in 0..2 {
        let link = match client.get_download_link(&cached.torrent, &file.id).await {
            Ok(link) => link,
            Err(_) if attempt == 0 => continue,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };

        let mut req = reqwest::Client::new().get(&link.resolved_url);
        if let Some(range) = &range {
            if let Ok(value) = range.to_str() {
                req = req.header(axum::http::header::RANGE, value);
            }
        }

        let upstream = match req.send().await {
            Ok(response) => response,
            Err(_) if attempt == 0 => continue,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };

        let status = upstream.status();
        if status.as_u16() == 403 || status.as_u16() == 404 {
            if attempt == 0 {
                client.invalidate_download_link(&link.source_link).await;
                continue;
            }
            return StatusCode::BAD_GATEWAY.into_response();
        }

        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            builder = builder.header(name, value);
        }
        let stream = upstream.bytes_stream();
        return builder.body(Body::from_stream(stream)).unwrap().into_response();
    }

    StatusCode::BAD_GATEWAY.into_response()
}
