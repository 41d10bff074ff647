use super::DebridClient;
use crate::accounts::AccountPool;
use crate::config::{DebridAccountConfig, RateLimitConfig};
use crate::error::HTTPError;
use crate::helpers::get_user_agent;
use crate::httpclient::DebridHttpClient;
use crate::model::{Account, DebridFile, DebridStatus, DebridTorrent, DownloadLink, Magnet};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::collections::HashMap;

const BASE_URL: &str = "https://api.torbox.app/v1/api";

#[derive(Debug, Deserialize)]
struct TorboxApiError {
    error: Option<String>,
    detail: String,
}

#[derive(Debug, Deserialize)]
struct TorboxCreateTorrentData {
    torrent_id: u64,
}

#[derive(Debug, Deserialize)]
struct TorboxListTorrent {
    id: u64,
    hash: String,
    name: String,
    progress: f32,
    download_speed: u64,
    eta: u32,
    size: u64,
    download_state: String,
    download_present: bool,
    files: Option<Vec<TorboxTorrentFile>>,
}

#[derive(Debug, Deserialize)]
struct TorboxTorrentFile {
    id: u64,
    name: String,
    size: u64,
}

fn map_status(download_state: &str, download_present: bool) -> DebridStatus {
    if download_present {
        return DebridStatus::Downloaded;
    }
    match download_state {
        "downloading" | "metaDL" | "checking" => DebridStatus::Downloading,
        "completed" | "uploading" | "cached" => DebridStatus::Downloaded,
        "queued" | "paused" => DebridStatus::Queued,
        _ => DebridStatus::Error,
    }
}

fn to_debrid_torrent(t: TorboxListTorrent, debrid_name: &str) -> DebridTorrent {
    let files = t
        .files
        .unwrap_or_default()
        .into_iter()
        .map(|f| {
            (
                f.name.clone(),
                DebridFile {
                    id: f.id.to_string(),
                    size: f.size,
                    path: f.name,
                    link: None,
                },
            )
        })
        .collect();

    DebridTorrent {
        id: t.id.to_string(),
        debrid_name: debrid_name.to_string(),
        info_hash: t.hash.to_lowercase(),
        name: t.name,
        size: t.size,
        status: map_status(&t.download_state, t.download_present),
        progress: t.progress,
        speed: t.download_speed,
        added_on: Utc::now(),
        files,
    }
}

/// Torbox adapter (§4.A). Grounded directly on the teacher's Torbox client,
/// generalised behind `DebridClient` and retargeted onto the shared
/// `DebridHttpClient`/`AccountPool`.
pub struct TorboxClient {
    name: String,
    base_url: String,
    http: DebridHttpClient,
    accounts: AccountPool,
    download_uncached_default: bool,
    auto_expire_links_after_secs: i64,
}

impl TorboxClient {
    pub fn new(
        name: String,
        account_configs: &[DebridAccountConfig],
        rate_limit: &RateLimitConfig,
        download_uncached_default: bool,
        auto_expire_links_after_secs: i64,
    ) -> anyhow::Result<Self> {
        let accounts = account_configs
            .iter()
            .enumerate()
            .map(|(i, a)| Account {
                order: i as u32,
                token: a.token.clone(),
                username: a.username.clone(),
                disabled: false,
                disabled_reason: None,
                traffic_used: 0,
            })
            .collect();

        Ok(Self {
            name,
            base_url: BASE_URL.to_string(),
            http: DebridHttpClient::new(rate_limit)?,
            accounts: AccountPool::new(accounts),
            download_uncached_default,
            auto_expire_links_after_secs,
        })
    }

    fn add_headers(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .header("User-Agent", get_user_agent())
    }

    fn parse_response<T: DeserializeOwned>(&self, mut response: serde_json::Value) -> Result<T, HTTPError> {
        let is_success = response["success"].as_bool().unwrap_or(false);
        if is_success {
            let data = response["data"].take();
            serde_json::from_value(data)
                .map_err(|e| HTTPError::fatal("deserialize_error", e.to_string()))
        } else {
            let error: TorboxApiError = serde_json::from_value(response)
                .map_err(|e| HTTPError::fatal("deserialize_error", e.to_string()))?;
            let code = error.error.unwrap_or_else(|| "UNKNOWN".to_string());
            if code == "ACTIVE_LIMIT" {
                Err(HTTPError::transient("too_many_active_downloads", error.detail))
            } else {
                Err(HTTPError::fatal(code, error.detail))
            }
        }
    }

    async fn current_token(&self) -> Result<String, HTTPError> {
        self.accounts
            .next_account()
            .await
            .map(|a| a.token)
            .ok_or_else(|| HTTPError::fatal("no_accounts", "no enabled torbox accounts configured"))
    }
}

#[async_trait]
impl DebridClient for TorboxClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_magnet(&self, magnet: &Magnet) -> Result<DebridTorrent, HTTPError> {
        let token = self.current_token().await?;
        let url = format!("{}/torrents/createtorrent", self.base_url);
        let body = json!({ "magnet": magnet.link, "allow_zip": false });
        let response = self
            .http
            .send(|| self.add_headers(self.http.client.post(&url), &token).form(&body))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        let created: TorboxCreateTorrentData = self.parse_response(response)?;
        self.get_torrent(&created.torrent_id.to_string()).await
    }

    async fn check_status(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(id).await
    }

    async fn update_torrent(&self, torrent: &DebridTorrent) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(&torrent.id).await
    }

    async fn get_torrent(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        let token = self.current_token().await?;
        let url = format!("{}/torrents/mylist?bypass_cache=true&id={}", self.base_url, id);
        let response = self
            .http
            .send(|| self.add_headers(self.http.client.get(&url), &token))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        let torrent: TorboxListTorrent = self.parse_response(response)?;
        Ok(to_debrid_torrent(torrent, &self.name))
    }

    async fn get_torrents(&self) -> Result<Vec<DebridTorrent>, HTTPError> {
        let token = self.current_token().await?;
        let url = format!("{}/torrents/mylist?bypass_cache=false", self.base_url);
        let response = self
            .http
            .send(|| self.add_headers(self.http.client.get(&url), &token))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        let torrents: Vec<TorboxListTorrent> = self.parse_response(response)?;
        Ok(torrents.into_iter().map(|t| to_debrid_torrent(t, &self.name)).collect())
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), HTTPError> {
        let token = self.current_token().await?;
        let url = format!("{}/torrents/controltorrent", self.base_url);
        let response = self
            .http
            .send(|| {
                self.add_headers(self.http.client.post(&url), &token)
                    .json(&json!({ "torrent_id": id, "operation": "delete" }))
            })
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        self.parse_response::<serde_json::Value>(response)?;
        Ok(())
    }

    async fn get_download_link(&self, torrent: &DebridTorrent, file_id: &str) -> Result<DownloadLink, HTTPError> {
        let source_link = format!("{}:{}", torrent.id, file_id);
        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let mutex = self.accounts.link_mutex(&source_link).await;
        let _guard = mutex.lock().await;
        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let token = self.current_token().await?;
        let url = format!(
            "{}/torrents/requestdl?torrent_id={}&file_id={}&token={}",
            self.base_url, torrent.id, file_id, token
        );
        let response = self
            .http
            .send(|| self.http.client.get(&url).header("User-Agent", get_user_agent()))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        let resolved: String = self.parse_response(response)?;
        let file = torrent.files.values().find(|f| f.id == file_id);
        let link = DownloadLink::new(
            token,
            source_link,
            resolved,
            file.map(|f| f.path.clone()).unwrap_or_default(),
            file.map(|f| f.size).unwrap_or(0),
            self.auto_expire_links_after_secs,
        );
        self.accounts.store_download_link(link.clone()).await;
        Ok(link)
    }

    async fn get_file_download_links(&self, torrent: &DebridTorrent) -> Result<Vec<DownloadLink>, HTTPError> {
        let mut links = Vec::with_capacity(torrent.files.len());
        for file in torrent.files.values() {
            links.push(self.get_download_link(torrent, &file.id).await?);
        }
        Ok(links)
    }

    async fn invalidate_download_link(&self, source_link: &str) {
        self.accounts.evict_download_link(source_link).await;
    }

    async fn is_available(&self, hashes: &[String]) -> Result<HashMap<String, bool>, HTTPError> {
        let token = self.current_token().await?;
        let hash_list = hashes.join(",");
        let url = format!("{}/torrents/checkcached?format=object&hash={}", self.base_url, hash_list);
        let response = self
            .http
            .send(|| self.add_headers(self.http.client.get(&url), &token))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        let data: HashMap<String, serde_json::Value> = self.parse_response(response)?;
        Ok(hashes.iter().map(|h| (h.clone(), data.contains_key(h))).collect())
    }

    async fn get_available_slots(&self) -> Result<i64, HTTPError> {
        // Torbox doesn't expose a slot count; treat it as unbounded until a
        // submit reports `too_many_active_downloads`.
        Ok(i64::MAX)
    }

    async fn get_profile(&self) -> Result<serde_json::Value, HTTPError> {
        let token = self.current_token().await?;
        let url = format!("{}/user/me", self.base_url);
        let response = self
            .http
            .send(|| self.add_headers(self.http.client.get(&url), &token))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        self.parse_response(response)
    }

    async fn accounts(&self) -> Vec<Account> {
        self.accounts.accounts().await
    }

    fn download_uncached_default(&self) -> bool {
        self.download_uncached_default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: String) -> TorboxClient {
        TorboxClient {
            name: "torbox".to_string(),
            base_url,
            http: DebridHttpClient::for_test(),
            accounts: AccountPool::new(vec![Account {
                order: 0,
                token: "test-token".to_string(),
                username: None,
                disabled: false,
                disabled_reason: None,
                traffic_used: 0,
            }]),
            download_uncached_default: false,
            auto_expire_links_after_secs: 3600,
        }
    }

    #[tokio::test]
    async fn get_torrent_parses_mylist_envelope() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server.mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/torrents/mylist");
            then.status(200).json_body(json!({
                "success": true,
                "data": {
                    "id": 42,
                    "hash": "ABCDEF0123456789ABCDEF0123456789ABCDEF01",
                    "name": "some.movie",
                    "progress": 1.0,
                    "download_speed": 0,
                    "eta": 0,
                    "size": 1000,
                    "download_state": "completed",
                    "download_present": true,
                    "files": [],
                }
            }));
        }).await;

        let client = client(server.base_url());
        let torrent = client.get_torrent("42").await.unwrap();
        mock.assert();
        assert_eq!(torrent.info_hash, "abcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(torrent.status, DebridStatus::Downloaded);
    }

    #[tokio::test]
    async fn get_torrent_surfaces_api_error() {
        let server = httpmock::MockServer::start_async().await;
        server.mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/torrents/mylist");
            then.status(200).json_body(json!({
                "success": false,
                "error": "ACTIVE_LIMIT",
                "detail": "too many active torrents",
            }));
        }).await;

        let client = client(server.base_url());
        let err = client.get_torrent("42").await.unwrap_err();
        assert!(err.is_slot_exhaustion());
    }
}
