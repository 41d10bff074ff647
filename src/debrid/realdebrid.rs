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
use std::collections::HashMap;

const BASE_URL: &str = "https://api.real-debrid.com/rest/1.0";

#[derive(Debug, Deserialize)]
struct RdError {
    error: String,
    error_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct RdAddMagnetResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RdTorrentFile {
    id: u32,
    path: String,
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct RdTorrentInfo {
    id: String,
    hash: String,
    filename: String,
    bytes: u64,
    status: String,
    progress: f32,
    speed: Option<u64>,
    files: Option<Vec<RdTorrentFile>>,
    links: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RdUnrestrict {
    download: String,
    filename: String,
    filesize: u64,
}

fn map_status(status: &str) -> DebridStatus {
    match status {
        "downloaded" => DebridStatus::Downloaded,
        "waiting_files_selection" | "queued" => DebridStatus::Queued,
        "downloading" | "compressing" | "uploading" | "magnet_conversion" => DebridStatus::Downloading,
        _ => DebridStatus::Error,
    }
}

fn to_debrid_torrent(t: RdTorrentInfo, debrid_name: &str) -> DebridTorrent {
    let links = t.links.unwrap_or_default();
    let files = t
        .files
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            let name = f.path.rsplit('/').next().unwrap_or(&f.path).to_string();
            (
                name.clone(),
                DebridFile {
                    id: f.id.to_string(),
                    size: f.bytes,
                    path: name,
                    link: links.get(i).cloned(),
                },
            )
        })
        .collect();

    DebridTorrent {
        id: t.id,
        debrid_name: debrid_name.to_string(),
        info_hash: t.hash.to_lowercase(),
        name: t.filename,
        size: t.bytes,
        status: map_status(&t.status),
        progress: t.progress / 100.0,
        speed: t.speed.unwrap_or(0),
        added_on: Utc::now(),
        files,
    }
}

/// Real-Debrid adapter (§4.A). Endpoint shapes grounded on the pack's
/// Real-Debrid reference client; retry/rate-limit plumbing shared with the
/// Torbox adapter via `DebridHttpClient`.
pub struct RealDebridClient {
    name: String,
    base_url: String,
    http: DebridHttpClient,
    accounts: AccountPool,
    download_uncached_default: bool,
    auto_expire_links_after_secs: i64,
}

impl RealDebridClient {
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

    async fn token(&self) -> Result<String, HTTPError> {
        self.accounts
            .next_account()
            .await
            .map(|a| a.token)
            .ok_or_else(|| HTTPError::fatal("no_accounts", "no enabled real-debrid accounts configured"))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, HTTPError> {
        let token = self.token().await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .send(|| {
                self.http
                    .client
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("User-Agent", get_user_agent())
            })
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        Self::parse(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, form: &[(&str, &str)]) -> Result<T, HTTPError> {
        let token = self.token().await?;
        let url = format!("{}{}", self.base_url, path);
        let form = form.to_vec();
        let response = self
            .http
            .send(|| {
                self.http
                    .client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("User-Agent", get_user_agent())
                    .form(&form)
            })
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HTTPError> {
        let status = response.status();
        if status.as_u16() == 204 {
            return serde_json::from_str("{}").map_err(|e| HTTPError::fatal("deserialize_error", e.to_string()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<RdError>(&text) {
                if err.error == "active_limit_exceeded" {
                    return Err(HTTPError::transient("too_many_active_downloads", err.error));
                }
                return Err(HTTPError::fatal(
                    err.error_code.map(|c| c.to_string()).unwrap_or_default(),
                    err.error,
                ));
            }
            return Err(HTTPError::fatal(status.as_u16().to_string(), text));
        }

        serde_json::from_str(&text).map_err(|e| HTTPError::fatal("deserialize_error", format!("{e}: {text}")))
    }
}

#[async_trait]
impl DebridClient for RealDebridClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_magnet(&self, magnet: &Magnet) -> Result<DebridTorrent, HTTPError> {
        let response: RdAddMagnetResponse = self
            .post("/torrents/addMagnet", &[("magnet", &magnet.link)])
            .await?;
        self.post::<serde_json::Value>(&format!("/torrents/selectFiles/{}", response.id), &[("files", "all")])
            .await?;
        self.get_torrent(&response.id).await
    }

    async fn check_status(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(id).await
    }

    async fn update_torrent(&self, torrent: &DebridTorrent) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(&torrent.id).await
    }

    async fn get_torrent(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        let info: RdTorrentInfo = self.get(&format!("/torrents/info/{}", id)).await?;
        Ok(to_debrid_torrent(info, &self.name))
    }

    async fn get_torrents(&self) -> Result<Vec<DebridTorrent>, HTTPError> {
        let infos: Vec<RdTorrentInfo> = self.get("/torrents?limit=2500").await?;
        Ok(infos.into_iter().map(|t| to_debrid_torrent(t, &self.name)).collect())
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), HTTPError> {
        let token = self.token().await?;
        let url = format!("{}/torrents/delete/{}", self.base_url, id);
        let response = self
            .http
            .send(|| {
                self.http
                    .client
                    .delete(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("User-Agent", get_user_agent())
            })
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        Self::parse::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn get_download_link(&self, torrent: &DebridTorrent, file_id: &str) -> Result<DownloadLink, HTTPError> {
        let file = torrent
            .files
            .values()
            .find(|f| f.id == file_id)
            .ok_or_else(|| HTTPError::fatal("file_not_found", "file not present in torrent"))?;

        let source_link = file
            .link
            .clone()
            .ok_or_else(|| HTTPError::fatal("file_not_ready", "torrent has no restricted link for this file yet"))?;

        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let mutex = self.accounts.link_mutex(&source_link).await;
        let _guard = mutex.lock().await;
        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let token = self.token().await?;
        let unrestricted: RdUnrestrict = self.post("/unrestrict/link", &[("link", &source_link)]).await?;
        let link = DownloadLink::new(
            token,
            source_link,
            unrestricted.download,
            unrestricted.filename,
            unrestricted.filesize,
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
        let hash_list = hashes.join("/");
        let data: HashMap<String, serde_json::Value> =
            self.get(&format!("/torrents/instantAvailability/{}", hash_list)).await?;
        Ok(hashes
            .iter()
            .map(|h| (h.clone(), data.get(h).map(|v| !v.is_null()).unwrap_or(false)))
            .collect())
    }

    async fn get_available_slots(&self) -> Result<i64, HTTPError> {
        Ok(i64::MAX)
    }

    async fn get_profile(&self) -> Result<serde_json::Value, HTTPError> {
        self.get("/user").await
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
    use serde_json::json;

    fn client(base_url: String) -> RealDebridClient {
        RealDebridClient {
            name: "realdebrid".to_string(),
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
    async fn get_torrent_parses_info_response() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/torrents/info/abc123");
                then.status(200).json_body(json!({
                    "id": "abc123",
                    "hash": "ABCDEF0123456789ABCDEF0123456789ABCDEF01",
                    "filename": "some.movie",
                    "bytes": 1000,
                    "status": "downloaded",
                    "progress": 100.0,
                    "speed": 0,
                    "files": [],
                    "links": [],
                }));
            })
            .await;

        let client = client(server.base_url());
        let torrent = client.get_torrent("abc123").await.unwrap();
        mock.assert();
        assert_eq!(torrent.info_hash, "abcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(torrent.status, DebridStatus::Downloaded);
    }

    #[tokio::test]
    async fn get_torrent_surfaces_active_limit_as_transient() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/torrents/info/abc123");
                then.status(503).json_body(json!({
                    "error": "active_limit_exceeded",
                    "error_code": 34,
                }));
            })
            .await;

        let client = client(server.base_url());
        let err = client.get_torrent("abc123").await.unwrap_err();
        assert!(err.is_slot_exhaustion());
    }
}
