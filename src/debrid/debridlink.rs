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

const BASE_URL: &str = "https://debrid-link.com/api/v2";

#[derive(Debug, Deserialize)]
struct DlEnvelope<T> {
    success: bool,
    value: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DlFile {
    name: String,
    size: u64,
    #[serde(rename = "downloadUrl")]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DlSeedbox {
    id: String,
    name: String,
    #[serde(rename = "hashString")]
    hash: String,
    #[serde(rename = "totalSize")]
    total_size: u64,
    #[serde(rename = "downloadPercent")]
    download_percent: f32,
    #[serde(rename = "downloadSpeed")]
    download_speed: Option<u64>,
    status: i32,
    files: Option<Vec<DlFile>>,
}

fn map_status(status: i32) -> DebridStatus {
    match status {
        0 | 1 => DebridStatus::Downloading,
        2 | 3 => DebridStatus::Error,
        4 => DebridStatus::Downloaded,
        _ => DebridStatus::Queued,
    }
}

fn to_debrid_torrent(t: DlSeedbox, debrid_name: &str) -> DebridTorrent {
    let files = t
        .files
        .unwrap_or_default()
        .into_iter()
        .map(|f| {
            (
                f.name.clone(),
                DebridFile {
                    id: f.name.clone(),
                    size: f.size,
                    path: f.name,
                    link: f.download_url,
                },
            )
        })
        .collect();

    DebridTorrent {
        id: t.id,
        debrid_name: debrid_name.to_string(),
        info_hash: t.hash.to_lowercase(),
        name: t.name,
        size: t.total_size,
        status: map_status(t.status),
        progress: t.download_percent / 100.0,
        speed: t.download_speed.unwrap_or(0),
        added_on: Utc::now(),
        files,
    }
}

/// Debrid-Link adapter (§4.A). Endpoint shapes follow Debrid-Link's
/// `{success,value,error}` response envelope; client plumbing shared with
/// the other adapters via `DebridHttpClient`/`AccountPool`.
pub struct DebridLinkClient {
    name: String,
    base_url: String,
    http: DebridHttpClient,
    accounts: AccountPool,
    download_uncached_default: bool,
    auto_expire_links_after_secs: i64,
}

impl DebridLinkClient {
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
            .ok_or_else(|| HTTPError::fatal("no_accounts", "no enabled debrid-link accounts configured"))
    }

    async fn call<T: DeserializeOwned>(&self, build: impl Fn(&str) -> reqwest::RequestBuilder) -> Result<T, HTTPError> {
        let token = self.token().await?;
        let response = self
            .http
            .send(|| build(&token).header("User-Agent", get_user_agent()))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json::<DlEnvelope<T>>()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        if response.success {
            response.value.ok_or_else(|| HTTPError::fatal("empty_response", "missing value"))
        } else {
            let code = response.error.unwrap_or_default();
            if code == "maxLink" || code == "maxTorrent" {
                Err(HTTPError::transient("too_many_active_downloads", code))
            } else {
                Err(HTTPError::fatal(code, "debrid-link error"))
            }
        }
    }
}

#[async_trait]
impl DebridClient for DebridLinkClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_magnet(&self, magnet: &Magnet) -> Result<DebridTorrent, HTTPError> {
        let url = format!("{}/seedbox/add", self.base_url);
        let magnet_link = magnet.link.clone();
        let seedbox: DlSeedbox = self
            .call(|token| {
                self.http
                    .client
                    .post(&url)
                    .bearer_auth(token)
                    .form(&[("url", magnet_link.as_str())])
            })
            .await?;
        Ok(to_debrid_torrent(seedbox, &self.name))
    }

    async fn check_status(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(id).await
    }

    async fn update_torrent(&self, torrent: &DebridTorrent) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(&torrent.id).await
    }

    async fn get_torrent(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        let url = format!("{}/seedbox/{}", self.base_url, id);
        let seedbox: DlSeedbox = self.call(|token| self.http.client.get(&url).bearer_auth(token)).await?;
        Ok(to_debrid_torrent(seedbox, &self.name))
    }

    async fn get_torrents(&self) -> Result<Vec<DebridTorrent>, HTTPError> {
        let url = format!("{}/seedbox/list", self.base_url);
        let seedboxes: Vec<DlSeedbox> = self.call(|token| self.http.client.get(&url).bearer_auth(token)).await?;
        Ok(seedboxes.into_iter().map(|s| to_debrid_torrent(s, &self.name)).collect())
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), HTTPError> {
        let url = format!("{}/seedbox/{}/remove", self.base_url, id);
        self.call::<serde_json::Value>(|token| self.http.client.delete(&url).bearer_auth(token))
            .await?;
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
            .ok_or_else(|| HTTPError::fatal("file_not_ready", "no download url for this file yet"))?;

        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let mutex = self.accounts.link_mutex(&source_link).await;
        let _guard = mutex.lock().await;
        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let token = self.token().await?;
        let link = DownloadLink::new(
            token,
            source_link.clone(),
            source_link,
            file.path.clone(),
            file.size,
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
        let url = format!("{}/seedbox/cached?hash={}", self.base_url, hashes.join(","));
        let data: HashMap<String, serde_json::Value> =
            self.call(|token| self.http.client.get(&url).bearer_auth(token)).await?;
        Ok(hashes.iter().map(|h| (h.clone(), data.contains_key(h))).collect())
    }

    async fn get_available_slots(&self) -> Result<i64, HTTPError> {
        Ok(i64::MAX)
    }

    async fn get_profile(&self) -> Result<serde_json::Value, HTTPError> {
        let url = format!("{}/account/infos", self.base_url);
        self.call(|token| self.http.client.get(&url).bearer_auth(token)).await
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

    fn client(base_url: String) -> DebridLinkClient {
        DebridLinkClient {
            name: "debridlink".to_string(),
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
    async fn get_torrent_parses_seedbox_envelope() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/seedbox/abc123");
                then.status(200).json_body(json!({
                    "success": true,
                    "value": {
                        "id": "abc123",
                        "name": "some.movie",
                        "hashString": "ABCDEF0123456789ABCDEF0123456789ABCDEF01",
                        "totalSize": 1000,
                        "downloadPercent": 100.0,
                        "downloadSpeed": 0,
                        "status": 4,
                        "files": [],
                    }
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
    async fn get_torrent_surfaces_max_torrent_as_transient() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/seedbox/abc123");
                then.status(200).json_body(json!({
                    "success": false,
                    "error": "maxTorrent",
                }));
            })
            .await;

        let client = client(server.base_url());
        let err = client.get_torrent("abc123").await.unwrap_err();
        assert!(err.is_slot_exhaustion());
    }
}
