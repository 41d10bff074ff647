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

const BASE_URL: &str = "https://api.alldebrid.com/v4";

#[derive(Debug, Deserialize)]
struct AdEnvelope<T> {
    status: String,
    data: Option<T>,
    error: Option<AdError>,
}

#[derive(Debug, Deserialize)]
struct AdError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AdUploadMagnet {
    id: u64,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct AdUploadEnvelope {
    magnets: Vec<AdUploadMagnet>,
}

#[derive(Debug, Deserialize)]
struct AdLink {
    filename: String,
    size: u64,
    link: String,
}

#[derive(Debug, Deserialize)]
struct AdMagnetStatus {
    id: u64,
    filename: String,
    size: u64,
    hash: String,
    status: String,
    #[serde(rename = "statusCode")]
    status_code: i32,
    #[serde(rename = "downloadSpeed")]
    download_speed: Option<u64>,
    #[serde(rename = "downloaded")]
    downloaded_bytes: Option<u64>,
    links: Option<Vec<AdLink>>,
}

fn map_status(status_code: i32) -> DebridStatus {
    match status_code {
        0 | 1 | 2 | 3 => DebridStatus::Downloading,
        4 => DebridStatus::Downloaded,
        _ => DebridStatus::Error,
    }
}

fn to_debrid_torrent(m: AdMagnetStatus, debrid_name: &str) -> DebridTorrent {
    let progress = if m.size == 0 {
        0.0
    } else {
        m.downloaded_bytes.unwrap_or(0) as f32 / m.size as f32
    };

    let files = m
        .links
        .unwrap_or_default()
        .into_iter()
        .map(|l| {
            (
                l.filename.clone(),
                DebridFile {
                    id: l.link.clone(),
                    size: l.size,
                    path: l.filename,
                    link: Some(l.link),
                },
            )
        })
        .collect();

    DebridTorrent {
        id: m.id.to_string(),
        debrid_name: debrid_name.to_string(),
        info_hash: m.hash.to_lowercase(),
        name: m.filename,
        size: m.size,
        status: map_status(m.status_code),
        progress,
        speed: m.download_speed.unwrap_or(0),
        added_on: Utc::now(),
        files,
    }
}

/// AllDebrid adapter (§4.A). Endpoint shapes follow AllDebrid's
/// `{status,data,error}` v4 envelope.
pub struct AllDebridClient {
    name: String,
    base_url: String,
    http: DebridHttpClient,
    accounts: AccountPool,
    download_uncached_default: bool,
    auto_expire_links_after_secs: i64,
}

impl AllDebridClient {
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
            .ok_or_else(|| HTTPError::fatal("no_accounts", "no enabled alldebrid accounts configured"))
    }

    async fn call<T: DeserializeOwned>(&self, build: impl Fn(&str) -> reqwest::RequestBuilder) -> Result<T, HTTPError> {
        let token = self.token().await?;
        let response: AdEnvelope<T> = self
            .http
            .send(|| build(&token).header("User-Agent", get_user_agent()))
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?
            .json()
            .await
            .map_err(|e| HTTPError::transient("request_error", e.to_string()))?;

        if response.status == "success" {
            response.data.ok_or_else(|| HTTPError::fatal("empty_response", "missing data"))
        } else {
            let err = response.error.unwrap_or(AdError {
                code: "UNKNOWN".to_string(),
                message: "alldebrid error".to_string(),
            });
            if err.code == "MAGNET_MUST_BE_PREMIUM" || err.code == "FREE_TRIAL_LIMIT_REACHED" {
                Err(HTTPError::transient("too_many_active_downloads", err.message))
            } else {
                Err(HTTPError::fatal(err.code, err.message))
            }
        }
    }
}

#[async_trait]
impl DebridClient for AllDebridClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_magnet(&self, magnet: &Magnet) -> Result<DebridTorrent, HTTPError> {
        let url = format!("{}/magnet/upload", self.base_url);
        let magnet_link = magnet.link.clone();
        let uploaded: AdUploadEnvelope = self
            .call(|token| {
                self.http
                    .client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("magnets[]", magnet_link.as_str())])
            })
            .await?;

        let added = uploaded
            .magnets
            .into_iter()
            .next()
            .ok_or_else(|| HTTPError::fatal("upload_failed", "alldebrid returned no magnet"))?;

        self.get_torrent(&added.id.to_string()).await
    }

    async fn check_status(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(id).await
    }

    async fn update_torrent(&self, torrent: &DebridTorrent) -> Result<DebridTorrent, HTTPError> {
        self.get_torrent(&torrent.id).await
    }

    async fn get_torrent(&self, id: &str) -> Result<DebridTorrent, HTTPError> {
        let url = format!("{}/magnet/status", self.base_url);
        let status: AdMagnetStatus = self
            .call(|token| self.http.client.get(&url).bearer_auth(token).query(&[("id", id)]))
            .await?;
        Ok(to_debrid_torrent(status, &self.name))
    }

    async fn get_torrents(&self) -> Result<Vec<DebridTorrent>, HTTPError> {
        #[derive(Debug, Deserialize)]
        struct AdMagnets {
            magnets: Vec<AdMagnetStatus>,
        }

        let url = format!("{}/magnet/status", self.base_url);
        let all: AdMagnets = self.call(|token| self.http.client.get(&url).bearer_auth(token)).await?;
        Ok(all.magnets.into_iter().map(|m| to_debrid_torrent(m, &self.name)).collect())
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), HTTPError> {
        let url = format!("{}/magnet/delete", self.base_url);
        self.call::<serde_json::Value>(|token| self.http.client.get(&url).bearer_auth(token).query(&[("id", id)]))
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
            .ok_or_else(|| HTTPError::fatal("file_not_ready", "no locked link for this file yet"))?;

        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let mutex = self.accounts.link_mutex(&source_link).await;
        let _guard = mutex.lock().await;
        if let Some(cached) = self.accounts.get_download_link(&source_link).await {
            return Ok(cached);
        }

        let url = format!("{}/link/unlock", self.base_url);
        let unlocked: AdLink = self
            .call(|token| self.http.client.get(&url).bearer_auth(token).query(&[("link", source_link.as_str())]))
            .await?;

        let token = self.token().await?;
        let link = DownloadLink::new(
            token,
            source_link,
            unlocked.link,
            unlocked.filename,
            unlocked.size,
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
        #[derive(Debug, Deserialize)]
        struct AdMagnetAvail {
            hash: String,
            instant: bool,
        }
        #[derive(Debug, Deserialize)]
        struct AdAvailEnvelope {
            magnets: Vec<AdMagnetAvail>,
        }

        let url = format!("{}/magnet/instant", self.base_url);
        let pairs: Vec<(&str, &str)> = hashes.iter().map(|h| ("magnets[]", h.as_str())).collect();
        let result: AdAvailEnvelope = self
            .call(|token| self.http.client.get(&url).bearer_auth(token).query(&pairs))
            .await?;

        Ok(result
            .magnets
            .into_iter()
            .map(|m| (m.hash.to_lowercase(), m.instant))
            .collect())
    }

    async fn get_available_slots(&self) -> Result<i64, HTTPError> {
        Ok(i64::MAX)
    }

    async fn get_profile(&self) -> Result<serde_json::Value, HTTPError> {
        let url = format!("{}/user", self.base_url);
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

    fn client(base_url: String) -> AllDebridClient {
        AllDebridClient {
            name: "alldebrid".to_string(),
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
    async fn get_torrent_parses_status_envelope() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/magnet/status");
                then.status(200).json_body(json!({
                    "status": "success",
                    "data": {
                        "id": 42,
                        "filename": "some.movie",
                        "size": 1000,
                        "hash": "ABCDEF0123456789ABCDEF0123456789ABCDEF01",
                        "status": "Ready",
                        "statusCode": 4,
                        "downloadSpeed": 0,
                        "downloaded": 1000,
                        "links": [],
                    }
                }));
            })
            .await;

        let client = client(server.base_url());
        let torrent = client.get_torrent("42").await.unwrap();
        mock.assert();
        assert_eq!(torrent.info_hash, "abcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(torrent.status, DebridStatus::Downloaded);
    }

    #[tokio::test]
    async fn get_torrent_surfaces_premium_required_as_transient() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/magnet/status");
                then.status(200).json_body(json!({
                    "status": "error",
                    "error": { "code": "MAGNET_MUST_BE_PREMIUM", "message": "premium required" },
                }));
            })
            .await;

        let client = client(server.base_url());
        let err = client.get_torrent("42").await.unwrap_err();
        assert!(err.is_slot_exhaustion());
    }
}
