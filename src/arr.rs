use crate::config::{ArrConfig, ArrKind};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
pub struct ArrMediaFile {
    pub id: u64,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArrMedia {
    pub id: u64,
    pub title: String,
    pub files: Vec<ArrMediaFile>,
}

const UNAUTHORIZED_RETRIES: u32 = 5;

fn parse_arr_file(v: &serde_json::Value) -> Option<ArrMediaFile> {
    let id = v.get("id")?.as_u64()?;
    let path = v.get("relativePath").or_else(|| v.get("path"))?.as_str()?.to_string();
    let size = v.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
    Some(ArrMediaFile { id, path, size })
}

/// §4.G — uniform HTTP client over Sonarr/Radarr/Lidarr/Readarr's near-identical
/// REST surface, keyed by `X-Api-Key`. Retries once per 401 up to 5 times.
pub struct ArrClient {
    pub name: String,
    pub kind: ArrKind,
    pub host: String,
    api_key: String,
    pub cleanup: bool,
    pub download_uncached: Option<bool>,
    client: reqwest::Client,
}

impl ArrClient {
    pub fn new(config: &ArrConfig) -> Self {
        let kind = config.kind.unwrap_or_else(|| ArrKind::infer(&config.name, &config.host));
        Self {
            name: config.name.clone(),
            kind,
            host: config.host.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            cleanup: config.cleanup,
            download_uncached: config.download_uncached,
            client: reqwest::Client::new(),
        }
    }

    fn api_root(&self) -> &'static str {
        match self.kind {
            ArrKind::Sonarr => "/api/v3",
            ArrKind::Radarr => "/api/v3",
            ArrKind::Lidarr => "/api/v1",
            ArrKind::Readarr => "/api/v1",
        }
    }

    async fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}{}", self.host, self.api_root(), path);
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .request(method.clone(), &url)
                .header("X-Api-Key", &self.api_key)
                .send()
                .await?;

            if response.status().as_u16() == 401 && attempt < UNAUTHORIZED_RETRIES {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                continue;
            }

            return Ok(response);
        }
    }

    /// `GetMedia(tmdbId?)` (§4.G). Endpoint name follows the arr family
    /// (movie for Radarr, series for Sonarr, etc). File data comes from
    /// `fetch_media_files`, since only Radarr embeds it on the media resource
    /// itself.
    pub async fn get_media(&self, media_id: Option<u64>) -> anyhow::Result<Vec<ArrMedia>> {
        let resource = match self.kind {
            ArrKind::Radarr => "movie",
            ArrKind::Sonarr => "series",
            ArrKind::Lidarr => "artist",
            ArrKind::Readarr => "author",
        };
        let path = match media_id {
            Some(id) => format!("/{}/{}", resource, id),
            None => format!("/{}", resource),
        };
        let response = self.request(reqwest::Method::GET, &path).await?;
        if !response.status().is_success() {
            anyhow::bail!("{} returned {} for {}", self.name, response.status(), path);
        }

        let body: serde_json::Value = response.json().await?;
        let items: Vec<serde_json::Value> = if body.is_array() {
            body.as_array().cloned().unwrap_or_default()
        } else {
            vec![body]
        };

        let mut media = Vec::with_capacity(items.len());
        for v in &items {
            let Some(id) = v.get("id").and_then(|i| i.as_u64()) else { continue };
            let title = v.get("title").and_then(|t| t.as_str()).unwrap_or_default().to_string();
            let files = self.fetch_media_files(id, v).await;
            media.push(ArrMedia { id, title, files });
        }
        Ok(media)
    }

    /// Radarr embeds a single `movieFile` object on the movie resource;
    /// Sonarr/Lidarr/Readarr require a dedicated `*file` endpoint keyed by
    /// the parent media id.
    async fn fetch_media_files(&self, media_id: u64, media_json: &serde_json::Value) -> Vec<ArrMediaFile> {
        match self.kind {
            ArrKind::Radarr => media_json.get("movieFile").and_then(parse_arr_file).into_iter().collect(),
            ArrKind::Sonarr => self.fetch_file_list("/episodefile", "seriesId", media_id).await,
            ArrKind::Lidarr => self.fetch_file_list("/trackfile", "artistId", media_id).await,
            ArrKind::Readarr => self.fetch_file_list("/bookfile", "authorId", media_id).await,
        }
    }

    async fn fetch_file_list(&self, endpoint: &str, id_param: &str, media_id: u64) -> Vec<ArrMediaFile> {
        let path = format!("{}?{}={}", endpoint, id_param, media_id);
        let Ok(response) = self.request(reqwest::Method::GET, &path).await else { return Vec::new() };
        if !response.status().is_success() {
            return Vec::new();
        }
        let Ok(body) = response.json::<serde_json::Value>().await else { return Vec::new() };
        body.as_array().map(|items| items.iter().filter_map(parse_arr_file).collect()).unwrap_or_default()
    }

    /// `DeleteFiles(ids)` (§4.H): arr-side file-delete endpoint, named per
    /// arr family.
    pub async fn delete_files(&self, file_ids: &[u64]) -> anyhow::Result<()> {
        let endpoint = match self.kind {
            ArrKind::Radarr => "moviefile",
            ArrKind::Sonarr => "episodefile",
            ArrKind::Lidarr => "trackfile",
            ArrKind::Readarr => "bookfile",
        };
        for id in file_ids {
            let path = format!("/{}/{}", endpoint, id);
            let _ = self.request(reqwest::Method::DELETE, &path).await?;
        }
        Ok(())
    }

    /// `SearchMissing(ids)` (§4.H, §8 scenario 5): command name and id field
    /// are arr-specific (e.g. Radarr's `MissingMoviesSearch`/`movieIds`).
    pub async fn search_missing(&self, media_ids: &[u64]) -> anyhow::Result<()> {
        let (name, id_field) = match self.kind {
            ArrKind::Radarr => ("MissingMoviesSearch", "movieIds"),
            ArrKind::Sonarr => ("MissingEpisodeSearch", "episodeIds"),
            ArrKind::Lidarr => ("MissingArtistSearch", "artistIds"),
            ArrKind::Readarr => ("MissingBookSearch", "authorIds"),
        };
        let mut body = serde_json::Map::new();
        body.insert("name".to_string(), serde_json::Value::String(name.to_string()));
        body.insert(id_field.to_string(), serde_json::json!(media_ids));

        let url = format!("{}{}/command", self.host, self.api_root());
        self.client.post(&url).header("X-Api-Key", &self.api_key).json(&body).send().await?;
        Ok(())
    }

    pub async fn refresh(&self) -> anyhow::Result<()> {
        let url = format!("{}{}/command", self.host, self.api_root());
        self.client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({ "name": "RefreshMonitoredDownloads" }))
            .send()
            .await?;
        Ok(())
    }

    pub async fn cleanup_queue(&self) -> anyhow::Result<()> {
        let path = "/queue?removeFromClient=true&blocklist=false";
        let response = self.request(reqwest::Method::GET, &format!("/queue/bulk{}", path)).await?;
        if !response.status().is_success() {
            tracing::debug!(arr = %self.name, status = %response.status(), "cleanup queue returned non-success");
        }
        Ok(())
    }

    pub async fn validate(&self) -> anyhow::Result<bool> {
        let response = self.request(reqwest::Method::GET, "/system/status").await?;
        Ok(response.status().is_success())
    }
}

/// 10s scheduler (§4.G) invoking `CleanupQueue()` on every arr with `Cleanup=true`.
pub async fn run_cleanup_scheduler(arrs: Vec<Arc<ArrClient>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        for arr in arrs.iter().filter(|a| a.cleanup) {
            if let Err(e) = arr.cleanup_queue().await {
                tracing::warn!(arr = %arr.name, error = %e, "cleanup queue failed");
            }
        }
    }
}
