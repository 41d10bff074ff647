pub mod placement;

use crate::arr::ArrClient;
use crate::cache::Cache;
use crate::debrid::DebridRegistry;
use crate::model::{ImportAction, ImportRequest, Torrent, TorrentState};
use crate::queue::{Admit, QueueController};
use crate::torrent_store::TorrentStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// §4.D — translates an `ImportRequest` into a submitted, polled, and placed
/// debrid download. Holds capability references only (registry, caches,
/// store, queue, arrs) — never a back-reference from those into itself,
/// matching §9's "Cyclic ownership" re-expression.
pub struct IngestOrchestrator {
    pub registry: Arc<DebridRegistry>,
    pub caches: HashMap<String, Arc<Cache>>,
    pub store: Arc<TorrentStore>,
    pub queue: Arc<QueueController>,
    pub arrs: HashMap<String, Arc<ArrClient>>,
    pub mount_paths: HashMap<String, PathBuf>,
    pub refresh_interval: Duration,
    pub max_downloads: usize,
}

impl IngestOrchestrator {
    /// `AddTorrent(ctx, ImportRequest)` (§4.D). Steps 1-6 of the algorithm.
    pub async fn add_torrent(&self, req: ImportRequest) {
        let hash = req.magnet.info_hash.clone();
        let category = req.category.clone();

        // Step 1: skeleton user-facing Torrent.
        let mut torrent = Torrent {
            info_hash: hash.clone(),
            category: category.clone(),
            name: req.magnet.name.clone().unwrap_or_else(|| hash.clone()),
            size: req.magnet.size,
            progress: 0.0,
            download_speed: 0,
            upload_speed: 0,
            eta_secs: 0,
            state: TorrentState::Queued,
            debrid: req.debrid.clone().unwrap_or_default(),
            debrid_id: None,
            torrent_path: None,
            error_message: None,
            added_on: chrono::Utc::now(),
            completed_on: None,
            num_seeds: 0,
            ratio: 0.0,
        };
        self.store.upsert(torrent.clone()).await;

        // Step 2: try the selected debrid, or all in order, until one accepts.
        let candidates: Vec<String> = match &req.debrid {
            Some(name) => vec![name.clone()],
            None => self.registry.names(),
        };

        let mut slot_exhausted_on = None;
        let mut last_error = None;
        let mut submitted = None;

        for name in &candidates {
            let Some(client) = self.registry.get(name) else { continue };
            match client.submit_magnet(&req.magnet).await {
                Ok(debrid_torrent) => {
                    submitted = Some((name.clone(), debrid_torrent));
                    break;
                }
                Err(e) if e.is_slot_exhaustion() => {
                    slot_exhausted_on = Some(name.clone());
                }
                Err(e) => last_error = Some(e),
            }
        }

        let Some((debrid_name, mut debrid_torrent)) = submitted else {
            if let Some(debrid_name) = slot_exhausted_on {
                torrent.debrid = debrid_name.clone();
                torrent.state = TorrentState::Queued;
                self.store.upsert(torrent).await;
                if self.queue.push(&debrid_name, req).is_err() {
                    tracing::warn!(hash = %hash, debrid = %debrid_name, "admission queue full, dropping import request");
                }
                return;
            }

            torrent.state = TorrentState::Error;
            torrent.error_message = Some(last_error.map(|e| e.message).unwrap_or_else(|| "no debrid accepted the magnet".to_string()));
            torrent.completed_on = Some(chrono::Utc::now());
            self.store.upsert(torrent).await;
            return;
        };

        torrent.debrid = debrid_name.clone();
        torrent.debrid_id = Some(debrid_torrent.id.clone());
        torrent.state = TorrentState::Downloading;
        self.store.upsert(torrent.clone()).await;

        // Step 3: downloadUncached precedence — override > arr setting > adapter default.
        let arr_override = req.arr.as_ref().and_then(|name| self.arrs.get(name)).and_then(|arr| arr.download_uncached);
        let adapter_default = self.registry.get(&debrid_name).map(|c| c.download_uncached_default()).unwrap_or(false);
        let download_uncached = req.download_uncached_override.or(arr_override).unwrap_or(adapter_default);

        // Step 4: poll CheckStatus until terminal.
        let client = match self.registry.get(&debrid_name) {
            Some(client) => client,
            None => return,
        };

        loop {
            tokio::time::sleep(self.refresh_interval).await;
            match client.check_status(&debrid_torrent.id).await {
                Ok(updated) => {
                    debrid_torrent = updated;
                    torrent.progress = debrid_torrent.progress;
                    torrent.download_speed = debrid_torrent.speed;
                    self.store.upsert(torrent.clone()).await;

                    if debrid_torrent.status.is_terminal() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(hash = %hash, error = %e, "check_status failed while polling");
                    break;
                }
            }
        }

        // A terminal `Error` status is a hard failure regardless of
        // `downloadUncached` — it never falls through to placement.
        if debrid_torrent.status == crate::model::DebridStatus::Error {
            let _ = client.delete_torrent(&debrid_torrent.id).await;
            torrent.state = TorrentState::Error;
            torrent.error_message = Some("debrid reported a terminal error status".to_string());
            torrent.completed_on = Some(chrono::Utc::now());
            self.store.upsert(torrent).await;
            self.fire_callback(&req, false).await;
            return;
        }

        if debrid_torrent.status != crate::model::DebridStatus::Downloaded && !download_uncached {
            let _ = client.delete_torrent(&debrid_torrent.id).await;
            torrent.state = TorrentState::Error;
            torrent.error_message = Some("content not cached and downloadUncached=false".to_string());
            torrent.completed_on = Some(chrono::Utc::now());
            self.store.upsert(torrent).await;
            self.fire_callback(&req, false).await;
            return;
        }

        // Step 5: placement.
        let placement_result = match req.action {
            ImportAction::Symlink => {
                if let Some(cache) = self.caches.get(&debrid_name) {
                    cache.process_torrent(debrid_torrent.clone());
                }
                let mount_path = self.mount_paths.get(&debrid_name).cloned().unwrap_or_default();
                let folder_name = self
                    .caches
                    .get(&debrid_name)
                    .and_then(|c| c.get_torrent(&debrid_torrent.info_hash))
                    .map(|c| c.folder_name)
                    .unwrap_or_else(|| debrid_torrent.name.clone());

                placement::place_symlinks(
                    &PathBuf::from(&req.download_folder),
                    category.as_deref(),
                    &folder_name,
                    &mount_path,
                    &debrid_torrent,
                )
                .await
            }
            ImportAction::Download => {
                placement::download_files(
                    &client,
                    &PathBuf::from(&req.download_folder),
                    category.as_deref(),
                    &debrid_torrent,
                    self.max_downloads,
                )
                .await
            }
        };

        // Step 6: finalise.
        match placement_result {
            Ok(path) => {
                torrent.torrent_path = Some(path.to_string_lossy().to_string());
                torrent.state = TorrentState::PausedUP;
                torrent.completed_on = Some(chrono::Utc::now());
                self.store.upsert(torrent).await;

                if let Some(arr_name) = &req.arr {
                    if let Some(arr) = self.arrs.get(arr_name) {
                        if let Err(e) = arr.refresh().await {
                            tracing::warn!(arr = %arr_name, error = %e, "failed to refresh arr after placement");
                        }
                    }
                }
                self.fire_callback(&req, true).await;
            }
            Err(e) => {
                tracing::warn!(hash = %hash, error = %e, "placement failed");
                let _ = client.delete_torrent(&debrid_torrent.id).await;
                torrent.state = TorrentState::Error;
                torrent.error_message = Some(e.to_string());
                torrent.completed_on = Some(chrono::Utc::now());
                self.store.upsert(torrent).await;
                self.fire_callback(&req, false).await;
            }
        }
    }

    async fn fire_callback(&self, req: &ImportRequest, success: bool) {
        let Some(url) = &req.callback_url else { return };
        let body = serde_json::json!({
            "info_hash": req.magnet.info_hash,
            "success": success,
        });
        if let Err(e) = reqwest::Client::new().post(url).json(&body).send().await {
            tracing::warn!(url = %url, error = %e, "callback delivery failed");
        }
    }
}

#[async_trait::async_trait]
impl Admit for IngestOrchestrator {
    async fn add_torrent(&self, req: ImportRequest) {
        IngestOrchestrator::add_torrent(self, req).await
    }
}
