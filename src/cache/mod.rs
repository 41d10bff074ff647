use crate::config::FolderNaming;
use crate::debrid::SharedDebridClient;
use crate::helpers::should_ignore_path::{FilePolicy, should_ignore_file};
use crate::model::{CachedTorrent, DebridTorrent};
use crate::rclone::RcloneManager;
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

pub mod ratelimiter;

/// One ingest diagnostic entry, retained for recent-activity views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestRecord {
    pub info_hash: String,
    pub name: String,
    pub status: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// A named virtual directory whose membership is a regex filter over file paths.
pub struct VirtualDir {
    pub name: String,
    pub filter: Regex,
}

/// §4.C — a per-debrid in-memory index of torrents and files, with
/// background refreshers, listing materialisation, and broken-file lookup.
/// Holds only a capability reference to the client it refreshes from (§9
/// "Cyclic ownership") — never the other way round.
pub struct Cache {
    debrid_name: String,
    client: SharedDebridClient,
    folder_naming: FolderNaming,
    file_policy: FilePolicy,
    virtual_dirs: Vec<VirtualDir>,

    torrents: DashMap<String, CachedTorrent>,
    names: DashMap<String, String>,
    listings: RwLock<std::collections::HashMap<String, Vec<String>>>,
    ingests: RwLock<Vec<IngestRecord>>,

    listings_dirty: AtomicBool,
    listings_notify: Notify,
}

const MAX_INGEST_RECORDS: usize = 200;

impl Cache {
    pub fn new(
        debrid_name: String,
        client: SharedDebridClient,
        folder_naming: FolderNaming,
        file_policy: FilePolicy,
        virtual_dirs: Vec<VirtualDir>,
    ) -> Arc<Self> {
        Arc::new(Self {
            debrid_name,
            client,
            folder_naming,
            file_policy,
            virtual_dirs,
            torrents: DashMap::new(),
            names: DashMap::new(),
            listings: RwLock::new(std::collections::HashMap::new()),
            ingests: RwLock::new(Vec::new()),
            listings_dirty: AtomicBool::new(false),
            listings_notify: Notify::new(),
        })
    }

    pub fn debrid_name(&self) -> &str {
        &self.debrid_name
    }

    fn canonical_folder_name(&self, name: &str) -> String {
        match self.folder_naming {
            FolderNaming::Original => name.to_string(),
            FolderNaming::OriginalNoExt => name.rsplit_once('.').map(|(base, _)| base.to_string()).unwrap_or_else(|| name.to_string()),
            FolderNaming::Filename => name.rsplit('/').next().unwrap_or(name).to_string(),
        }
    }

    /// `ProcessTorrent(t)` (§4.C): canonicalises the folder name, rejects
    /// duplicates by info-hash, applies file filters, and marks listings dirty.
    pub fn process_torrent(&self, torrent: DebridTorrent) {
        if self.torrents.contains_key(&torrent.info_hash) {
            return;
        }

        let mut base_name = self.canonical_folder_name(&torrent.name);
        let mut suffix = 1;
        while let Some(existing) = self.names.get(&base_name) {
            if *existing == torrent.info_hash {
                break;
            }
            suffix += 1;
            base_name = format!("{}-{}", self.canonical_folder_name(&torrent.name), suffix);
        }

        let is_complete = !torrent.files.is_empty();
        self.names.insert(base_name.clone(), torrent.info_hash.clone());
        self.ingest_record(&torrent.info_hash, &torrent.name, "processed");
        self.torrents.insert(
            torrent.info_hash.clone(),
            CachedTorrent {
                torrent,
                added_on: chrono::Utc::now(),
                is_complete,
                folder_name: base_name,
            },
        );
        self.mark_listings_dirty();
    }

    pub fn remove_torrent(&self, info_hash: &str) {
        if let Some((_, cached)) = self.torrents.remove(info_hash) {
            self.names.remove(&cached.folder_name);
            self.mark_listings_dirty();
        }
    }

    pub fn get_torrent(&self, info_hash: &str) -> Option<CachedTorrent> {
        self.torrents.get(info_hash).map(|e| e.clone())
    }

    /// `GetTorrentByName(name)` (§4.C): O(1) via the `names` index.
    pub fn get_torrent_by_name(&self, name: &str) -> Option<CachedTorrent> {
        let info_hash = self.names.get(name)?;
        self.torrents.get(info_hash.value()).map(|e| e.clone())
    }

    pub fn all_torrents(&self) -> Vec<CachedTorrent> {
        self.torrents.iter().map(|e| e.clone()).collect()
    }

    fn file_is_visible(&self, path: &str, size: u64) -> bool {
        !should_ignore_file(path, size, &self.file_policy)
    }

    /// `GetBrokenFiles(t, [filename])` (§4.C): a filename is broken if it is
    /// absent from the cached file list, or its link no longer resolves.
    pub async fn get_broken_files(&self, info_hash: &str, filenames: &[String]) -> Vec<String> {
        let Some(cached) = self.get_torrent(info_hash) else {
            return filenames.to_vec();
        };

        let mut broken = Vec::new();
        for filename in filenames {
            let Some(file) = cached.torrent.files.get(filename) else {
                broken.push(filename.clone());
                continue;
            };

            if !self.file_is_visible(&file.path, file.size) {
                broken.push(filename.clone());
                continue;
            }

            if self.client.get_download_link(&cached.torrent, &file.id).await.is_err() {
                broken.push(filename.clone());
            }
        }
        broken
    }

    fn ingest_record(&self, info_hash: &str, name: &str, status: &str) {
        if let Ok(mut ingests) = self.ingests.try_write() {
            if ingests.len() >= MAX_INGEST_RECORDS {
                ingests.remove(0);
            }
            ingests.push(IngestRecord {
                info_hash: info_hash.to_string(),
                name: name.to_string(),
                status: status.to_string(),
                at: chrono::Utc::now(),
            });
        }
    }

    pub async fn recent_ingests(&self) -> Vec<IngestRecord> {
        self.ingests.read().await.clone()
    }

    fn mark_listings_dirty(&self) {
        self.listings_dirty.store(true, Ordering::Release);
        self.listings_notify.notify_one();
    }

    /// Rebuilds `__all__`, `__bad__`, and user-configured virtual directories.
    async fn rematerialise_listings(&self) {
        let mut all = Vec::new();
        let mut bad = Vec::new();
        let mut virtual_hits: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();

        for entry in self.torrents.iter() {
            let cached = entry.value();
            for file in cached.torrent.files.values() {
                let visible = self.file_is_visible(&file.path, file.size);
                let listing_path = format!("{}/{}", cached.folder_name, file.path);

                if visible {
                    all.push(listing_path.clone());
                    for dir in &self.virtual_dirs {
                        if dir.filter.is_match(&file.path) {
                            virtual_hits.entry(dir.name.clone()).or_default().push(listing_path.clone());
                        }
                    }
                } else {
                    bad.push(listing_path);
                }
            }
        }

        all.sort();
        bad.sort();

        let mut listings = self.listings.write().await;
        listings.clear();
        listings.insert("__all__".to_string(), all);
        listings.insert("__bad__".to_string(), bad);
        for (name, mut paths) in virtual_hits {
            paths.sort();
            listings.insert(name, paths);
        }
    }

    pub async fn listing(&self, name: &str) -> Vec<String> {
        self.listings.read().await.get(name).cloned().unwrap_or_default()
    }

    pub async fn listing_names(&self) -> Vec<String> {
        self.listings.read().await.keys().cloned().collect()
    }

    /// Background loop 1 (§4.C): periodic full refresh against the adapter,
    /// diffed into add/remove, with 500ms-debounced listing re-materialisation.
    pub async fn run_torrents_refresh(self: Arc<Self>, interval: Duration, workers: usize, cancel: CancellationToken) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let upstream = match self.client.get_torrents().await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(debrid = %self.debrid_name, error = %e, "torrents refresh failed");
                    continue;
                }
            };

            let upstream_hashes: HashSet<String> = upstream.iter().map(|t| t.info_hash.clone()).collect();

            let mut handles = Vec::new();
            for torrent in upstream {
                if self.torrents.contains_key(&torrent.info_hash) {
                    continue;
                }
                let cache = self.clone();
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    cache.process_torrent(torrent);
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }

            let stale: Vec<String> = self
                .torrents
                .iter()
                .map(|e| e.key().clone())
                .filter(|hash| !upstream_hashes.contains(hash))
                .collect();
            for hash in stale {
                self.remove_torrent(&hash);
            }
        }
    }

    /// Debounces listing rebuilds behind a 500ms coalescing window so a burst
    /// of `process_torrent`/`remove_torrent` calls triggers one rebuild. When
    /// this debrid is rclone-mounted, `rclone` carries the manager and the
    /// local mount path so the VFS is told to forget/refresh its directory
    /// entries right after (§4.J `RefreshDir`).
    pub async fn run_listings_debouncer(self: Arc<Self>, rclone: Option<(Arc<RcloneManager>, String)>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.listings_notify.notified() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }

            if self.listings_dirty.swap(false, Ordering::AcqRel) {
                self.rematerialise_listings().await;

                if let Some((manager, local_path)) = &rclone {
                    let dirs = self.listing_names().await;
                    if let Err(e) = manager.refresh_dir(local_path, &dirs).await {
                        tracing::warn!(debrid = %self.debrid_name, error = %e, "rclone refresh_dir failed");
                    }
                }
            }
        }
    }

    /// Background loop 2 (§4.C): periodically rebuild B's download-link map
    /// from the debrid's own view of currently-issued links.
    pub async fn run_download_links_refresh(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let torrents = self.all_torrents();
            for cached in torrents {
                if let Err(e) = self.client.get_file_download_links(&cached.torrent).await {
                    tracing::debug!(debrid = %self.debrid_name, hash = %cached.torrent.info_hash, error = %e, "download-links refresh skipped entry");
                }
            }
        }
    }
}
