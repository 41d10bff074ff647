use crate::model::{Torrent, TorrentState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub type TorrentKey = (String, Option<String>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Size,
    AddedOn,
    CompletedOn,
    Progress,
    State,
    Category,
    DlSpeed,
    UpSpeed,
    Ratio,
}

/// §4.F — in-memory map keyed by (hash, category), persisted as
/// `torrents.json` with a debounced async save after every mutation.
pub struct TorrentStore {
    path: PathBuf,
    torrents: RwLock<HashMap<TorrentKey, Torrent>>,
    save_lock: Mutex<()>,
}

impl TorrentStore {
    pub async fn load(path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let torrents = if path.exists() {
            let data = tokio::fs::read(&path).await?;
            let list: Vec<Torrent> = serde_json::from_slice(&data).unwrap_or_default();
            list.into_iter().map(|t| ((t.info_hash.clone(), t.category.clone()), t)).collect()
        } else {
            HashMap::new()
        };

        Ok(Arc::new(Self {
            path,
            torrents: RwLock::new(torrents),
            save_lock: Mutex::new(()),
        }))
    }

    pub async fn upsert(self: &Arc<Self>, torrent: Torrent) {
        let key = (torrent.info_hash.clone(), torrent.category.clone());
        {
            let mut torrents = self.torrents.write().await;
            torrents.insert(key, torrent);
        }
        self.schedule_save();
    }

    pub async fn get(&self, hash: &str, category: Option<&str>) -> Option<Torrent> {
        let torrents = self.torrents.read().await;
        if let Some(category) = category {
            return torrents.get(&(hash.to_string(), Some(category.to_string()))).cloned();
        }
        torrents.values().find(|t| t.info_hash == hash).cloned()
    }

    pub async fn all(&self) -> Vec<Torrent> {
        self.torrents.read().await.values().cloned().collect()
    }

    pub async fn filter_by_state(&self, state: TorrentState) -> Vec<Torrent> {
        self.torrents.read().await.values().filter(|t| t.state == state).cloned().collect()
    }

    pub async fn filter_by_hashes(&self, hashes: &[String]) -> Vec<Torrent> {
        let set: std::collections::HashSet<&str> = hashes.iter().map(|h| h.as_str()).collect();
        self.torrents.read().await.values().filter(|t| set.contains(t.info_hash.as_str())).cloned().collect()
    }

    pub async fn sorted(&self, field: SortField, descending: bool) -> Vec<Torrent> {
        let mut all = self.all().await;
        all.sort_by(|a, b| {
            let ord = match field {
                SortField::Name => a.name.cmp(&b.name),
                SortField::Size => a.size.cmp(&b.size),
                SortField::AddedOn => a.added_on.cmp(&b.added_on),
                SortField::CompletedOn => a.completed_on.cmp(&b.completed_on),
                SortField::Progress => a.progress.partial_cmp(&b.progress).unwrap_or(std::cmp::Ordering::Equal),
                SortField::State => format!("{:?}", a.state).cmp(&format!("{:?}", b.state)),
                SortField::Category => a.category.cmp(&b.category),
                SortField::DlSpeed => a.download_speed.cmp(&b.download_speed),
                SortField::UpSpeed => a.upload_speed.cmp(&b.upload_speed),
                SortField::Ratio => a.ratio.partial_cmp(&b.ratio).unwrap_or(std::cmp::Ordering::Equal),
            };
            if descending { ord.reverse() } else { ord }
        });
        all
    }

    /// Cascading delete: removes the store entry; callers are responsible for
    /// removing the content path on disk, the remote debrid torrent, and any
    /// pending entry in E's queue, since those require capability references
    /// this store deliberately doesn't hold (§9 "Cyclic ownership").
    pub async fn remove(self: &Arc<Self>, hash: &str, category: Option<&str>) -> Option<Torrent> {
        let removed = {
            let mut torrents = self.torrents.write().await;
            if let Some(category) = category {
                torrents.remove(&(hash.to_string(), Some(category.to_string())))
            } else {
                let key = torrents
                    .keys()
                    .find(|(h, _)| h == hash)
                    .cloned();
                key.and_then(|k| torrents.remove(&k))
            }
        };
        if removed.is_some() {
            self.schedule_save();
        }
        removed
    }

    fn schedule_save(self: &Arc<Self>) {
        let store = self.clone();
        tokio::spawn(async move {
            let _guard = store.save_lock.lock().await;
            let snapshot: Vec<Torrent> = store.torrents.read().await.values().cloned().collect();
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&store.path, bytes).await {
                        tracing::warn!(error = %e, "failed to persist torrents.json");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialise torrent store"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(hash: &str, category: &str, size: u64) -> Torrent {
        Torrent {
            info_hash: hash.to_string(),
            category: Some(category.to_string()),
            name: format!("{hash}.mkv"),
            size,
            progress: 0.0,
            download_speed: 0,
            upload_speed: 0,
            eta_secs: 0,
            state: TorrentState::Queued,
            debrid: "torbox".to_string(),
            debrid_id: None,
            torrent_path: None,
            error_message: None,
            added_on: Utc::now(),
            completed_on: None,
            num_seeds: 0,
            ratio: 0.0,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TorrentStore::load(dir.path().join("torrents.json")).await.unwrap();
        store.upsert(sample("abc", "radarr", 100)).await;
        let found = store.get("abc", Some("radarr")).await;
        assert!(found.is_some());
        assert_eq!(found.unwrap().size, 100);
    }

    #[tokio::test]
    async fn sorted_by_size_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = TorrentStore::load(dir.path().join("torrents.json")).await.unwrap();
        store.upsert(sample("a", "radarr", 10)).await;
        store.upsert(sample("b", "radarr", 30)).await;
        store.upsert(sample("c", "radarr", 20)).await;
        let sorted = store.sorted(SortField::Size, true).await;
        let sizes: Vec<u64> = sorted.iter().map(|t| t.size).collect();
        assert_eq!(sizes, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn remove_cascades_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TorrentStore::load(dir.path().join("torrents.json")).await.unwrap();
        store.upsert(sample("abc", "radarr", 100)).await;
        let removed = store.remove("abc", Some("radarr")).await;
        assert!(removed.is_some());
        assert!(store.get("abc", Some("radarr")).await.is_none());
    }
}
