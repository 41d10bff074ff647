use crate::debrid::DebridRegistry;
use crate::model::{ImportRequest, TorrentState};
use crate::torrent_store::TorrentStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Called back into by the admission scheduler once a debrid reports a free
/// slot. Implemented by the ingest orchestrator to avoid a `queue -> ingest ->
/// queue` import cycle (§9 "Cyclic ownership" — lookups stay by string id).
#[async_trait::async_trait]
pub trait Admit: Send + Sync {
    async fn add_torrent(&self, req: ImportRequest);
}

/// §4.E — bounded per-debrid admission queue plus a stalled-torrent reaper.
pub struct QueueController {
    senders: HashMap<String, mpsc::Sender<ImportRequest>>,
    receivers: tokio::sync::Mutex<HashMap<String, mpsc::Receiver<ImportRequest>>>,
}

impl QueueController {
    pub fn new(debrid_names: &[String], capacity: usize) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for name in debrid_names {
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(name.clone(), tx);
            receivers.insert(name.clone(), rx);
        }
        Self {
            senders,
            receivers: tokio::sync::Mutex::new(receivers),
        }
    }

    /// `Push(req)` (§4.E): fails fast if the bounded channel is full.
    pub fn push(&self, debrid: &str, req: ImportRequest) -> Result<(), ImportRequest> {
        match self.senders.get(debrid) {
            Some(sender) => sender.try_send(req).map_err(|e| match e {
                mpsc::error::TrySendError::Full(req) => req,
                mpsc::error::TrySendError::Closed(req) => req,
            }),
            None => Err(req),
        }
    }

    /// Admission scheduler: every 30s, for each debrid with a non-empty queue,
    /// query available slots and pop requests while slots remain.
    pub async fn run_admission_scheduler(
        &self,
        registry: Arc<DebridRegistry>,
        admit: Arc<dyn Admit>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut receivers = self.receivers.lock().await;
            for (debrid_name, receiver) in receivers.iter_mut() {
                let Some(client) = registry.get(debrid_name) else { continue };
                let mut slots = match client.get_available_slots().await {
                    Ok(slots) => slots,
                    Err(e) => {
                        tracing::warn!(debrid = %debrid_name, error = %e, "could not read available slots");
                        continue;
                    }
                };

                while slots > 0 {
                    match receiver.try_recv() {
                        Ok(req) => {
                            admit.add_torrent(req).await;
                            slots -= 1;
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    }

    /// Stalled-torrent reaper: every minute, removes torrents stuck
    /// downloading with zero seeds past `remove_stalled_after_secs`.
    pub async fn run_stalled_reaper(
        &self,
        store: Arc<TorrentStore>,
        registry: Arc<DebridRegistry>,
        remove_stalled_after_secs: u64,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = chrono::Utc::now();
            for torrent in store.filter_by_state(TorrentState::Downloading).await {
                let Some(debrid_id) = &torrent.debrid_id else { continue };
                if torrent.num_seeds != 0 {
                    continue;
                }
                let age = (now - torrent.added_on).num_seconds().max(0) as u64;
                if age <= remove_stalled_after_secs {
                    continue;
                }

                tracing::info!(hash = %torrent.info_hash, age, "reaping stalled torrent");
                if let Some(client) = registry.get(&torrent.debrid) {
                    if let Err(e) = client.delete_torrent(debrid_id).await {
                        tracing::warn!(hash = %torrent.info_hash, error = %e, "failed to delete stalled torrent remotely");
                    }
                }
                store.remove(&torrent.info_hash, torrent.category.as_deref()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImportAction, Magnet};

    fn req(hash: &str) -> ImportRequest {
        ImportRequest {
            download_folder: "/data/downloads".to_string(),
            debrid: Some("torbox".to_string()),
            magnet: Magnet {
                info_hash: hash.to_string(),
                name: None,
                size: 0,
                link: format!("magnet:?xt=urn:btih:{hash}"),
                torrent_bytes: None,
            },
            arr: None,
            action: ImportAction::Symlink,
            download_uncached_override: None,
            callback_url: None,
            category: None,
        }
    }

    #[test]
    fn push_fails_fast_when_full() {
        let queue = QueueController::new(&["torbox".to_string()], 1);
        assert!(queue.push("torbox", req("a")).is_ok());
        assert!(queue.push("torbox", req("b")).is_err());
    }

    #[test]
    fn push_fails_for_unknown_debrid() {
        let queue = QueueController::new(&["torbox".to_string()], 10);
        assert!(queue.push("realdebrid", req("a")).is_err());
    }
}
