use crate::arr::ArrClient;
use crate::cache::Cache;
use crate::config::RepairConfig;
use crate::model::{RepairJob, RepairJobStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// How a repair job should classify broken files for a given arr's library.
pub enum RepairSource {
    /// Self-served WebDAV: look up the torrent in the matching `Cache`.
    Webdav,
    /// External zurg instance, probed over HTTP.
    Zurg { base_url: String },
    /// Plain files on disk (no symlink indirection).
    PlainFiles,
}

struct JobHandle {
    cancel: CancellationToken,
}

/// §4.H — scheduled scan of arr libraries for missing/unreadable media.
/// Persisted jobs survive restart only in `pending` state (§3 "RepairJob").
pub struct RepairWorker {
    path: std::path::PathBuf,
    jobs: RwLock<HashMap<uuid::Uuid, RepairJob>>,
    handles: Mutex<HashMap<uuid::Uuid, JobHandle>>,
    caches: HashMap<String, Arc<Cache>>,
    arrs: HashMap<String, Arc<ArrClient>>,
    source: RepairSource,
    config: RepairConfig,
}

impl RepairWorker {
    pub async fn load(
        path: std::path::PathBuf,
        caches: HashMap<String, Arc<Cache>>,
        arrs: HashMap<String, Arc<ArrClient>>,
        source: RepairSource,
        config: RepairConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let jobs = if path.exists() {
            let data = tokio::fs::read(&path).await?;
            let all: Vec<RepairJob> = serde_json::from_slice(&data).unwrap_or_default();
            // Only `pending` jobs survive restart (§3 "RepairJob").
            all.into_iter()
                .filter(|j| j.status == RepairJobStatus::Pending)
                .map(|j| (j.id, j))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Arc::new(Self {
            path,
            jobs: RwLock::new(jobs),
            handles: Mutex::new(HashMap::new()),
            caches,
            arrs,
            source,
            config,
        }))
    }

    /// Preflight (§4.H): if serving WebDAV ourselves, at least one cache must
    /// be non-empty; if using zurg, its version endpoint must answer 200.
    pub async fn preflight(&self) -> anyhow::Result<()> {
        match &self.source {
            RepairSource::Webdav => {
                if self.caches.values().all(|c| c.all_torrents().is_empty()) {
                    anyhow::bail!("repair preflight failed: no non-empty cache available for webdav source");
                }
            }
            RepairSource::Zurg { base_url } => {
                let response = reqwest::get(format!("{}/http/version", base_url)).await?;
                if !response.status().is_success() {
                    anyhow::bail!("repair preflight failed: zurg version endpoint returned {}", response.status());
                }
            }
            RepairSource::PlainFiles => {}
        }
        Ok(())
    }

    async fn save(&self) {
        let jobs: Vec<RepairJob> = self.jobs.read().await.values().cloned().collect();
        if let Ok(bytes) = serde_json::to_vec_pretty(&jobs) {
            if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                tracing::warn!(error = %e, "failed to persist repair.json");
            }
        }
    }

    pub async fn start_job(self: &Arc<Self>, arrs: Vec<String>, media_ids: Option<Vec<u64>>, auto_process: bool, recurrent: bool) -> uuid::Uuid {
        let job = RepairJob {
            id: uuid::Uuid::new_v4(),
            arrs,
            media_ids,
            broken_items: HashMap::new(),
            status: RepairJobStatus::Started,
            auto_process,
            recurrent,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let id = job.id;
        self.jobs.write().await.insert(id, job);

        let cancel = CancellationToken::new();
        self.handles.lock().await.insert(id, JobHandle { cancel: cancel.clone() });

        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_job(id, cancel).await;
        });

        id
    }

    /// `StopJob(id)` (§4.H): cancels the job's context and marks it
    /// `cancelled`, serialised under the job's own entry so this can't race a
    /// concurrent terminal transition from `run_job` (§9 Open Question).
    pub async fn stop_job(&self, id: uuid::Uuid) -> bool {
        let Some(handle) = self.handles.lock().await.remove(&id) else { return false };
        handle.cancel.cancel();

        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            if !matches!(job.status, RepairJobStatus::Completed | RepairJobStatus::Failed) {
                job.status = RepairJobStatus::Cancelled;
                job.updated_at = chrono::Utc::now();
            }
        }
        drop(jobs);
        self.save().await;
        true
    }

    /// `GET /api/repair/jobs` (§6) lists every job currently tracked in
    /// memory, including ones that won't survive a restart.
    pub async fn jobs(&self) -> Vec<RepairJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn process_job(&self, id: uuid::Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else { return false };
        if job.status != RepairJobStatus::Pending {
            return false;
        }

        let broken = job.broken_items.clone();
        job.status = RepairJobStatus::Processing;
        job.updated_at = chrono::Utc::now();
        drop(jobs);

        for (arr_name, files) in broken {
            let Some(arr) = self.arrs.get(&arr_name) else { continue };
            let ids: Vec<u64> = files.iter().filter_map(|f| f.parse::<u64>().ok()).collect();
            let _ = arr.delete_files(&ids).await;
            let _ = arr.search_missing(&ids).await;
        }

        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.status = RepairJobStatus::Completed;
            job.updated_at = chrono::Utc::now();
        }
        drop(jobs);
        self.save().await;
        true
    }

    async fn run_job(self: Arc<Self>, id: uuid::Uuid, cancel: CancellationToken) {
        {
            let mut jobs = self.jobs.write().await;
            if let Some(job) = jobs.get_mut(&id) {
                job.status = RepairJobStatus::Processing;
                job.updated_at = chrono::Utc::now();
            }
        }

        let (arr_names, media_ids, auto_process) = {
            let jobs = self.jobs.read().await;
            let job = jobs.get(&id).unwrap();
            (job.arrs.clone(), job.media_ids.clone(), job.auto_process)
        };

        let mut broken_items: HashMap<String, Vec<String>> = HashMap::new();

        for arr_name in &arr_names {
            if cancel.is_cancelled() {
                return;
            }
            let Some(arr) = self.arrs.get(arr_name) else { continue };
            let media = match arr.get_media(media_ids.as_ref().and_then(|ids| ids.first().copied())).await {
                Ok(media) => media,
                Err(e) => {
                    tracing::warn!(arr = %arr_name, error = %e, "repair: failed to list media");
                    continue;
                }
            };

            let mut broken = Vec::new();
            for item in media {
                if cancel.is_cancelled() {
                    return;
                }
                for file in &item.files {
                    if self.is_broken(&file.path).await {
                        broken.push(file.id.to_string());
                    }
                }
            }
            if !broken.is_empty() {
                broken_items.insert(arr_name.clone(), broken);
            }
        }

        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&id) {
            job.broken_items = broken_items;
            job.status = if auto_process { RepairJobStatus::Processing } else { RepairJobStatus::Pending };
            job.updated_at = chrono::Utc::now();
        }
        drop(jobs);
        self.save().await;

        if auto_process {
            self.process_job(id).await;
        }

        self.handles.lock().await.remove(&id);
    }

    /// Classifies a single media path as broken per §4.H's `source` dispatch.
    async fn is_broken(&self, path: &str) -> bool {
        match &self.source {
            RepairSource::Webdav => {
                let folder = Path::new(path).parent().and_then(|p| p.file_name()).map(|s| s.to_string_lossy().to_string());
                let Some(folder) = folder else { return true };
                for cache in self.caches.values() {
                    if let Some(cached) = cache.get_torrent_by_name(&folder) {
                        let file_name = Path::new(path).file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                        let broken = cache.get_broken_files(&cached.torrent.info_hash, &[file_name]).await;
                        return !broken.is_empty();
                    }
                }
                true
            }
            RepairSource::Zurg { base_url } => {
                let url = format!("{}/http/__all__/{}", base_url, path.trim_start_matches('/'));
                match reqwest::get(&url).await {
                    Ok(response) => !response.status().is_success(),
                    Err(_) => true,
                }
            }
            RepairSource::PlainFiles => match tokio::fs::File::open(path).await {
                Ok(mut file) => {
                    use tokio::io::AsyncReadExt;
                    let mut buf = [0u8; 1024];
                    file.read(&mut buf).await.is_err()
                }
                Err(_) => true,
            },
        }
    }
}

/// Cron-scheduled recurring job launcher (§4.H "Scheduling uses a cron-like
/// expression parsed to the next fire time").
pub async fn run_schedule(worker: Arc<RepairWorker>, schedule: String, arrs: Vec<String>, cancel: CancellationToken) {
    use std::str::FromStr;
    let Ok(expr) = cron::Schedule::from_str(&schedule) else {
        tracing::error!(schedule = %schedule, "invalid repair cron expression, scheduler disabled");
        return;
    };

    loop {
        let now = chrono::Utc::now();
        let Some(next) = expr.after(&now).next() else { return };
        let wait = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(1));

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if cancel.is_cancelled() {
            return;
        }

        let auto_process = worker.config.auto_process;
        let recurrent = worker.config.recurrent;
        worker.clone().start_job(arrs.clone(), None, auto_process, recurrent).await;

        if !recurrent {
            return;
        }
    }
}
