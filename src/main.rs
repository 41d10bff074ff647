use clap::Parser;
use decypharr::arr::{self, ArrClient};
use decypharr::auth::AuthStore;
use decypharr::cache::{Cache, VirtualDir};
use decypharr::config::{self, DebridKind, get_config};
use decypharr::debrid::alldebrid::AllDebridClient;
use decypharr::debrid::debridlink::DebridLinkClient;
use decypharr::debrid::realdebrid::RealDebridClient;
use decypharr::debrid::torbox::TorboxClient;
use decypharr::debrid::{DebridRegistry, SharedDebridClient};
use decypharr::helpers::should_ignore_path::FilePolicy;
use decypharr::ingest::IngestOrchestrator;
use decypharr::internal_api;
use decypharr::qbittorrent::mimic_qbittorrent;
use decypharr::queue::QueueController;
use decypharr::rclone::{RcloneManager, RcloneVfsOptions};
use decypharr::repair::{RepairSource, RepairWorker, run_schedule};
use decypharr::sab::mimic_sabnzbd;
use decypharr::torrent_store::TorrentStore;
use decypharr::webdav::{self, WebdavState};
use decypharr::AppState;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `decypharr --config <dir>` (§6 CLI).
#[derive(Parser, Debug)]
#[command(name = "decypharr")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let default_level = if std::env::var("DEBUG").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match std::env::var("LOG_PATH") {
        Ok(path) => {
            let dir = std::path::Path::new(&path).parent().unwrap_or(std::path::Path::new(".")).to_path_buf();
            let file_name = std::path::Path::new(&path).file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_else(|| "decypharr.log".to_string());
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leaked deliberately: the guard must outlive the process, and this runs once at startup.
            Box::leak(Box::new(guard));
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn build_debrid_client(cfg: &config::DebridConfig, auto_expire_links_after_secs: i64) -> anyhow::Result<SharedDebridClient> {
    let client: SharedDebridClient = match cfg.kind {
        DebridKind::RealDebrid => Arc::new(RealDebridClient::new(
            cfg.name.clone(),
            &cfg.accounts,
            &cfg.rate_limit,
            cfg.download_uncached,
            auto_expire_links_after_secs,
        )?),
        DebridKind::Torbox => Arc::new(TorboxClient::new(
            cfg.name.clone(),
            &cfg.accounts,
            &cfg.rate_limit,
            cfg.download_uncached,
            auto_expire_links_after_secs,
        )?),
        DebridKind::DebridLink => Arc::new(DebridLinkClient::new(
            cfg.name.clone(),
            &cfg.accounts,
            &cfg.rate_limit,
            cfg.download_uncached,
            auto_expire_links_after_secs,
        )?),
        DebridKind::AllDebrid => Arc::new(AllDebridClient::new(
            cfg.name.clone(),
            &cfg.accounts,
            &cfg.rate_limit,
            cfg.download_uncached,
            auto_expire_links_after_secs,
        )?),
    };
    Ok(client)
}

/// Generic retry wrapper for background tasks (teacher's `main.rs` pattern):
/// up to 3 attempts, 5-minute delay, resets the counter if the task ran for
/// more than 60s before failing, kills the process once exhausted.
async fn run_with_retry<F, Fut>(task_name: &str, task_factory: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    const MAX_ATTEMPTS: u32 = 3;
    const RETRY_DELAY: Duration = Duration::from_secs(300);
    const RESET_THRESHOLD: Duration = Duration::from_secs(60);

    let mut attempts = 0;
    loop {
        attempts += 1;
        let start = tokio::time::Instant::now();
        task_factory().await;
        let runtime = start.elapsed();

        if runtime >= RESET_THRESHOLD {
            attempts = 0;
        }
        if attempts >= MAX_ATTEMPTS {
            tracing::error!("{} exited {} times consecutively, killing process", task_name, MAX_ATTEMPTS);
            std::process::exit(1);
        }
        warn!("{} exited after {:?}, restarting in {}s", task_name, runtime, RETRY_DELAY.as_secs());
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    config::load_config(cli.config).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let cfg = get_config();

    let root_cancel = CancellationToken::new();
    let auto_expire = cfg.auto_expire_links_after_secs;

    let mut registry_clients = Vec::new();
    let mut caches = HashMap::new();
    let mut mount_paths = HashMap::new();
    let mut webdav_caches: HashMap<String, Arc<Cache>> = HashMap::new();

    for debrid_cfg in &cfg.debrids {
        let client = build_debrid_client(debrid_cfg, auto_expire)?;
        let file_policy = FilePolicy {
            add_samples: debrid_cfg.add_samples,
            min_file_size: debrid_cfg.min_file_size,
            max_file_size: debrid_cfg.max_file_size,
        };
        let cache = Cache::new(debrid_cfg.name.clone(), client.clone(), debrid_cfg.folder_naming, file_policy, Vec::<VirtualDir>::new());

        mount_paths.insert(debrid_cfg.name.clone(), debrid_cfg.mount_path.clone());
        if debrid_cfg.use_webdav {
            webdav_caches.insert(debrid_cfg.name.clone(), cache.clone());
        }
        caches.insert(debrid_cfg.name.clone(), cache);
        registry_clients.push(client);
    }

    let registry = Arc::new(DebridRegistry::new(registry_clients));

    let arrs: HashMap<String, Arc<ArrClient>> = cfg.arrs.iter().map(|a| (a.name.clone(), Arc::new(ArrClient::new(a)))).collect();

    let store = TorrentStore::load(cfg.config_path.join("torrents.json")).await?;
    let queue = Arc::new(QueueController::new(&registry.names(), cfg.queue.capacity));

    let ingest = Arc::new(IngestOrchestrator {
        registry: registry.clone(),
        caches: caches.clone(),
        store: store.clone(),
        queue: queue.clone(),
        arrs: arrs.clone(),
        mount_paths,
        refresh_interval: Duration::from_secs(cfg.refresh_interval_secs),
        max_downloads: cfg.max_downloads,
    });

    let repair_source = if let Some(zurg_url) = &cfg.repair.zurg_url {
        RepairSource::Zurg { base_url: zurg_url.clone() }
    } else if !webdav_caches.is_empty() {
        RepairSource::Webdav
    } else {
        RepairSource::PlainFiles
    };
    let repair = RepairWorker::load(cfg.config_path.join("repair.json"), caches.clone(), arrs.clone(), repair_source, cfg.repair.clone()).await?;
    if let Err(e) = repair.preflight().await {
        warn!(error = %e, "repair preflight check failed; repair jobs may misclassify broken files");
    }

    let auth = Arc::new(AuthStore::load_or_init("admin", &std::env::var("DECYPHARR_SECRET_KEY").unwrap_or_else(|_| "decypharr".to_string())).await?);

    let state = Arc::new(AppState {
        store: store.clone(),
        ingest: ingest.clone(),
        registry: registry.clone(),
        caches: caches.clone(),
        queue: queue.clone(),
        arrs: arrs.clone(),
        repair: repair.clone(),
        auth,
    });

    // rclone must be built before the cache loops so `run_listings_debouncer`
    // can be handed the (manager, mount path) pair for any rclone-mounted debrid.
    let mut rclone_hooks: HashMap<String, (Arc<RcloneManager>, String)> = HashMap::new();
    let rclone_manager = if cfg.rclone.enabled {
        let manager = Arc::new(RcloneManager::new(cfg.rclone.clone(), cfg.config_path.join("rclone")));
        manager.start().await?;

        let bind_port = std::env::var("QBIT_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8282);
        let mut mounts = HashMap::new();
        for debrid_cfg in &cfg.debrids {
            if !debrid_cfg.use_webdav {
                continue;
            }
            let webdav_url = format!("http://127.0.0.1:{}/webdav/{}", bind_port, debrid_cfg.name);
            let local_path = debrid_cfg.mount_path.to_string_lossy().into_owned();
            manager.mount(&debrid_cfg.name, &webdav_url, &local_path, &RcloneVfsOptions::default()).await?;
            mounts.insert(debrid_cfg.name.clone(), (webdav_url, local_path.clone(), format!("decypharr-{}", debrid_cfg.name)));
            rclone_hooks.insert(debrid_cfg.name.clone(), (manager.clone(), local_path));
        }

        let monitor_manager = manager.clone();
        let cancel = root_cancel.clone();
        tokio::spawn(async move { monitor_manager.run_health_monitor(mounts, cancel).await });
        Some(manager)
    } else {
        None
    };

    // Background loops (§4.C, §4.E, §4.G, §4.H), each under the root cancellation hierarchy (§5).
    const CACHE_REFRESH_CONCURRENCY: usize = 8;
    for (name, cache) in &caches {
        tokio::spawn(cache.clone().run_torrents_refresh(Duration::from_secs(cfg.torrents_refresh_interval_secs), CACHE_REFRESH_CONCURRENCY, root_cancel.clone()));
        tokio::spawn(cache.clone().run_listings_debouncer(rclone_hooks.get(name).cloned(), root_cancel.clone()));
        tokio::spawn(cache.clone().run_download_links_refresh(Duration::from_secs(cfg.download_links_refresh_interval_secs), root_cancel.clone()));
    }

    {
        let queue = queue.clone();
        let registry = registry.clone();
        let ingest: Arc<dyn decypharr::queue::Admit> = ingest.clone();
        let cancel = root_cancel.clone();
        tokio::spawn(async move { queue.run_admission_scheduler(registry, ingest, cancel).await });
    }
    {
        let queue = queue.clone();
        let store = store.clone();
        let registry = registry.clone();
        let remove_stalled_after_secs = cfg.queue.remove_stalled_after_secs;
        let cancel = root_cancel.clone();
        tokio::spawn(async move { queue.run_stalled_reaper(store, registry, remove_stalled_after_secs, cancel).await });
    }

    let cleanup_arrs: Vec<Arc<ArrClient>> = arrs.values().cloned().collect();
    {
        let cancel = root_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = run_with_retry("arr cleanup scheduler", || arr::run_cleanup_scheduler(cleanup_arrs.clone(), cancel.clone())) => {}
            }
        });
    }

    if cfg.repair.recurrent {
        let repair = repair.clone();
        let schedule = cfg.repair.schedule.clone();
        let all_arrs: Vec<String> = arrs.keys().cloned().collect();
        let cancel = root_cancel.clone();
        tokio::spawn(run_schedule(repair, schedule, all_arrs, cancel));
    }

    let webdav_state = WebdavState {
        caches: Arc::new(webdav_caches),
        registry: registry.clone(),
    };

    let mut app = axum::Router::new()
        .merge(mimic_qbittorrent().with_state(state.clone()))
        .merge(internal_api::router(state.clone()))
        .merge(webdav::router(webdav_state))
        .route("/", axum::routing::get(|| async { "decypharr" }));

    if cfg.sab_enabled {
        app = app.merge(mimic_sabnzbd().with_state(state.clone()));
    }

    let bind_port = std::env::var("QBIT_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8282);
    let listener = TcpListener::bind(("0.0.0.0", bind_port)).await?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(root_cancel.clone())).await?;

    if let Some(manager) = rclone_manager {
        let unmounts: Vec<(String, String)> = cfg
            .debrids
            .iter()
            .filter(|d| d.use_webdav)
            .map(|d| (d.name.clone(), d.mount_path.to_string_lossy().into_owned()))
            .collect();
        manager.stop(&unmounts).await;
    }

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received termination signal"),
    }

    cancel.cancel();
}
