use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebridKind {
    RealDebrid,
    Torbox,
    DebridLink,
    AllDebrid,
}

impl DebridKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebridKind::RealDebrid => "realdebrid",
            DebridKind::Torbox => "torbox",
            DebridKind::DebridLink => "debridlink",
            DebridKind::AllDebrid => "alldebrid",
        }
    }
}

/// One account credential for a debrid. Multiple accounts form the ring
/// `AccountPool` rotates over (§4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebridAccountConfig {
    pub token: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderNaming {
    Original,
    OriginalNoExt,
    Filename,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 5,
            per_minute: 60,
            per_hour: 1000,
            per_day: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebridConfig {
    pub name: String,
    pub kind: DebridKind,
    pub accounts: Vec<DebridAccountConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Adapter-level default for `downloadUncached` (§4.D, lowest-priority rung).
    #[serde(default)]
    pub download_uncached: bool,
    #[serde(default)]
    pub use_webdav: bool,
    #[serde(default = "default_folder_naming")]
    pub folder_naming: FolderNaming,
    pub mount_path: PathBuf,
    #[serde(default)]
    pub add_samples: bool,
    #[serde(default)]
    pub min_file_size: u64,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_folder_naming() -> FolderNaming {
    FolderNaming::OriginalNoExt
}

fn default_max_file_size() -> u64 {
    u64::MAX
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrKind {
    Sonarr,
    Radarr,
    Lidarr,
    Readarr,
}

impl ArrKind {
    /// Infers the arr family from host/name substrings (§4.G).
    pub fn infer(name: &str, host: &str) -> Self {
        let haystack = format!("{} {}", name, host).to_lowercase();
        if haystack.contains("radarr") {
            ArrKind::Radarr
        } else if haystack.contains("lidarr") {
            ArrKind::Lidarr
        } else if haystack.contains("readarr") {
            ArrKind::Readarr
        } else {
            ArrKind::Sonarr
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrConfig {
    pub name: String,
    pub host: String,
    pub api_key: String,
    #[serde(default)]
    pub kind: Option<ArrKind>,
    #[serde(default)]
    pub cleanup: bool,
    /// Per-arr override in §4.D's precedence, one rung above the adapter default.
    #[serde(default)]
    pub download_uncached: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_remove_stalled_after_secs")]
    pub remove_stalled_after_secs: u64,
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_remove_stalled_after_secs() -> u64 {
    48 * 3600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            remove_stalled_after_secs: default_remove_stalled_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Cron expression, e.g. "0 0 3 * * *" for daily at 3am.
    #[serde(default = "default_repair_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub auto_process: bool,
    #[serde(default = "default_true")]
    pub recurrent: bool,
    #[serde(default = "default_repair_workers")]
    pub workers: usize,
    /// Set when repair should probe a zurg instance instead of the internal cache.
    #[serde(default)]
    pub zurg_url: Option<String>,
}

fn default_repair_schedule() -> String {
    "0 0 3 * * *".to_string()
}
fn default_repair_workers() -> usize {
    4
}
fn default_true() -> bool {
    true
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            schedule: default_repair_schedule(),
            auto_process: false,
            recurrent: true,
            workers: default_repair_workers(),
            zurg_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcloneConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rc_port")]
    pub rc_port: u16,
    #[serde(default = "default_rc_bin")]
    pub binary: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_rc_port() -> u16 {
    5572
}
fn default_rc_bin() -> String {
    "rclone".to_string()
}

impl Default for RcloneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rc_port: default_rc_port(),
            binary: default_rc_bin(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub config_path: PathBuf,
    pub download_folder: PathBuf,
    pub debrids: Vec<DebridConfig>,
    #[serde(default)]
    pub arrs: Vec<ArrConfig>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub rclone: RcloneConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default = "default_max_downloads")]
    pub max_downloads: usize,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_torrents_refresh_interval_secs")]
    pub torrents_refresh_interval_secs: u64,
    #[serde(default = "default_download_links_refresh_interval_secs")]
    pub download_links_refresh_interval_secs: u64,
    #[serde(default = "default_auto_expire_links_after_secs")]
    pub auto_expire_links_after_secs: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub sab_enabled: bool,
}

fn default_max_downloads() -> usize {
    5
}
fn default_refresh_interval_secs() -> u64 {
    10
}
fn default_torrents_refresh_interval_secs() -> u64 {
    15
}
fn default_download_links_refresh_interval_secs() -> u64 {
    40 * 60
}
fn default_auto_expire_links_after_secs() -> i64 {
    3 * 24 * 3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_http_timeout_secs() -> u64 {
    60
}

static CONFIG: once_cell::sync::OnceCell<Config> = once_cell::sync::OnceCell::new();

pub fn get_config() -> &'static Config {
    CONFIG.get().expect("config not initialised")
}

/// Loads `<configPath>/config.json`, merges env overrides, and fills in the
/// defaults named throughout §4. `config_dir` is `--config <dir>` (§6 CLI),
/// falling back to `$DECYPHARR_CONFIG_DIR` or `/data`.
pub fn load_config(config_dir: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = config_dir
        .or_else(|| std::env::var("DECYPHARR_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/data"));

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    let config_file = config_dir.join("config.json");
    let mut builder = config::Config::builder()
        .set_default("config_path", config_dir.to_string_lossy().to_string())?
        .set_default(
            "download_folder",
            config_dir.join("downloads").to_string_lossy().to_string(),
        )?
        .set_default("max_downloads", default_max_downloads() as i64)?
        .set_default("refresh_interval_secs", default_refresh_interval_secs())?
        .set_default(
            "torrents_refresh_interval_secs",
            default_torrents_refresh_interval_secs(),
        )?
        .set_default(
            "download_links_refresh_interval_secs",
            default_download_links_refresh_interval_secs(),
        )?
        .set_default(
            "auto_expire_links_after_secs",
            default_auto_expire_links_after_secs(),
        )?
        .set_default("max_retries", default_max_retries())?
        .set_default("http_timeout_secs", default_http_timeout_secs())?
        .set_default("sab_enabled", false)?
        .set_default("categories", vec!["sonarr", "radarr"])?;

    if config_file.exists() {
        builder = builder.add_source(config::File::from(config_file));
    }

    builder = builder.add_source(config::Environment::with_prefix("decypharr").separator("__"));

    let built = builder.build()?;
    let config: Config = built.try_deserialize()?;

    if !config.download_folder.exists() {
        std::fs::create_dir_all(&config.download_folder)?;
    }

    if config.debrids.is_empty() {
        tracing::warn!("no debrid providers configured; nothing will be able to download");
    }

    CONFIG
        .set(config)
        .map_err(|_| "config already initialised".to_string())?;
    Ok(())
}
