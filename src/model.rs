use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// §3 "Magnet". `info_hash` is the identity key across the system: 40
/// lowercase hex chars, canonicalised from base32 if the source was 32
/// chars (see `helpers::parse_magnet_uri::canonicalise_info_hash`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Magnet {
    pub info_hash: String,
    pub name: Option<String>,
    pub size: u64,
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torrent_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportAction {
    Symlink,
    Download,
}

/// §3 "ImportRequest". Immutable; consumed by the ingest orchestrator
/// exactly once, or re-queued by the queue controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub download_folder: String,
    pub debrid: Option<String>,
    pub magnet: Magnet,
    pub arr: Option<String>,
    pub action: ImportAction,
    pub download_uncached_override: Option<bool>,
    pub callback_url: Option<String>,
    pub category: Option<String>,
}

/// §3 "Torrent (user-facing)" states, as surfaced to the qBittorrent facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TorrentState {
    Queued,
    Downloading,
    PausedUP,
    Error,
}

impl TorrentState {
    pub fn as_qbittorrent_str(&self) -> &'static str {
        match self {
            TorrentState::Queued => "queuedDL",
            TorrentState::Downloading => "downloading",
            TorrentState::PausedUP => "pausedUP",
            TorrentState::Error => "error",
        }
    }
}

/// §3 "Torrent (user-facing)". Key = (info_hash, category).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torrent {
    pub info_hash: String,
    pub category: Option<String>,
    pub name: String,
    pub size: u64,
    pub progress: f32,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub eta_secs: u64,
    pub state: TorrentState,
    pub debrid: String,
    pub debrid_id: Option<String>,
    pub torrent_path: Option<String>,
    pub error_message: Option<String>,
    pub added_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub num_seeds: u32,
    pub ratio: f64,
}

impl Torrent {
    pub fn is_ready(&self) -> bool {
        (self.progress >= 1.0) && self.torrent_path.is_some()
    }
}

/// §3 "DebridTorrent". Ephemeral; rebuilt on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebridFile {
    pub id: String,
    pub size: u64,
    pub path: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebridStatus {
    Downloading,
    Queued,
    Downloaded,
    Error,
}

impl DebridStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DebridStatus::Downloaded | DebridStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebridTorrent {
    pub id: String,
    pub debrid_name: String,
    pub info_hash: String,
    pub name: String,
    pub size: u64,
    pub status: DebridStatus,
    pub progress: f32,
    pub speed: u64,
    pub added_on: DateTime<Utc>,
    pub files: HashMap<String, DebridFile>,
}

/// §3 "CachedTorrent".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTorrent {
    pub torrent: DebridTorrent,
    pub added_on: DateTime<Utc>,
    pub is_complete: bool,
    pub folder_name: String,
}

/// §3 "DownloadLink".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLink {
    pub account_token: String,
    pub source_link: String,
    pub resolved_url: String,
    pub filename: String,
    pub size: u64,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DownloadLink {
    pub fn new(account_token: String, source_link: String, resolved_url: String, filename: String, size: u64, ttl_secs: i64) -> Self {
        let generated_at = Utc::now();
        Self {
            account_token,
            source_link,
            resolved_url,
            filename,
            size,
            generated_at,
            expires_at: generated_at + chrono::Duration::seconds(ttl_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// §3 "Account".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub order: u32,
    pub token: String,
    pub username: Option<String>,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    pub traffic_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairJobStatus {
    Started,
    Processing,
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// §3 "RepairJob".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairJob {
    pub id: uuid::Uuid,
    pub arrs: Vec<String>,
    pub media_ids: Option<Vec<u64>>,
    pub broken_items: HashMap<String, Vec<String>>,
    pub status: RepairJobStatus,
    pub auto_process: bool,
    pub recurrent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// §3 "Mount". Exactly one per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub provider: String,
    pub local_path: String,
    pub webdav_url: String,
    pub mounted: bool,
    pub mounted_at: Option<DateTime<Utc>>,
    pub rclone_config_name: String,
}
