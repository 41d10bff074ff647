pub mod accounts;
pub mod arr;
pub mod auth;
pub mod cache;
pub mod config;
pub mod debrid;
pub mod error;
pub mod helpers;
pub mod httpclient;
pub mod ingest;
pub mod internal_api;
pub mod model;
pub mod qbittorrent;
pub mod queue;
pub mod rclone;
pub mod repair;
pub mod sab;
pub mod torrent_store;
pub mod webdav;

use arr::ArrClient;
use cache::Cache;
use debrid::DebridRegistry;
use ingest::IngestOrchestrator;
use queue::QueueController;
use repair::RepairWorker;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared state behind every inbound protocol surface (qBit, SAB, internal
/// API). WebDAV is mounted with its own narrower `webdav::WebdavState`
/// since it only ever needs the caches and the registry.
pub struct AppState {
    pub store: Arc<torrent_store::TorrentStore>,
    pub ingest: Arc<IngestOrchestrator>,
    pub registry: Arc<DebridRegistry>,
    pub caches: HashMap<String, Arc<Cache>>,
    pub queue: Arc<QueueController>,
    pub arrs: HashMap<String, Arc<ArrClient>>,
    pub repair: Arc<RepairWorker>,
    pub auth: Arc<auth::AuthStore>,
}
