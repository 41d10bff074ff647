pub mod alldebrid;
pub mod debridlink;
pub mod realdebrid;
pub mod torbox;

use crate::error::HTTPError;
use crate::model::{Account, DebridTorrent, DownloadLink, Magnet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// §4.A — one capability set implemented uniformly over four REST APIs.
#[async_trait]
pub trait DebridClient: Send + Sync {
    fn name(&self) -> &str;

    async fn submit_magnet(&self, magnet: &Magnet) -> Result<DebridTorrent, HTTPError>;
    async fn check_status(&self, id: &str) -> Result<DebridTorrent, HTTPError>;
    async fn get_torrent(&self, id: &str) -> Result<DebridTorrent, HTTPError>;
    async fn get_torrents(&self) -> Result<Vec<DebridTorrent>, HTTPError>;

    /// Re-fetches the remote torrent's current state. None of the four
    /// providers expose a distinct "update" endpoint, so this is a refresh
    /// rather than a push of local field changes.
    async fn update_torrent(&self, torrent: &DebridTorrent) -> Result<DebridTorrent, HTTPError>;
    async fn delete_torrent(&self, id: &str) -> Result<(), HTTPError>;

    async fn get_download_link(&self, torrent: &DebridTorrent, file_id: &str) -> Result<DownloadLink, HTTPError>;
    async fn get_file_download_links(&self, torrent: &DebridTorrent) -> Result<Vec<DownloadLink>, HTTPError>;

    /// Forces eviction of a cached `DownloadLink` ahead of its TTL, used by
    /// the WebDAV streamer's link-rotation-on-403/404 path (§4.I, §7).
    async fn invalidate_download_link(&self, source_link: &str);

    /// May return an empty map if the provider has no instant-availability endpoint.
    async fn is_available(&self, hashes: &[String]) -> Result<HashMap<String, bool>, HTTPError>;

    async fn get_available_slots(&self) -> Result<i64, HTTPError>;
    async fn get_profile(&self) -> Result<serde_json::Value, HTTPError>;
    async fn accounts(&self) -> Vec<Account>;

    /// Lowest-priority rung of §4.D's `downloadUncached` precedence.
    fn download_uncached_default(&self) -> bool;
}

pub type SharedDebridClient = Arc<dyn DebridClient>;

/// All configured debrid clients, keyed by configured name. Ingest and repair
/// look adapters up by this key, never holding a cache-side reference back to
/// the client (§9 "Cyclic ownership").
pub struct DebridRegistry {
    clients: HashMap<String, SharedDebridClient>,
}

impl DebridRegistry {
    pub fn new(clients: Vec<SharedDebridClient>) -> Self {
        let clients = clients.into_iter().map(|c| (c.name().to_string(), c)).collect();
        Self { clients }
    }

    pub fn get(&self, name: &str) -> Option<SharedDebridClient> {
        self.clients.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<SharedDebridClient> {
        self.clients.values().cloned().collect()
    }
}
