use crate::model::{Account, DownloadLink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// §4.B — ordered ring of accounts plus the per-account download-link cache.
/// Selection is round-robin skipping disabled accounts; link minting per
/// source link is serialised via `link_mutexes` so concurrent minters of the
/// same source link waste at most one call, never store two entries (§5).
pub struct AccountPool {
    accounts: RwLock<Vec<Account>>,
    cursor: AtomicUsize,
    links: RwLock<HashMap<String, DownloadLink>>,
    link_mutexes: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
            cursor: AtomicUsize::new(0),
            links: RwLock::new(HashMap::new()),
            link_mutexes: Mutex::new(HashMap::new()),
        }
    }

    /// Advances the round-robin pointer past disabled accounts, wrapping.
    pub async fn next_account(&self) -> Option<Account> {
        let accounts = self.accounts.read().await;
        if accounts.is_empty() {
            return None;
        }

        let len = accounts.len();
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            if !accounts[idx].disabled {
                return Some(accounts[idx].clone());
            }
        }

        None
    }

    pub async fn mark_account_disabled(&self, token: &str, reason: &str) {
        let mut accounts = self.accounts.write().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.token == token) {
            account.disabled = true;
            account.disabled_reason = Some(reason.to_string());
            tracing::warn!("account {} disabled: {}", token, reason);
        }
    }

    pub async fn store_download_link(&self, link: DownloadLink) {
        self.links.write().await.insert(link.source_link.clone(), link);
    }

    pub async fn get_download_link(&self, source_link: &str) -> Option<DownloadLink> {
        let mut links = self.links.write().await;
        match links.get(source_link) {
            Some(link) if link.is_expired() => {
                links.remove(source_link);
                None
            }
            Some(link) => Some(link.clone()),
            None => None,
        }
    }

    /// Evicts a link ahead of its TTL, e.g. after a 403/404 observed at
    /// stream time (§4.I, §7).
    pub async fn evict_download_link(&self, source_link: &str) {
        self.links.write().await.remove(source_link);
    }

    /// Called by the cache's download-links refresher to atomically replace
    /// the whole map (§4.B `SetDownloadLinks`).
    pub async fn set_download_links(&self, links: Vec<DownloadLink>) {
        let mut map = HashMap::with_capacity(links.len());
        for link in links {
            map.insert(link.source_link.clone(), link);
        }
        *self.links.write().await = map;
    }

    /// Hands back a per-source-link mutex so a caller can double-check the
    /// cache after acquiring the lock, mirroring `debrid.rs`'s `url_mutex`
    /// double-checked-locking pattern.
    pub async fn link_mutex(&self, source_link: &str) -> std::sync::Arc<Mutex<()>> {
        let mut mutexes = self.link_mutexes.lock().await;
        mutexes
            .entry(source_link.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(order: u32, token: &str, disabled: bool) -> Account {
        Account {
            order,
            token: token.to_string(),
            username: None,
            disabled,
            disabled_reason: None,
            traffic_used: 0,
        }
    }

    #[tokio::test]
    async fn next_account_skips_disabled_and_wraps() {
        let pool = AccountPool::new(vec![
            account(0, "a", false),
            account(1, "b", true),
            account(2, "c", false),
        ]);

        let first = pool.next_account().await.unwrap();
        let second = pool.next_account().await.unwrap();
        let third = pool.next_account().await.unwrap();
        assert_eq!(first.token, "a");
        assert_eq!(second.token, "c");
        assert_eq!(third.token, "a");
    }

    #[tokio::test]
    async fn next_account_returns_none_when_all_disabled() {
        let pool = AccountPool::new(vec![account(0, "a", true)]);
        assert!(pool.next_account().await.is_none());
    }
}
