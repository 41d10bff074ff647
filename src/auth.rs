use crate::config::get_config;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// `<configPath>/auth.json` (§6 Persisted state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFile {
    pub username: String,
    pub password_bcrypt_hash: String,
    pub api_token: String,
}

pub struct AuthStore {
    path: PathBuf,
    inner: RwLock<AuthFile>,
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

impl AuthStore {
    pub async fn load_or_init(default_username: &str, default_password: &str) -> anyhow::Result<Self> {
        let path = get_config().config_path.join("auth.json");
        let auth = if path.exists() {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            let hash = bcrypt::hash(default_password, bcrypt::DEFAULT_COST)?;
            let auth = AuthFile {
                username: default_username.to_string(),
                password_bcrypt_hash: hash,
                api_token: random_token(),
            };
            let bytes = serde_json::to_vec_pretty(&auth)?;
            tokio::fs::write(&path, bytes).await?;
            auth
        };

        Ok(Self {
            path,
            inner: RwLock::new(auth),
        })
    }

    pub async fn verify_password(&self, username: &str, password: &str) -> bool {
        let auth = self.inner.read().await;
        auth.username == username
            && bcrypt::verify(password, &auth.password_bcrypt_hash).unwrap_or(false)
    }

    pub async fn verify_token(&self, token: &str) -> bool {
        let auth = self.inner.read().await;
        constant_time_eq(token.as_bytes(), auth.api_token.as_bytes())
    }

    pub async fn current_token(&self) -> String {
        self.inner.read().await.api_token.clone()
    }

    pub async fn refresh_token(&self) -> anyhow::Result<String> {
        let mut auth = self.inner.write().await;
        auth.api_token = random_token();
        let bytes = serde_json::to_vec_pretty(&*auth)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(auth.api_token.clone())
    }

    pub async fn update(&self, username: String, password: Option<String>) -> anyhow::Result<()> {
        let mut auth = self.inner.write().await;
        auth.username = username;
        if let Some(password) = password {
            auth.password_bcrypt_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        }
        let bytes = serde_json::to_vec_pretty(&*auth)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
