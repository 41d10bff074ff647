use crate::config::RcloneConfig;
use serde_json::json;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// §4.J — lifecycle of the child `rclone rcd` process and its mounts, talked
/// to exclusively over its RC HTTP JSON API (never by shelling to `rclone
/// mount` directly, except as the unmount fallback ladder below).
pub struct RcloneManager {
    config: RcloneConfig,
    config_path: std::path::PathBuf,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl RcloneManager {
    pub fn new(config: RcloneConfig, config_path: std::path::PathBuf) -> Self {
        Self {
            config,
            config_path,
            client: reqwest::Client::new(),
            child: Mutex::new(None),
        }
    }

    fn rc_url(&self, endpoint: &str) -> String {
        format!("http://127.0.0.1:{}/{}", self.config.rc_port, endpoint)
    }

    /// `Start(ctx)`: spawns `rclone rcd`, polling `/core/version` up to 30s.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("rcd")
            .arg("--rc-addr")
            .arg(format!(":{}", self.config.rc_port))
            .arg("--rc-no-auth")
            .arg("--config")
            .arg(&self.config_path)
            .args(&self.config.extra_args)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn()?;
        *self.child.lock().await = Some(child);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if self.client.post(self.rc_url("core/version")).send().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("rclone rcd did not become ready within 30s");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// `Mount(provider, webdavURL)`: creates a webdav remote then mounts its
    /// VFS, retrying up to 3 times with linear backoff.
    pub async fn mount(&self, provider: &str, webdav_url: &str, local_path: &str, vfs_opts: &RcloneVfsOptions) -> anyhow::Result<()> {
        let remote_name = format!("decypharr-{}", provider);

        let create_body = json!({
            "name": remote_name,
            "type": "webdav",
            "parameters": { "url": webdav_url, "vendor": "other" },
        });

        let mount_body = json!({
            "fs": format!("{}:", remote_name),
            "mountPoint": local_path,
            "vfsOpt": {
                "CacheMode": vfs_opts.cache_mode,
                "DirCacheTime": vfs_opts.dir_cache_time_secs,
                "ChunkSize": vfs_opts.chunk_size,
                "BufferSize": vfs_opts.buffer_size,
            },
            "mountOpt": {
                "UID": vfs_opts.uid,
                "GID": vfs_opts.gid,
                "Umask": vfs_opts.umask,
            },
        });

        let mut attempt = 0;
        loop {
            let created = self.client.post(self.rc_url("config/create")).json(&create_body).send().await;
            let mounted = match created {
                Ok(_) => self.client.post(self.rc_url("mount/mount")).json(&mount_body).send().await,
                Err(e) => Err(e),
            };

            match mounted {
                Ok(response) if response.status().is_success() => return Ok(()),
                _ if attempt >= 2 => anyhow::bail!("failed to mount {} after 3 attempts", provider),
                _ => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
    }

    /// `Unmount(provider)`: tries the RC API first, then an escalating ladder
    /// of shell fallbacks (§4.J).
    pub async fn unmount(&self, provider: &str, local_path: &str) -> anyhow::Result<()> {
        let body = json!({ "mountPoint": local_path });
        let response = self.client.post(self.rc_url("mount/unmount")).json(&body).send().await;
        if matches!(response, Ok(r) if r.status().is_success()) {
            return Ok(());
        }

        tracing::warn!(provider, "rc unmount failed, falling back to shell commands");
        for (bin, args) in [
            ("umount", vec![local_path]),
            ("umount", vec!["-l", local_path]),
            ("fusermount", vec!["-uz", local_path]),
            ("fusermount3", vec!["-uz", local_path]),
        ] {
            if Command::new(bin).args(&args).status().await.map(|s| s.success()).unwrap_or(false) {
                return Ok(());
            }
        }
        anyhow::bail!("could not unmount {}", provider)
    }

    /// `RefreshDir(provider, dirs)`: forget then refresh so directory entries
    /// are re-read after C's listings change.
    pub async fn refresh_dir(&self, local_path: &str, dirs: &[String]) -> anyhow::Result<()> {
        let body = json!({ "fs": local_path, "dir": dirs });
        self.client.post(self.rc_url("vfs/forget")).json(&body).send().await?;
        self.client.post(self.rc_url("vfs/refresh")).json(&body).send().await?;
        Ok(())
    }

    /// Health monitor (30s tick): lists each mount, remounting once on failure.
    pub async fn run_health_monitor(&self, mounts: HashMap<String, (String, String, String)>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            for (provider, (webdav_url, local_path, _remote_name)) in &mounts {
                let body = json!({ "fs": local_path, "remote": "" });
                let healthy = self
                    .client
                    .post(self.rc_url("operations/list"))
                    .json(&body)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);

                if !healthy {
                    tracing::warn!(provider, "mount unhealthy, attempting remount");
                    if let Err(e) = self.mount(provider, webdav_url, local_path, &RcloneVfsOptions::default()).await {
                        tracing::error!(provider, error = %e, "remount failed");
                    }
                }
            }
        }
    }

    /// `Stop()`: unmounts everything in parallel (30s cap), SIGINT the
    /// child, falling back to kill after 10s.
    pub async fn stop(&self, mounts: &[(String, String)]) {
        let unmounts = mounts.iter().map(|(provider, path)| self.unmount(provider, path));
        let _ = tokio::time::timeout(Duration::from_secs(30), futures_util::future::join_all(unmounts)).await;

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(pid) = child.id() {
                unsafe { libc_kill(pid as i32) };
            }
            if tokio::time::timeout(Duration::from_secs(10), child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
        }
    }
}

/// VFS mount options named in §4.J ("cache mode, dir-cache time, UID/GID,
/// umask, chunk sizes, buffer size, transfer count").
pub struct RcloneVfsOptions {
    pub cache_mode: String,
    pub dir_cache_time_secs: u64,
    pub chunk_size: String,
    pub buffer_size: String,
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
    pub transfers: u32,
}

impl Default for RcloneVfsOptions {
    fn default() -> Self {
        Self {
            cache_mode: "full".to_string(),
            dir_cache_time_secs: 30,
            chunk_size: "32M".to_string(),
            buffer_size: "32M".to_string(),
            uid: 1000,
            gid: 1000,
            umask: 0o22,
            transfers: 4,
        }
    }
}

unsafe fn libc_kill(pid: i32) {
    // SIGINT = 2; avoids pulling in the `libc` crate for a single syscall.
    unsafe extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    unsafe {
        kill(pid, 2);
    }
}
