use crate::debrid::SharedDebridClient;
use crate::model::DebridTorrent;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

/// §4.D step 5, symlink placements: create per-file symlinks under
/// `<downloadFolder>/<category>/<torrent-no-ext>/` pointing into the
/// WebDAV-mounted (or externally managed) tree at `<mountPath>/<folderName>`.
pub async fn place_symlinks(
    download_folder: &Path,
    category: Option<&str>,
    folder_name: &str,
    mount_path: &Path,
    torrent: &DebridTorrent,
) -> anyhow::Result<PathBuf> {
    let base_no_ext = folder_name.rsplit_once('.').map(|(base, _)| base).unwrap_or(folder_name);
    let mut dest_dir = download_folder.to_path_buf();
    if let Some(category) = category {
        dest_dir.push(category);
    }
    dest_dir.push(base_no_ext);
    tokio::fs::create_dir_all(&dest_dir).await?;

    let source_dir = mount_path.join(folder_name);
    for file in torrent.files.values() {
        let file_name = file.path.rsplit('/').next().unwrap_or(&file.path);
        let link_path = dest_dir.join(file_name);
        let source_path = source_dir.join(&file.path);

        if tokio::fs::symlink_metadata(&link_path).await.is_ok() {
            continue;
        }

        #[cfg(unix)]
        tokio::fs::symlink(&source_path, &link_path).await?;
        #[cfg(not(unix))]
        tokio::fs::copy(&source_path, &link_path).await.map(|_| ())?;
    }

    Ok(dest_dir)
}

/// §4.D step 5, download placement: stream every file through a
/// `DownloadLink` with bounded concurrency (`MaxDownloads`), verifying size
/// on completion.
pub async fn download_files(
    client: &SharedDebridClient,
    download_folder: &Path,
    category: Option<&str>,
    torrent: &DebridTorrent,
    max_downloads: usize,
) -> anyhow::Result<PathBuf> {
    let mut dest_dir = download_folder.to_path_buf();
    if let Some(category) = category {
        dest_dir.push(category);
    }
    dest_dir.push(&torrent.name);
    tokio::fs::create_dir_all(&dest_dir).await?;

    let semaphore = Arc::new(Semaphore::new(max_downloads.max(1)));
    let mut handles = Vec::new();

    for file in torrent.files.values().cloned().collect::<Vec<_>>() {
        let permit = semaphore.clone().acquire_owned().await?;
        let client = client.clone();
        let torrent = torrent.clone();
        let dest_dir = dest_dir.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let link = client.get_download_link(&torrent, &file.id).await?;
            let file_name = file.path.rsplit('/').next().unwrap_or(&file.path);
            let dest_path = dest_dir.join(file_name);

            let response = reqwest::get(&link.resolved_url).await?;
            let mut out = tokio::fs::File::create(&dest_path).await?;
            let mut stream = response.bytes_stream();
            let mut written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                written += chunk.len() as u64;
                out.write_all(&chunk).await?;
            }
            out.flush().await?;

            if file.size > 0 && written != file.size {
                anyhow::bail!("size mismatch downloading {}: expected {} got {}", file_name, file.size, written);
            }
            Ok::<(), anyhow::Error>(())
        }));
    }

    for handle in handles {
        handle.await??;
    }

    Ok(dest_dir)
}
