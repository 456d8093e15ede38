//! Weight file downloader
//!
//! Instances are created only after their weight file exists on disk. The
//! downloader fills that gap: it fetches a model's `url` into the models
//! dir, collapsing concurrent requests for the same URL into one transfer
//! and remembering failed attempts so repeated misses fail fast for the
//! rest of the process lifetime.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};

pub struct Downloader {
    client: reqwest::Client,
    /// Per-URL locks; holding one serializes transfers of that URL.
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// URLs whose download failed. Not retried while the process lives.
    failed: std::sync::Mutex<HashSet<String>>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Downloader {
            client: reqwest::Client::new(),
            locks: tokio::sync::Mutex::new(HashMap::new()),
            failed: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Ensure `file` exists, downloading from `url` if necessary.
    ///
    /// A file already on disk short-circuits. A miss with no URL, or a
    /// miss after a failed attempt, is a resource error.
    pub async fn prepare(&self, file: &Path, url: Option<&str>) -> Result<()> {
        if file.exists() {
            return Ok(());
        }

        let Some(url) = url else {
            return Err(GatewayError::Resource(format!(
                "weight file {} is missing and no source url is configured",
                file.display()
            )));
        };

        if self.failed.lock().unwrap().contains(url) {
            return Err(GatewayError::Resource(format!(
                "download of {url} already failed; not retrying"
            )));
        }

        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(url.to_string()).or_default())
        };
        let _guard = lock.lock().await;

        // Another request may have completed the transfer while we waited.
        if file.exists() {
            return Ok(());
        }

        match self.download(url, file).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(url, error = %e, "model download failed");
                self.failed.lock().unwrap().insert(url.to_string());
                Err(e)
            }
        }
    }

    async fn download(&self, url: &str, file: &Path) -> Result<()> {
        info!(url, dest = %file.display(), "downloading model weights");

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::Resource(format!("cannot create {}: {e}", parent.display())))?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GatewayError::Resource(format!("download of {url} failed: {e}")))?;

        // Write to a temp name and rename, so a partial transfer never
        // looks like a complete weight file.
        let partial = file.with_extension("partial");
        let mut out = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| GatewayError::Resource(format!("cannot create {}: {e}", partial.display())))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::Resource(format!("download of {url} failed: {e}")))?;
            out.write_all(&chunk)
                .await
                .map_err(|e| GatewayError::Resource(format!("write failed: {e}")))?;
        }
        out.flush()
            .await
            .map_err(|e| GatewayError::Resource(format!("write failed: {e}")))?;
        drop(out);

        tokio::fs::rename(&partial, file)
            .await
            .map_err(|e| GatewayError::Resource(format!("rename failed: {e}")))?;

        info!(dest = %file.display(), "download complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("corral-dl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn existing_file_short_circuits() {
        let dir = temp_dir();
        let file = dir.join("model.gguf");
        std::fs::write(&file, b"weights").unwrap();

        let downloader = Downloader::new();
        downloader.prepare(&file, None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_without_url_is_a_resource_error() {
        let dir = temp_dir();
        let downloader = Downloader::new();
        let err = downloader
            .prepare(&dir.join("absent.gguf"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Resource(_)));
    }

    #[tokio::test]
    async fn downloads_and_dedups_concurrent_requests() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_handler = Arc::clone(&hits);

        let app = axum::Router::new().route(
            "/weights.gguf",
            axum::routing::get(move || {
                let hits = Arc::clone(&hits_for_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "fake weight bytes"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = temp_dir();
        let file = dir.join("weights.gguf");
        let url = format!("http://{addr}/weights.gguf");

        let downloader = Arc::new(Downloader::new());
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let downloader = Arc::clone(&downloader);
                let file = file.clone();
                let url = url.clone();
                tokio::spawn(async move { downloader.prepare(&file, Some(&url)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(std::fs::read(&file).unwrap(), b"fake weight bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_download_is_not_retried() {
        let dir = temp_dir();
        let file = dir.join("gone.gguf");
        // Nothing is listening here, so the first attempt fails fast.
        let url = "http://127.0.0.1:9/gone.gguf";

        let downloader = Downloader::new();
        let first = downloader.prepare(&file, Some(url)).await.unwrap_err();
        assert!(matches!(first, GatewayError::Resource(_)));

        let second = downloader.prepare(&file, Some(url)).await.unwrap_err();
        assert!(matches!(second, GatewayError::Resource(msg) if msg.contains("not retrying")));
    }
}
