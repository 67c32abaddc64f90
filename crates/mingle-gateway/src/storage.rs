use std::path::PathBuf;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use tokio::fs;
use tracing::info;

/// Narrow contract to the object-storage collaborator: store bytes at a
/// path, get back the URL the attachment record will reference. Uploads
/// happen before the message that references them is persisted.
pub trait ObjectStore: Send + Sync {
    fn upload<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<String>>;
}

/// Filesystem-backed store: each object is a flat file under the storage
/// directory, served back under `public_base`.
pub struct FsObjectStore {
    dir: PathBuf,
    public_base: String,
}

impl FsObjectStore {
    pub async fn new(dir: PathBuf, public_base: String) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Attachment storage directory: {}", dir.display());
        Ok(Self { dir, public_base })
    }
}

impl ObjectStore for FsObjectStore {
    fn upload<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            // Object paths are server-generated, but never trust them with
            // path traversal anyway.
            anyhow::ensure!(
                !path.split('/').any(|seg| seg == ".." || seg.is_empty()),
                "invalid object path: {}",
                path
            );

            let target = self.dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(&target, bytes)
                .await
                .with_context(|| format!("writing {}", target.display()))?;

            Ok(format!("{}/{}", self.public_base.trim_end_matches('/'), path))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_writes_file_and_returns_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), "/files".into())
            .await
            .unwrap();

        let url = store
            .upload("chat/conv-1/photo.png", b"png bytes".to_vec())
            .await
            .unwrap();

        assert_eq!(url, "/files/chat/conv-1/photo.png");
        let on_disk = tokio::fs::read(dir.path().join("chat/conv-1/photo.png"))
            .await
            .unwrap();
        assert_eq!(on_disk, b"png bytes");
    }

    #[tokio::test]
    async fn upload_rejects_traversal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), "/files".into())
            .await
            .unwrap();

        assert!(store.upload("../escape.bin", vec![1]).await.is_err());
    }
}
