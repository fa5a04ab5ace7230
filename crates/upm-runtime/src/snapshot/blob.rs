//! File-system blob storage for snapshot artifacts.
//!
//! Blobs live at `<root>/<trainer_id>/v<version>-<snapshot_id>.<ext>`.
//! Writes are atomic via temp file + fsync + rename, so a reader never sees
//! a partially written artifact.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use upm_core::{SnapshotId, TrainerId};

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of the blob for a snapshot.
    pub fn path_for(
        &self,
        trainer_id: &TrainerId,
        version: u64,
        snapshot_id: &SnapshotId,
        extension: &str,
    ) -> PathBuf {
        self.root
            .join(sanitize(trainer_id.as_str()))
            .join(format!("v{}-{}.{}", version, snapshot_id, extension))
    }

    /// Atomically write `data` to `path`. Returns the number of bytes written.
    pub async fn write(&self, path: &Path, data: &[u8]) -> io::Result<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = tmp_path_for(path);
        match write_and_sync(&tmp_path, data).await {
            Ok(()) => {}
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(data.len() as u64)
    }

    pub async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    /// Remove a blob. A blob that is already gone counts as removed.
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn write_and_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Keep trainer ids from escaping the snapshot root.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_layout() {
        let store = BlobStore::new("/var/upm");
        let path = store.path_for(&"fraud".into(), 7, &"abc".into(), "gz");
        assert_eq!(path, PathBuf::from("/var/upm/fraud/v7-abc.gz"));
    }

    #[test]
    fn test_trainer_id_cannot_escape_root() {
        let store = BlobStore::new("/var/upm");
        let path = store.path_for(&"../../etc".into(), 1, &"x".into(), "bin");
        assert!(path.starts_with("/var/upm"));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let path = store.path_for(&"t1".into(), 1, &"s1".into(), "bin");

        let written = store.write(&path, b"params").await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(store.read(&path).await.unwrap(), b"params");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        store.remove(&path).await.unwrap();
        assert!(!path.exists());
        // Removing again is fine
        store.remove(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let path = store.path_for(&"t1".into(), 1, &"s1".into(), "bin");
        store.write(&path, b"first").await.unwrap();
        store.write(&path, b"second").await.unwrap();
        assert_eq!(store.read(&path).await.unwrap(), b"second");
    }
}
