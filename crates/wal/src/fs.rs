//! Filesystem abstraction (`spec.md` §6). Statelessly path-based; real
//! socket/file primitives are external collaborators (`spec.md` §1), so
//! this crate only ever talks through this trait, letting storage tests run
//! against `tempfile::TempDir` without touching the real filesystem.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    async fn exists(&self, path: &Path) -> bool;
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Overwrites the file at `path` with `data` in full.
    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Appends `data` to the file at `path`, creating it if absent.
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove_file(&self, path: &Path) -> io::Result<()>;
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;
    async fn file_size(&self, path: &Path) -> io::Result<u64>;
    /// Recursively copies the tree rooted at `from` to `to` (`spec.md` §6's
    /// `copy(source, target)`).
    async fn copy_tree(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Forces a durable write of the file at `path`, used when a commit
    /// requests `fsync`.
    async fn fsync(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFilesystem;

#[async_trait]
impl Filesystem for TokioFilesystem {
    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        tokio::fs::write(path, data).await
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }

    async fn copy_tree(&self, from: &Path, to: &Path) -> io::Result<()> {
        copy_tree_recursive(from.to_path_buf(), to.to_path_buf()).await
    }

    async fn fsync(&self, path: &Path) -> io::Result<()> {
        tokio::fs::File::open(path).await?.sync_all().await
    }
}

fn copy_tree_recursive(
    from: PathBuf,
    to: PathBuf,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                copy_tree_recursive(entry.path(), target).await?;
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
        Ok(())
    })
}
