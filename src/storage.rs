//! Object storage port and a filesystem-backed implementation.
//!
//! Handles look like `/b/<bucket>/<name>` so records stay valid if the
//! backing store moves; readers parse the name back out of the handle.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::{DreamError, Result};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Read the object a previously returned handle points at.
    async fn read_file(&self, handle: &str) -> Result<Vec<u8>>;

    /// Store `data` under `name` and return a handle for it.
    async fn write_file(&self, name: &str, data: &[u8]) -> Result<String>;
}

/// Stores objects as plain files under `<root>/<bucket>/<name>`.
pub struct FsStorage {
    root: PathBuf,
    bucket: String,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DreamError::Storage(format!("invalid object name: {name}")));
        }
        Ok(self.root.join(&self.bucket).join(relative))
    }

    fn name_from_handle(&self, handle: &str) -> Result<String> {
        let prefix = format!("/b/{}/", self.bucket);
        match handle.strip_prefix(&prefix) {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(DreamError::Storage(format!("malformed handle: {handle}"))),
        }
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn read_file(&self, handle: &str) -> Result<Vec<u8>> {
        let name = self.name_from_handle(handle)?;
        let path = self.path_for(&name)?;
        Ok(fs::read(path).await?)
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<String> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;

        Ok(format!("/b/{}/{}", self.bucket, name))
    }
}
