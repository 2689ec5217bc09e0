//! Message body storage
//!
//! Accepted bodies are streamed straight to a sink while the DATA phase
//! runs. The sink is keyed by a [`ContentId`], which is also what the
//! accepted-mail record carries so later consumers can find the body.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, BufWriter};
use tracing::debug;
use uuid::Uuid;

/// Opaque handle correlating a stored body with its metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(Uuid);

impl ContentId {
    /// A fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ContentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// Where message bodies go.
pub trait ContentStorage: Send + Sync + 'static {
    /// Writable stream for one message body.
    type Sink: AsyncWrite + Unpin + Send;

    /// Create the sink for `id`. `size_hint` is the expected body size in
    /// bytes and is used to pre-size write buffers.
    fn create_sink(
        &self,
        id: &ContentId,
        size_hint: usize,
    ) -> impl Future<Output = Result<Self::Sink>> + Send;

    /// Location of the body stored under `id`.
    fn path_for(&self, id: &ContentId) -> PathBuf;

    /// Delete the body stored under `id`. Removing a body that does not
    /// exist is not an error.
    fn remove(&self, id: &ContentId) -> impl Future<Output = Result<()>> + Send;
}

/// Stores each body as a file named after its [`ContentId`] inside one
/// directory.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ContentStorage for DirectoryStorage {
    type Sink = BufWriter<File>;

    async fn create_sink(&self, id: &ContentId, size_hint: usize) -> Result<Self::Sink> {
        let path = self.path_for(id);
        debug!("Creating content file {}", path.display());

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(BufWriter::with_capacity(size_hint, file))
    }

    fn path_for(&self, id: &ContentId) -> PathBuf {
        self.root.join(id.to_string())
    }

    async fn remove(&self, id: &ContentId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
