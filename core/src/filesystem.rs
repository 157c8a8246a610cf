//! Source-agnostic filesystem abstraction the scanner walks over. The
//! `Local` source kind (spec §3) is the only production implementation;
//! tests use the in-memory fixture so the scanner never touches disk.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: u64,
    pub modified_unix: i64,
    pub mode: u32,
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn stat(&self, path: &Path) -> Result<Stat, CoreError>;

    /// Lists immediate children, names only, in arbitrary order (the
    /// scanner sorts before hashing — §3's directory checksum formula
    /// requires a stable child order).
    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CoreError>;

    async fn open(&self, path: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError>;
}

pub struct LocalFilesystem;

fn io_err(path: &Path, source: std::io::Error) -> CoreError {
    CoreError::Io { path: path.display().to_string(), source }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn stat(&self, path: &Path) -> Result<Stat, CoreError> {
        use std::os::unix::fs::MetadataExt;
        let meta = tokio::fs::metadata(path).await.map_err(|e| io_err(path, e))?;
        Ok(Stat {
            kind: if meta.is_dir() { EntryKind::Directory } else { EntryKind::File },
            size: meta.len(),
            modified_unix: meta.mtime(),
            mode: meta.mode(),
        })
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CoreError> {
        let mut dir = tokio::fs::read_dir(path).await.map_err(|e| io_err(path, e))?;
        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(path, e))? {
            out.push(entry.path());
        }
        Ok(out)
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| io_err(path, e))?;
        Ok(Box::new(file))
    }
}

/// In-memory fixture filesystem for tests, mirroring the teacher's
/// `MemoryBlockStore` pattern of pairing a disk-backed implementation with
/// a map-backed one for the same trait.
#[derive(Default)]
pub struct MemoryFilesystem {
    files: BTreeMap<PathBuf, (Vec<u8>, i64, u32)>,
    dirs: BTreeMap<PathBuf, (i64, u32)>,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), (contents.into(), 0, 0o100644));
        self
    }

    pub fn with_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dirs.insert(path.into(), (0, 0o040755));
        self
    }
}

#[async_trait]
impl Filesystem for MemoryFilesystem {
    async fn stat(&self, path: &Path) -> Result<Stat, CoreError> {
        if let Some((contents, mtime, mode)) = self.files.get(path) {
            return Ok(Stat { kind: EntryKind::File, size: contents.len() as u64, modified_unix: *mtime, mode: *mode });
        }
        if let Some((mtime, mode)) = self.dirs.get(path) {
            return Ok(Stat { kind: EntryKind::Directory, size: 0, modified_unix: *mtime, mode: *mode });
        }
        Err(CoreError::NotFound { entity: "path", id: path.display().to_string() })
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CoreError> {
        let mut children = Vec::new();
        for candidate in self.files.keys().chain(self.dirs.keys()) {
            if candidate.parent() == Some(path) {
                children.push(candidate.clone());
            }
        }
        Ok(children)
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        let (contents, _, _) =
            self.files.get(path).ok_or_else(|| CoreError::NotFound { entity: "file", id: path.display().to_string() })?;
        Ok(Box::new(std::io::Cursor::new(contents.clone())))
    }
}
