//! Filesystem scanner (spec component C5): walks a `Source` depth-first,
//! post-order, deduplicating `FsEntry` rows by a content/metadata
//! checksum so unchanged subtrees are recognized across runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::error::CoreError;
use crate::filesystem::{EntryKind, Filesystem};
use crate::model::{FsEntry, FsEntryKind, Id, Scan, ScanState, Source};
use crate::repo::Repository;

/// `H(path ‖ mtime ‖ mode ‖ size ‖ source_id)` for a file (§3).
fn file_checksum(source_id: Id, rel_path: &str, mtime: i64, mode: u32, size: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(rel_path.as_bytes());
    hasher.update(mtime.to_le_bytes());
    hasher.update(mode.to_le_bytes());
    hasher.update(size.to_le_bytes());
    hasher.update(source_id.0.as_bytes());
    hasher.finalize().to_vec()
}

/// `H(path ‖ mtime ‖ mode ‖ child_checksums ‖ source_id)` for a directory,
/// with children contributing in name-sorted order so the checksum is
/// stable regardless of the filesystem's own iteration order (§3).
fn directory_checksum(
    source_id: Id,
    rel_path: &str,
    mtime: i64,
    mode: u32,
    child_checksums: &[Vec<u8>],
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(rel_path.as_bytes());
    hasher.update(mtime.to_le_bytes());
    hasher.update(mode.to_le_bytes());
    for checksum in child_checksums {
        hasher.update(checksum);
    }
    hasher.update(source_id.0.as_bytes());
    hasher.finalize().to_vec()
}

pub struct Scanner {
    filesystem: Arc<dyn Filesystem>,
    repository: Arc<dyn Repository>,
}

impl Scanner {
    pub fn new(filesystem: Arc<dyn Filesystem>, repository: Arc<dyn Repository>) -> Self {
        Self { filesystem, repository }
    }

    /// Runs (or resumes) the scan for `upload_id`, walking `source` from
    /// its root. On success the `Scan` row is `Completed` with
    /// `root_fs_entry_id` set; errors leave it `Failed` with a message.
    #[instrument(skip(self, source), fields(upload_id = %upload_id, source_id = %source.id))]
    pub async fn run(&self, upload_id: Id, source: &Source) -> Result<Scan, CoreError> {
        let mut scan = match self.repository.get_scan_for_upload(upload_id).await? {
            Some(existing) => existing,
            None => {
                let scan = Scan::new(upload_id);
                self.repository.create_scan(scan.clone()).await?;
                scan
            }
        };

        scan.state = ScanState::Running;
        scan.touch();
        self.repository.update_scan(scan.clone()).await?;

        let root_path = PathBuf::from(&source.path);
        match self.walk(source.id, &root_path, "").await {
            Ok(root_entry) => {
                scan.root_fs_entry_id = Some(root_entry.id);
                scan.state = ScanState::Completed;
                scan.error_message = None;
            }
            Err(e) => {
                scan.state = ScanState::Failed;
                scan.error_message = Some(e.to_string());
                scan.touch();
                self.repository.update_scan(scan.clone()).await?;
                return Err(e);
            }
        }
        scan.touch();
        self.repository.update_scan(scan.clone()).await?;
        Ok(scan)
    }

    fn walk<'a>(
        &'a self,
        source_id: Id,
        abs_path: &'a Path,
        rel_path: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FsEntry, CoreError>> + Send + 'a>> {
        Box::pin(async move {
            let stat = self.filesystem.stat(abs_path).await?;

            match stat.kind {
                EntryKind::File => {
                    let checksum = file_checksum(source_id, rel_path, stat.modified_unix, stat.mode, stat.size);
                    let candidate = FsEntry {
                        id: Id::new(),
                        source_id,
                        path: rel_path.to_string(),
                        last_modified: stat.modified_unix,
                        mode: stat.mode,
                        size: stat.size,
                        checksum,
                        kind: FsEntryKind::File,
                    };
                    let (entry, created) = self.repository.find_or_create_fs_entry(candidate).await?;
                    debug!(path = rel_path, created, "scanned file");
                    Ok(entry)
                }
                EntryKind::Directory => {
                    let mut child_paths = self.filesystem.read_dir(abs_path).await?;
                    child_paths.sort();

                    let mut children = Vec::with_capacity(child_paths.len());
                    for child_abs in &child_paths {
                        let name =
                            child_abs.file_name().expect("read_dir entries have a name").to_string_lossy().into_owned();
                        let child_rel = if rel_path.is_empty() { name.clone() } else { format!("{rel_path}/{name}") };
                        let child = self.walk(source_id, child_abs, &child_rel).await?;
                        children.push(child);
                    }

                    let child_checksums: Vec<Vec<u8>> = children.iter().map(|c| c.checksum.clone()).collect();
                    let checksum =
                        directory_checksum(source_id, rel_path, stat.modified_unix, stat.mode, &child_checksums);
                    let candidate = FsEntry {
                        id: Id::new(),
                        source_id,
                        path: rel_path.to_string(),
                        last_modified: stat.modified_unix,
                        mode: stat.mode,
                        size: 0,
                        checksum,
                        kind: FsEntryKind::Directory,
                    };
                    let (entry, created) = self.repository.find_or_create_fs_entry(candidate).await?;
                    if created {
                        let child_ids: Vec<Id> = children.iter().map(|c| c.id).collect();
                        self.repository.set_directory_children(entry.id, child_ids).await?;
                    }
                    debug!(path = rel_path, children = children.len(), created, "scanned directory");
                    Ok(entry)
                }
            }
        })
    }
}
