//! Persisted entities (spec §3). Plain data, owned exclusively by whichever
//! [`crate::repository::Repository`] implementation stores them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cid::Cid;

/// 128-bit opaque identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(pub Uuid);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Local,
}

/// An ingest root. Created by the user, never mutated or destroyed by the
/// core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: Id,
    pub name: String,
    pub kind: SourceKind,
    pub path: String,
    pub connection_params: Option<Vec<u8>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Source {
    pub fn new_local(name: impl Into<String>, path: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: Id::new(),
            name: name.into(),
            kind: SourceKind::Local,
            path: path.into(),
            connection_params: None,
            created_at: ts,
            updated_at: ts,
        }
    }
}

/// Tunable parameters for one upload run. Carries the parameters the
/// teacher's UnixFS-adjacent code kept as module-level defaults
/// (`DefaultLinksPerBlock` and friends), per the Redesign Flag in §9.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: Id,
    pub name: String,
    pub created_at: i64,
    pub shard_size: u64,
    pub chunk_size: u64,
    pub links_per_node: u64,
    pub use_hamt_threshold: u64,
    pub max_restarts: u32,
}

pub const MIN_SHARD_SIZE: u64 = 128;
pub const MAX_SHARD_SIZE: u64 = 1u64 << 32;
pub const DEFAULT_SHARD_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("shard_size {0} out of range [{MIN_SHARD_SIZE}, {MAX_SHARD_SIZE})")]
    ShardSizeOutOfRange(u64),
}

impl Configuration {
    pub fn new(name: impl Into<String>, shard_size: u64) -> Result<Self, ConfigurationError> {
        if !(MIN_SHARD_SIZE..MAX_SHARD_SIZE).contains(&shard_size) {
            return Err(ConfigurationError::ShardSizeOutOfRange(shard_size));
        }
        Ok(Self {
            id: Id::new(),
            name: name.into(),
            created_at: now(),
            shard_size,
            chunk_size: crate::chunker::DEFAULT_CHUNK_SIZE as u64,
            links_per_node: crate::unixfs::DEFAULT_LINKS_PER_NODE as u64,
            use_hamt_threshold: crate::unixfs::DEFAULT_USE_HAMT_THRESHOLD as u64,
            max_restarts: 10,
        })
    }

    pub fn default_sized(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_SHARD_SIZE).expect("default shard size is always in range")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsEntryKind {
    File,
    Directory,
}

/// A deduplicated filesystem entry. `checksum` is the dedup key (spec §3);
/// identical checksums must map to the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub id: Id,
    pub source_id: Id,
    pub path: String,
    pub last_modified: i64,
    pub mode: u32,
    pub size: u64,
    pub checksum: Vec<u8>,
    pub kind: FsEntryKind,
}

impl FsEntry {
    /// The final path component, used as the UnixFS link name under its
    /// parent directory.
    pub fn path_basename(&self) -> String {
        self.path.rsplit('/').next().unwrap_or(&self.path).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scan {
    pub id: Id,
    pub upload_id: Id,
    pub root_fs_entry_id: Option<Id>,
    pub created_at: i64,
    pub updated_at: i64,
    pub state: ScanState,
    pub error_message: Option<String>,
}

impl Scan {
    pub fn new(upload_id: Id) -> Self {
        let ts = now();
        Self {
            id: Id::new(),
            upload_id,
            root_fs_entry_id: None,
            created_at: ts,
            updated_at: ts,
            state: ScanState::Pending,
            error_message: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}

/// A raw leaf or UnixFS node. `cid` is the primary key: nodes are globally
/// deduplicated by content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub cid: Cid,
    pub size: u64,
    /// The exact bytes this CID hashes over: raw leaf content for
    /// `Codec::Raw`, the full DagPB block for `Codec::DagPb`. This is what
    /// a CAR block frame carries as payload.
    pub payload: Vec<u8>,
    /// `None` for raw leaves; `Some(encoded UnixFS Data field)` for
    /// UnixFS nodes, kept alongside `payload` for inspection/debugging.
    pub ufsdata: Option<Vec<u8>>,
    /// Byte offset of this leaf within its source file; empty string and 0
    /// offset for UnixFS nodes.
    pub path: String,
    pub source_id: Id,
    pub offset: u64,
}

/// An ordered edge from a UnixFS parent to one of its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub parent_cid: Cid,
    pub ordering: i64,
    pub name: String,
    pub t_size: u64,
    pub hash_cid: Cid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagScanKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagScanState {
    Pending,
    Running,
    AwaitingChildren,
    Completed,
    Failed,
    Cancelled,
}

/// The unit of work that produces a single FSEntry's CID by encoding its
/// subtree. Primary key is `fs_entry_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagScan {
    pub fs_entry_id: Id,
    pub upload_id: Id,
    pub kind: DagScanKind,
    pub created_at: i64,
    pub updated_at: i64,
    pub state: DagScanState,
    pub error_message: Option<String>,
    pub cid: Option<Cid>,
}

impl DagScan {
    pub fn new(fs_entry_id: Id, upload_id: Id, kind: DagScanKind) -> Self {
        let ts = now();
        Self {
            fs_entry_id,
            upload_id,
            kind,
            created_at: ts,
            updated_at: ts,
            state: DagScanState::Pending,
            error_message: None,
            cid: None,
        }
    }

    pub fn touch_updated(&mut self) {
        self.updated_at = now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Open,
    Closed,
    Added,
}

/// A size-bounded CAR containing a contiguous subsequence of emitted nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: Id,
    pub upload_id: Id,
    pub cid: Option<Cid>,
    pub state: ShardState,
}

impl Shard {
    pub fn new(upload_id: Id) -> Self {
        Self { id: Id::new(), upload_id, cid: None, state: ShardState::Open }
    }
}

/// Records which nodes are placed in which shard, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInShard {
    pub shard_id: Id,
    pub node_cid: Cid,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Pending,
    Scanning,
    GeneratingDAG,
    Sharding,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub id: Id,
    pub configuration_id: Id,
    pub source_id: Id,
    pub created_at: i64,
    pub updated_at: i64,
    pub state: UploadState,
    pub error_message: Option<String>,
    pub root_fs_entry_id: Option<Id>,
    pub root_cid: Option<Cid>,
}

impl Upload {
    pub fn new(configuration_id: Id, source_id: Id) -> Self {
        let ts = now();
        Self {
            id: Id::new(),
            configuration_id,
            source_id,
            created_at: ts,
            updated_at: ts,
            state: UploadState::Pending,
            error_message: None,
            root_fs_entry_id: None,
            root_cid: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }
}
