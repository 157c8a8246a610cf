//! UnixFS encoder (spec component C3): file-trunk, directory, and
//! HAMT-shard node construction over DagPB.

mod directory;
mod file;
mod hamt;
pub mod pb;

pub use directory::{build_directory, DirectoryChild, DEFAULT_USE_HAMT_THRESHOLD};
pub use file::{build_file_tree, BuiltTrunk, DEFAULT_LINKS_PER_NODE};

use crate::cid::Cid;

/// UnixFS `Data.Type` enum values (field 1 of the UnixFS `Data` message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DataType {
    Raw = 0,
    Directory = 1,
    File = 2,
    #[allow(dead_code)]
    Metadata = 3,
    #[allow(dead_code)]
    Symlink = 4,
    HamtShard = 5,
}

/// The result of building one UnixFS node (file-trunk, directory, or HAMT
/// shard): its CID, the exact bytes that hash to that CID (the full DagPB
/// block), the UnixFS `Data` field alone (persisted separately per the
/// [`crate::model::Node`] schema), and the byte-accounting pair used when
/// this node is referenced from a parent (§4.3, §9 stored-size note).
#[derive(Debug, Clone)]
pub struct BuiltNode {
    pub cid: Cid,
    /// `None` when no new node was created (the degenerate single-leaf
    /// file-tree case reuses the leaf's own block as the root).
    pub block_bytes: Option<Vec<u8>>,
    pub ufsdata: Option<Vec<u8>>,
    pub byte_size: u64,
    /// Bytes this node (and, for File nodes only, its descendants)
    /// contribute to CAR storage. See the stored-size resolution in
    /// DESIGN.md: File-trunk nodes accumulate recursively; Directory and
    /// HAMTShard nodes report only their own encoded length, matching the
    /// `BuildUnixFSDirectoryEntry` convention spec.md §9 calls out.
    pub stored_size: u64,
}

/// A reference to an already-built child, as consumed by the file-tree
/// reducer and by directory link construction.
#[derive(Debug, Clone, Copy)]
pub struct ChildRef {
    pub cid: Cid,
    pub byte_size: u64,
    pub stored_size: u64,
}

fn pb_node_bytes(data_message: &[u8], links: &[(Cid, &str, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    pb::write_bytes_field(&mut out, 1, data_message);
    for (cid, name, tsize) in links {
        let mut link_buf = Vec::new();
        pb::write_bytes_field(&mut link_buf, 1, &cid.to_bytes());
        pb::write_string_field(&mut link_buf, 2, name);
        pb::write_varint_field(&mut link_buf, 3, *tsize);
        pb::write_bytes_field(&mut out, 2, &link_buf);
    }
    out
}
