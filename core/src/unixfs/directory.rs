use super::hamt::build_hamt_directory;
use super::{pb, pb_node_bytes, BuiltNode, DataType};
use crate::cid::{encode_pb_cid, Cid};

/// Default number of direct children a directory can hold before the
/// builder switches to a HAMT shard (§4.3).
pub const DEFAULT_USE_HAMT_THRESHOLD: usize = 256;

/// One named child of a directory, as handed to the encoder by the DAG
/// builder. `stored_size` is whatever the child's own builder already
/// computed it to mean (recursive for File-trunk children, own-length-only
/// for Directory/HAMTShard children — see `BuiltNode::stored_size`).
#[derive(Debug, Clone)]
pub struct DirectoryChild {
    pub name: String,
    pub cid: Cid,
    pub stored_size: u64,
}

/// Builds a UnixFS directory node from its children, switching to a
/// HAMT-sharded representation once `children.len() > use_hamt_threshold`.
///
/// When HAMT sharding recurses into sub-shards, every sub-shard node is
/// appended to `sub_shards_out` alongside the top-level node this function
/// returns, since the top shard's links reference them (see
/// `build_hamt_directory`). Stays empty for the flat (non-HAMT) case.
pub fn build_directory(
    mut children: Vec<DirectoryChild>,
    use_hamt_threshold: usize,
    sub_shards_out: &mut Vec<BuiltNode>,
) -> BuiltNode {
    if children.len() > use_hamt_threshold {
        return build_hamt_directory(children, sub_shards_out);
    }
    // Canonical DagPB link order: ascending by raw name bytes.
    children.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let mut data_message = Vec::new();
    pb::write_varint_field(&mut data_message, 1, DataType::Directory as u64);

    let links: Vec<(Cid, &str, u64)> = children
        .iter()
        .map(|c| (c.cid, c.name.as_str(), c.stored_size))
        .collect();
    let block_bytes = pb_node_bytes(&data_message, &links);
    let cid = encode_pb_cid(&block_bytes);
    let stored_size = block_bytes.len() as u64;

    BuiltNode {
        cid,
        block_bytes: Some(block_bytes),
        ufsdata: Some(data_message),
        byte_size: 0,
        stored_size,
    }
}
