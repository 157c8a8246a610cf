use super::{pb, pb_node_bytes, BuiltNode, ChildRef, DataType};
use crate::cid::encode_pb_cid;

/// Default maximum number of children packed under one File-trunk or
/// Directory node before a new sibling (or, for directories, HAMT sharding)
/// kicks in.
pub const DEFAULT_LINKS_PER_NODE: usize = 1024;

/// One File-trunk node built by [`build_file_tree`], paired with the
/// immediate children it links to — everything a caller needs to persist
/// the node and its `Link` rows.
#[derive(Debug, Clone)]
pub struct BuiltTrunk {
    pub node: BuiltNode,
    pub children: Vec<ChildRef>,
}

/// Reduces an ordered list of leaves (or, recursively, of previously-built
/// File-trunk roots) into a single UnixFS file DAG root.
///
/// Degenerate cases per §4.3: an empty list is a caller error (the DAG
/// builder must substitute the canonical empty-file leaf before calling
/// this); a single child is returned unwrapped (no File node is created).
///
/// Every trunk node built along the way — not just the final root — is
/// appended to `trunks_out`, in children-before-parents order, since a
/// file needing more than one level produces intermediate trunk nodes that
/// the root's links reference and that must be persisted and uploaded just
/// like the root.
pub fn build_file_tree(
    children: &[ChildRef],
    links_per_node: usize,
    trunks_out: &mut Vec<BuiltTrunk>,
) -> BuiltNode {
    assert!(!children.is_empty(), "build_file_tree requires at least one child");
    assert!(links_per_node > 0, "links_per_node must be positive");

    let mut level: Vec<ChildRef> = children.to_vec();
    if level.len() == 1 {
        let only = level[0];
        return BuiltNode {
            cid: only.cid,
            block_bytes: None,
            ufsdata: None,
            byte_size: only.byte_size,
            stored_size: only.stored_size,
        };
    }

    loop {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(links_per_node));
        let mut last_built: Option<BuiltNode> = None;
        for chunk in level.chunks(links_per_node) {
            let built = build_file_trunk_node(chunk);
            next_level.push(ChildRef {
                cid: built.cid,
                byte_size: built.byte_size,
                stored_size: built.stored_size,
            });
            trunks_out.push(BuiltTrunk { node: built.clone(), children: chunk.to_vec() });
            last_built = Some(built);
        }
        if next_level.len() == 1 {
            return last_built.expect("at least one chunk was built");
        }
        level = next_level;
    }
}

fn build_file_trunk_node(children: &[ChildRef]) -> BuiltNode {
    let filesize: u64 = children.iter().map(|c| c.byte_size).sum();

    let mut data_message = Vec::new();
    pb::write_varint_field(&mut data_message, 1, DataType::File as u64);
    pb::write_varint_field(&mut data_message, 3, filesize);
    for child in children {
        pb::write_varint_field(&mut data_message, 4, child.byte_size);
    }

    let links: Vec<(crate::cid::Cid, &str, u64)> =
        children.iter().map(|c| (c.cid, "", c.stored_size)).collect();
    let block_bytes = pb_node_bytes(&data_message, &links);
    let cid = encode_pb_cid(&block_bytes);

    let children_stored_size: u64 = children.iter().map(|c| c.stored_size).sum();
    let stored_size = children_stored_size + block_bytes.len() as u64;

    BuiltNode {
        cid,
        block_bytes: Some(block_bytes),
        ufsdata: Some(data_message),
        byte_size: filesize,
        stored_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::encode_raw_cid;

    fn leaf(byte_size: u64) -> ChildRef {
        let bytes = vec![0xabu8; byte_size as usize];
        let cid = encode_raw_cid(&bytes);
        ChildRef { cid, byte_size, stored_size: byte_size }
    }

    #[test]
    fn single_leaf_is_returned_unwrapped() {
        let leaves = [leaf(128)];
        let mut trunks = Vec::new();
        let root = build_file_tree(&leaves, 1024, &mut trunks);
        assert_eq!(root.cid, leaves[0].cid);
        assert!(root.block_bytes.is_none());
        assert_eq!(root.byte_size, 128);
        assert!(trunks.is_empty(), "the degenerate single-leaf case builds no new node");
    }

    #[test]
    fn many_leaves_wrap_into_one_trunk_node() {
        let leaves: Vec<_> = (0..5).map(|i| leaf(10 + i)).collect();
        let mut trunks = Vec::new();
        let root = build_file_tree(&leaves, 1024, &mut trunks);
        assert!(root.block_bytes.is_some());
        let total: u64 = leaves.iter().map(|l| l.byte_size).sum();
        assert_eq!(root.byte_size, total);
        let leaves_stored: u64 = leaves.iter().map(|l| l.stored_size).sum();
        assert_eq!(root.stored_size, leaves_stored + root.block_bytes.as_ref().unwrap().len() as u64);
        assert_eq!(trunks.len(), 1);
        assert_eq!(trunks[0].node.cid, root.cid);
        assert_eq!(trunks[0].children.len(), leaves.len());
    }

    #[test]
    fn deep_tree_reduces_to_single_root_across_multiple_levels() {
        let leaves: Vec<_> = (0..10).map(|_| leaf(4)).collect();
        let mut trunks = Vec::new();
        let root = build_file_tree(&leaves, 2, &mut trunks);
        assert!(root.block_bytes.is_some());
        assert_eq!(root.byte_size, 40);
        // 10 leaves at fan-out 2 reduce over four levels (5, 3, 2, 1 nodes);
        // every trunk node built along the way must come back out so the
        // caller can persist and upload it, not just the final root.
        assert_eq!(trunks.len(), 5 + 3 + 2 + 1);
        assert_eq!(trunks.last().unwrap().node.cid, root.cid);
    }

    #[test]
    fn trunk_cid_is_deterministic() {
        let leaves: Vec<_> = (0..3).map(|i| leaf(5 + i)).collect();
        let mut trunks_a = Vec::new();
        let mut trunks_b = Vec::new();
        let a = build_file_tree(&leaves, 1024, &mut trunks_a);
        let b = build_file_tree(&leaves, 1024, &mut trunks_b);
        assert_eq!(a.cid, b.cid);
    }
}
