use std::collections::BTreeMap;

use super::{directory::DirectoryChild, pb, pb_node_bytes, BuiltNode, DataType};
use crate::cid::encode_pb_cid;

/// Fan-out of a HAMT shard: 256 buckets, addressed by one byte (8 bits) of
/// hash per level, per §4.3.
const FANOUT: usize = 256;
const BITMAP_BYTES: usize = FANOUT / 8;
/// Multiformats hash-function code for murmur3-x64-64.
const MURMUR3_X64_64_CODE: u64 = 0x22;

/// Incremental source of bucket indices for one child name: an infinite
/// stream of hash bytes, extended by rehashing whenever exhausted (mirrors
/// go-unixfs's `hashBits.Next`, simplified by the fact that an 8-bit bucket
/// width is always byte-aligned).
struct HashBits {
    material: Vec<u8>,
    pos: usize,
}

impl HashBits {
    fn new(name: &str) -> Self {
        Self { material: murmur3_x64_128(name.as_bytes(), 0), pos: 0 }
    }

    fn next_bucket(&mut self) -> u8 {
        if self.pos >= self.material.len() {
            let more = murmur3_x64_128(&self.material, 0);
            self.material.extend_from_slice(&more);
        }
        let b = self.material[self.pos];
        self.pos += 1;
        b
    }
}

/// MurmurHash3 x64 128-bit variant, returned as 16 raw bytes (h1 ‖ h2).
fn murmur3_x64_128(data: &[u8], seed: u64) -> Vec<u8> {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1: u64 = seed;
    let mut h2: u64 = seed;
    let len = data.len();
    let nblocks = len / 16;

    for i in 0..nblocks {
        let block = &data[i * 16..i * 16 + 16];
        let mut k1 = u64::from_le_bytes(block[0..8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(block[8..16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dce729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x38495ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    if tail.len() > 8 {
        let mut buf = [0u8; 8];
        buf[..tail.len() - 8].copy_from_slice(&tail[8..]);
        k2 = u64::from_le_bytes(buf);
    }
    if !tail.is_empty() {
        let mut buf = [0u8; 8];
        let n = tail.len().min(8);
        buf[..n].copy_from_slice(&tail[..n]);
        k1 = u64::from_le_bytes(buf);
    }

    k2 = k2.wrapping_mul(C2);
    k2 = k2.rotate_left(33);
    k2 = k2.wrapping_mul(C1);
    h2 ^= k2;

    k1 = k1.wrapping_mul(C1);
    k1 = k1.rotate_left(31);
    k1 = k1.wrapping_mul(C2);
    h1 ^= k1;

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&h1.to_le_bytes());
    out.extend_from_slice(&h2.to_le_bytes());
    out
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

/// Builds a (possibly multi-level) HAMT-sharded directory over `children`.
///
/// Every sub-shard node built along the way when a bucket collides and
/// recurses — not just the top-level shard this function returns — is
/// appended to `sub_shards_out`, in children-before-parents order, since
/// the top shard's links reference those sub-shards and they must be
/// persisted and uploaded just like it.
pub fn build_hamt_directory(children: Vec<DirectoryChild>, sub_shards_out: &mut Vec<BuiltNode>) -> BuiltNode {
    let entries: Vec<(HashBits, DirectoryChild)> =
        children.into_iter().map(|c| (HashBits::new(&c.name), c)).collect();
    build_hamt_level(entries, sub_shards_out)
}

fn build_hamt_level(mut entries: Vec<(HashBits, DirectoryChild)>, sub_shards_out: &mut Vec<BuiltNode>) -> BuiltNode {
    let mut buckets: BTreeMap<u8, Vec<(HashBits, DirectoryChild)>> = BTreeMap::new();
    for (mut bits, child) in entries.drain(..) {
        let bucket = bits.next_bucket();
        buckets.entry(bucket).or_default().push((bits, child));
    }

    let mut bitmap = vec![0u8; BITMAP_BYTES];
    let width = 2usize; // log16(256) = 2 hex digits, per §4.3.
    let mut links: Vec<(crate::cid::Cid, String, u64)> = Vec::new();

    for (&bucket, group) in buckets.iter() {
        bitmap[(bucket / 8) as usize] |= 1 << (bucket % 8);
        let prefix = format!("{bucket:0width$X}", width = width);
        if group.len() == 1 {
            let (_, child) = &group[0];
            links.push((child.cid, format!("{prefix}{}", child.name), child.stored_size));
        } else {
            let owned: Vec<(HashBits, DirectoryChild)> =
                group.iter().map(|(b, c)| (HashBits { material: b.material.clone(), pos: b.pos }, c.clone())).collect();
            let sub = build_hamt_level(owned, sub_shards_out);
            links.push((sub.cid, prefix, sub.stored_size));
            sub_shards_out.push(sub);
        }
    }

    let mut data_message = Vec::new();
    pb::write_varint_field(&mut data_message, 1, DataType::HamtShard as u64);
    pb::write_bytes_field(&mut data_message, 2, &bitmap);
    pb::write_varint_field(&mut data_message, 5, MURMUR3_X64_64_CODE);
    pb::write_varint_field(&mut data_message, 6, FANOUT as u64);

    let link_refs: Vec<(crate::cid::Cid, &str, u64)> =
        links.iter().map(|(cid, name, tsize)| (*cid, name.as_str(), *tsize)).collect();
    let block_bytes = pb_node_bytes(&data_message, &link_refs);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::encode_raw_cid;

    fn child(name: &str) -> DirectoryChild {
        DirectoryChild { name: name.to_string(), cid: encode_raw_cid(name.as_bytes()), stored_size: 1 }
    }

    #[test]
    fn deterministic_for_same_children() {
        let children: Vec<_> = (0..50).map(|i| child(&format!("entry-{i}"))).collect();
        let mut subs_a = Vec::new();
        let mut subs_b = Vec::new();
        let a = build_hamt_directory(children.clone(), &mut subs_a);
        let b = build_hamt_directory(children, &mut subs_b);
        assert_eq!(a.cid, b.cid);
    }

    #[test]
    fn order_independent() {
        let mut children: Vec<_> = (0..50).map(|i| child(&format!("entry-{i}"))).collect();
        let mut subs_a = Vec::new();
        let mut subs_b = Vec::new();
        let a = build_hamt_directory(children.clone(), &mut subs_a);
        children.reverse();
        let b = build_hamt_directory(children, &mut subs_b);
        assert_eq!(a.cid, b.cid);
    }

    #[test]
    fn handles_large_fanout_requiring_recursion() {
        // More children than one level's 256 buckets comfortably separate by
        // chance collisions at minimum; this just exercises the code path.
        let children: Vec<_> = (0..2000).map(|i| child(&format!("file-{i}.bin"))).collect();
        let mut sub_shards = Vec::new();
        let built = build_hamt_directory(children, &mut sub_shards);
        assert!(built.block_bytes.is_some());
        assert!(
            !sub_shards.is_empty(),
            "2000 children over a 256-bucket fanout must recurse into sub-shards that get surfaced, not discarded"
        );
        for sub in &sub_shards {
            assert!(sub.block_bytes.is_some(), "every surfaced sub-shard must carry its own block bytes");
        }
    }
}
