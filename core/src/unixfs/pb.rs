//! Minimal hand-rolled Protocol Buffers writer for UnixFS/DagPB nodes.
//!
//! The teacher repo hand-rolls its own CARv1/DAG-CBOR codecs
//! (`banyan-guts::car::v1::header`) instead of reaching for a generic codec
//! crate; this module follows the same approach for the (unrelated) DagPB
//! wire format UnixFS needs, since adopting the teacher's `wnfs`/`libipld`
//! dependency would pull in WNFS's private, encrypted tree model rather than
//! plain UnixFS.

use crate::cid::encode_varint_u64;

/// Appends a protobuf tag byte sequence: `(field_number << 3) | wire_type`.
fn write_tag(out: &mut Vec<u8>, field_number: u32, wire_type: u8) {
    let tag = ((field_number as u64) << 3) | wire_type as u64;
    out.extend_from_slice(&encode_varint_u64(tag));
}

/// Writes a varint-typed field (wire type 0).
pub fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    write_tag(out, field_number, 0);
    out.extend_from_slice(&encode_varint_u64(value));
}

/// Writes a length-delimited field (wire type 2): bytes, strings, and
/// embedded messages all share this shape.
pub fn write_bytes_field(out: &mut Vec<u8>, field_number: u32, bytes: &[u8]) {
    write_tag(out, field_number, 2);
    out.extend_from_slice(&encode_varint_u64(bytes.len() as u64));
    out.extend_from_slice(bytes);
}

pub fn write_string_field(out: &mut Vec<u8>, field_number: u32, value: &str) {
    write_bytes_field(out, field_number, value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_field_tag_encodes_field_and_wire_type() {
        let mut out = Vec::new();
        write_varint_field(&mut out, 3, 150);
        // field 3, wire type 0 -> tag = (3<<3)|0 = 24 = 0x18
        assert_eq!(out[0], 0x18);
    }

    #[test]
    fn bytes_field_includes_length_prefix() {
        let mut out = Vec::new();
        write_bytes_field(&mut out, 1, b"hi");
        // tag for field 1, wire type 2 -> (1<<3)|2 = 10 = 0x0a
        assert_eq!(out[0], 0x0a);
        assert_eq!(out[1], 2); // length
        assert_eq!(&out[2..], b"hi");
    }
}
