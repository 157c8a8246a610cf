//! Content addressing: CID construction, multihash, varint framing, CAR
//! block-length computation (spec component C1).
//!
//! Grounded on `banyan-guts::car::v1::header` (varint-prefixed CAR framing)
//! and `banyan-guts::utils::varint` (hand-rolled `unsigned-varint` wrapper
//! functions) from the teacher repository.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use unsigned_varint::{decode, encode};

/// Multicodec code for SHA-256.
const SHA2_256_CODE: u64 = 0x12;
/// Digest length produced by SHA-256.
const SHA2_256_DIGEST_LEN: usize = 32;

/// Multicodec for the two block shapes this core ever produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    /// Raw bytes, no wrapping envelope: used for chunked file leaves.
    Raw,
    /// MerkleDAG Protocol Buffers: used for UnixFS file-trunk, directory,
    /// and HAMT-shard nodes.
    DagPb,
}

impl Codec {
    const fn multicodec_code(self) -> u64 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagPb => 0x70,
        }
    }

    fn from_multicodec_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(Codec::Raw),
            0x70 => Some(Codec::DagPb),
            _ => None,
        }
    }
}

/// A CID v1: `version ‖ codec ‖ multihash`. This core only ever constructs
/// SHA-256 multihashes, so the digest is stored inline rather than as a
/// generic multihash byte vector.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cid {
    pub codec: Codec,
    digest: [u8; SHA2_256_DIGEST_LEN],
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({:?}, {})", self.codec, hex_string(&self.digest))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.codec, hex_string(&self.digest))
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Cid {
    /// Binary CID form: `varint(version=1) ‖ varint(codec) ‖ varint(hash fn)
    /// ‖ varint(digest len) ‖ digest`. Always 36 bytes for our SHA-256-only
    /// multihash.
    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&encode_varint_u64(1));
        out.extend_from_slice(&encode_varint_u64(self.codec.multicodec_code()));
        out.extend_from_slice(&encode_varint_u64(SHA2_256_CODE));
        out.extend_from_slice(&encode_varint_u64(SHA2_256_DIGEST_LEN as u64));
        out.extend_from_slice(&self.digest);
        out
    }

    /// Length of [`Cid::to_bytes`] without materializing it.
    pub fn encoded_len(&self) -> u64 {
        varint_len(1)
            + varint_len(self.codec.multicodec_code())
            + varint_len(SHA2_256_CODE)
            + varint_len(SHA2_256_DIGEST_LEN as u64)
            + SHA2_256_DIGEST_LEN as u64
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (version, rest) = decode::u64(bytes).map_err(|_| CidError::Malformed)?;
        if version != 1 {
            return Err(CidError::UnsupportedVersion(version));
        }
        let (codec_code, rest) = decode::u64(rest).map_err(|_| CidError::Malformed)?;
        let codec = Codec::from_multicodec_code(codec_code).ok_or(CidError::UnknownCodec(codec_code))?;
        let (hash_fn, rest) = decode::u64(rest).map_err(|_| CidError::Malformed)?;
        if hash_fn != SHA2_256_CODE {
            return Err(CidError::UnsupportedMultihash(hash_fn));
        }
        let (len, rest) = decode::u64(rest).map_err(|_| CidError::Malformed)?;
        if len as usize != SHA2_256_DIGEST_LEN || rest.len() != SHA2_256_DIGEST_LEN {
            return Err(CidError::Malformed);
        }
        let mut digest = [0u8; SHA2_256_DIGEST_LEN];
        digest.copy_from_slice(rest);
        Ok(Self { codec, digest })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CidError {
    #[error("malformed CID bytes")]
    Malformed,
    #[error("unsupported CID version {0}")]
    UnsupportedVersion(u64),
    #[error("unknown codec 0x{0:x}")]
    UnknownCodec(u64),
    #[error("unsupported multihash function 0x{0:x}")]
    UnsupportedMultihash(u64),
}

/// Encode a raw leaf block: codec = Raw, multihash = SHA-256(bytes).
pub fn encode_raw_cid(bytes: &[u8]) -> Cid {
    digest_cid(Codec::Raw, bytes)
}

/// Encode a UnixFS (DagPB) block: codec = DagPb, multihash = SHA-256(bytes).
pub fn encode_pb_cid(bytes: &[u8]) -> Cid {
    digest_cid(Codec::DagPb, bytes)
}

fn digest_cid(codec: Codec, bytes: &[u8]) -> Cid {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest: [u8; SHA2_256_DIGEST_LEN] = hasher.finalize().into();
    Cid { codec, digest }
}

/// The canonical raw CID over the empty byte string, substituted whenever a
/// file or chunk stream yields zero bytes.
pub fn empty_raw_cid() -> Cid {
    encode_raw_cid(&[])
}

/// Exact number of bytes a block occupies in a CARv1 payload:
/// `varint(len(cid_binary) + payload_len) ‖ cid_binary ‖ payload`.
pub fn car_block_frame_length(cid: &Cid, payload_len: u64) -> u64 {
    let cid_len = cid.encoded_len();
    let body_len = cid_len + payload_len;
    varint_len(body_len) + body_len
}

/// Write one CAR block frame (varint-length-prefixed `cid ‖ payload`) into `out`.
pub fn write_car_block_frame(out: &mut Vec<u8>, cid: &Cid, payload: &[u8]) {
    let cid_bytes = cid.to_bytes();
    let body_len = (cid_bytes.len() + payload.len()) as u64;
    out.extend_from_slice(&encode_varint_u64(body_len));
    out.extend_from_slice(&cid_bytes);
    out.extend_from_slice(payload);
}

/// Byte length of the fixed "no roots, version 1" DAG-CBOR header object
/// (not counting its own varint length prefix). Used directly in the shard
/// fill formula of §4.7: `current_fill = EMPTY_ROOTS_HEADER_LEN + Σ frames`.
pub const EMPTY_ROOTS_HEADER_LEN: u64 = 17;

/// The fixed DAG-CBOR encoding of `{"roots": [], "version": 1}` (canonical
/// CBOR map-key order: shorter keys first), 17 bytes:
///
/// ```text
/// A2                        # map(2)
///    65 726F6F7473          # text(5) "roots"
///    80                     # array(0)
///    67 76657273696F6E      # text(7) "version"
///    01                     # unsigned(1)
/// ```
pub fn car_v1_empty_roots_header_cbor() -> [u8; EMPTY_ROOTS_HEADER_LEN as usize] {
    [
        0xa2, 0x65, b'r', b'o', b'o', b't', b's', 0x80, 0x67, b'v', b'e', b'r', b's', b'i', b'o',
        b'n', 0x01,
    ]
}

/// Writes the on-wire CARv1 header for an upload with no roots:
/// `varint(17) ‖ <17-byte CBOR body>`, 18 bytes total.
pub fn write_empty_roots_car_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&encode_varint_u64(EMPTY_ROOTS_HEADER_LEN));
    out.extend_from_slice(&car_v1_empty_roots_header_cbor());
}

fn varint_len(value: u64) -> u64 {
    encode_varint_u64(value).len() as u64
}

pub(crate) fn encode_varint_u64(value: u64) -> Vec<u8> {
    let mut buf = encode::u64_buffer();
    encode::u64(value, &mut buf).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_cid_roundtrips_through_bytes() {
        let cid = encode_raw_cid(b"hello world");
        let bytes = cid.to_bytes();
        assert_eq!(bytes.len(), cid.encoded_len() as usize);
        let decoded = Cid::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, cid);
    }

    #[test]
    fn empty_cid_is_stable() {
        let a = empty_raw_cid();
        let b = encode_raw_cid(&[]);
        assert_eq!(a, b);
    }

    #[test]
    fn car_frame_length_matches_written_bytes() {
        let cid = encode_raw_cid(b"abc");
        let payload = b"abc";
        let predicted = car_block_frame_length(&cid, payload.len() as u64);
        let mut buf = Vec::new();
        write_car_block_frame(&mut buf, &cid, payload);
        assert_eq!(buf.len() as u64, predicted);
    }

    #[test]
    fn empty_header_cbor_is_seventeen_bytes() {
        assert_eq!(car_v1_empty_roots_header_cbor().len(), 17);
        let mut written = Vec::new();
        write_empty_roots_car_header(&mut written);
        assert_eq!(written.len(), 18);
    }

    #[test]
    fn different_codecs_give_different_cids_for_same_bytes() {
        let raw = encode_raw_cid(b"same bytes");
        let pb = encode_pb_cid(b"same bytes");
        assert_ne!(raw, pb);
    }
}
