//! Fixed-size chunking of a byte stream into raw UnixFS leaves (spec
//! component C2).
//!
//! Grounded on the teacher's `futures`/`futures-util` streaming style
//! (`dataprep-pipelines::crypto_tools::encryption_writer`), reimplemented
//! here as a plain `futures::stream::unfold` rather than a custom poll loop.

use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cid::{encode_raw_cid, Cid};

/// Default chunk size used when a [`crate::model::Configuration`] doesn't
/// override it.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// One chunk of a file: its raw CID, its bytes, and the cumulative byte
/// offset of this chunk's first byte within the source file.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub cid: Cid,
    pub bytes: Bytes,
    pub offset: u64,
}

/// Splits `reader` into a lazy, finite sequence of chunks of at most
/// `chunk_size` bytes each (the last chunk may be shorter). An empty reader
/// yields zero chunks; callers must substitute [`crate::cid::empty_raw_cid`]
/// themselves (see DAG builder, C6).
pub fn chunk_stream<R>(reader: R, chunk_size: usize) -> impl Stream<Item = std::io::Result<Chunk>>
where
    R: AsyncRead + Unpin,
{
    assert!(chunk_size > 0, "chunk_size must be positive");
    stream::unfold((reader, 0u64), move |(mut reader, offset)| async move {
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0usize;
        while filled < chunk_size {
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Some((Err(e), (reader, offset))),
            }
        }
        if filled == 0 {
            return None;
        }
        buf.truncate(filled);
        let bytes = Bytes::from(buf);
        let cid = encode_raw_cid(&bytes);
        let chunk = Chunk { cid, bytes, offset };
        let next_offset = offset + filled as u64;
        Some((Ok(chunk), (reader, next_offset)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Cursor;

    async fn collect(data: &[u8], chunk_size: usize) -> Vec<Chunk> {
        let reader = Cursor::new(data.to_vec());
        chunk_stream(reader, chunk_size)
            .map(|c| c.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn empty_input_yields_no_chunks() {
        let chunks = collect(&[], 4).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn splits_on_boundary() {
        let data = vec![1u8; 10];
        let chunks = collect(&data, 4).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].bytes.len(), 4);
        assert_eq!(chunks[1].bytes.len(), 4);
        assert_eq!(chunks[2].bytes.len(), 2);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[1].offset, 4);
        assert_eq!(chunks[2].offset, 8);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_trailing_empty_chunk() {
        let data = vec![7u8; 8];
        let chunks = collect(&data, 4).await;
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn chunk_cids_are_content_derived() {
        let data = vec![9u8; 4];
        let chunks = collect(&data, 4).await;
        assert_eq!(chunks[0].cid, encode_raw_cid(&data));
    }
}
