//! Blob adapter (spec component C9): hands a packed CAR shard to whatever
//! remote accepts uploads. Grounded on
//! `tomb-common::banyan_api::requests::staging::upload::push::PushContent`'s
//! multipart-POST shape from the teacher repository.

use async_trait::async_trait;
use bytes::Bytes;

use crate::cid::Cid;
use crate::error::CoreError;

#[async_trait]
pub trait BlobAdder: Send + Sync {
    /// Uploads one shard's CAR bytes, addressed by its own CID. Errors are
    /// always `ErrorCategory::Protocol` (§7): a remote that rejects a
    /// shard is telling us the request itself is bad, not hiccuping, so the
    /// orchestrator fails the upload immediately rather than burning its
    /// restart budget on a repeat rejection.
    async fn add_blob(&self, shard_cid: Cid, car_bytes: Bytes) -> Result<(), CoreError>;
}

/// Pushes shard bytes as a multipart form upload, the way the teacher's
/// staging client pushes CAR content to its storage backend.
pub struct ReqwestBlobAdder {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl ReqwestBlobAdder {
    pub fn new(client: reqwest::Client, endpoint: reqwest::Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl BlobAdder for ReqwestBlobAdder {
    async fn add_blob(&self, shard_cid: Cid, car_bytes: Bytes) -> Result<(), CoreError> {
        let part = reqwest::multipart::Part::bytes(car_bytes.to_vec())
            .file_name(format!("{shard_cid}.car"))
            .mime_str("application/vnd.ipld.car")
            .map_err(|e| CoreError::Upload(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| CoreError::Upload(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Upload(format!("server returned {}", response.status())));
        }
        Ok(())
    }
}

/// In-memory test double that records every call instead of making network
/// requests.
#[derive(Default)]
pub struct RecordingBlobAdder {
    pub calls: tokio::sync::Mutex<Vec<(Cid, Bytes)>>,
}

impl RecordingBlobAdder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobAdder for RecordingBlobAdder {
    async fn add_blob(&self, shard_cid: Cid, car_bytes: Bytes) -> Result<(), CoreError> {
        self.calls.lock().await.push((shard_cid, car_bytes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::encode_raw_cid;

    #[tokio::test]
    async fn recording_adder_keeps_every_call() {
        let adder = RecordingBlobAdder::new();
        let cid = encode_raw_cid(b"shard");
        adder.add_blob(cid, Bytes::from_static(b"car bytes")).await.unwrap();
        let calls = adder.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, cid);
    }
}
