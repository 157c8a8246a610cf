//! End-to-end scenarios for the scan -> dag -> shard -> upload pipeline,
//! run against the in-memory fixtures so every phase is exercised without
//! touching a real filesystem or network.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use upload_core::blob::RecordingBlobAdder;
use upload_core::error::CoreError;
use upload_core::filesystem::{EntryKind, Filesystem, MemoryFilesystem, Stat};
use upload_core::model::{Configuration, ShardState, Source, Upload, UploadState};
use upload_core::repo::InMemoryRepository;
use upload_core::{Orchestrator, Repository};

/// Wraps a [`MemoryFilesystem`] and fails the first `N` `open` calls with a
/// transient I/O error, so restart handling (§7) can be exercised without a
/// real flaky disk.
struct FlakyFilesystem {
    inner: MemoryFilesystem,
    failures_remaining: AtomicUsize,
}

impl FlakyFilesystem {
    fn new(inner: MemoryFilesystem, failures: usize) -> Self {
        Self { inner, failures_remaining: AtomicUsize::new(failures) }
    }
}

#[async_trait]
impl Filesystem for FlakyFilesystem {
    async fn stat(&self, path: &Path) -> Result<Stat, CoreError> {
        self.inner.stat(path).await
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, CoreError> {
        self.inner.read_dir(path).await
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>, CoreError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::Io {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated flaky read"),
            });
        }
        self.inner.open(path).await
    }
}

async fn setup(
    fs: Arc<dyn Filesystem>,
    configuration: Configuration,
) -> (Orchestrator, Arc<dyn Repository>, Upload) {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let source = Source::new_local("test", "/root");
    repo.put_source(source.clone()).await.unwrap();
    repo.put_configuration(configuration.clone()).await.unwrap();
    let upload = Upload::new(configuration.id, source.id);
    repo.create_upload(upload.clone()).await.unwrap();

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let orchestrator =
        Orchestrator::new(repo.clone(), fs, Arc::new(RecordingBlobAdder::new()), rx);
    (orchestrator, repo, upload)
}

#[tokio::test]
async fn small_shard_size_splits_a_tree_across_multiple_shards() {
    let fs = MemoryFilesystem::new()
        .with_dir("/root")
        .with_file("/root/a.txt", vec![b'a'; 64])
        .with_file("/root/b.txt", vec![b'b'; 64])
        .with_file("/root/c.txt", vec![b'c'; 64])
        .with_file("/root/d.txt", vec![b'd'; 64]);

    let mut configuration = Configuration::default_sized("small-shards");
    configuration.shard_size = 128;
    let (orchestrator, repo, upload) = setup(Arc::new(fs), configuration).await;

    let finished = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(finished.state, UploadState::Completed);

    let added = repo.list_shards_by_state(upload.id, ShardState::Added).await.unwrap();
    assert!(added.len() > 1, "a 128-byte shard budget should force more than one shard for 4x64-byte files");
}

#[tokio::test]
async fn an_oversized_leaf_gets_uploaded_in_its_own_shard() {
    let fs = MemoryFilesystem::new().with_dir("/root").with_file("/root/huge.bin", vec![0u8; 4096]);

    let mut configuration = Configuration::default_sized("tiny-shards");
    configuration.shard_size = 128;
    let (orchestrator, repo, upload) = setup(Arc::new(fs), configuration).await;

    let finished = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(finished.state, UploadState::Completed);

    let added = repo.list_shards_by_state(upload.id, ShardState::Added).await.unwrap();
    assert!(!added.is_empty());
}

#[tokio::test]
async fn transient_io_errors_are_retried_within_the_restart_budget() {
    let fs = MemoryFilesystem::new().with_dir("/root").with_file("/root/a.txt", b"resumable".to_vec());
    let flaky = FlakyFilesystem::new(fs, 2);

    let mut configuration = Configuration::default_sized("retry-budget");
    configuration.max_restarts = 5;
    let (orchestrator, _repo, upload) = setup(Arc::new(flaky), configuration).await;

    let finished = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(finished.state, UploadState::Completed);
}

#[tokio::test]
async fn exhausting_the_restart_budget_fails_the_upload_with_the_last_error() {
    let fs = MemoryFilesystem::new().with_dir("/root").with_file("/root/a.txt", b"resumable".to_vec());
    let flaky = FlakyFilesystem::new(fs, 100);

    let mut configuration = Configuration::default_sized("tiny-budget");
    configuration.max_restarts = 2;
    let (orchestrator, _repo, upload) = setup(Arc::new(flaky), configuration).await;

    let finished = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(finished.state, UploadState::Failed);
    let message = finished.error_message.expect("a failed upload records why");
    assert_eq!(message, "maximum number of restarts reached");
}

#[tokio::test]
async fn nested_directory_tree_produces_a_root_cid_and_uploaded_shards() {
    let fs = MemoryFilesystem::new()
        .with_dir("/root")
        .with_dir("/root/docs")
        .with_dir("/root/docs/nested")
        .with_file("/root/top.txt", b"top level".to_vec())
        .with_file("/root/docs/readme.md", b"# hello".to_vec())
        .with_file("/root/docs/nested/leaf.txt", b"deeply nested".to_vec());

    let configuration = Configuration::default_sized("nested-tree");
    let (orchestrator, repo, upload) = setup(Arc::new(fs), configuration).await;

    let finished = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(finished.state, UploadState::Completed);
    assert!(finished.root_cid.is_some());

    let added = repo.list_shards_by_state(upload.id, ShardState::Added).await.unwrap();
    assert_eq!(added.len(), 1, "default half-gigabyte shard budget fits this whole tree in one shard");
}
