//! End-to-end pipeline tests against a real (in-memory) SQLite database,
//! covering the scenarios the core crate's own tests only exercise
//! against `InMemoryRepository`.

use std::sync::Arc;

use upload_core::blob::RecordingBlobAdder;
use upload_core::filesystem::MemoryFilesystem;
use upload_core::model::{Configuration, Source, Upload, UploadState};
use upload_core::{Orchestrator, Repository};
use upload_repository::SqliteRepository;

async fn sqlite_repo() -> Arc<dyn Repository> {
    Arc::new(SqliteRepository::connect("sqlite::memory:").await.unwrap())
}

#[tokio::test]
async fn multi_file_tree_completes_against_sqlite() {
    let repo = sqlite_repo().await;
    let fs = MemoryFilesystem::new()
        .with_dir("/root")
        .with_dir("/root/docs")
        .with_file("/root/a.txt", b"hello".to_vec())
        .with_file("/root/b.txt", b"world".to_vec())
        .with_file("/root/docs/c.txt", b"nested".to_vec());

    let source = Source::new_local("demo", "/root");
    repo.put_source(source.clone()).await.unwrap();
    let configuration = Configuration::default_sized("default");
    repo.put_configuration(configuration.clone()).await.unwrap();
    let upload = Upload::new(configuration.id, source.id);
    repo.create_upload(upload.clone()).await.unwrap();

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let orchestrator = Orchestrator::new(repo.clone(), Arc::new(fs), Arc::new(RecordingBlobAdder::new()), rx);
    let finished = orchestrator.run(upload.id).await.unwrap();

    assert_eq!(finished.state, UploadState::Completed);
    assert!(finished.root_cid.is_some());
}

#[tokio::test]
async fn resuming_a_pending_upload_picks_up_where_it_left_off() {
    let repo = sqlite_repo().await;
    let fs = MemoryFilesystem::new().with_dir("/root").with_file("/root/a.txt", b"hi".to_vec());

    let source = Source::new_local("demo", "/root");
    repo.put_source(source.clone()).await.unwrap();
    let configuration = Configuration::default_sized("default");
    repo.put_configuration(configuration.clone()).await.unwrap();
    let upload = Upload::new(configuration.id, source.id);
    repo.create_upload(upload.clone()).await.unwrap();

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let orchestrator = Orchestrator::new(repo.clone(), Arc::new(fs), Arc::new(RecordingBlobAdder::new()), rx);

    // First run completes; running again against the same (now-terminal)
    // upload must be a no-op that returns the same completed state.
    let first = orchestrator.run(upload.id).await.unwrap();
    let second = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(first.state, UploadState::Completed);
    assert_eq!(second.state, UploadState::Completed);
    assert_eq!(first.root_cid, second.root_cid);
}

#[tokio::test]
async fn cancellation_is_recorded_in_sqlite() {
    let repo = sqlite_repo().await;
    let fs = MemoryFilesystem::new().with_dir("/root");
    let source = Source::new_local("demo", "/root");
    repo.put_source(source.clone()).await.unwrap();
    let configuration = Configuration::default_sized("default");
    repo.put_configuration(configuration.clone()).await.unwrap();
    let upload = Upload::new(configuration.id, source.id);
    repo.create_upload(upload.clone()).await.unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).unwrap();
    let orchestrator = Orchestrator::new(repo.clone(), Arc::new(fs), Arc::new(RecordingBlobAdder::new()), rx);
    let finished = orchestrator.run(upload.id).await.unwrap();
    assert_eq!(finished.state, UploadState::Cancelled);

    let reloaded = repo.get_upload(upload.id).await.unwrap();
    assert_eq!(reloaded.state, UploadState::Cancelled);
}
