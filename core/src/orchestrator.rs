//! Upload orchestrator (spec component C8): drives one `Upload` through
//! its state machine, restarting transient failures up to the active
//! `Configuration`'s budget and leaving everything else resumable.
//!
//! Grounded on the teacher's `banyan-guts::native::sync` module for the
//! overall shape (one state enum, matched in a loop, async all the way
//! down) and on its coalescing-signal style of cancellation. §4.8 asks for
//! three cooperative workers wired over capacity-1 coalescing channels; a
//! `tokio::sync::watch` channel already *is* a capacity-1 coalescing
//! channel ("multiple signals coalesce", §5), so `dag_work`/`shard_work`
//! are built on `watch` rather than pulling in `tokio-util`'s
//! `CancellationToken` for the one cancellation flag this crate already
//! modeled the same way (see DESIGN.md).
//!
//! The DAG-scan worker drains `DagScan` rows and feeds nodes to the shard
//! packer as they're produced; the shard/upload worker drains closed
//! shards to the blob adder as they appear. Both run concurrently with the
//! main loop, so DAG generation, sharding, and uploading overlap instead of
//! running as three fully sequential passes. They're spawned fresh at the
//! start of `run()` for any non-terminal state, not only on `Pending ->
//! Scanning`, so a process restart that resumes an upload mid-pipeline
//! gets live workers too; whichever work channel a skipped phase would
//! have fed is pre-closed so its worker still gets one drain pass instead
//! of blocking forever on a signal that will never come.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::blob::BlobAdder;
use crate::dag::DagBuilder;
use crate::error::{CoreError, ErrorCategory};
use crate::filesystem::Filesystem;
use crate::model::{Configuration, DagScanState, Id, ShardState, Upload, UploadState};
use crate::repo::Repository;
use crate::scanner::Scanner;
use crate::shard_packer::ShardPacker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Advanced,
    Cancelled,
}

/// The cooperative workers for one attempt at an upload (§4.8), spawned the
/// first time `run()`'s loop sees a non-terminal state and torn down on
/// Restart or cancellation.
/// `dag_work_tx`/`shard_work_tx` are dropped (closing the channel) once
/// the phase that feeds them has nothing left to produce; the worker sees
/// the close, drains whatever is left, and its join handle resolves.
struct Workers {
    dag_work_tx: Option<watch::Sender<u64>>,
    shard_work_tx: Option<watch::Sender<u64>>,
    dag_scan: JoinHandle<Result<(), CoreError>>,
    shard_upload: JoinHandle<Result<(), CoreError>>,
}

impl Workers {
    /// Requests cancellation of both workers and waits for them to
    /// actually stop (§4.8's "wait for workers to drain") before the
    /// caller recreates the work channels.
    async fn abort(self) {
        self.dag_scan.abort();
        self.shard_upload.abort();
        let _ = self.dag_scan.await;
        let _ = self.shard_upload.await;
    }
}

pub struct Orchestrator {
    repository: Arc<dyn Repository>,
    filesystem: Arc<dyn Filesystem>,
    blob_adder: Arc<dyn BlobAdder>,
    cancel: tokio::sync::watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn Repository>,
        filesystem: Arc<dyn Filesystem>,
        blob_adder: Arc<dyn BlobAdder>,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self { repository, filesystem, blob_adder, cancel }
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Spawns the DAG-scan and shard/upload workers for one attempt at
    /// `upload_id`. The DAG-scan worker wakes on `dag_work`, runs C6, and
    /// places every node it produces straight into the shard packer,
    /// nudging `shard_work` after each placement. The shard/upload worker
    /// wakes on `shard_work` and drains whatever shards are `Closed` to
    /// the blob adder (C9), which also serves as the spec's "ambient"
    /// upload-confirmation worker since marking a shard `Added` *is* the
    /// confirmation.
    fn spawn_workers(&self, upload_id: Id, source_id: Id, configuration: &Configuration) -> Workers {
        let (dag_work_tx, dag_work_rx) = watch::channel(0u64);
        let (shard_work_tx, shard_work_rx) = watch::channel(0u64);

        let dag_scan = {
            let repository = self.repository.clone();
            let filesystem = self.filesystem.clone();
            let configuration = configuration.clone();
            let mut dag_work_rx = dag_work_rx;
            let shard_work_tx = shard_work_tx.clone();
            let mut cancel = self.cancel.clone();
            tokio::spawn(async move {
                let source = repository.get_source(source_id).await?;
                let dag_builder = DagBuilder::new(filesystem, repository.clone());
                let packer = ShardPacker::new(repository.clone(), configuration.shard_size);
                loop {
                    if *cancel.borrow() {
                        return Err(CoreError::Cancelled);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.changed() => continue,
                        changed = dag_work_rx.changed() => {
                            if *cancel.borrow() {
                                return Err(CoreError::Cancelled);
                            }
                            dag_builder.run(upload_id, &source, &configuration, &packer, &shard_work_tx).await?;
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            })
        };

        let shard_upload = {
            let repository = self.repository.clone();
            let blob_adder = self.blob_adder.clone();
            let mut shard_work_rx = shard_work_rx;
            let mut cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    if *cancel.borrow() {
                        return Err(CoreError::Cancelled);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.changed() => continue,
                        changed = shard_work_rx.changed() => {
                            if *cancel.borrow() {
                                return Err(CoreError::Cancelled);
                            }
                            drain_closed_shards(&repository, &blob_adder, upload_id).await?;
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            })
        };

        Workers { dag_work_tx: Some(dag_work_tx), shard_work_tx: Some(shard_work_tx), dag_scan, shard_upload }
    }

    /// Restart procedure (§4.8): tear down the workers, reset any `DagScan`
    /// left `Failed` by this attempt back to `Pending` so the next attempt
    /// retries it, then move the upload back to `Pending` with
    /// `root_fs_entry_id`/`root_cid` cleared.
    async fn restart(&self, upload: &mut Upload, workers: &mut Option<Workers>) -> Result<(), CoreError> {
        if let Some(w) = workers.take() {
            w.abort().await;
        }
        for mut scan in self.repository.list_dag_scans_by_state(upload.id, &[DagScanState::Failed]).await? {
            scan.state = DagScanState::Pending;
            scan.error_message = None;
            scan.touch_updated();
            self.repository.update_dag_scan(scan).await?;
        }
        upload.state = UploadState::Pending;
        upload.root_fs_entry_id = None;
        upload.root_cid = None;
        upload.touch();
        self.repository.update_upload(upload.clone()).await
    }

    /// Drives `upload_id` to `Completed`, `Failed`, or `Cancelled`. Safe to
    /// call repeatedly on the same upload: every phase resumes from
    /// whatever the repository already recorded.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn run(&self, upload_id: Id) -> Result<Upload, CoreError> {
        let mut upload = self.repository.get_upload(upload_id).await?;
        let configuration = self.repository.get_configuration(upload.configuration_id).await?;
        let mut restarts_remaining = configuration.max_restarts;
        let mut workers: Option<Workers> = None;

        loop {
            if self.cancel_requested() {
                if let Some(w) = workers.take() {
                    w.abort().await;
                }
                return self.finish(upload, UploadState::Cancelled, None).await;
            }

            // A fresh `run()` call resuming a process-crashed upload lands
            // on whatever non-terminal state was last persisted, not on
            // `Pending` — spawn workers here too so `Scanning`/
            // `GeneratingDAG`/`Uploading` always find them, rather than
            // only on the `Pending -> Scanning` transition. A state that
            // has already moved past where a channel is seeded/closed
            // (e.g. resuming straight into `GeneratingDAG`, so
            // `step_scanning` never runs this attempt) gets that channel
            // pre-closed, since no further signals on it will ever come;
            // the worker still gets its guaranteed drain pass once it
            // observes the channel closed.
            if workers.is_none()
                && !matches!(
                    upload.state,
                    UploadState::Completed | UploadState::Failed | UploadState::Cancelled
                )
            {
                let mut w = self.spawn_workers(upload_id, upload.source_id, &configuration);
                if !matches!(upload.state, UploadState::Pending | UploadState::Scanning) {
                    w.dag_work_tx = None;
                }
                if !matches!(
                    upload.state,
                    UploadState::Pending | UploadState::Scanning | UploadState::GeneratingDAG
                ) {
                    w.shard_work_tx = None;
                }
                workers = Some(w);
            }

            let step = match upload.state {
                UploadState::Pending => {
                    upload.state = UploadState::Scanning;
                    upload.touch();
                    self.repository.update_upload(upload.clone()).await?;
                    Ok(StepOutcome::Advanced)
                }
                UploadState::Scanning => {
                    let workers = workers.as_mut().expect("workers spawned at top of loop for any non-terminal state");
                    self.step_scanning(&mut upload, workers).await
                }
                UploadState::GeneratingDAG => {
                    let workers = workers.as_mut().expect("workers spawned at top of loop for any non-terminal state");
                    self.step_generating_dag(&mut upload, workers, &configuration).await
                }
                UploadState::Sharding => {
                    // Sharding happens inline as the DAG builder emits
                    // nodes (§4.7); reaching this state means every shard
                    // the DAG produced is already closed and the
                    // shard/upload worker has been told no more will
                    // come. There is nothing left but to wait for it.
                    upload.state = UploadState::Uploading;
                    upload.touch();
                    self.repository.update_upload(upload.clone()).await?;
                    Ok(StepOutcome::Advanced)
                }
                UploadState::Uploading => {
                    let workers = workers.as_mut().expect("workers spawned at top of loop for any non-terminal state");
                    self.step_uploading(&mut upload, workers).await
                }
                UploadState::Completed | UploadState::Failed | UploadState::Cancelled => {
                    if let Some(w) = workers.take() {
                        w.abort().await;
                    }
                    return Ok(upload);
                }
            };

            match step {
                Ok(StepOutcome::Advanced) => continue,
                Ok(StepOutcome::Cancelled) => {
                    if let Some(w) = workers.take() {
                        w.abort().await;
                    }
                    return self.finish(upload, UploadState::Cancelled, None).await;
                }
                Err(e) => match e.category() {
                    ErrorCategory::Cancellation => {
                        if let Some(w) = workers.take() {
                            w.abort().await;
                        }
                        return self.finish(upload, UploadState::Cancelled, None).await;
                    }
                    ErrorCategory::Validation | ErrorCategory::Protocol => {
                        if let Some(w) = workers.take() {
                            w.abort().await;
                        }
                        error!(error = %e, "unrecoverable error, failing upload");
                        return self.finish(upload, UploadState::Failed, Some(e.to_string())).await;
                    }
                    ErrorCategory::NotFound | ErrorCategory::TransientIo | ErrorCategory::DataIntegrity => {
                        if restarts_remaining == 0 {
                            if let Some(w) = workers.take() {
                                w.abort().await;
                            }
                            let message = e.to_string();
                            let exhausted = CoreError::RestartsExhausted {
                                attempts: configuration.max_restarts,
                                last: message.clone(),
                            };
                            error!(error = %exhausted, attempts = configuration.max_restarts, last_error = %message, "restart budget exhausted");
                            return self
                                .finish(upload, UploadState::Failed, Some(exhausted.to_string()))
                                .await;
                        }
                        restarts_remaining -= 1;
                        warn!(
                            error = %e,
                            restarts_remaining,
                            "transient error, restarting from a clean scan"
                        );
                        self.restart(&mut upload, &mut workers).await?;
                    }
                    ErrorCategory::Exhaustion => {
                        if let Some(w) = workers.take() {
                            w.abort().await;
                        }
                        return self.finish(upload, UploadState::Failed, Some(e.to_string())).await;
                    }
                },
            }
        }
    }

    async fn step_scanning(&self, upload: &mut Upload, workers: &mut Workers) -> Result<StepOutcome, CoreError> {
        let source = self.repository.get_source(upload.source_id).await?;
        let scanner = Scanner::new(self.filesystem.clone(), self.repository.clone());
        let scan = scanner.run(upload.id, &source).await?;
        let root_fs_entry_id = match scan.root_fs_entry_id {
            Some(id) => id,
            // Per §4.8: a scan that returns no root (cancelled mid-walk)
            // is a Restart trigger, not a hard failure.
            None => return Err(CoreError::Repository("scan finished without a root entry".into())),
        };

        let dag_work_tx =
            workers.dag_work_tx.as_ref().expect("dag_work is still open while scanning is in progress");
        let dag_builder = DagBuilder::new(self.filesystem.clone(), self.repository.clone());
        dag_builder.seed(upload.id, root_fs_entry_id, dag_work_tx).await?;
        // Scanning is done and every entry it found has been seeded as a
        // DagScan; closing dag_work tells the DAG-scan worker no more work
        // will arrive once it drains what's already pending.
        workers.dag_work_tx = None;

        upload.root_fs_entry_id = Some(root_fs_entry_id);
        upload.state = UploadState::GeneratingDAG;
        upload.touch();
        self.repository.update_upload(upload.clone()).await?;
        info!("scan complete, moving to dag generation");
        Ok(StepOutcome::Advanced)
    }

    async fn step_generating_dag(
        &self,
        upload: &mut Upload,
        workers: &mut Workers,
        configuration: &Configuration,
    ) -> Result<StepOutcome, CoreError> {
        let root_fs_entry_id = upload
            .root_fs_entry_id
            .ok_or_else(|| CoreError::Protocol("entered GeneratingDAG without a scanned root".into()))?;

        match (&mut workers.dag_scan).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => return Err(CoreError::Protocol(format!("dag-scan worker panicked: {join_err}"))),
        }

        let root_scan = self.repository.get_dag_scan(root_fs_entry_id).await?;
        let root_cid = match root_scan {
            Some(scan) if scan.state == DagScanState::Completed => scan
                .cid
                .ok_or_else(|| CoreError::Protocol("dag builder finished without a root cid".into()))?,
            _ => {
                return Err(CoreError::Repository(format!(
                    "dag scan for {root_fs_entry_id} did not complete"
                )));
            }
        };

        let packer = ShardPacker::new(self.repository.clone(), configuration.shard_size);
        packer.close_upload_shards(upload.id).await?;
        // Every shard this upload will ever produce is now closed;
        // closing shard_work tells the shard/upload worker to drain what's
        // left and exit.
        workers.shard_work_tx = None;

        upload.root_cid = Some(root_cid);
        upload.state = UploadState::Sharding;
        upload.touch();
        self.repository.update_upload(upload.clone()).await?;
        info!(root_cid = %root_cid, "dag generation complete");
        Ok(StepOutcome::Advanced)
    }

    async fn step_uploading(&self, upload: &mut Upload, workers: &mut Workers) -> Result<StepOutcome, CoreError> {
        match (&mut workers.shard_upload).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_err) => return Err(CoreError::Protocol(format!("shard/upload worker panicked: {join_err}"))),
        }

        // Ambient upload-worker confirmation (§4.8): every shard the DAG
        // produced must now be `Added`.
        let still_closed = self.repository.list_shards_by_state(upload.id, ShardState::Closed).await?;
        if !still_closed.is_empty() {
            return Err(CoreError::Repository(format!(
                "{} shard(s) closed but never confirmed added",
                still_closed.len()
            )));
        }

        upload.state = UploadState::Completed;
        upload.touch();
        self.repository.update_upload(upload.clone()).await?;
        info!("upload complete");
        Ok(StepOutcome::Advanced)
    }

    async fn finish(
        &self,
        mut upload: Upload,
        state: UploadState,
        error_message: Option<String>,
    ) -> Result<Upload, CoreError> {
        upload.state = state;
        upload.error_message = error_message;
        upload.touch();
        self.repository.update_upload(upload.clone()).await?;
        Ok(upload)
    }
}

/// Uploads every `Closed` shard of `upload_id` that the blob adder hasn't
/// acknowledged yet, in shard-creation order, marking each `Added` on
/// success (§4.9). Free function (rather than an `Orchestrator` method) so
/// the shard/upload worker can own its captures independently of the
/// orchestrator across an `.await` that outlives any single step.
async fn drain_closed_shards(
    repository: &Arc<dyn Repository>,
    blob_adder: &Arc<dyn BlobAdder>,
    upload_id: Id,
) -> Result<(), CoreError> {
    let closed_shards = repository.list_shards_by_state(upload_id, ShardState::Closed).await?;
    for mut shard in closed_shards {
        let cid = shard.cid.ok_or_else(|| CoreError::Protocol("closed shard missing its cid".into()))?;
        let car_bytes = materialize_shard(repository, shard.id).await?;
        blob_adder.add_blob(cid, car_bytes.into()).await?;
        shard.state = ShardState::Added;
        repository.update_shard(shard).await?;
    }
    Ok(())
}

/// Re-derives one shard's CAR bytes from its recorded node list, in
/// insertion order.
async fn materialize_shard(repository: &Arc<dyn Repository>, shard_id: Id) -> Result<Vec<u8>, CoreError> {
    let entries = repository.list_nodes_in_shard(shard_id).await?;
    let mut out = Vec::new();
    crate::cid::write_empty_roots_car_header(&mut out);
    for entry in entries {
        if let Some(node) = repository.get_node(entry.node_cid).await? {
            crate::cid::write_car_block_frame(&mut out, &node.cid, &node.payload);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::RecordingBlobAdder;
    use crate::filesystem::MemoryFilesystem;
    use crate::model::{Configuration, Source};
    use crate::repo::InMemoryRepository;

    async fn setup(fs: MemoryFilesystem) -> (Orchestrator, Id) {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let source = Source::new_local("test", "/root");
        repo.put_source(source.clone()).await.unwrap();
        let configuration = Configuration::default_sized("test-config");
        repo.put_configuration(configuration.clone()).await.unwrap();
        let upload = Upload::new(configuration.id, source.id);
        repo.create_upload(upload.clone()).await.unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let orchestrator = Orchestrator::new(
            repo,
            Arc::new(fs),
            Arc::new(RecordingBlobAdder::new()),
            rx,
        );
        (orchestrator, upload.id)
    }

    #[tokio::test]
    async fn single_small_file_completes() {
        let fs = MemoryFilesystem::new().with_dir("/root").with_file("/root/a.txt", b"hi".to_vec());
        let (orchestrator, upload_id) = setup(fs).await;
        let finished = orchestrator.run(upload_id).await.unwrap();
        assert_eq!(finished.state, UploadState::Completed);
        assert!(finished.root_cid.is_some());
    }

    #[tokio::test]
    async fn empty_source_still_completes() {
        let fs = MemoryFilesystem::new().with_dir("/root");
        let (orchestrator, upload_id) = setup(fs).await;
        let finished = orchestrator.run(upload_id).await.unwrap();
        assert_eq!(finished.state, UploadState::Completed);
    }

    #[tokio::test]
    async fn cancellation_before_start_is_honored() {
        let fs = MemoryFilesystem::new().with_dir("/root");
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let source = Source::new_local("test", "/root");
        repo.put_source(source.clone()).await.unwrap();
        let configuration = Configuration::default_sized("test-config");
        repo.put_configuration(configuration.clone()).await.unwrap();
        let upload = Upload::new(configuration.id, source.id);
        repo.create_upload(upload.clone()).await.unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        let orchestrator = Orchestrator::new(repo, Arc::new(fs), Arc::new(RecordingBlobAdder::new()), rx);
        let finished = orchestrator.run(upload.id).await.unwrap();
        assert_eq!(finished.state, UploadState::Cancelled);
    }

    #[tokio::test]
    async fn nested_tree_pipelines_dag_generation_and_upload() {
        let fs = MemoryFilesystem::new()
            .with_dir("/root")
            .with_dir("/root/dir1")
            .with_file("/root/a.txt", vec![b'a'; 32])
            .with_file("/root/dir1/b.txt", vec![b'b'; 32])
            .with_file("/root/dir1/c.txt", vec![b'c'; 32]);
        let (orchestrator, upload_id) = setup(fs).await;
        let finished = orchestrator.run(upload_id).await.unwrap();
        assert_eq!(finished.state, UploadState::Completed);
        assert!(finished.root_cid.is_some());
    }

    /// Simulates a process crash right after scanning: the scan and seed
    /// already happened and the upload was persisted at `GeneratingDAG`,
    /// but this `Orchestrator` is freshly constructed and has never driven
    /// the upload through `Pending`, so `Workers` don't exist yet going
    /// into `run()`. Exercises the fresh-process worker spawn at the top
    /// of the loop rather than only on `Pending -> Scanning`.
    #[tokio::test]
    async fn resuming_past_scanning_in_a_fresh_process_still_completes() {
        let fs: Arc<dyn Filesystem> = Arc::new(
            MemoryFilesystem::new()
                .with_dir("/root")
                .with_file("/root/a.txt", b"resumed".to_vec()),
        );
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let source = Source::new_local("test", "/root");
        repo.put_source(source.clone()).await.unwrap();
        let configuration = Configuration::default_sized("test-config");
        repo.put_configuration(configuration.clone()).await.unwrap();
        let mut upload = Upload::new(configuration.id, source.id);
        repo.create_upload(upload.clone()).await.unwrap();

        let scanner = Scanner::new(fs.clone(), repo.clone());
        let scan = scanner.run(upload.id, &source).await.unwrap();
        let root_fs_entry_id = scan.root_fs_entry_id.unwrap();
        let dag_builder = DagBuilder::new(fs.clone(), repo.clone());
        let (dag_work_tx, _dag_work_rx) = tokio::sync::watch::channel(0u64);
        dag_builder.seed(upload.id, root_fs_entry_id, &dag_work_tx).await.unwrap();

        upload.root_fs_entry_id = Some(root_fs_entry_id);
        upload.state = UploadState::GeneratingDAG;
        repo.update_upload(upload.clone()).await.unwrap();

        let (_tx, rx) = tokio::sync::watch::channel(false);
        let orchestrator = Orchestrator::new(repo, fs, Arc::new(RecordingBlobAdder::new()), rx);
        let finished = orchestrator.run(upload.id).await.unwrap();
        assert_eq!(finished.state, UploadState::Completed);
        assert!(finished.root_cid.is_some());
    }
}
