//! The repository trait (spec component C4) and an in-process
//! implementation used by the core crate's own tests. A durable,
//! SQLite-backed implementation lives in the sibling `repository` crate.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::cid::Cid;
use crate::error::CoreError;
use crate::model::{
    Configuration, DagScan, DagScanState, FsEntry, Link, Node, NodeInShard, Scan, Shard,
    ShardState, Source, Upload, Id,
};

/// Persistence boundary for the whole pipeline. Every method is
/// independently transactional; callers never assume multi-call atomicity
/// (§4.4, §5).
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_source(&self, id: Id) -> Result<Source, CoreError>;
    async fn put_source(&self, source: Source) -> Result<(), CoreError>;

    async fn get_configuration(&self, id: Id) -> Result<Configuration, CoreError>;
    async fn put_configuration(&self, configuration: Configuration) -> Result<(), CoreError>;

    async fn create_upload(&self, upload: Upload) -> Result<(), CoreError>;
    async fn get_upload(&self, id: Id) -> Result<Upload, CoreError>;
    async fn update_upload(&self, upload: Upload) -> Result<(), CoreError>;

    async fn create_scan(&self, scan: Scan) -> Result<(), CoreError>;
    async fn get_scan_for_upload(&self, upload_id: Id) -> Result<Option<Scan>, CoreError>;
    async fn update_scan(&self, scan: Scan) -> Result<(), CoreError>;

    /// Finds an `FsEntry` by its dedup checksum within a source, creating it
    /// if absent. Returns `(entry, was_created)`.
    async fn find_or_create_fs_entry(&self, entry: FsEntry) -> Result<(FsEntry, bool), CoreError>;
    async fn get_fs_entry(&self, id: Id) -> Result<FsEntry, CoreError>;

    /// Records the ordered list of a directory's children. Idempotent:
    /// replaces any previously recorded ordering for this parent.
    async fn set_directory_children(&self, parent_id: Id, children: Vec<Id>) -> Result<(), CoreError>;
    async fn get_directory_children(&self, parent_id: Id) -> Result<Vec<Id>, CoreError>;

    /// Finds or creates the `DagScan` keyed by `fs_entry_id`. Returns
    /// `(scan, was_created)`.
    async fn find_or_create_dag_scan(&self, scan: DagScan) -> Result<(DagScan, bool), CoreError>;
    async fn get_dag_scan(&self, fs_entry_id: Id) -> Result<Option<DagScan>, CoreError>;
    async fn update_dag_scan(&self, scan: DagScan) -> Result<(), CoreError>;
    async fn list_dag_scans_by_state(
        &self,
        upload_id: Id,
        states: &[DagScanState],
    ) -> Result<Vec<DagScan>, CoreError>;

    /// Finds or creates a `Node` by CID (content-addressed dedup).
    async fn find_or_create_node(&self, node: Node) -> Result<Node, CoreError>;
    async fn get_node(&self, cid: Cid) -> Result<Option<Node>, CoreError>;

    async fn create_links(&self, links: Vec<Link>) -> Result<(), CoreError>;
    async fn list_links(&self, parent_cid: Cid) -> Result<Vec<Link>, CoreError>;

    async fn create_shard(&self, shard: Shard) -> Result<(), CoreError>;
    async fn update_shard(&self, shard: Shard) -> Result<(), CoreError>;
    async fn get_open_shard(&self, upload_id: Id) -> Result<Option<Shard>, CoreError>;
    async fn list_shards_by_state(&self, upload_id: Id, state: ShardState) -> Result<Vec<Shard>, CoreError>;
    async fn add_node_to_shard(&self, entry: NodeInShard) -> Result<(), CoreError>;
    async fn list_nodes_in_shard(&self, shard_id: Id) -> Result<Vec<NodeInShard>, CoreError>;
}

#[derive(Default)]
struct State {
    sources: HashMap<Id, Source>,
    configurations: HashMap<Id, Configuration>,
    uploads: HashMap<Id, Upload>,
    scans_by_upload: HashMap<Id, Scan>,
    fs_entries: HashMap<Id, FsEntry>,
    fs_entry_by_checksum: HashMap<(Id, Vec<u8>), Id>,
    directory_children: HashMap<Id, Vec<Id>>,
    dag_scans: HashMap<Id, DagScan>,
    nodes: HashMap<Cid, Node>,
    links: HashMap<Cid, Vec<Link>>,
    shards: HashMap<Id, Shard>,
    nodes_in_shard: HashMap<Id, Vec<NodeInShard>>,
}

/// A dependency-free [`Repository`] backed by in-process maps, mirroring
/// the disk/memory split the teacher draws between its block stores: this
/// is the memory half, used both as a legitimate embedded backend and as
/// the fixture for this crate's own tests.
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &'static str, id: impl std::fmt::Display) -> CoreError {
    CoreError::NotFound { entity, id: id.to_string() }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_source(&self, id: Id) -> Result<Source, CoreError> {
        let state = self.state.lock().await;
        state.sources.get(&id).cloned().ok_or_else(|| not_found("Source", id))
    }

    async fn put_source(&self, source: Source) -> Result<(), CoreError> {
        self.state.lock().await.sources.insert(source.id, source);
        Ok(())
    }

    async fn get_configuration(&self, id: Id) -> Result<Configuration, CoreError> {
        let state = self.state.lock().await;
        state.configurations.get(&id).cloned().ok_or_else(|| not_found("Configuration", id))
    }

    async fn put_configuration(&self, configuration: Configuration) -> Result<(), CoreError> {
        self.state.lock().await.configurations.insert(configuration.id, configuration);
        Ok(())
    }

    async fn create_upload(&self, upload: Upload) -> Result<(), CoreError> {
        self.state.lock().await.uploads.insert(upload.id, upload);
        Ok(())
    }

    async fn get_upload(&self, id: Id) -> Result<Upload, CoreError> {
        let state = self.state.lock().await;
        state.uploads.get(&id).cloned().ok_or_else(|| not_found("Upload", id))
    }

    async fn update_upload(&self, upload: Upload) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.uploads.contains_key(&upload.id) {
            return Err(not_found("Upload", upload.id));
        }
        state.uploads.insert(upload.id, upload);
        Ok(())
    }

    async fn create_scan(&self, scan: Scan) -> Result<(), CoreError> {
        self.state.lock().await.scans_by_upload.insert(scan.upload_id, scan);
        Ok(())
    }

    async fn get_scan_for_upload(&self, upload_id: Id) -> Result<Option<Scan>, CoreError> {
        Ok(self.state.lock().await.scans_by_upload.get(&upload_id).cloned())
    }

    async fn update_scan(&self, scan: Scan) -> Result<(), CoreError> {
        self.state.lock().await.scans_by_upload.insert(scan.upload_id, scan);
        Ok(())
    }

    async fn find_or_create_fs_entry(&self, entry: FsEntry) -> Result<(FsEntry, bool), CoreError> {
        let mut state = self.state.lock().await;
        let key = (entry.source_id, entry.checksum.clone());
        if let Some(existing_id) = state.fs_entry_by_checksum.get(&key) {
            let existing = state.fs_entries.get(existing_id).cloned().expect("dedup index is consistent");
            return Ok((existing, false));
        }
        state.fs_entry_by_checksum.insert(key, entry.id);
        state.fs_entries.insert(entry.id, entry.clone());
        Ok((entry, true))
    }

    async fn get_fs_entry(&self, id: Id) -> Result<FsEntry, CoreError> {
        let state = self.state.lock().await;
        state.fs_entries.get(&id).cloned().ok_or_else(|| not_found("FsEntry", id))
    }

    async fn set_directory_children(&self, parent_id: Id, children: Vec<Id>) -> Result<(), CoreError> {
        self.state.lock().await.directory_children.insert(parent_id, children);
        Ok(())
    }

    async fn get_directory_children(&self, parent_id: Id) -> Result<Vec<Id>, CoreError> {
        Ok(self.state.lock().await.directory_children.get(&parent_id).cloned().unwrap_or_default())
    }

    async fn find_or_create_dag_scan(&self, scan: DagScan) -> Result<(DagScan, bool), CoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.dag_scans.get(&scan.fs_entry_id) {
            return Ok((existing.clone(), false));
        }
        state.dag_scans.insert(scan.fs_entry_id, scan.clone());
        Ok((scan, true))
    }

    async fn get_dag_scan(&self, fs_entry_id: Id) -> Result<Option<DagScan>, CoreError> {
        Ok(self.state.lock().await.dag_scans.get(&fs_entry_id).cloned())
    }

    async fn update_dag_scan(&self, scan: DagScan) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.dag_scans.contains_key(&scan.fs_entry_id) {
            return Err(not_found("DagScan", scan.fs_entry_id));
        }
        state.dag_scans.insert(scan.fs_entry_id, scan);
        Ok(())
    }

    async fn list_dag_scans_by_state(
        &self,
        upload_id: Id,
        states: &[DagScanState],
    ) -> Result<Vec<DagScan>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dag_scans
            .values()
            .filter(|s| s.upload_id == upload_id && states.contains(&s.state))
            .cloned()
            .collect())
    }

    async fn find_or_create_node(&self, node: Node) -> Result<Node, CoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.nodes.get(&node.cid) {
            return Ok(existing.clone());
        }
        state.nodes.insert(node.cid, node.clone());
        Ok(node)
    }

    async fn get_node(&self, cid: Cid) -> Result<Option<Node>, CoreError> {
        Ok(self.state.lock().await.nodes.get(&cid).cloned())
    }

    async fn create_links(&self, links: Vec<Link>) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        for link in links {
            state.links.entry(link.parent_cid).or_default().push(link);
        }
        Ok(())
    }

    async fn list_links(&self, parent_cid: Cid) -> Result<Vec<Link>, CoreError> {
        let mut links = self.state.lock().await.links.get(&parent_cid).cloned().unwrap_or_default();
        links.sort_by_key(|l| l.ordering);
        Ok(links)
    }

    async fn create_shard(&self, shard: Shard) -> Result<(), CoreError> {
        self.state.lock().await.shards.insert(shard.id, shard);
        Ok(())
    }

    async fn update_shard(&self, shard: Shard) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.shards.contains_key(&shard.id) {
            return Err(not_found("Shard", shard.id));
        }
        state.shards.insert(shard.id, shard);
        Ok(())
    }

    async fn get_open_shard(&self, upload_id: Id) -> Result<Option<Shard>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .shards
            .values()
            .find(|s| s.upload_id == upload_id && s.state == ShardState::Open)
            .cloned())
    }

    async fn list_shards_by_state(&self, upload_id: Id, wanted: ShardState) -> Result<Vec<Shard>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.shards.values().filter(|s| s.upload_id == upload_id && s.state == wanted).cloned().collect())
    }

    async fn add_node_to_shard(&self, entry: NodeInShard) -> Result<(), CoreError> {
        self.state.lock().await.nodes_in_shard.entry(entry.shard_id).or_default().push(entry);
        Ok(())
    }

    async fn list_nodes_in_shard(&self, shard_id: Id) -> Result<Vec<NodeInShard>, CoreError> {
        Ok(self.state.lock().await.nodes_in_shard.get(&shard_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FsEntryKind;

    fn entry(source_id: Id, checksum: &[u8]) -> FsEntry {
        FsEntry {
            id: Id::new(),
            source_id,
            path: "a".into(),
            last_modified: 0,
            mode: 0o644,
            size: 1,
            checksum: checksum.to_vec(),
            kind: FsEntryKind::File,
        }
    }

    #[tokio::test]
    async fn find_or_create_fs_entry_dedups_by_checksum() {
        let repo = InMemoryRepository::new();
        let source_id = Id::new();
        let (first, created1) = repo.find_or_create_fs_entry(entry(source_id, b"x")).await.unwrap();
        let (second, created2) = repo.find_or_create_fs_entry(entry(source_id, b"x")).await.unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn find_or_create_dag_scan_is_idempotent() {
        let repo = InMemoryRepository::new();
        let fs_entry_id = Id::new();
        let upload_id = Id::new();
        let (a, c1) = repo
            .find_or_create_dag_scan(DagScan::new(fs_entry_id, upload_id, crate::model::DagScanKind::File))
            .await
            .unwrap();
        let (b, c2) = repo
            .find_or_create_dag_scan(DagScan::new(fs_entry_id, upload_id, crate::model::DagScanKind::File))
            .await
            .unwrap();
        assert!(c1);
        assert!(!c2);
        assert_eq!(a.fs_entry_id, b.fs_entry_id);
    }

    #[tokio::test]
    async fn links_round_trip_in_insertion_order() {
        let repo = InMemoryRepository::new();
        let parent = crate::cid::encode_raw_cid(b"parent");
        let child_a = crate::cid::encode_raw_cid(b"a");
        let child_b = crate::cid::encode_raw_cid(b"b");
        repo.create_links(vec![
            Link { parent_cid: parent, ordering: 1, name: "b".into(), t_size: 1, hash_cid: child_b },
            Link { parent_cid: parent, ordering: 0, name: "a".into(), t_size: 1, hash_cid: child_a },
        ])
        .await
        .unwrap();
        let links = repo.list_links(parent).await.unwrap();
        assert_eq!(links.iter().map(|l| l.name.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
