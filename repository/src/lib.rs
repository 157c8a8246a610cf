//! SQLite-backed [`Repository`](upload_core::Repository) implementation.
//! Grounded on `ChainSafe-forest`'s declared `sqlx` dependency and its own
//! `repository` crate naming convention; each method opens its own short
//! transaction, matching the "no cross-call atomicity" contract the core
//! crate's trait documents.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use upload_core::cid::Cid;
use upload_core::error::CoreError;
use upload_core::model::{
    Configuration, DagScan, DagScanKind, DagScanState, FsEntry, FsEntryKind, Id, Link, Node,
    NodeInShard, Scan, ScanState, Shard, ShardState, Source, SourceKind, Upload, UploadState,
};
use upload_core::Repository;
use uuid::Uuid;

mod convert;
use convert::*;

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        tracing::debug!(url, "connecting sqlite repository");
        let pool = SqlitePool::connect(url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("sqlite repository migrations applied");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_repo_err(e: sqlx::Error) -> CoreError {
    CoreError::Repository(e.to_string())
}

fn not_found(entity: &'static str, id: impl std::fmt::Display) -> CoreError {
    CoreError::NotFound { entity, id: id.to_string() }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_source(&self, id: Id) -> Result<Source, CoreError> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id_text(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?
            .ok_or_else(|| not_found("Source", id))?;
        source_from_row(&row)
    }

    async fn put_source(&self, source: Source) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO sources (id, name, kind, path, connection_params, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, path=excluded.path,
               connection_params=excluded.connection_params, updated_at=excluded.updated_at",
        )
        .bind(id_text(source.id))
        .bind(&source.name)
        .bind(source_kind_text(source.kind))
        .bind(&source.path)
        .bind(&source.connection_params)
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        Ok(())
    }

    async fn get_configuration(&self, id: Id) -> Result<Configuration, CoreError> {
        let row = sqlx::query("SELECT * FROM configurations WHERE id = ?")
            .bind(id_text(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?
            .ok_or_else(|| not_found("Configuration", id))?;
        Ok(Configuration {
            id: parse_id(row.get::<String, _>("id"))?,
            name: row.get("name"),
            created_at: row.get("created_at"),
            shard_size: row.get::<i64, _>("shard_size") as u64,
            chunk_size: row.get::<i64, _>("chunk_size") as u64,
            links_per_node: row.get::<i64, _>("links_per_node") as u64,
            use_hamt_threshold: row.get::<i64, _>("use_hamt_threshold") as u64,
            max_restarts: row.get::<i64, _>("max_restarts") as u32,
        })
    }

    async fn put_configuration(&self, configuration: Configuration) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO configurations
               (id, name, created_at, shard_size, chunk_size, links_per_node, use_hamt_threshold, max_restarts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id_text(configuration.id))
        .bind(&configuration.name)
        .bind(configuration.created_at)
        .bind(configuration.shard_size as i64)
        .bind(configuration.chunk_size as i64)
        .bind(configuration.links_per_node as i64)
        .bind(configuration.use_hamt_threshold as i64)
        .bind(configuration.max_restarts as i64)
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        Ok(())
    }

    async fn create_upload(&self, upload: Upload) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO uploads
               (id, configuration_id, source_id, created_at, updated_at, state, error_message, root_fs_entry_id, root_cid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id_text(upload.id))
        .bind(id_text(upload.configuration_id))
        .bind(id_text(upload.source_id))
        .bind(upload.created_at)
        .bind(upload.updated_at)
        .bind(upload_state_text(upload.state))
        .bind(&upload.error_message)
        .bind(upload.root_fs_entry_id.map(id_text))
        .bind(upload.root_cid.map(|c| c.to_bytes()))
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        Ok(())
    }

    async fn get_upload(&self, id: Id) -> Result<Upload, CoreError> {
        let row = sqlx::query("SELECT * FROM uploads WHERE id = ?")
            .bind(id_text(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?
            .ok_or_else(|| not_found("Upload", id))?;
        upload_from_row(&row)
    }

    async fn update_upload(&self, upload: Upload) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE uploads SET updated_at=?, state=?, error_message=?, root_fs_entry_id=?, root_cid=? WHERE id=?",
        )
        .bind(upload.updated_at)
        .bind(upload_state_text(upload.state))
        .bind(&upload.error_message)
        .bind(upload.root_fs_entry_id.map(id_text))
        .bind(upload.root_cid.map(|c| c.to_bytes()))
        .bind(id_text(upload.id))
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found("Upload", upload.id));
        }
        Ok(())
    }

    async fn create_scan(&self, scan: Scan) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO scans (upload_id, id, root_fs_entry_id, created_at, updated_at, state, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id_text(scan.upload_id))
        .bind(id_text(scan.id))
        .bind(scan.root_fs_entry_id.map(id_text))
        .bind(scan.created_at)
        .bind(scan.updated_at)
        .bind(scan_state_text(scan.state))
        .bind(&scan.error_message)
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        Ok(())
    }

    async fn get_scan_for_upload(&self, upload_id: Id) -> Result<Option<Scan>, CoreError> {
        let row = sqlx::query("SELECT * FROM scans WHERE upload_id = ?")
            .bind(id_text(upload_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn update_scan(&self, scan: Scan) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE scans SET id=?, root_fs_entry_id=?, updated_at=?, state=?, error_message=? WHERE upload_id=?",
        )
        .bind(id_text(scan.id))
        .bind(scan.root_fs_entry_id.map(id_text))
        .bind(scan.updated_at)
        .bind(scan_state_text(scan.state))
        .bind(&scan.error_message)
        .bind(id_text(scan.upload_id))
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        Ok(())
    }

    async fn find_or_create_fs_entry(&self, entry: FsEntry) -> Result<(FsEntry, bool), CoreError> {
        let mut tx = self.pool.begin().await.map_err(to_repo_err)?;
        let existing = sqlx::query("SELECT * FROM fs_entries WHERE source_id = ? AND checksum = ?")
            .bind(id_text(entry.source_id))
            .bind(&entry.checksum)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_repo_err)?;
        if let Some(row) = existing {
            tx.commit().await.map_err(to_repo_err)?;
            return Ok((fs_entry_from_row(&row)?, false));
        }

        sqlx::query(
            "INSERT INTO fs_entries (id, source_id, path, last_modified, mode, size, checksum, kind)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id_text(entry.id))
        .bind(id_text(entry.source_id))
        .bind(&entry.path)
        .bind(entry.last_modified)
        .bind(entry.mode as i64)
        .bind(entry.size as i64)
        .bind(&entry.checksum)
        .bind(fs_entry_kind_text(entry.kind))
        .execute(&mut *tx)
        .await
        .map_err(to_repo_err)?;
        tx.commit().await.map_err(to_repo_err)?;
        Ok((entry, true))
    }

    async fn get_fs_entry(&self, id: Id) -> Result<FsEntry, CoreError> {
        let row = sqlx::query("SELECT * FROM fs_entries WHERE id = ?")
            .bind(id_text(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?
            .ok_or_else(|| not_found("FsEntry", id))?;
        fs_entry_from_row(&row)
    }

    async fn set_directory_children(&self, parent_id: Id, children: Vec<Id>) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(to_repo_err)?;
        sqlx::query("DELETE FROM directory_children WHERE parent_id = ?")
            .bind(id_text(parent_id))
            .execute(&mut *tx)
            .await
            .map_err(to_repo_err)?;
        for (ordering, child_id) in children.into_iter().enumerate() {
            sqlx::query("INSERT INTO directory_children (parent_id, ordering, child_id) VALUES (?, ?, ?)")
                .bind(id_text(parent_id))
                .bind(ordering as i64)
                .bind(id_text(child_id))
                .execute(&mut *tx)
                .await
                .map_err(to_repo_err)?;
        }
        tx.commit().await.map_err(to_repo_err)?;
        Ok(())
    }

    async fn get_directory_children(&self, parent_id: Id) -> Result<Vec<Id>, CoreError> {
        let rows = sqlx::query("SELECT child_id FROM directory_children WHERE parent_id = ? ORDER BY ordering")
            .bind(id_text(parent_id))
            .fetch_all(&self.pool)
            .await
            .map_err(to_repo_err)?;
        rows.into_iter().map(|r| parse_id(r.get::<String, _>("child_id"))).collect()
    }

    async fn find_or_create_dag_scan(&self, scan: DagScan) -> Result<(DagScan, bool), CoreError> {
        let mut tx = self.pool.begin().await.map_err(to_repo_err)?;
        let existing = sqlx::query("SELECT * FROM dag_scans WHERE fs_entry_id = ?")
            .bind(id_text(scan.fs_entry_id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_repo_err)?;
        if let Some(row) = existing {
            tx.commit().await.map_err(to_repo_err)?;
            return Ok((dag_scan_from_row(&row)?, false));
        }
        sqlx::query(
            "INSERT INTO dag_scans (fs_entry_id, upload_id, kind, created_at, updated_at, state, error_message, cid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id_text(scan.fs_entry_id))
        .bind(id_text(scan.upload_id))
        .bind(dag_scan_kind_text(scan.kind))
        .bind(scan.created_at)
        .bind(scan.updated_at)
        .bind(dag_scan_state_text(scan.state))
        .bind(&scan.error_message)
        .bind(scan.cid.map(|c| c.to_bytes()))
        .execute(&mut *tx)
        .await
        .map_err(to_repo_err)?;
        tx.commit().await.map_err(to_repo_err)?;
        Ok((scan, true))
    }

    async fn get_dag_scan(&self, fs_entry_id: Id) -> Result<Option<DagScan>, CoreError> {
        let row = sqlx::query("SELECT * FROM dag_scans WHERE fs_entry_id = ?")
            .bind(id_text(fs_entry_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?;
        row.as_ref().map(dag_scan_from_row).transpose()
    }

    async fn update_dag_scan(&self, scan: DagScan) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE dag_scans SET updated_at=?, state=?, error_message=?, cid=? WHERE fs_entry_id=?",
        )
        .bind(scan.updated_at)
        .bind(dag_scan_state_text(scan.state))
        .bind(&scan.error_message)
        .bind(scan.cid.map(|c| c.to_bytes()))
        .bind(id_text(scan.fs_entry_id))
        .execute(&self.pool)
        .await
        .map_err(to_repo_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found("DagScan", scan.fs_entry_id));
        }
        Ok(())
    }

    async fn list_dag_scans_by_state(
        &self,
        upload_id: Id,
        states: &[DagScanState],
    ) -> Result<Vec<DagScan>, CoreError> {
        // SQLite driver doesn't bind Vec directly; build the IN clause manually
        // since `states` only ever holds our own fixed-name enum variants.
        let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM dag_scans WHERE upload_id = ? AND state IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(id_text(upload_id));
        for state in states {
            query = query.bind(dag_scan_state_text(*state));
        }
        let rows = query.fetch_all(&self.pool).await.map_err(to_repo_err)?;
        rows.iter().map(dag_scan_from_row).collect()
    }

    async fn find_or_create_node(&self, node: Node) -> Result<Node, CoreError> {
        let cid_bytes = node.cid.to_bytes();
        let mut tx = self.pool.begin().await.map_err(to_repo_err)?;
        let existing = sqlx::query("SELECT * FROM nodes WHERE cid = ?")
            .bind(&cid_bytes)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_repo_err)?;
        if let Some(row) = existing {
            tx.commit().await.map_err(to_repo_err)?;
            return node_from_row(&row);
        }
        sqlx::query(
            "INSERT INTO nodes (cid, size, payload, ufsdata, path, source_id, offset) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cid_bytes)
        .bind(node.size as i64)
        .bind(&node.payload)
        .bind(&node.ufsdata)
        .bind(&node.path)
        .bind(id_text(node.source_id))
        .bind(node.offset as i64)
        .execute(&mut *tx)
        .await
        .map_err(to_repo_err)?;
        tx.commit().await.map_err(to_repo_err)?;
        Ok(node)
    }

    async fn get_node(&self, cid: Cid) -> Result<Option<Node>, CoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE cid = ?")
            .bind(cid.to_bytes())
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn create_links(&self, links: Vec<Link>) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(to_repo_err)?;
        for link in links {
            sqlx::query(
                "INSERT INTO links (parent_cid, ordering, name, t_size, hash_cid) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(link.parent_cid.to_bytes())
            .bind(link.ordering)
            .bind(&link.name)
            .bind(link.t_size as i64)
            .bind(link.hash_cid.to_bytes())
            .execute(&mut *tx)
            .await
            .map_err(to_repo_err)?;
        }
        tx.commit().await.map_err(to_repo_err)?;
        Ok(())
    }

    async fn list_links(&self, parent_cid: Cid) -> Result<Vec<Link>, CoreError> {
        let rows = sqlx::query("SELECT * FROM links WHERE parent_cid = ? ORDER BY ordering")
            .bind(parent_cid.to_bytes())
            .fetch_all(&self.pool)
            .await
            .map_err(to_repo_err)?;
        rows.iter().map(link_from_row).collect()
    }

    async fn create_shard(&self, shard: Shard) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO shards (id, upload_id, cid, state) VALUES (?, ?, ?, ?)")
            .bind(id_text(shard.id))
            .bind(id_text(shard.upload_id))
            .bind(shard.cid.map(|c| c.to_bytes()))
            .bind(shard_state_text(shard.state))
            .execute(&self.pool)
            .await
            .map_err(to_repo_err)?;
        Ok(())
    }

    async fn update_shard(&self, shard: Shard) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE shards SET cid=?, state=? WHERE id=?")
            .bind(shard.cid.map(|c| c.to_bytes()))
            .bind(shard_state_text(shard.state))
            .bind(id_text(shard.id))
            .execute(&self.pool)
            .await
            .map_err(to_repo_err)?;
        if result.rows_affected() == 0 {
            return Err(not_found("Shard", shard.id));
        }
        Ok(())
    }

    async fn get_open_shard(&self, upload_id: Id) -> Result<Option<Shard>, CoreError> {
        let row = sqlx::query("SELECT * FROM shards WHERE upload_id = ? AND state = ? LIMIT 1")
            .bind(id_text(upload_id))
            .bind(shard_state_text(ShardState::Open))
            .fetch_optional(&self.pool)
            .await
            .map_err(to_repo_err)?;
        row.as_ref().map(shard_from_row).transpose()
    }

    async fn list_shards_by_state(&self, upload_id: Id, state: ShardState) -> Result<Vec<Shard>, CoreError> {
        let rows = sqlx::query("SELECT * FROM shards WHERE upload_id = ? AND state = ?")
            .bind(id_text(upload_id))
            .bind(shard_state_text(state))
            .fetch_all(&self.pool)
            .await
            .map_err(to_repo_err)?;
        rows.iter().map(shard_from_row).collect()
    }

    async fn add_node_to_shard(&self, entry: NodeInShard) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO nodes_in_shard (shard_id, node_cid, offset) VALUES (?, ?, ?)")
            .bind(id_text(entry.shard_id))
            .bind(entry.node_cid.to_bytes())
            .bind(entry.offset.map(|o| o as i64))
            .execute(&self.pool)
            .await
            .map_err(to_repo_err)?;
        Ok(())
    }

    async fn list_nodes_in_shard(&self, shard_id: Id) -> Result<Vec<NodeInShard>, CoreError> {
        let rows = sqlx::query("SELECT * FROM nodes_in_shard WHERE shard_id = ? ORDER BY row_id")
            .bind(id_text(shard_id))
            .fetch_all(&self.pool)
            .await
            .map_err(to_repo_err)?;
        rows.iter().map(node_in_shard_from_row).collect()
    }
}

pub(crate) fn id_text(id: Id) -> String {
    id.0.to_string()
}

pub(crate) fn parse_id(s: String) -> Result<Id, CoreError> {
    Uuid::parse_str(&s).map(Id).map_err(|e| CoreError::Repository(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use upload_core::model::{DagScan as CoreDagScan, FsEntry as CoreFsEntry};

    async fn fresh() -> SqliteRepository {
        SqliteRepository::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn source_round_trips() {
        let repo = fresh().await;
        let source = Source::new_local("demo", "/data");
        repo.put_source(source.clone()).await.unwrap();
        let fetched = repo.get_source(source.id).await.unwrap();
        assert_eq!(fetched.path, "/data");
    }

    #[tokio::test]
    async fn fs_entry_dedup_by_checksum() {
        let repo = fresh().await;
        let source = Source::new_local("demo", "/data");
        repo.put_source(source.clone()).await.unwrap();
        let entry = CoreFsEntry {
            id: Id::new(),
            source_id: source.id,
            path: "a.txt".into(),
            last_modified: 0,
            mode: 0o644,
            size: 3,
            checksum: vec![1, 2, 3],
            kind: FsEntryKind::File,
        };
        let (first, created1) = repo.find_or_create_fs_entry(entry.clone()).await.unwrap();
        let (second, created2) = repo.find_or_create_fs_entry(entry).await.unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn dag_scan_state_filtering() {
        let repo = fresh().await;
        let source = Source::new_local("demo", "/data");
        repo.put_source(source.clone()).await.unwrap();
        let configuration = Configuration::default_sized("cfg");
        repo.put_configuration(configuration.clone()).await.unwrap();
        let upload = Upload::new(configuration.id, source.id);
        repo.create_upload(upload.clone()).await.unwrap();
        let entry = CoreFsEntry {
            id: Id::new(),
            source_id: source.id,
            path: "a.txt".into(),
            last_modified: 0,
            mode: 0o644,
            size: 3,
            checksum: vec![9],
            kind: FsEntryKind::File,
        };
        let (entry, _) = repo.find_or_create_fs_entry(entry).await.unwrap();
        repo.find_or_create_dag_scan(CoreDagScan::new(entry.id, upload.id, DagScanKind::File)).await.unwrap();

        let pending = repo.list_dag_scans_by_state(upload.id, &[DagScanState::Pending]).await.unwrap();
        assert_eq!(pending.len(), 1);
        let completed = repo.list_dag_scans_by_state(upload.id, &[DagScanState::Completed]).await.unwrap();
        assert!(completed.is_empty());
    }
}
