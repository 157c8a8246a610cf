//! Row <-> model conversions and the enum <-> TEXT mappings SQLite stores
//! state columns as.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use upload_core::cid::Cid;
use upload_core::error::CoreError;
use upload_core::model::{
    DagScan, DagScanKind, DagScanState, FsEntry, FsEntryKind, Link, Node, NodeInShard, Scan,
    ScanState, Shard, ShardState, Source, SourceKind, Upload, UploadState,
};

use crate::parse_id;

fn cid_from_blob(bytes: Vec<u8>) -> Result<Cid, CoreError> {
    Cid::from_bytes(&bytes).map_err(|e| CoreError::Repository(e.to_string()))
}

pub fn source_kind_text(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Local => "local",
    }
}

fn source_kind_from_text(s: &str) -> Result<SourceKind, CoreError> {
    match s {
        "local" => Ok(SourceKind::Local),
        other => Err(CoreError::Repository(format!("unknown source kind {other}"))),
    }
}

pub fn fs_entry_kind_text(kind: FsEntryKind) -> &'static str {
    match kind {
        FsEntryKind::File => "file",
        FsEntryKind::Directory => "directory",
    }
}

fn fs_entry_kind_from_text(s: &str) -> Result<FsEntryKind, CoreError> {
    match s {
        "file" => Ok(FsEntryKind::File),
        "directory" => Ok(FsEntryKind::Directory),
        other => Err(CoreError::Repository(format!("unknown fs entry kind {other}"))),
    }
}

pub fn scan_state_text(state: ScanState) -> &'static str {
    match state {
        ScanState::Pending => "pending",
        ScanState::Running => "running",
        ScanState::Completed => "completed",
        ScanState::Failed => "failed",
        ScanState::Cancelled => "cancelled",
    }
}

fn scan_state_from_text(s: &str) -> Result<ScanState, CoreError> {
    Ok(match s {
        "pending" => ScanState::Pending,
        "running" => ScanState::Running,
        "completed" => ScanState::Completed,
        "failed" => ScanState::Failed,
        "cancelled" => ScanState::Cancelled,
        other => return Err(CoreError::Repository(format!("unknown scan state {other}"))),
    })
}

pub fn dag_scan_kind_text(kind: DagScanKind) -> &'static str {
    match kind {
        DagScanKind::File => "file",
        DagScanKind::Directory => "directory",
    }
}

fn dag_scan_kind_from_text(s: &str) -> Result<DagScanKind, CoreError> {
    match s {
        "file" => Ok(DagScanKind::File),
        "directory" => Ok(DagScanKind::Directory),
        other => Err(CoreError::Repository(format!("unknown dag scan kind {other}"))),
    }
}

pub fn dag_scan_state_text(state: DagScanState) -> &'static str {
    match state {
        DagScanState::Pending => "pending",
        DagScanState::Running => "running",
        DagScanState::AwaitingChildren => "awaiting_children",
        DagScanState::Completed => "completed",
        DagScanState::Failed => "failed",
        DagScanState::Cancelled => "cancelled",
    }
}

fn dag_scan_state_from_text(s: &str) -> Result<DagScanState, CoreError> {
    Ok(match s {
        "pending" => DagScanState::Pending,
        "running" => DagScanState::Running,
        "awaiting_children" => DagScanState::AwaitingChildren,
        "completed" => DagScanState::Completed,
        "failed" => DagScanState::Failed,
        "cancelled" => DagScanState::Cancelled,
        other => return Err(CoreError::Repository(format!("unknown dag scan state {other}"))),
    })
}

pub fn shard_state_text(state: ShardState) -> &'static str {
    match state {
        ShardState::Open => "open",
        ShardState::Closed => "closed",
        ShardState::Added => "added",
    }
}

fn shard_state_from_text(s: &str) -> Result<ShardState, CoreError> {
    Ok(match s {
        "open" => ShardState::Open,
        "closed" => ShardState::Closed,
        "added" => ShardState::Added,
        other => return Err(CoreError::Repository(format!("unknown shard state {other}"))),
    })
}

pub fn upload_state_text(state: UploadState) -> &'static str {
    match state {
        UploadState::Pending => "pending",
        UploadState::Scanning => "scanning",
        UploadState::GeneratingDAG => "generating_dag",
        UploadState::Sharding => "sharding",
        UploadState::Uploading => "uploading",
        UploadState::Completed => "completed",
        UploadState::Failed => "failed",
        UploadState::Cancelled => "cancelled",
    }
}

fn upload_state_from_text(s: &str) -> Result<UploadState, CoreError> {
    Ok(match s {
        "pending" => UploadState::Pending,
        "scanning" => UploadState::Scanning,
        "generating_dag" => UploadState::GeneratingDAG,
        "sharding" => UploadState::Sharding,
        "uploading" => UploadState::Uploading,
        "completed" => UploadState::Completed,
        "failed" => UploadState::Failed,
        "cancelled" => UploadState::Cancelled,
        other => return Err(CoreError::Repository(format!("unknown upload state {other}"))),
    })
}

pub fn source_from_row(row: &SqliteRow) -> Result<Source, CoreError> {
    Ok(Source {
        id: parse_id(row.get::<String, _>("id"))?,
        name: row.get("name"),
        kind: source_kind_from_text(&row.get::<String, _>("kind"))?,
        path: row.get("path"),
        connection_params: row.get("connection_params"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub fn upload_from_row(row: &SqliteRow) -> Result<Upload, CoreError> {
    let root_fs_entry_id: Option<String> = row.get("root_fs_entry_id");
    let root_cid: Option<Vec<u8>> = row.get("root_cid");
    Ok(Upload {
        id: parse_id(row.get::<String, _>("id"))?,
        configuration_id: parse_id(row.get::<String, _>("configuration_id"))?,
        source_id: parse_id(row.get::<String, _>("source_id"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        state: upload_state_from_text(&row.get::<String, _>("state"))?,
        error_message: row.get("error_message"),
        root_fs_entry_id: root_fs_entry_id.map(parse_id).transpose()?,
        root_cid: root_cid.map(cid_from_blob).transpose()?,
    })
}

pub fn scan_from_row(row: &SqliteRow) -> Result<Scan, CoreError> {
    let root_fs_entry_id: Option<String> = row.get("root_fs_entry_id");
    Ok(Scan {
        id: parse_id(row.get::<String, _>("id"))?,
        upload_id: parse_id(row.get::<String, _>("upload_id"))?,
        root_fs_entry_id: root_fs_entry_id.map(parse_id).transpose()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        state: scan_state_from_text(&row.get::<String, _>("state"))?,
        error_message: row.get("error_message"),
    })
}

pub fn fs_entry_from_row(row: &SqliteRow) -> Result<FsEntry, CoreError> {
    Ok(FsEntry {
        id: parse_id(row.get::<String, _>("id"))?,
        source_id: parse_id(row.get::<String, _>("source_id"))?,
        path: row.get("path"),
        last_modified: row.get("last_modified"),
        mode: row.get::<i64, _>("mode") as u32,
        size: row.get::<i64, _>("size") as u64,
        checksum: row.get("checksum"),
        kind: fs_entry_kind_from_text(&row.get::<String, _>("kind"))?,
    })
}

pub fn dag_scan_from_row(row: &SqliteRow) -> Result<DagScan, CoreError> {
    let cid: Option<Vec<u8>> = row.get("cid");
    Ok(DagScan {
        fs_entry_id: parse_id(row.get::<String, _>("fs_entry_id"))?,
        upload_id: parse_id(row.get::<String, _>("upload_id"))?,
        kind: dag_scan_kind_from_text(&row.get::<String, _>("kind"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        state: dag_scan_state_from_text(&row.get::<String, _>("state"))?,
        error_message: row.get("error_message"),
        cid: cid.map(cid_from_blob).transpose()?,
    })
}

pub fn node_from_row(row: &SqliteRow) -> Result<Node, CoreError> {
    Ok(Node {
        cid: cid_from_blob(row.get::<Vec<u8>, _>("cid"))?,
        size: row.get::<i64, _>("size") as u64,
        payload: row.get("payload"),
        ufsdata: row.get("ufsdata"),
        path: row.get("path"),
        source_id: parse_id(row.get::<String, _>("source_id"))?,
        offset: row.get::<i64, _>("offset") as u64,
    })
}

pub fn link_from_row(row: &SqliteRow) -> Result<Link, CoreError> {
    Ok(Link {
        parent_cid: cid_from_blob(row.get::<Vec<u8>, _>("parent_cid"))?,
        ordering: row.get("ordering"),
        name: row.get("name"),
        t_size: row.get::<i64, _>("t_size") as u64,
        hash_cid: cid_from_blob(row.get::<Vec<u8>, _>("hash_cid"))?,
    })
}

pub fn shard_from_row(row: &SqliteRow) -> Result<Shard, CoreError> {
    let cid: Option<Vec<u8>> = row.get("cid");
    Ok(Shard {
        id: parse_id(row.get::<String, _>("id"))?,
        upload_id: parse_id(row.get::<String, _>("upload_id"))?,
        cid: cid.map(cid_from_blob).transpose()?,
        state: shard_state_from_text(&row.get::<String, _>("state"))?,
    })
}

pub fn node_in_shard_from_row(row: &SqliteRow) -> Result<NodeInShard, CoreError> {
    Ok(NodeInShard {
        shard_id: parse_id(row.get::<String, _>("shard_id"))?,
        node_cid: cid_from_blob(row.get::<Vec<u8>, _>("node_cid"))?,
        offset: row.get::<Option<i64>, _>("offset").map(|o| o as u64),
    })
}
