//! SQLite snapshot store
//!
//! Persists roots, snapshots, per-snapshot entity first-seen times, nodes and
//! their present hashes in five tables. Derived keys are stored next to each
//! node so every store query is a single indexed lookup. Timestamps are
//! stored as fixed-width RFC 3339 strings, so SQL ordering on them matches
//! chronological ordering.
//!
//! ## Schema
//!
//! | Table | Key | Notes |
//! |-------|-----|-------|
//! | `roots` | `rootId` | unique `rootKey` |
//! | `snapshots` | `snapshotId` | coverage and stats as JSON, node id counter |
//! | `entities` | `(snapshotId, entityKey)` | first-seen time |
//! | `nodes` | `(snapshotId, nodeId)` | unique `(snapshotId, rootId, layersSigHash, vpathKey)` |
//! | `node_hashes` | `(snapshotId, nodeId, algo, value)` | present hashes only |
//!
//! Prefix tests use exact `substr` comparisons instead of `LIKE`, which is
//! ASCII case-insensitive and treats `%` and `_` in paths as wildcards.

use super::session::{PatchTarget, StoreSession};
use super::{
    cursor_offset, scope_base_key, DerivedKeys, PatchSession, SnapshotStore, NODE_ID_PREFIX, NODE_ID_WIDTH,
    SNAPSHOT_ID_PREFIX,
};
use crate::clock::{Clock, IdGenerator, SystemClock, UuidIdGenerator};
use crate::error::{Result, TreesnapError};
use crate::node;
use crate::root::resolve_case_policy;
use crate::types::{
    CasePolicy, Coverage, FileIdentity, NodeFilter, NodeKind, NodeMeta, NodePage, NodeQuery, NodeRef, NodeSort,
    NodeSortKey, ObservedNode, Page, RootCapabilities, RootDescriptor, ScanRun, ScopeCompleteness, ScopeMode,
    Snapshot, SnapshotStats, SortOrder,
};
use crate::utils::{format_instant, incremental_id, parse_instant};
use crate::vpath;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS roots (
  rootId TEXT PRIMARY KEY,
  rootKey TEXT UNIQUE NOT NULL,
  os TEXT NOT NULL,
  osPath TEXT NOT NULL,
  createdAt TEXT NOT NULL,
  casePolicy TEXT NOT NULL,
  capabilitiesCaseSensitive INTEGER NOT NULL,
  capabilitiesSupportsFileId INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
  snapshotId TEXT PRIMARY KEY,
  rootId TEXT NOT NULL REFERENCES roots(rootId),
  createdAt TEXT NOT NULL,
  lastPatchedAt TEXT NOT NULL,
  lastRunId TEXT NOT NULL,
  lastCoverage TEXT NOT NULL,
  statsJson TEXT NOT NULL,
  nodeCounter INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS entities (
  snapshotId TEXT NOT NULL,
  entityKey TEXT NOT NULL,
  firstSeenAt TEXT NOT NULL,
  PRIMARY KEY (snapshotId, entityKey)
);

CREATE TABLE IF NOT EXISTS nodes (
  snapshotId TEXT NOT NULL,
  nodeId TEXT NOT NULL,
  rootId TEXT NOT NULL,
  layersJson TEXT NOT NULL,
  layersSigHash TEXT NOT NULL,
  vpath TEXT NOT NULL,
  vpathKey TEXT NOT NULL,
  parentKey TEXT NOT NULL,
  name TEXT NOT NULL,
  nameKey TEXT NOT NULL,
  kind TEXT NOT NULL,
  size INTEGER,
  mtime TEXT,
  ctime TEXT,
  birthtime TEXT,
  identityJson TEXT NOT NULL,
  identityValue TEXT,
  entityKey TEXT NOT NULL,
  firstSeenAt TEXT NOT NULL,
  isDeleted INTEGER NOT NULL,
  deletedAt TEXT,
  hashesJson TEXT NOT NULL,
  extrasJson TEXT NOT NULL,
  observedInRunId TEXT NOT NULL,
  lastObservedAt TEXT NOT NULL,
  errorsJson TEXT NOT NULL,
  canonical TEXT NOT NULL,
  osVpath TEXT NOT NULL,
  osVpathKey TEXT NOT NULL,
  PRIMARY KEY (snapshotId, nodeId),
  UNIQUE (snapshotId, rootId, layersSigHash, vpathKey)
);

CREATE TABLE IF NOT EXISTS node_hashes (
  snapshotId TEXT NOT NULL,
  nodeId TEXT NOT NULL,
  algo TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (snapshotId, nodeId, algo, value)
);

CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes (snapshotId, parentKey, nameKey);
CREATE INDEX IF NOT EXISTS idx_nodes_entity ON nodes (snapshotId, entityKey);
CREATE INDEX IF NOT EXISTS idx_nodes_identity ON nodes (snapshotId, identityValue);
CREATE INDEX IF NOT EXISTS idx_nodes_size ON nodes (snapshotId, size);
CREATE INDEX IF NOT EXISTS idx_nodes_vpath ON nodes (snapshotId, vpathKey);
CREATE INDEX IF NOT EXISTS idx_nodes_os_vpath ON nodes (snapshotId, osVpathKey);
CREATE INDEX IF NOT EXISTS idx_hashes_value ON node_hashes (snapshotId, algo, value);
"#;

const NODE_COLUMNS: &str = "n.nodeId, n.rootId, n.layersJson, n.vpath, n.name, n.kind, n.size, n.mtime, n.ctime, \
     n.birthtime, n.identityJson, n.entityKey, n.firstSeenAt, n.isDeleted, n.deletedAt, n.hashesJson, \
     n.extrasJson, n.observedInRunId, n.lastObservedAt, n.errorsJson";

const ROOT_COLUMNS: &str = "rootId, rootKey, os, osPath, createdAt, casePolicy, capabilitiesCaseSensitive, \
     capabilitiesSupportsFileId";

const SNAPSHOT_COLUMNS: &str = "snapshotId, rootId, createdAt, lastPatchedAt, lastRunId, lastCoverage, statsJson";

fn enum_to_sql<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(TreesnapError::internal(format!("expected a string enum, got {}", other))),
    }
}

fn enum_from_sql<T: DeserializeOwned>(value: String) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value))
        .map_err(|e| TreesnapError::corrupt(format!("unknown enum value: {}", e)))
}

fn opt_instant(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_instant).transpose()
}

fn size_to_sql(size: Option<u64>) -> Result<Option<i64>> {
    size.map(|s| i64::try_from(s).map_err(|_| TreesnapError::internal(format!("unchecked size {} reached the database", s))))
        .transpose()
}

/// Raw `roots` row
struct RootRow {
    root_id: String,
    root_key: String,
    os: String,
    os_path: String,
    created_at: String,
    case_policy: String,
    case_sensitive: bool,
    supports_file_id: bool,
}

impl RootRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            root_id: row.get(0)?,
            root_key: row.get(1)?,
            os: row.get(2)?,
            os_path: row.get(3)?,
            created_at: row.get(4)?,
            case_policy: row.get(5)?,
            case_sensitive: row.get(6)?,
            supports_file_id: row.get(7)?,
        })
    }

    fn into_descriptor(self) -> Result<RootDescriptor> {
        Ok(RootDescriptor {
            root_id: self.root_id,
            root_key: self.root_key,
            os: enum_from_sql(self.os)?,
            os_path: PathBuf::from(self.os_path),
            created_at: parse_instant(&self.created_at)?,
            case_policy: enum_from_sql(self.case_policy)?,
            capabilities: RootCapabilities {
                case_sensitive: self.case_sensitive,
                supports_file_id: self.supports_file_id,
            },
        })
    }
}

/// Raw `snapshots` row
struct SnapshotRow {
    snapshot_id: String,
    root_id: String,
    created_at: String,
    last_patched_at: String,
    last_run_id: String,
    coverage_json: String,
    stats_json: String,
}

impl SnapshotRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            snapshot_id: row.get(0)?,
            root_id: row.get(1)?,
            created_at: row.get(2)?,
            last_patched_at: row.get(3)?,
            last_run_id: row.get(4)?,
            coverage_json: row.get(5)?,
            stats_json: row.get(6)?,
        })
    }

    fn into_snapshot(self) -> Result<Snapshot> {
        Ok(Snapshot {
            snapshot_id: self.snapshot_id,
            root_id: self.root_id,
            created_at: parse_instant(&self.created_at)?,
            last_patched_at: parse_instant(&self.last_patched_at)?,
            last_run_id: self.last_run_id,
            last_coverage: serde_json::from_str(&self.coverage_json)?,
            stats: serde_json::from_str(&self.stats_json)?,
        })
    }
}

/// Raw `nodes` row in [`NODE_COLUMNS`] order
struct NodeRow {
    node_id: String,
    root_id: String,
    layers_json: String,
    vpath: String,
    name: String,
    kind: String,
    size: Option<i64>,
    mtime: Option<String>,
    ctime: Option<String>,
    birthtime: Option<String>,
    identity_json: String,
    entity_key: String,
    first_seen_at: String,
    is_deleted: bool,
    deleted_at: Option<String>,
    hashes_json: String,
    extras_json: String,
    observed_in_run_id: String,
    last_observed_at: String,
    errors_json: String,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            root_id: row.get(1)?,
            layers_json: row.get(2)?,
            vpath: row.get(3)?,
            name: row.get(4)?,
            kind: row.get(5)?,
            size: row.get(6)?,
            mtime: row.get(7)?,
            ctime: row.get(8)?,
            birthtime: row.get(9)?,
            identity_json: row.get(10)?,
            entity_key: row.get(11)?,
            first_seen_at: row.get(12)?,
            is_deleted: row.get(13)?,
            deleted_at: row.get(14)?,
            hashes_json: row.get(15)?,
            extras_json: row.get(16)?,
            observed_in_run_id: row.get(17)?,
            last_observed_at: row.get(18)?,
            errors_json: row.get(19)?,
        })
    }

    fn into_meta(self) -> Result<NodeMeta> {
        let kind = NodeKind::parse(&self.kind)
            .ok_or_else(|| TreesnapError::corrupt(format!("unknown node kind {:?}", self.kind)))?;
        let size = self
            .size
            .map(|s| u64::try_from(s).map_err(|_| TreesnapError::corrupt(format!("negative size {}", s))))
            .transpose()?;
        Ok(NodeMeta {
            node_id: self.node_id,
            node_ref: NodeRef {
                root_id: self.root_id,
                layers: serde_json::from_str(&self.layers_json)?,
                vpath: self.vpath,
            },
            kind,
            name: self.name,
            size,
            mtime: opt_instant(self.mtime)?,
            ctime: opt_instant(self.ctime)?,
            birthtime: opt_instant(self.birthtime)?,
            identity: serde_json::from_str(&self.identity_json)?,
            entity_key: self.entity_key,
            first_seen_at: parse_instant(&self.first_seen_at)?,
            is_deleted: self.is_deleted,
            deleted_at: opt_instant(self.deleted_at)?,
            hashes: serde_json::from_str(&self.hashes_json)?,
            extras: serde_json::from_str(&self.extras_json)?,
            observed_in_run_id: self.observed_in_run_id,
            last_observed_at: parse_instant(&self.last_observed_at)?,
            errors: serde_json::from_str(&self.errors_json)?,
        })
    }
}

/// ORDER BY clause for a node sort; ties break by canonical string then node id
fn order_by(sort: NodeSort) -> String {
    let dir = match sort.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    let primary = match (sort.key, sort.order) {
        (NodeSortKey::Name, _) => format!("n.nameKey COLLATE BINARY {}", dir),
        (NodeSortKey::Vpath, _) => format!("n.vpathKey COLLATE BINARY {}", dir),
        (NodeSortKey::Size, SortOrder::Asc) => "(n.size IS NOT NULL) ASC, n.size ASC".to_string(),
        (NodeSortKey::Size, SortOrder::Desc) => "(n.size IS NULL) ASC, n.size DESC".to_string(),
        (NodeSortKey::Mtime, SortOrder::Asc) => "(n.mtime IS NOT NULL) ASC, n.mtime COLLATE BINARY ASC".to_string(),
        (NodeSortKey::Mtime, SortOrder::Desc) => "(n.mtime IS NULL) ASC, n.mtime COLLATE BINARY DESC".to_string(),
        (NodeSortKey::FirstSeenAt, _) => format!("n.firstSeenAt COLLATE BINARY {}", dir),
        (NodeSortKey::LastObservedAt, _) => format!("n.lastObservedAt COLLATE BINARY {}", dir),
    };
    format!("{}, n.canonical COLLATE BINARY ASC, n.nodeId COLLATE BINARY ASC", primary)
}

/// SQL condition "`column` equals `prefix` or lies under it"
fn push_prefix_clause(clauses: &mut Vec<String>, params: &mut Vec<Value>, column: &str, prefix: &str) {
    if prefix == vpath::ROOT {
        return;
    }
    clauses.push(format!(
        "({col} = ? OR (length({col}) > length(?) AND substr({col}, 1, length(?) + 1) = ? || '/'))",
        col = column
    ));
    for _ in 0..4 {
        params.push(Value::Text(prefix.to_string()));
    }
}

/// Node selection under construction
struct NodeSelect {
    join: &'static str,
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl NodeSelect {
    fn new(snapshot_id: &str, include_deleted: bool) -> Self {
        let mut select = Self {
            join: "",
            clauses: vec!["n.snapshotId = ?".to_string()],
            params: vec![Value::Text(snapshot_id.to_string())],
        };
        if !include_deleted {
            select.clauses.push("n.isDeleted = 0".to_string());
        }
        select
    }

    fn and(mut self, clause: &str, values: impl IntoIterator<Item = Value>) -> Self {
        self.clauses.push(clause.to_string());
        self.params.extend(values);
        self
    }

    fn join_hashes(mut self, algo: &str, value: &str) -> Self {
        self.join = "JOIN node_hashes h ON n.snapshotId = h.snapshotId AND n.nodeId = h.nodeId";
        self.and(
            "h.algo = ? AND h.value = ?",
            [Value::Text(algo.to_string()), Value::Text(value.to_string())],
        )
    }

    fn fetch(mut self, conn: &Connection, sort: NodeSort, page: Option<&Page>) -> Result<NodePage> {
        let offset = cursor_offset(page)?;
        let mut sql = format!(
            "SELECT {} FROM nodes n {} WHERE {} ORDER BY {}",
            NODE_COLUMNS,
            self.join,
            self.clauses.join(" AND "),
            order_by(sort)
        );
        if let Some(page) = page {
            sql.push_str(" LIMIT ? OFFSET ?");
            self.params.push(Value::Integer(page.limit.saturating_add(1) as i64));
            self.params.push(Value::Integer(offset as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(self.params.iter()), NodeRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut next_cursor = None;
        let mut rows = rows;
        if let Some(page) = page {
            if rows.len() > page.limit {
                rows.truncate(page.limit);
                next_cursor = Some((offset + page.limit).to_string());
            }
        }
        let nodes = rows.into_iter().map(NodeRow::into_meta).collect::<Result<Vec<_>>>()?;
        Ok(NodePage { nodes, next_cursor })
    }
}

fn load_root(conn: &Connection, root_id: &str) -> Result<RootDescriptor> {
    conn.query_row(
        &format!("SELECT {} FROM roots WHERE rootId = ?1", ROOT_COLUMNS),
        params![root_id],
        RootRow::from_row,
    )
    .optional()?
    .ok_or_else(|| TreesnapError::RootNotFound(root_id.to_string()))?
    .into_descriptor()
}

fn load_snapshot(conn: &Connection, snapshot_id: &str) -> Result<Snapshot> {
    conn.query_row(
        &format!("SELECT {} FROM snapshots WHERE snapshotId = ?1", SNAPSHOT_COLUMNS),
        params![snapshot_id],
        SnapshotRow::from_row,
    )
    .optional()?
    .ok_or_else(|| TreesnapError::SnapshotNotFound(snapshot_id.to_string()))?
    .into_snapshot()
}

fn snapshot_case_policy(conn: &Connection, snapshot_id: &str) -> Result<CasePolicy> {
    let snapshot = load_snapshot(conn, snapshot_id)?;
    let root = load_root(conn, &snapshot.root_id)?;
    Ok(resolve_case_policy(root.case_policy, &root.capabilities))
}

fn upsert_node(
    tx: &Transaction<'_>,
    snapshot_id: &str,
    observed: &ObservedNode,
    keys: &DerivedKeys,
    policy: CasePolicy,
    counter: &mut u64,
) -> Result<()> {
    let entity_key = node::entity_key(&observed.identity, &observed.node_ref, policy);
    let first_seen_at: String = match tx
        .query_row(
            "SELECT firstSeenAt FROM entities WHERE snapshotId = ?1 AND entityKey = ?2",
            params![snapshot_id, entity_key],
            |row| row.get(0),
        )
        .optional()?
    {
        Some(existing) => existing,
        None => {
            let seeded = format_instant(&observed.last_observed_at);
            tx.execute(
                "INSERT INTO entities (snapshotId, entityKey, firstSeenAt) VALUES (?1, ?2, ?3)",
                params![snapshot_id, entity_key, seeded],
            )?;
            seeded
        }
    };

    let existing: Option<String> = tx
        .query_row(
            "SELECT nodeId FROM nodes WHERE snapshotId = ?1 AND rootId = ?2 AND layersSigHash = ?3 AND vpathKey = ?4",
            params![snapshot_id, observed.node_ref.root_id, keys.layers_sig, keys.vpath_key],
            |row| row.get(0),
        )
        .optional()?;
    let node_id = match existing {
        Some(id) => id,
        None => {
            *counter += 1;
            incremental_id(NODE_ID_PREFIX, *counter, NODE_ID_WIDTH)
        }
    };

    tx.execute(
        "INSERT OR REPLACE INTO nodes (
            snapshotId, nodeId, rootId, layersJson, layersSigHash, vpath, vpathKey, parentKey,
            name, nameKey, kind, size, mtime, ctime, birthtime, identityJson, identityValue, entityKey,
            firstSeenAt, isDeleted, deletedAt, hashesJson, extrasJson, observedInRunId, lastObservedAt,
            errorsJson, canonical, osVpath, osVpathKey
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, 0, NULL, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
        )",
        params![
            snapshot_id,
            node_id,
            observed.node_ref.root_id,
            keys.layers_json,
            keys.layers_sig,
            observed.node_ref.vpath,
            keys.vpath_key,
            keys.parent_key,
            observed.name,
            keys.name_key,
            observed.kind.as_str(),
            size_to_sql(observed.size)?,
            observed.mtime.as_ref().map(format_instant),
            observed.ctime.as_ref().map(format_instant),
            observed.birthtime.as_ref().map(format_instant),
            serde_json::to_string(&observed.identity)?,
            keys.identity_value,
            entity_key,
            first_seen_at,
            serde_json::to_string(&observed.hashes)?,
            serde_json::to_string(&observed.extras)?,
            observed.observed_in_run_id,
            format_instant(&observed.last_observed_at),
            serde_json::to_string(&observed.errors)?,
            keys.canonical,
            keys.os_vpath,
            keys.os_vpath_key,
        ],
    )?;

    tx.execute(
        "DELETE FROM node_hashes WHERE snapshotId = ?1 AND nodeId = ?2",
        params![snapshot_id, node_id],
    )?;
    for hash in observed.hashes.values() {
        if let Some(value) = hash.present_value() {
            tx.execute(
                "INSERT OR IGNORE INTO node_hashes (snapshotId, nodeId, algo, value) VALUES (?1, ?2, ?3, ?4)",
                params![snapshot_id, node_id, hash.algo, value],
            )?;
        }
    }
    Ok(())
}

/// Tombstone live nodes of one COMPLETE scope not observed in `run_id`
fn reconcile_scope(
    tx: &Transaction<'_>,
    snapshot_id: &str,
    run_id: &str,
    mode: ScopeMode,
    base_key: &str,
    now: &str,
) -> Result<usize> {
    let mut clauses = vec![
        "snapshotId = ?".to_string(),
        "isDeleted = 0".to_string(),
        "observedInRunId != ?".to_string(),
    ];
    let mut values = vec![
        Value::Text(now.to_string()),
        Value::Text(snapshot_id.to_string()),
        Value::Text(run_id.to_string()),
    ];
    match mode {
        ScopeMode::FullSubtree => push_prefix_clause(&mut clauses, &mut values, "osVpathKey", base_key),
        ScopeMode::ChildrenOnly => {
            let prefix = if base_key == vpath::ROOT {
                vpath::ROOT.to_string()
            } else {
                format!("{}/", base_key)
            };
            clauses.push(
                "substr(osVpathKey, 1, length(?)) = ? AND length(osVpathKey) > length(?) \
                 AND instr(substr(osVpathKey, length(?) + 1), '/') = 0"
                    .to_string(),
            );
            for _ in 0..4 {
                values.push(Value::Text(prefix.clone()));
            }
        }
        ScopeMode::SingleNode => {
            clauses.push("osVpathKey = ?".to_string());
            values.push(Value::Text(base_key.to_string()));
        }
    }
    let sql = format!(
        "UPDATE nodes SET isDeleted = 1, deletedAt = ? WHERE {}",
        clauses.join(" AND ")
    );
    Ok(tx.execute(&sql, params_from_iter(values.iter()))?)
}

fn compute_stats(tx: &Transaction<'_>, snapshot_id: &str) -> Result<SnapshotStats> {
    let (node_count, dir_count, file_count): (i64, i64, i64) = tx.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN kind = 'DIR' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN kind = 'FILE' THEN 1 ELSE 0 END), 0)
         FROM nodes WHERE snapshotId = ?1 AND isDeleted = 0",
        params![snapshot_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(SnapshotStats {
        node_count: node_count as u64,
        dir_count: dir_count as u64,
        file_count: file_count as u64,
    })
}

/// Snapshot store backed by an embedded SQLite database
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteSnapshotStore {
    /// Open (or create) a database file with the system clock and UUID ids
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), Arc::new(SystemClock), Arc::new(UuidIdGenerator))
    }

    /// Open a private in-memory database with the system clock and UUID ids
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(Arc::new(SystemClock), Arc::new(UuidIdGenerator))
    }

    /// Open (or create) a database file with injected dependencies
    pub fn open_with(path: &Path, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Opened {:?} with journal mode {}", path, mode);
        Self::init(conn, clock, ids)
    }

    /// Open a private in-memory database with injected dependencies
    pub fn open_in_memory_with(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, clock, ids)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            ids,
        })
    }

    fn select_page(
        &self,
        snapshot_id: &str,
        build: impl FnOnce(NodeSelect, CasePolicy) -> Result<NodeSelect>,
        include_deleted: bool,
        sort: NodeSort,
        page: Option<&Page>,
    ) -> Result<NodePage> {
        let conn = self.conn.lock();
        let policy = snapshot_case_policy(&conn, snapshot_id)?;
        let select = build(NodeSelect::new(snapshot_id, include_deleted), policy)?;
        select.fetch(&conn, sort, page)
    }
}

impl PatchTarget for SqliteSnapshotStore {
    fn apply_upserts(&self, snapshot_id: &str, _run: &ScanRun, nodes: &[ObservedNode]) -> Result<()> {
        let mut conn = self.conn.lock();
        let policy = snapshot_case_policy(&conn, snapshot_id)?;
        let keys = nodes
            .iter()
            .map(|n| DerivedKeys::of_observed(n, policy))
            .collect::<Result<Vec<_>>>()?;

        let tx = conn.transaction()?;
        let mut counter: u64 = tx.query_row(
            "SELECT nodeCounter FROM snapshots WHERE snapshotId = ?1",
            params![snapshot_id],
            |row| row.get::<_, i64>(0),
        )? as u64;
        for (observed, keys) in nodes.iter().zip(&keys) {
            upsert_node(&tx, snapshot_id, observed, keys, policy, &mut counter)?;
        }
        tx.execute(
            "UPDATE snapshots SET nodeCounter = ?1 WHERE snapshotId = ?2",
            params![counter as i64, snapshot_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn apply_commit(&self, snapshot_id: &str, run: &ScanRun, coverage: &Coverage) -> Result<()> {
        let now = format_instant(&self.clock.now());
        let mut conn = self.conn.lock();
        let policy = snapshot_case_policy(&conn, snapshot_id)?;

        let tx = conn.transaction()?;
        let mut tombstoned = 0usize;
        for scope in coverage
            .scopes
            .iter()
            .filter(|s| s.completeness == ScopeCompleteness::Complete)
        {
            let base_key = scope_base_key(&scope.scope, policy);
            tombstoned += reconcile_scope(&tx, snapshot_id, &run.run_id, scope.scope.mode, &base_key, &now)?;
        }
        let stats = compute_stats(&tx, snapshot_id)?;
        tx.execute(
            "UPDATE snapshots SET lastPatchedAt = ?1, lastRunId = ?2, lastCoverage = ?3, statsJson = ?4
             WHERE snapshotId = ?5",
            params![
                now,
                run.run_id,
                serde_json::to_string(coverage)?,
                serde_json::to_string(&stats)?,
                snapshot_id
            ],
        )?;
        tx.commit()?;
        info!(
            "Committed run {} to {}: {} live nodes, {} tombstoned",
            run.run_id, snapshot_id, stats.node_count, tombstoned
        );
        Ok(())
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    #[instrument(skip(self, desc), fields(root_id = %desc.root_id))]
    fn register_root(&self, desc: RootDescriptor) -> Result<RootDescriptor> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT {} FROM roots WHERE rootKey = ?1", ROOT_COLUMNS),
                params![desc.root_key],
                RootRow::from_row,
            )
            .optional()?;
        if let Some(existing) = existing {
            debug!("Root key {} already registered as {}", desc.root_key, existing.root_id);
            return existing.into_descriptor();
        }
        let id_taken: Option<String> = tx
            .query_row(
                "SELECT rootId FROM roots WHERE rootId = ?1",
                params![desc.root_id],
                |row| row.get(0),
            )
            .optional()?;
        if id_taken.is_some() {
            return Err(TreesnapError::RootIdConflict {
                root_id: desc.root_id,
                root_key: desc.root_key,
            });
        }
        tx.execute(
            &format!("INSERT INTO roots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", ROOT_COLUMNS),
            params![
                desc.root_id,
                desc.root_key,
                enum_to_sql(&desc.os)?,
                desc.os_path.to_string_lossy().into_owned(),
                format_instant(&desc.created_at),
                enum_to_sql(&desc.case_policy)?,
                desc.capabilities.case_sensitive,
                desc.capabilities.supports_file_id,
            ],
        )?;
        tx.commit()?;
        info!("Registered root {} at {:?}", desc.root_id, desc.os_path);
        Ok(desc)
    }

    fn get_root(&self, root_id: &str) -> Result<RootDescriptor> {
        load_root(&self.conn.lock(), root_id)
    }

    fn find_root_by_key(&self, root_key: &str) -> Result<Option<RootDescriptor>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM roots WHERE rootKey = ?1", ROOT_COLUMNS),
            params![root_key],
            RootRow::from_row,
        )
        .optional()?
        .map(RootRow::into_descriptor)
        .transpose()
    }

    fn list_roots(&self) -> Result<Vec<RootDescriptor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM roots ORDER BY rootId ASC", ROOT_COLUMNS))?;
        let rows = stmt
            .query_map([], RootRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RootRow::into_descriptor).collect()
    }

    #[instrument(skip(self))]
    fn create_snapshot(&self, root_id: &str) -> Result<Snapshot> {
        let conn = self.conn.lock();
        load_root(&conn, root_id)?;
        let created_at = self.clock.now();
        let snapshot = Snapshot {
            snapshot_id: self.ids.next_id(SNAPSHOT_ID_PREFIX),
            root_id: root_id.to_string(),
            created_at,
            last_patched_at: created_at,
            last_run_id: String::new(),
            last_coverage: Coverage::default(),
            stats: SnapshotStats::default(),
        };
        conn.execute(
            &format!("INSERT INTO snapshots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", SNAPSHOT_COLUMNS),
            params![
                snapshot.snapshot_id,
                snapshot.root_id,
                format_instant(&snapshot.created_at),
                format_instant(&snapshot.last_patched_at),
                snapshot.last_run_id,
                serde_json::to_string(&snapshot.last_coverage)?,
                serde_json::to_string(&snapshot.stats)?,
            ],
        )?;
        info!("Created snapshot {} of root {}", snapshot.snapshot_id, root_id);
        Ok(snapshot)
    }

    fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        load_snapshot(&self.conn.lock(), snapshot_id)
    }

    fn list_snapshots(&self, root_id: &str) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock();
        load_root(&conn, root_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM snapshots WHERE rootId = ?1 ORDER BY createdAt ASC, snapshotId ASC",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![root_id], SnapshotRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SnapshotRow::into_snapshot).collect()
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id))]
    fn begin_patch(&self, snapshot_id: &str, run: ScanRun) -> Result<Box<dyn PatchSession + '_>> {
        load_snapshot(&self.conn.lock(), snapshot_id)?;
        Ok(Box::new(StoreSession::new(self, snapshot_id, run)))
    }

    fn get_node_by_id(&self, snapshot_id: &str, node_id: &str) -> Result<Option<NodeMeta>> {
        let conn = self.conn.lock();
        load_snapshot(&conn, snapshot_id)?;
        conn.query_row(
            &format!("SELECT {} FROM nodes n WHERE n.snapshotId = ?1 AND n.nodeId = ?2", NODE_COLUMNS),
            params![snapshot_id, node_id],
            NodeRow::from_row,
        )
        .optional()?
        .map(NodeRow::into_meta)
        .transpose()
    }

    fn get_node_by_ref(&self, snapshot_id: &str, node_ref: &NodeRef, include_deleted: bool) -> Result<Option<NodeMeta>> {
        let page = self.select_page(
            snapshot_id,
            |select, policy| {
                Ok(select.and(
                    "n.rootId = ? AND n.layersSigHash = ? AND n.vpathKey = ?",
                    [
                        Value::Text(node_ref.root_id.clone()),
                        Value::Text(node::layers_signature(&node_ref.layers)),
                        Value::Text(vpath::key(&node_ref.vpath, policy).into_owned()),
                    ],
                ))
            },
            include_deleted,
            NodeSort::asc(NodeSortKey::Vpath),
            None,
        )?;
        Ok(page.nodes.into_iter().next())
    }

    fn list_children(
        &self,
        snapshot_id: &str,
        parent_ref: &NodeRef,
        sort: Option<NodeSort>,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        let parent_key = node::parent_key_for(parent_ref)?;
        self.select_page(
            snapshot_id,
            |select, _| {
                Ok(select.and(
                    "n.parentKey = ? AND n.vpath != ?",
                    [Value::Text(parent_key), Value::Text(parent_ref.vpath.clone())],
                ))
            },
            include_deleted,
            sort.unwrap_or(NodeSort::asc(NodeSortKey::Name)),
            page,
        )
    }

    fn find_by_entity_key(
        &self,
        snapshot_id: &str,
        entity_key: &str,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        self.select_page(
            snapshot_id,
            |select, _| Ok(select.and("n.entityKey = ?", [Value::Text(entity_key.to_string())])),
            include_deleted,
            NodeSort::asc(NodeSortKey::Vpath),
            page,
        )
    }

    fn find_by_os_identity(
        &self,
        snapshot_id: &str,
        identity: &FileIdentity,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        let identity_value = node::identity_value(identity);
        self.select_page(
            snapshot_id,
            |select, _| {
                Ok(match identity_value {
                    Some(value) => select.and("n.identityValue = ?", [Value::Text(value)]),
                    None => select.and("0 = 1", []),
                })
            },
            include_deleted,
            NodeSort::asc(NodeSortKey::Vpath),
            page,
        )
    }

    fn find_by_hash(
        &self,
        snapshot_id: &str,
        algo: &str,
        value: &str,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        self.select_page(
            snapshot_id,
            |select, _| Ok(select.join_hashes(algo, value)),
            include_deleted,
            NodeSort::asc(NodeSortKey::Vpath),
            page,
        )
    }

    fn range_by_size(
        &self,
        snapshot_id: &str,
        min: u64,
        max: u64,
        page: Option<&Page>,
        include_deleted: bool,
    ) -> Result<NodePage> {
        if min > i64::MAX as u64 || min > max {
            // No stored size can satisfy the bounds; still validate the ids and cursor.
            return self.select_page(
                snapshot_id,
                |select, _| Ok(select.and("0 = 1", [])),
                include_deleted,
                NodeSort::asc(NodeSortKey::Size),
                page,
            );
        }
        let max = max.min(i64::MAX as u64);
        self.select_page(
            snapshot_id,
            |select, _| {
                Ok(select.and(
                    "n.size >= ? AND n.size <= ?",
                    [Value::Integer(min as i64), Value::Integer(max as i64)],
                ))
            },
            include_deleted,
            NodeSort::asc(NodeSortKey::Size),
            page,
        )
    }

    #[instrument(skip(self, query))]
    fn query_nodes(&self, snapshot_id: &str, query: &NodeQuery) -> Result<NodePage> {
        let default_filter = NodeFilter::default();
        let filter = query.filter.as_ref().unwrap_or(&default_filter);
        self.select_page(
            snapshot_id,
            |mut select, policy| {
                if let Some(kinds) = filter.kinds.as_ref().filter(|k| !k.is_empty()) {
                    let marks = vec!["?"; kinds.len()].join(", ");
                    select = select.and(
                        &format!("n.kind IN ({})", marks),
                        kinds.iter().map(|k| Value::Text(k.as_str().to_string())),
                    );
                }
                if let Some(prefix) = &filter.vpath_prefix {
                    let prefix_key = vpath::key(prefix, policy).into_owned();
                    push_prefix_clause(&mut select.clauses, &mut select.params, "n.vpathKey", &prefix_key);
                }
                if let Some(run_id) = &filter.observed_in_run_id {
                    select = select.and("n.observedInRunId = ?", [Value::Text(run_id.clone())]);
                }
                if let Some(has_errors) = filter.has_errors {
                    let clause = if has_errors { "n.errorsJson != '[]'" } else { "n.errorsJson = '[]'" };
                    select = select.and(clause, []);
                }
                if let Some(min) = filter.min_size {
                    select = match i64::try_from(min) {
                        Ok(min) => select.and("n.size >= ?", [Value::Integer(min)]),
                        Err(_) => select.and("0 = 1", []),
                    };
                }
                if let Some(max) = filter.max_size {
                    let max = i64::try_from(max).unwrap_or(i64::MAX);
                    select = select.and("n.size <= ?", [Value::Integer(max)]);
                }
                if let Some(entity_key) = &filter.entity_key {
                    select = select.and("n.entityKey = ?", [Value::Text(entity_key.clone())]);
                }
                if let Some(hash) = &filter.hash {
                    select = select.join_hashes(&hash.algo, &hash.value);
                }
                Ok(select)
            },
            filter.include_deleted,
            query.sort.unwrap_or(NodeSort::asc(NodeSortKey::Vpath)),
            query.page.as_ref(),
        )
    }
}
