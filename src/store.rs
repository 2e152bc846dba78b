// 🗄️ Metadata Store - versions, projects, transactions and the audit trail
// Versions are immutable apart from a few flag fields; list-valued project
// and transaction fields are stored as JSON text.

use crate::catalog::{ColumnCatalog, SystemColumn};
use crate::error::{PipelineError, Result};
use crate::pipeline::StepTracker;
use crate::rules::DatasetStats;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// RECORDS
// ============================================================================

/// Rule-application fields carried by transaction chain versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub parent_version_id: Option<String>,
    pub root_version_id: String,
    pub branch_level: u32,
    pub branch_number: u32,
    pub rule_applied: serde_json::Value,
    pub stats_before_rule: DatasetStats,
    pub stats_after_rule: DatasetStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: String,

    /// Project or transaction the version belongs to
    pub owner_id: String,
    pub description: String,
    pub file_path: PathBuf,
    pub file_sha256: Option<String>,
    pub version_number: f64,

    pub tag_name: Option<String>,
    pub tag_type: Option<String>,

    pub rows_count: usize,
    pub rows_added: usize,
    pub rows_removed: usize,
    pub modified: bool,

    // Mutable flags
    pub sent_for_rule_addition: bool,
    pub bdc_multiplier: f64,

    pub chain: Option<ChainLink>,
    pub created_at: DateTime<Utc>,
}

impl VersionRecord {
    pub fn new(
        owner_id: impl Into<String>,
        description: impl Into<String>,
        file_path: impl Into<PathBuf>,
        version_number: f64,
    ) -> Self {
        VersionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            description: description.into(),
            file_path: file_path.into(),
            file_sha256: None,
            version_number,
            tag_name: None,
            tag_type: None,
            rows_count: 0,
            rows_added: 0,
            rows_removed: 0,
            modified: false,
            sent_for_rule_addition: false,
            bdc_multiplier: 1.0,
            chain: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tag(mut self, tag_name: impl Into<String>, tag_type: impl Into<String>) -> Self {
        self.tag_name = Some(tag_name.into());
        self.tag_type = Some(tag_type.into());
        self
    }

    pub fn with_rows(mut self, rows_count: usize) -> Self {
        self.rows_count = rows_count;
        self
    }

    pub fn with_changes(mut self, rows_added: usize, rows_removed: usize, modified: bool) -> Self {
        self.rows_added = rows_added;
        self.rows_removed = rows_removed;
        self.modified = modified;
        self
    }

    pub fn with_digest(mut self, sha256: impl Into<String>) -> Self {
        self.file_sha256 = Some(sha256.into());
        self
    }

    pub fn with_chain(mut self, chain: ChainLink) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn tag_name(&self) -> &str {
        self.tag_name.as_deref().unwrap_or("")
    }

    pub fn tag_type(&self) -> &str {
        self.tag_type.as_deref().unwrap_or("")
    }

    pub fn is_rule_application_version(&self) -> bool {
        self.chain.is_some()
    }
}

/// One `{key: version_id}` entry of a project's version lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub key: String,
    pub version_id: String,
}

impl VersionEntry {
    pub fn new(key: impl Into<String>, version_id: impl Into<String>) -> Self {
        VersionEntry {
            key: key.into(),
            version_id: version_id.into(),
        }
    }
}

/// Debt-sheet project document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,

    /// Converted dataset the tag split starts from
    pub current_version: Option<String>,
    /// Copy under per-column datatype fixes, promoted to `current_version`
    pub temp_datatype_conversion: Option<String>,
    pub split_with_tags: Vec<VersionEntry>,
    pub temp_files: Vec<VersionEntry>,
    pub rows_added_files: Vec<VersionEntry>,
    pub rows_removed_files: Vec<VersionEntry>,
    pub files_with_rules_applied: Vec<VersionEntry>,
    pub combined_version: Option<String>,
    pub steps: StepTracker,
}

impl ProjectRecord {
    pub fn new(name: impl Into<String>) -> Self {
        ProjectRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            current_version: None,
            temp_datatype_conversion: None,
            split_with_tags: Vec::new(),
            temp_files: Vec::new(),
            rows_added_files: Vec::new(),
            rows_removed_files: Vec::new(),
            files_with_rules_applied: Vec::new(),
            combined_version: None,
            steps: StepTracker::for_debt_sheet(),
        }
    }
}

/// Transaction document (calculated columns and rule chains)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub name: String,
    pub current_version: Option<String>,
    pub temp_datatype_conversion: Option<String>,
    pub temp_new_column_adding: Option<String>,
    pub new_added_columns_datatype: BTreeMap<String, String>,

    /// Output of the fixed-rule filter; every chain root copies it
    pub final_rbi_rules_applied: Option<String>,
    pub rule_application_root_versions: Vec<String>,
    pub steps: StepTracker,
}

impl TransactionRecord {
    pub fn new(name: impl Into<String>) -> Self {
        TransactionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            current_version: None,
            temp_datatype_conversion: None,
            temp_new_column_adding: None,
            new_added_columns_datatype: BTreeMap::new(),
            final_rbi_rules_applied: None,
            rule_application_root_versions: Vec::new(),
            steps: StepTracker::for_transaction(),
        }
    }
}

/// Event for audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Document-store operations the engines depend on
pub trait MetadataStore {
    fn create_version(&self, version: &VersionRecord) -> Result<String>;
    fn get_version(&self, id: &str) -> Result<Option<VersionRecord>>;
    /// Rewrite mutable fields (flags, chain links) of an existing version
    fn update_version(&self, version: &VersionRecord) -> Result<()>;
    fn delete_version(&self, id: &str) -> Result<bool>;
    fn versions_for_owner(&self, owner_id: &str) -> Result<Vec<VersionRecord>>;
    fn find_children(&self, parent_id: &str) -> Result<Vec<VersionRecord>>;
    fn highest_version_number(&self, owner_id: &str) -> Result<Option<f64>>;

    fn create_project(&self, project: &ProjectRecord) -> Result<String>;
    fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>>;
    fn save_project(&self, project: &ProjectRecord) -> Result<()>;

    fn create_transaction(&self, transaction: &TransactionRecord) -> Result<String>;
    fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>>;
    fn save_transaction(&self, transaction: &TransactionRecord) -> Result<()>;

    fn get_all_columns(&self) -> Result<Vec<SystemColumn>>;
    fn upsert_system_column(&self, column: &SystemColumn) -> Result<()>;

    fn record_event(&self, event: &Event) -> Result<()>;
    fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>>;

    // ------------------------------------------------------------------------
    // Derived operations
    // ------------------------------------------------------------------------

    fn require_version(&self, id: &str) -> Result<VersionRecord> {
        self.get_version(id)?
            .ok_or_else(|| PipelineError::not_found("version", id))
    }

    fn require_project(&self, id: &str) -> Result<ProjectRecord> {
        self.get_project(id)?
            .ok_or_else(|| PipelineError::not_found("project", id))
    }

    fn require_transaction(&self, id: &str) -> Result<TransactionRecord> {
        self.get_transaction(id)?
            .ok_or_else(|| PipelineError::not_found("transaction", id))
    }

    /// `column_name -> datatype` view of the system column catalog
    fn column_catalog(&self) -> Result<ColumnCatalog> {
        Ok(ColumnCatalog::from_columns(&self.get_all_columns()?))
    }

    fn append_temp_file(&self, project_id: &str, entry: VersionEntry) -> Result<()> {
        let mut project = self.require_project(project_id)?;
        project.temp_files.push(entry);
        self.save_project(&project)
    }

    fn append_rows_added_file(&self, project_id: &str, entry: VersionEntry) -> Result<()> {
        let mut project = self.require_project(project_id)?;
        project.rows_added_files.push(entry);
        self.save_project(&project)
    }

    fn append_rows_removed_file(&self, project_id: &str, entry: VersionEntry) -> Result<()> {
        let mut project = self.require_project(project_id)?;
        project.rows_removed_files.push(entry);
        self.save_project(&project)
    }

    /// Drop every rows-added/removed version of a project and empty both
    /// lists. Returns the deleted records so the caller can remove files.
    fn clear_rows_tracking_files(&self, project_id: &str) -> Result<Vec<VersionRecord>> {
        let mut project = self.require_project(project_id)?;
        let mut removed = Vec::new();
        for entry in project
            .rows_added_files
            .drain(..)
            .chain(project.rows_removed_files.drain(..))
        {
            if let Some(version) = self.get_version(&entry.version_id)? {
                self.delete_version(&version.id)?;
                removed.push(version);
            }
        }
        self.save_project(&project)?;
        Ok(removed)
    }

    fn add_rule_application_root_version(&self, transaction_id: &str, version_id: &str) -> Result<()> {
        let mut transaction = self.require_transaction(transaction_id)?;
        if !transaction
            .rule_application_root_versions
            .iter()
            .any(|id| id == version_id)
        {
            transaction
                .rule_application_root_versions
                .push(version_id.to_string());
        }
        self.save_transaction(&transaction)
    }

    /// Swap a root id for its successor, keeping its place in the list
    fn replace_rule_application_root_version(&self, transaction_id: &str, old_id: &str, new_id: &str) -> Result<()> {
        let mut transaction = self.require_transaction(transaction_id)?;
        let roots = &mut transaction.rule_application_root_versions;
        roots.retain(|id| id != new_id);
        match roots.iter().position(|id| id == old_id) {
            Some(index) => roots[index] = new_id.to_string(),
            None => roots.push(new_id.to_string()),
        }
        self.save_transaction(&transaction)
    }

    fn remove_rule_application_root_version(&self, transaction_id: &str, version_id: &str) -> Result<bool> {
        let mut transaction = self.require_transaction(transaction_id)?;
        let before = transaction.rule_application_root_versions.len();
        transaction
            .rule_application_root_versions
            .retain(|id| id != version_id);
        let removed = transaction.rule_application_root_versions.len() != before;
        self.save_transaction(&transaction)?;
        Ok(removed)
    }

    /// The single child of a version, if any
    fn find_child(&self, parent_id: &str) -> Result<Option<VersionRecord>> {
        Ok(self.find_children(parent_id)?.into_iter().next())
    }
}

// ============================================================================
// SQLITE IMPLEMENTATION
// ============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Versions Table (one row per dataset file)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS versions (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            description TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_sha256 TEXT,
            version_number REAL NOT NULL,
            tag_name TEXT,
            tag_type TEXT,
            rows_count INTEGER NOT NULL DEFAULT 0,
            rows_added INTEGER NOT NULL DEFAULT 0,
            rows_removed INTEGER NOT NULL DEFAULT 0,
            modified INTEGER NOT NULL DEFAULT 0,
            sent_for_rule_addition INTEGER NOT NULL DEFAULT 0,
            bdc_multiplier REAL NOT NULL DEFAULT 1,
            -- Rule application chain
            is_rule_application_version INTEGER NOT NULL DEFAULT 0,
            parent_version_id TEXT,
            root_version_id TEXT,
            branch_level INTEGER,
            branch_number INTEGER,
            rule_applied TEXT,
            stats_before_rule TEXT,
            stats_after_rule TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Projects / Transactions (document-shaped, list fields as JSON)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            current_version TEXT,
            split_with_tags TEXT NOT NULL,
            temp_files TEXT NOT NULL,
            rows_added_files TEXT NOT NULL,
            rows_removed_files TEXT NOT NULL,
            files_with_rules_applied TEXT NOT NULL,
            combined_version TEXT,
            steps TEXT NOT NULL,
            temp_datatype_conversion TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            current_version TEXT,
            temp_new_column_adding TEXT,
            new_added_columns_datatype TEXT NOT NULL,
            final_rbi_rules_applied TEXT,
            rule_application_root_versions TEXT NOT NULL,
            steps TEXT NOT NULL,
            temp_datatype_conversion TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_columns (
            column_name TEXT PRIMARY KEY,
            datatype TEXT NOT NULL,
            is_currency INTEGER NOT NULL DEFAULT 0,
            description TEXT NOT NULL DEFAULT '',
            alt_names TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail / event sourcing)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_owner ON versions(owner_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_parent ON versions(parent_version_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

const VERSION_COLUMNS: &str = "id, owner_id, description, file_path, file_sha256, version_number,
    tag_name, tag_type, rows_count, rows_added, rows_removed, modified,
    sent_for_rule_addition, bdc_multiplier, is_rule_application_version,
    parent_version_id, root_version_id, branch_level, branch_number,
    rule_applied, stats_before_rule, stats_after_rule, created_at";

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn count_column(row: &Row, idx: usize) -> rusqlite::Result<usize> {
    let value: i64 = row.get(idx)?;
    Ok(value.max(0) as usize)
}

fn version_from_row(row: &Row) -> rusqlite::Result<VersionRecord> {
    let is_chain: bool = row.get(14)?;
    let chain = if is_chain {
        let rule_applied: Option<String> = row.get(19)?;
        let branch_level: Option<i64> = row.get(17)?;
        let branch_number: Option<i64> = row.get(18)?;
        Some(ChainLink {
            parent_version_id: row.get(15)?,
            root_version_id: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
            branch_level: branch_level.unwrap_or(0).max(0) as u32,
            branch_number: branch_number.unwrap_or(0).max(0) as u32,
            rule_applied: match rule_applied {
                Some(text) => serde_json::from_str(&text).map_err(|e| conversion_error(19, e))?,
                None => serde_json::Value::Null,
            },
            stats_before_rule: json_column(row, 20)?,
            stats_after_rule: json_column(row, 21)?,
        })
    } else {
        None
    };

    Ok(VersionRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        description: row.get(2)?,
        file_path: PathBuf::from(row.get::<_, String>(3)?),
        file_sha256: row.get(4)?,
        version_number: row.get(5)?,
        tag_name: row.get(6)?,
        tag_type: row.get(7)?,
        rows_count: count_column(row, 8)?,
        rows_added: count_column(row, 9)?,
        rows_removed: count_column(row, 10)?,
        modified: row.get(11)?,
        sent_for_rule_addition: row.get(12)?,
        bdc_multiplier: row.get(13)?,
        chain,
        created_at: timestamp_column(row, 22)?,
    })
}

fn project_from_row(row: &Row) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        current_version: row.get(2)?,
        split_with_tags: json_column(row, 3)?,
        temp_files: json_column(row, 4)?,
        rows_added_files: json_column(row, 5)?,
        rows_removed_files: json_column(row, 6)?,
        files_with_rules_applied: json_column(row, 7)?,
        combined_version: row.get(8)?,
        steps: json_column(row, 9)?,
        temp_datatype_conversion: row.get(10)?,
    })
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        current_version: row.get(2)?,
        temp_new_column_adding: row.get(3)?,
        new_added_columns_datatype: json_column(row, 4)?,
        final_rbi_rules_applied: row.get(5)?,
        rule_application_root_versions: json_column(row, 6)?,
        steps: json_column(row, 7)?,
        temp_datatype_conversion: row.get(8)?,
    })
}

impl SqliteStore {
    fn write_version(&self, version: &VersionRecord, replace: bool) -> Result<()> {
        let chain = version.chain.as_ref();
        let rule_applied = chain.map(|c| serde_json::to_string(&c.rule_applied)).transpose()?;
        let stats_before = chain.map(|c| serde_json::to_string(&c.stats_before_rule)).transpose()?;
        let stats_after = chain.map(|c| serde_json::to_string(&c.stats_after_rule)).transpose()?;
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };

        self.conn.execute(
            &format!(
                "{verb} INTO versions ({VERSION_COLUMNS}, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
            ),
            params![
                version.id,
                version.owner_id,
                version.description,
                version.file_path.to_string_lossy(),
                version.file_sha256,
                version.version_number,
                version.tag_name,
                version.tag_type,
                version.rows_count as i64,
                version.rows_added as i64,
                version.rows_removed as i64,
                version.modified,
                version.sent_for_rule_addition,
                version.bdc_multiplier,
                chain.is_some(),
                chain.and_then(|c| c.parent_version_id.clone()),
                chain.map(|c| c.root_version_id.clone()),
                chain.map(|c| c.branch_level as i64),
                chain.map(|c| c.branch_number as i64),
                rule_applied,
                stats_before,
                stats_after,
                version.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn query_versions(&self, filter: &str, arg: &str) -> Result<Vec<VersionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE {filter} ORDER BY version_number, created_at"
        ))?;
        let versions = stmt
            .query_map(params![arg], version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }
}

impl MetadataStore for SqliteStore {
    fn create_version(&self, version: &VersionRecord) -> Result<String> {
        self.write_version(version, false)?;
        tracing::debug!(version_id = %version.id, number = version.version_number, "version created");
        Ok(version.id.clone())
    }

    fn get_version(&self, id: &str) -> Result<Option<VersionRecord>> {
        let version = self
            .conn
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?1"),
                params![id],
                version_from_row,
            )
            .optional()?;
        Ok(version)
    }

    fn update_version(&self, version: &VersionRecord) -> Result<()> {
        if self.get_version(&version.id)?.is_none() {
            return Err(PipelineError::not_found("version", &version.id));
        }
        self.write_version(version, true)
    }

    fn delete_version(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM versions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn versions_for_owner(&self, owner_id: &str) -> Result<Vec<VersionRecord>> {
        self.query_versions("owner_id = ?1", owner_id)
    }

    fn find_children(&self, parent_id: &str) -> Result<Vec<VersionRecord>> {
        self.query_versions("parent_version_id = ?1", parent_id)
    }

    fn highest_version_number(&self, owner_id: &str) -> Result<Option<f64>> {
        let highest: Option<f64> = self.conn.query_row(
            "SELECT MAX(version_number) FROM versions WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(highest)
    }

    fn create_project(&self, project: &ProjectRecord) -> Result<String> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO projects (id, name, current_version, split_with_tags, temp_files,
                rows_added_files, rows_removed_files, files_with_rules_applied,
                combined_version, steps, temp_datatype_conversion, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                project.id,
                project.name,
                project.current_version,
                serde_json::to_string(&project.split_with_tags)?,
                serde_json::to_string(&project.temp_files)?,
                serde_json::to_string(&project.rows_added_files)?,
                serde_json::to_string(&project.rows_removed_files)?,
                serde_json::to_string(&project.files_with_rules_applied)?,
                project.combined_version,
                serde_json::to_string(&project.steps)?,
                project.temp_datatype_conversion,
                now,
            ],
        )?;
        Ok(project.id.clone())
    }

    fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let project = self
            .conn
            .query_row(
                "SELECT id, name, current_version, split_with_tags, temp_files,
                        rows_added_files, rows_removed_files, files_with_rules_applied,
                        combined_version, steps, temp_datatype_conversion
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    fn save_project(&self, project: &ProjectRecord) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE projects SET name = ?2, current_version = ?3, split_with_tags = ?4,
                temp_files = ?5, rows_added_files = ?6, rows_removed_files = ?7,
                files_with_rules_applied = ?8, combined_version = ?9, steps = ?10,
                temp_datatype_conversion = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                project.id,
                project.name,
                project.current_version,
                serde_json::to_string(&project.split_with_tags)?,
                serde_json::to_string(&project.temp_files)?,
                serde_json::to_string(&project.rows_added_files)?,
                serde_json::to_string(&project.rows_removed_files)?,
                serde_json::to_string(&project.files_with_rules_applied)?,
                project.combined_version,
                serde_json::to_string(&project.steps)?,
                project.temp_datatype_conversion,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(PipelineError::not_found("project", &project.id));
        }
        Ok(())
    }

    fn create_transaction(&self, transaction: &TransactionRecord) -> Result<String> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO transactions (id, name, current_version, temp_new_column_adding,
                new_added_columns_datatype, final_rbi_rules_applied,
                rule_application_root_versions, steps, temp_datatype_conversion, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                transaction.id,
                transaction.name,
                transaction.current_version,
                transaction.temp_new_column_adding,
                serde_json::to_string(&transaction.new_added_columns_datatype)?,
                transaction.final_rbi_rules_applied,
                serde_json::to_string(&transaction.rule_application_root_versions)?,
                serde_json::to_string(&transaction.steps)?,
                transaction.temp_datatype_conversion,
                now,
            ],
        )?;
        Ok(transaction.id.clone())
    }

    fn get_transaction(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let transaction = self
            .conn
            .query_row(
                "SELECT id, name, current_version, temp_new_column_adding,
                        new_added_columns_datatype, final_rbi_rules_applied,
                        rule_application_root_versions, steps, temp_datatype_conversion
                 FROM transactions WHERE id = ?1",
                params![id],
                transaction_from_row,
            )
            .optional()?;
        Ok(transaction)
    }

    fn save_transaction(&self, transaction: &TransactionRecord) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE transactions SET name = ?2, current_version = ?3,
                temp_new_column_adding = ?4, new_added_columns_datatype = ?5,
                final_rbi_rules_applied = ?6, rule_application_root_versions = ?7,
                steps = ?8, temp_datatype_conversion = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                transaction.id,
                transaction.name,
                transaction.current_version,
                transaction.temp_new_column_adding,
                serde_json::to_string(&transaction.new_added_columns_datatype)?,
                transaction.final_rbi_rules_applied,
                serde_json::to_string(&transaction.rule_application_root_versions)?,
                serde_json::to_string(&transaction.steps)?,
                transaction.temp_datatype_conversion,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(PipelineError::not_found("transaction", &transaction.id));
        }
        Ok(())
    }

    fn get_all_columns(&self) -> Result<Vec<SystemColumn>> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name, datatype, is_currency, description, alt_names
             FROM system_columns ORDER BY column_name",
        )?;
        let columns = stmt
            .query_map([], |row| {
                Ok(SystemColumn {
                    column_name: row.get(0)?,
                    datatype: row.get(1)?,
                    is_currency: row.get(2)?,
                    description: row.get(3)?,
                    alt_names: json_column(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn upsert_system_column(&self, column: &SystemColumn) -> Result<()> {
        self.conn.execute(
            "INSERT INTO system_columns (column_name, datatype, is_currency, description, alt_names)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(column_name) DO UPDATE SET
                datatype = excluded.datatype,
                is_currency = excluded.is_currency,
                description = excluded.description,
                alt_names = excluded.alt_names",
            params![
                column.column_name,
                column.datatype,
                column.is_currency,
                column.description,
                serde_json::to_string(&column.alt_names)?,
            ],
        )?;
        Ok(())
    }

    /// Insert event into audit trail
    fn record_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;

        self.conn.execute(
            "INSERT INTO events (
                event_id, timestamp, event_type, entity_type, entity_id, data, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.entity_type,
                event.entity_id,
                data_json,
                event.actor,
            ],
        )?;

        Ok(())
    }

    /// Events for one entity, oldest first
    fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY id",
        )?;

        let events = stmt
            .query_map(params![entity_type, entity_id], |row| {
                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: timestamp_column(row, 1)?,
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    data: json_column(row, 5)?,
                    actor: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}
