use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::traits::WorkflowService;
use weft_core::types::{
    InstanceRecord, PhaseRecord, RunStatus, SubWorkflowHandle, SubWorkflowRequest,
};
use weft_core::WorkflowDefinition;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT NOT NULL,
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        definition_json TEXT NOT NULL,
        locked INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        PRIMARY KEY (id, version)
    );

    CREATE TABLE IF NOT EXISTS instances (
        instance_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        status TEXT NOT NULL,
        project_folder TEXT NOT NULL,
        parent_instance_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_instances_parent
        ON instances(parent_instance_id);

    CREATE TABLE IF NOT EXISTS phase_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        status TEXT NOT NULL,
        output_json TEXT NOT NULL,
        error TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_phase_instance
        ON phase_executions(instance_id, id);";

fn db_err(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

/// Enum ↔ column text, using the serde wire names.
fn to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn from_text<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_value(Value::String(text.to_string()))?)
}

fn parse_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// [`WorkflowService`] backed by SQLite: versioned definitions, instances,
/// and phase-execution records.
pub struct SqliteWorkflowStore {
    conn: Mutex<Connection>,
}

impl SqliteWorkflowStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Workflow store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }

    /// Store a definition version. Locked versions cannot be replaced.
    pub fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        let conn = self.conn()?;
        let locked: Option<bool> = conn
            .query_row(
                "SELECT locked FROM workflows WHERE id = ?1 AND version = ?2",
                params![definition.id, definition.version],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if locked == Some(true) {
            return Err(WeftError::Database(format!(
                "workflow {} version {} is locked",
                definition.id, definition.version
            )));
        }

        conn.execute(
            "INSERT OR REPLACE INTO workflows (id, version, name, definition_json, locked, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                definition.id,
                definition.version,
                definition.name,
                serde_json::to_string(definition)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        info!(workflow_id = %definition.id, version = definition.version, "Workflow saved");
        Ok(())
    }

    /// Stored versions of a workflow, ascending, with their lock flag.
    pub fn versions(&self, workflow_id: &str) -> Result<Vec<(u32, bool)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT version, locked FROM workflows WHERE id = ?1 ORDER BY version")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workflow_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    pub fn instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT instance_id, workflow_id, version, status, project_folder, parent_instance_id, created_at
                 FROM instances WHERE instance_id = ?1",
                params![instance_id],
                instance_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(InstanceRow::into_record).transpose()
    }

    /// Instances started by `parent_instance_id`, oldest first.
    pub fn children(&self, parent_instance_id: &str) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT instance_id, workflow_id, version, status, project_folder, parent_instance_id, created_at
                 FROM instances WHERE parent_instance_id = ?1 ORDER BY created_at, instance_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![parent_instance_id], instance_row)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(InstanceRow::into_record).collect()
    }

    /// Phase records of one instance in execution order.
    pub fn phases(&self, instance_id: &str) -> Result<Vec<PhaseRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT instance_id, node_id, node_type, status, output_json, error, attempts, duration_ms, recorded_at
                 FROM phase_executions WHERE instance_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![instance_id], |row| {
                Ok(PhaseRow {
                    instance_id: row.get(0)?,
                    node_id: row.get(1)?,
                    node_type: row.get(2)?,
                    status: row.get(3)?,
                    output_json: row.get(4)?,
                    error: row.get(5)?,
                    attempts: row.get(6)?,
                    duration_ms: row.get(7)?,
                    recorded_at: row.get(8)?,
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(PhaseRow::into_record).collect()
    }

    fn find_definition(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>> {
        let conn = self.conn()?;
        let json: Option<String> = match version {
            Some(v) => conn
                .query_row(
                    "SELECT definition_json FROM workflows WHERE id = ?1 AND version = ?2",
                    params![workflow_id, v],
                    |row| row.get(0),
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT definition_json FROM workflows WHERE id = ?1
                     ORDER BY version DESC LIMIT 1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional(),
        }
        .map_err(db_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(WeftError::from))
            .transpose()
    }

    fn set_locked(&self, workflow_id: &str, version: u32) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE workflows SET locked = 1 WHERE id = ?1 AND version = ?2",
                params![workflow_id, version],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(WeftError::WorkflowNotFound(format!(
                "{} (version {})",
                workflow_id, version
            )));
        }
        Ok(())
    }

    fn insert_instance(
        &self,
        definition: &WorkflowDefinition,
        project_folder: &str,
        parent_instance_id: Option<&str>,
    ) -> Result<InstanceRecord> {
        let record = InstanceRecord {
            instance_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            version: definition.version,
            status: RunStatus::Pending,
            project_folder: project_folder.to_string(),
            parent_instance_id: parent_instance_id.map(String::from),
            created_at: Utc::now(),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO instances (instance_id, workflow_id, version, status, project_folder, parent_instance_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                record.instance_id,
                record.workflow_id,
                record.version,
                record.status.as_str(),
                record.project_folder,
                record.parent_instance_id,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(record)
    }

    fn set_status(&self, instance_id: &str, status: RunStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE instances SET status = ?2, updated_at = ?3 WHERE instance_id = ?1",
            params![instance_id, status.as_str(), Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn insert_phase(&self, record: &PhaseRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO phase_executions (instance_id, node_id, node_type, status, output_json, error, attempts, duration_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.instance_id,
                record.node_id,
                to_text(&record.node_type)?,
                to_text(&record.status)?,
                serde_json::to_string(&record.output)?,
                record.error,
                record.attempts,
                record.duration_ms as i64,
                record.recorded_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

struct InstanceRow {
    instance_id: String,
    workflow_id: String,
    version: u32,
    status: String,
    project_folder: String,
    parent_instance_id: Option<String>,
    created_at: String,
}

fn instance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok(InstanceRow {
        instance_id: row.get(0)?,
        workflow_id: row.get(1)?,
        version: row.get(2)?,
        status: row.get(3)?,
        project_folder: row.get(4)?,
        parent_instance_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl InstanceRow {
    fn into_record(self) -> Result<InstanceRecord> {
        Ok(InstanceRecord {
            instance_id: self.instance_id,
            workflow_id: self.workflow_id,
            version: self.version,
            status: from_text(&self.status)?,
            project_folder: self.project_folder,
            parent_instance_id: self.parent_instance_id,
            created_at: parse_time(&self.created_at),
        })
    }
}

struct PhaseRow {
    instance_id: String,
    node_id: String,
    node_type: String,
    status: String,
    output_json: String,
    error: Option<String>,
    attempts: u32,
    duration_ms: i64,
    recorded_at: String,
}

impl PhaseRow {
    fn into_record(self) -> Result<PhaseRecord> {
        Ok(PhaseRecord {
            instance_id: self.instance_id,
            node_id: self.node_id,
            node_type: from_text(&self.node_type)?,
            status: from_text(&self.status)?,
            output: serde_json::from_str(&self.output_json)?,
            error: self.error,
            attempts: self.attempts,
            duration_ms: self.duration_ms.max(0) as u64,
            recorded_at: parse_time(&self.recorded_at),
        })
    }
}

impl WorkflowService for SqliteWorkflowStore {
    fn get_definition(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let found = self.find_definition(workflow_id, version);
        Box::pin(async move { found })
    }

    fn create_instance(
        &self,
        definition: &WorkflowDefinition,
        project_folder: &str,
        parent_instance_id: Option<&str>,
    ) -> BoxFuture<'_, Result<InstanceRecord>> {
        let created = self.insert_instance(definition, project_folder, parent_instance_id);
        Box::pin(async move { created })
    }

    fn lock_version(&self, workflow_id: &str, version: u32) -> BoxFuture<'_, Result<()>> {
        let locked = self.set_locked(workflow_id, version);
        Box::pin(async move { locked })
    }

    fn record_phase_execution(&self, record: PhaseRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.insert_phase(&record) })
    }

    fn update_instance_status(
        &self,
        instance_id: &str,
        status: RunStatus,
    ) -> BoxFuture<'_, Result<()>> {
        let updated = self.set_status(instance_id, status);
        Box::pin(async move { updated })
    }

    fn start_sub_workflow(
        &self,
        request: SubWorkflowRequest,
    ) -> BoxFuture<'_, Result<SubWorkflowHandle>> {
        Box::pin(async move {
            let definition = self
                .find_definition(&request.workflow_id, request.version)?
                .ok_or_else(|| WeftError::WorkflowNotFound(request.workflow_id.clone()))?;
            self.set_locked(&definition.id, definition.version)?;
            let record = self.insert_instance(
                &definition,
                &request.project_folder,
                Some(&request.parent_instance_id),
            )?;
            info!(
                parent = %request.parent_instance_id,
                node_id = %request.parent_node_id,
                child = %record.instance_id,
                "Sub-workflow instance created"
            );
            Ok(SubWorkflowHandle {
                instance_id: record.instance_id,
                workflow_id: record.workflow_id,
                version: record.version,
                status: record.status,
            })
        })
    }
}
