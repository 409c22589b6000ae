//! Durable store of plugin records.
//!
//! The registry only persists records. Deciding which transitions are legal
//! is left to the [`PluginManager`](crate::plugin::PluginManager); the one
//! rule enforced here is that a record may only be deleted while it is
//! `UNINSTALLING` or `FAILED`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use aihub_plugin_interface::PluginType;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::RegistryError;
use crate::plugin::record::{PluginRecord, PluginState};

/// Persistence for [`PluginRecord`]s, keyed by plugin id.
pub trait PluginRegistry: Send + Sync {
    /// Insert a new record. Fails with `Duplicate` if the id exists.
    fn insert(&self, record: &PluginRecord) -> Result<(), RegistryError>;

    /// Replace an existing record. Fails with `NotFound` if the id is absent.
    fn update(&self, record: &PluginRecord) -> Result<(), RegistryError>;

    /// Insert or replace.
    fn upsert(&self, record: &PluginRecord) -> Result<(), RegistryError>;

    /// Delete a record that is `UNINSTALLING` or `FAILED`.
    fn delete(&self, plugin_id: &str) -> Result<(), RegistryError>;

    fn find_by_plugin_id(&self, plugin_id: &str) -> Result<Option<PluginRecord>, RegistryError>;

    fn exists_by_plugin_id(&self, plugin_id: &str) -> Result<bool, RegistryError> {
        Ok(self.find_by_plugin_id(plugin_id)?.is_some())
    }

    /// All records, ordered by plugin id.
    fn find_all(&self) -> Result<Vec<PluginRecord>, RegistryError>;

    fn find_by_type(&self, plugin_type: PluginType) -> Result<Vec<PluginRecord>, RegistryError>;

    fn find_by_state(&self, state: PluginState) -> Result<Vec<PluginRecord>, RegistryError>;

    /// Records that are (or are not) `ENABLED`.
    fn find_by_enabled(&self, enabled: bool) -> Result<Vec<PluginRecord>, RegistryError>;

    fn count_by_type(&self, plugin_type: PluginType) -> Result<usize, RegistryError> {
        Ok(self.find_by_type(plugin_type)?.len())
    }

    fn count_by_state(&self, state: PluginState) -> Result<usize, RegistryError> {
        Ok(self.find_by_state(state)?.len())
    }

    fn count_by_enabled(&self, enabled: bool) -> Result<usize, RegistryError> {
        Ok(self.find_by_enabled(enabled)?.len())
    }
}

const SELECT_COLUMNS: &str = "plugin_id, name, version, plugin_type, state, author, entry_point,
     capabilities, descriptions, source_reference, source_path, content_hash,
     invoke_timeout_secs, created_by, last_error, installed_at, updated_at";

/// Parse an RFC3339 timestamp string into a DateTime<Utc>
fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Raw data extracted from a database row before conversion to PluginRecord
struct PluginRowData {
    plugin_id: String,
    name: String,
    version: String,
    plugin_type_str: String,
    state_str: String,
    author: Option<String>,
    entry_point: String,
    capabilities_json: String,
    descriptions_json: String,
    source_reference: String,
    source_path: Option<String>,
    content_hash: String,
    invoke_timeout_secs: i64,
    created_by: String,
    last_error: Option<String>,
    installed_at_str: String,
    updated_at_str: String,
}

impl PluginRowData {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            plugin_id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            plugin_type_str: row.get(3)?,
            state_str: row.get(4)?,
            author: row.get(5)?,
            entry_point: row.get(6)?,
            capabilities_json: row.get(7)?,
            descriptions_json: row.get(8)?,
            source_reference: row.get(9)?,
            source_path: row.get(10)?,
            content_hash: row.get(11)?,
            invoke_timeout_secs: row.get(12)?,
            created_by: row.get(13)?,
            last_error: row.get(14)?,
            installed_at_str: row.get(15)?,
            updated_at_str: row.get(16)?,
        })
    }

    fn into_record(self) -> Result<PluginRecord, RegistryError> {
        let corrupt = |what: &str, detail: String| {
            RegistryError::Storage(format!(
                "corrupt {} for plugin '{}': {}",
                what, self.plugin_id, detail
            ))
        };

        let plugin_type = self
            .plugin_type_str
            .parse::<PluginType>()
            .map_err(|e| corrupt("type", e.to_string()))?;
        let state = self
            .state_str
            .parse::<PluginState>()
            .map_err(|e| corrupt("state", e))?;
        let capabilities = serde_json::from_str(&self.capabilities_json)
            .map_err(|e| corrupt("capabilities", e.to_string()))?;
        let descriptions = serde_json::from_str(&self.descriptions_json)
            .map_err(|e| corrupt("descriptions", e.to_string()))?;
        let installed_at = parse_rfc3339(&self.installed_at_str)
            .ok_or_else(|| corrupt("installed_at", self.installed_at_str.clone()))?;
        let updated_at = parse_rfc3339(&self.updated_at_str).unwrap_or(installed_at);

        Ok(PluginRecord {
            plugin_id: self.plugin_id,
            name: self.name,
            version: self.version,
            plugin_type,
            state,
            author: self.author,
            entry_point: self.entry_point,
            capabilities,
            descriptions,
            source_reference: self.source_reference,
            source_path: self.source_path,
            content_hash: self.content_hash,
            invoke_timeout_secs: self.invoke_timeout_secs.max(1) as u64,
            created_by: self.created_by,
            last_error: self.last_error,
            installed_at,
            updated_at,
        })
    }
}

/// SQLite-backed [`PluginRegistry`].
pub struct SqlitePluginRegistry {
    conn: Mutex<Connection>,
}

impl SqlitePluginRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| {
            RegistryError::Storage(format!("failed to open database at {:?}: {}", path, e))
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|_| RegistryError::Storage("database lock poisoned".to_string()))
    }

    fn query(&self, filter: &str, param: &dyn rusqlite::ToSql) -> Result<Vec<PluginRecord>, RegistryError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM plugins {} ORDER BY plugin_id",
            SELECT_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = if filter.is_empty() {
            stmt.query_map([], PluginRowData::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([param], PluginRowData::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(PluginRowData::into_record).collect()
    }
}

fn init_schema(conn: &Connection) -> Result<(), RegistryError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS plugins (
            plugin_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            plugin_type TEXT NOT NULL,
            state TEXT NOT NULL,
            author TEXT,
            entry_point TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            descriptions TEXT NOT NULL,
            source_reference TEXT NOT NULL,
            source_path TEXT,
            content_hash TEXT NOT NULL,
            invoke_timeout_secs INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            last_error TEXT,
            installed_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plugins_state ON plugins(state)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plugins_type ON plugins(plugin_type)",
        [],
    )?;

    Ok(())
}

fn write_record(conn: &Connection, verb: &str, record: &PluginRecord) -> Result<usize, RegistryError> {
    let capabilities = serde_json::to_string(&record.capabilities)
        .map_err(|e| RegistryError::Storage(e.to_string()))?;
    let descriptions = serde_json::to_string(&record.descriptions)
        .map_err(|e| RegistryError::Storage(e.to_string()))?;

    let sql = format!(
        "{} INTO plugins ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        verb, SELECT_COLUMNS
    );
    let changed = conn.execute(
        &sql,
        params![
            record.plugin_id,
            record.name,
            record.version,
            record.plugin_type.as_str(),
            record.state.as_str(),
            record.author,
            record.entry_point,
            capabilities,
            descriptions,
            record.source_reference,
            record.source_path,
            record.content_hash,
            record.invoke_timeout_secs as i64,
            record.created_by,
            record.last_error,
            record.installed_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(changed)
}

impl PluginRegistry for SqlitePluginRegistry {
    fn insert(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        match write_record(&conn, "INSERT", record) {
            Err(RegistryError::Storage(_)) if exists(&conn, &record.plugin_id)? => {
                Err(RegistryError::Duplicate(record.plugin_id.clone()))
            }
            other => other.map(|_| ()),
        }
    }

    fn update(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if !exists(&tx, &record.plugin_id)? {
            return Err(RegistryError::NotFound(record.plugin_id.clone()));
        }
        write_record(&tx, "INSERT OR REPLACE", record)?;
        tx.commit()?;
        Ok(())
    }

    fn upsert(&self, record: &PluginRecord) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        write_record(&conn, "INSERT OR REPLACE", record)?;
        Ok(())
    }

    fn delete(&self, plugin_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM plugins WHERE plugin_id = ?1",
                [plugin_id],
                |row| row.get(0),
            )
            .optional()?;

        let state = match state {
            None => return Err(RegistryError::NotFound(plugin_id.to_string())),
            Some(s) => s
                .parse::<PluginState>()
                .map_err(RegistryError::Storage)?,
        };
        if !state.is_deletable() {
            return Err(RegistryError::InvalidState {
                plugin_id: plugin_id.to_string(),
                state,
            });
        }

        tx.execute("DELETE FROM plugins WHERE plugin_id = ?1", [plugin_id])?;
        tx.commit()?;
        Ok(())
    }

    fn find_by_plugin_id(&self, plugin_id: &str) -> Result<Option<PluginRecord>, RegistryError> {
        Ok(self
            .query("WHERE plugin_id = ?1", &plugin_id)?
            .into_iter()
            .next())
    }

    fn exists_by_plugin_id(&self, plugin_id: &str) -> Result<bool, RegistryError> {
        let conn = self.conn()?;
        exists(&conn, plugin_id)
    }

    fn find_all(&self) -> Result<Vec<PluginRecord>, RegistryError> {
        self.query("", &"")
    }

    fn find_by_type(&self, plugin_type: PluginType) -> Result<Vec<PluginRecord>, RegistryError> {
        self.query("WHERE plugin_type = ?1", &plugin_type.as_str())
    }

    fn find_by_state(&self, state: PluginState) -> Result<Vec<PluginRecord>, RegistryError> {
        self.query("WHERE state = ?1", &state.as_str())
    }

    fn find_by_enabled(&self, enabled: bool) -> Result<Vec<PluginRecord>, RegistryError> {
        let filter = if enabled {
            "WHERE state = ?1"
        } else {
            "WHERE state != ?1"
        };
        self.query(filter, &PluginState::Enabled.as_str())
    }

    fn count_by_type(&self, plugin_type: PluginType) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        count(&conn, "plugin_type = ?1", plugin_type.as_str())
    }

    fn count_by_state(&self, state: PluginState) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        count(&conn, "state = ?1", state.as_str())
    }

    fn count_by_enabled(&self, enabled: bool) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        let filter = if enabled { "state = ?1" } else { "state != ?1" };
        count(&conn, filter, PluginState::Enabled.as_str())
    }
}

fn exists(conn: &Connection, plugin_id: &str) -> Result<bool, RegistryError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM plugins WHERE plugin_id = ?1",
            [plugin_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn count(conn: &Connection, filter: &str, value: &str) -> Result<usize, RegistryError> {
    let sql = format!("SELECT COUNT(*) FROM plugins WHERE {}", filter);
    let n: i64 = conn.query_row(&sql, [value], |row| row.get(0))?;
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::descriptor::DescriptorParser;
    use crate::plugin::package::PackageHandle;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn record(id: &str, plugin_type: &str, capability_type: &str) -> PluginRecord {
        let manifest = format!(
            r#"
schema_version = 1
id = "{id}"
name = "{id}"
version = "1.0.0"
type = "{plugin_type}"
entry_point = "run.sh"

[description]
en_US = "Test plugin"

[[capabilities]]
name = "{id}-cap"
type = "{capability_type}"
"#
        );
        let package = PackageHandle::from_bytes("test", manifest.into_bytes());
        let descriptor = DescriptorParser::parse(&package).unwrap();
        PluginRecord::from_descriptor(&descriptor, &package, "tester")
    }

    fn model(id: &str) -> PluginRecord {
        record(id, "model-provider", "model")
    }

    fn tool(id: &str) -> PluginRecord {
        record(id, "tool", "tool")
    }

    #[test]
    fn test_insert_and_find() {
        let registry = SqlitePluginRegistry::open_in_memory().unwrap();
        let rec = model("acme");
        registry.insert(&rec).unwrap();

        let found = registry.find_by_plugin_id("acme").unwrap().unwrap();
        assert_eq!(found.plugin_id, rec.plugin_id);
        assert_eq!(found.capabilities, rec.capabilities);
        assert_eq!(found.descriptions, rec.descriptions);
        assert_eq!(found.state, PluginState::Installing);
        assert!(registry.exists_by_plugin_id("acme").unwrap());
        assert!(registry.find_by_plugin_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let registry = SqlitePluginRegistry::open_in_memory().unwrap();
        registry.insert(&model("acme")).unwrap();
        let err = registry.insert(&model("acme")).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("acme".to_string()));
    }

    #[test]
    fn test_update_missing_fails() {
        let registry = SqlitePluginRegistry::open_in_memory().unwrap();
        let err = registry.update(&model("ghost")).unwrap_err();
        assert_eq!(err, RegistryError::NotFound("ghost".to_string()));
    }

    #[test]
    fn test_update_persists_state_and_error() {
        let registry = SqlitePluginRegistry::open_in_memory().unwrap();
        let mut rec = model("acme");
        registry.insert(&rec).unwrap();

        rec.mark_failed("boom");
        registry.update(&rec).unwrap();

        let found = registry.find_by_plugin_id("acme").unwrap().unwrap();
        assert_eq!(found.state, PluginState::Failed);
        assert_eq!(found.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_delete_only_from_terminal_states() {
        let registry = SqlitePluginRegistry::open_in_memory().unwrap();
        let mut rec = model("acme");
        rec.set_state(PluginState::Enabled);
        registry.insert(&rec).unwrap();

        let err = registry.delete("acme").unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidState {
                plugin_id: "acme".to_string(),
                state: PluginState::Enabled,
            }
        );

        rec.set_state(PluginState::Uninstalling);
        registry.update(&rec).unwrap();
        registry.delete("acme").unwrap();
        assert!(!registry.exists_by_plugin_id("acme").unwrap());

        assert_eq!(
            registry.delete("acme").unwrap_err(),
            RegistryError::NotFound("acme".to_string())
        );
    }

    #[test]
    fn test_queries_and_counts() {
        let registry = SqlitePluginRegistry::open_in_memory().unwrap();
        let mut a = model("a-models");
        a.set_state(PluginState::Enabled);
        let mut b = tool("b-tools");
        b.set_state(PluginState::Disabled);
        let mut c = model("c-models");
        c.set_state(PluginState::Installed);
        for rec in [&c, &a, &b] {
            registry.insert(rec).unwrap();
        }

        let all: Vec<_> = registry
            .find_all()
            .unwrap()
            .into_iter()
            .map(|r| r.plugin_id)
            .collect();
        assert_eq!(all, vec!["a-models", "b-tools", "c-models"]);

        assert_eq!(registry.find_by_type(PluginType::ModelProvider).unwrap().len(), 2);
        assert_eq!(registry.count_by_type(PluginType::Tool).unwrap(), 1);
        assert_eq!(registry.count_by_type(PluginType::WorkflowExtension).unwrap(), 0);

        assert_eq!(registry.find_by_state(PluginState::Disabled).unwrap()[0].plugin_id, "b-tools");
        assert_eq!(registry.count_by_state(PluginState::Installed).unwrap(), 1);

        assert_eq!(registry.find_by_enabled(true).unwrap()[0].plugin_id, "a-models");
        assert_eq!(registry.count_by_enabled(true).unwrap(), 1);
        assert_eq!(registry.count_by_enabled(false).unwrap(), 2);
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("aihub.db");
        {
            let registry = SqlitePluginRegistry::open(&path).unwrap();
            registry.upsert(&model("acme")).unwrap();
        }
        let registry = SqlitePluginRegistry::open(&path).unwrap();
        let found = registry.find_by_plugin_id("acme").unwrap().unwrap();
        assert_eq!(found.version, "1.0.0");
    }
}
