use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::Path};
use thiserror::Error;
use tracing::{debug, info};

/// Target used when no database path is configured.
pub const IN_MEMORY: &str = ":memory:";

/// Errors raised by [`RecordStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection could not be opened. The store was never constructed.
    #[error("failed to open database connection to '{target}'")]
    Connection {
        target: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A lookup by name matched no rows.
    #[error("no record named '{name}' found in table '{table}'")]
    NotFound { table: String, name: String },

    /// Any other failure while preparing or executing a statement.
    #[error(transparent)]
    Statement(#[from] rusqlite::Error),

    /// A [`TableName`] was built from a string outside the allowed identifier set.
    #[error("invalid table name '{name}'")]
    InvalidTableName { name: String },
}

/// Core value types bound as statement parameters
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Integer(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// SQL statement with positional parameters
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlQuery {
    pub(crate) statement: String,
    pub(crate) params: Vec<Value>,
}

impl SqlQuery {
    pub(crate) fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter
    pub(crate) fn with_param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// A single row of the Id/Name shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub name: String,
}

impl Record {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }
}

/// A table identifier restricted to `[A-Za-z_][A-Za-z0-9_]*`.
///
/// Opt-in: every [`RecordStore`] operation also accepts plain strings. Wrap
/// externally influenced names in this type before they reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if valid {
            Ok(Self(name))
        } else {
            Err(StoreError::InvalidTableName { name })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection settings for a [`RecordStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file, or `:memory:`
    pub db_path: String,
    /// Create the file when it does not exist yet
    pub create_if_missing: bool,
    /// Open without write access
    pub read_only: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: IN_MEMORY.to_string(),
            create_if_missing: true,
            read_only: false,
        }
    }
}

impl StoreConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn with_create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
            if self.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
        }
        flags
    }
}

/// Id/Name record access over one exclusively owned SQLite connection.
///
/// Every operation maps to exactly one SQL statement. Values are always bound
/// as parameters, but the table name is interpolated into the statement text.
/// A table name containing SQL can therefore change the statement that runs.
/// Callers that take table names from outside a trust boundary must validate
/// them first, for example through [`TableName`].
///
/// The connection has no internal locking. Use from a single thread or
/// serialize access externally.
pub struct RecordStore {
    conn: Connection,
    target: String,
}

impl RecordStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let target = path.display().to_string();
        match Connection::open(path) {
            Ok(conn) => Ok(Self::established(conn, target)),
            Err(source) => Err(StoreError::Connection { target, source }),
        }
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        match Connection::open_in_memory() {
            Ok(conn) => Ok(Self::established(conn, IN_MEMORY.to_string())),
            Err(source) => Err(StoreError::Connection {
                target: IN_MEMORY.to_string(),
                source,
            }),
        }
    }

    /// Opens the database described by `config` with its flags applied.
    pub fn with_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let target = config.db_path.clone();
        match Connection::open_with_flags(&config.db_path, config.open_flags()) {
            Ok(conn) => Ok(Self::established(conn, target)),
            Err(source) => Err(StoreError::Connection { target, source }),
        }
    }

    fn established(conn: Connection, target: String) -> Self {
        info!(db_target = %target, "opened sqlite connection");
        Self { conn, target }
    }

    /// The path or `:memory:` target this store was opened against.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Closes the connection, reporting any error from the driver.
    ///
    /// Dropping the store also closes the connection, but silently.
    pub fn close(self) -> Result<(), StoreError> {
        let Self { conn, target } = self;
        conn.close().map_err(|(_, e)| StoreError::Statement(e))?;
        info!(db_target = %target, "closed sqlite connection");
        Ok(())
    }

    pub fn insert(&self, table: impl AsRef<str>, name: &str) -> Result<(), StoreError> {
        let query = SqlQuery::new(format!("INSERT INTO {} (Name) VALUES (?1)", table.as_ref()))
            .with_param(name);
        self.execute(&query)?;
        Ok(())
    }

    /// Returns every `Name` in engine iteration order.
    pub fn fetch_all_names(&self, table: impl AsRef<str>) -> Result<Vec<String>, StoreError> {
        let query = SqlQuery::new(format!("SELECT Name FROM {}", table.as_ref()));
        self.query(&query, |row| row.get(0))
    }

    /// Returns the `Id` of a row with the given name.
    ///
    /// When several rows share the name, whichever row the engine yields first
    /// is returned.
    pub fn find_id_by_name(&self, table: impl AsRef<str>, name: &str) -> Result<i64, StoreError> {
        let table = table.as_ref();
        let query = SqlQuery::new(format!("SELECT Id FROM {table} WHERE Name = ?1 LIMIT 1"))
            .with_param(name);
        self.query_optional(&query, |row| row.get(0))?
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                name: name.to_string(),
            })
    }

    /// Renames the row with `id`. A missing id is a silent no-op.
    pub fn update(
        &self,
        table: impl AsRef<str>,
        id: i64,
        new_name: &str,
    ) -> Result<(), StoreError> {
        let query = SqlQuery::new(format!("UPDATE {} SET Name = ?1 WHERE Id = ?2", table.as_ref()))
            .with_param(new_name)
            .with_param(id);
        self.execute(&query)?;
        Ok(())
    }

    /// Deletes the row with `id`. A missing id is a silent no-op.
    pub fn delete(&self, table: impl AsRef<str>, id: i64) -> Result<(), StoreError> {
        let query =
            SqlQuery::new(format!("DELETE FROM {} WHERE Id = ?1", table.as_ref())).with_param(id);
        self.execute(&query)?;
        Ok(())
    }

    pub fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let query = SqlQuery::new("SELECT name FROM sqlite_master WHERE type='table'");
        self.query(&query, |row| row.get(0))
    }

    /// Returns every row keyed by `Id`. A repeated id keeps the last name seen.
    pub fn fetch_all_with_ids(
        &self,
        table: impl AsRef<str>,
    ) -> Result<HashMap<i64, String>, StoreError> {
        let records = self.fetch_records(table)?;
        Ok(records
            .into_iter()
            .map(|record| (record.id, record.name))
            .collect())
    }

    /// Returns every row in engine iteration order.
    pub fn fetch_records(&self, table: impl AsRef<str>) -> Result<Vec<Record>, StoreError> {
        let query = SqlQuery::new(format!("SELECT Id, Name FROM {}", table.as_ref()));
        self.query(&query, Record::from_row)
    }

    fn execute(&self, query: &SqlQuery) -> Result<usize, StoreError> {
        debug!(sql = %query.statement, params = query.params.len(), "executing statement");
        let mut stmt = self.conn.prepare(&query.statement)?;
        let affected = stmt.execute(params_from_iter(query.params.iter()))?;
        debug!(affected, "statement complete");
        Ok(affected)
    }

    fn query<T, F>(&self, query: &SqlQuery, map: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        debug!(sql = %query.statement, params = query.params.len(), "executing query");
        let mut stmt = self.conn.prepare(&query.statement)?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), map)?;
        let values = rows.collect::<rusqlite::Result<Vec<T>>>()?;
        Ok(values)
    }

    fn query_optional<T, F>(&self, query: &SqlQuery, map: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        debug!(sql = %query.statement, params = query.params.len(), "executing query");
        let mut stmt = self.conn.prepare(&query.statement)?;
        let value = stmt
            .query_row(params_from_iter(query.params.iter()), map)
            .optional()?;
        Ok(value)
    }
}
