//! Record access over a single SQLite connection.
//!
//! # Intention
//!
//! - Provide a small, typed API for the Id/Name row shape shared by a family of tables.
//! - Encapsulate SQLite-specific logic, types, and error handling.
//!
//! # Architectural Boundaries
//!
//! - Only SQLite/database code belongs here.
//! - No schema creation, migrations, pooling, or transactions. Tables must already exist.

pub mod sqlite;

pub use sqlite::{Record, RecordStore, StoreConfig, StoreError, TableName};
