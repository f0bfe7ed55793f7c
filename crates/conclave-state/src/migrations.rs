//! SurrealDB table definitions
//!
//! Every table stores one JSON-encoded record per row, keyed by `key` and
//! grouped by `run_id`. `ord` gives the listing order within a run.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Tables managed by [`init_schema`].
pub const TABLES: [&str; 4] = ["runs", "candidates", "decisions", "checkpoints"];

/// Initialize all Conclave tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Conclave SurrealDB schema");

    for table in TABLES {
        init_document_table(db, table).await?;
    }

    info!("Conclave schema initialization complete");
    Ok(())
}

/// Initialize a document table
///
/// Schema:
/// ```text
/// TABLE <name> {
///   key:     STRING (unique)
///   run_id:  STRING (indexed)
///   ord:     INT    (listing order within a run)
///   body:    STRING (JSON-encoded record)
/// }
/// ```
async fn init_document_table(db: &Surreal<Any>, table: &str) -> Result<()> {
    debug!("Initializing {} table", table);

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_{table}_key ON TABLE {table} COLUMNS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_{table}_run_id ON TABLE {table} COLUMNS run_id;
        "#
    );

    db.query(sql)
        .await
        .map_err(|e| crate::StateError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}
