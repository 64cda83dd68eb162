//! Schema synchronization from entity mappings
//!
//! - Drops every registered table when asked to start from a clean slate
//! - Creates missing tables
//! - Adds missing columns to existing tables
//! - Does NOT handle column renames or type changes

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::orm::{ColumnMapping, EntityMapping, Schema};

/// Result of a schema sync operation
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_dropped: Vec<String>,
    pub tables_created: Vec<String>,
    pub columns_added: Vec<(String, String)>, // (table, column)
    pub errors: Vec<String>,
}

impl SchemaSyncResult {
    fn merge(&mut self, other: SchemaSyncResult) {
        self.tables_dropped.extend(other.tables_dropped);
        self.tables_created.extend(other.tables_created);
        self.columns_added.extend(other.columns_added);
        self.errors.extend(other.errors);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check if a table exists in the database
async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

/// Get existing columns for a table
async fn get_table_columns(
    pool: &SqlitePool,
    table_name: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(i32, String, String, i32, Option<String>, i32)> =
        sqlx::query_as(&format!("PRAGMA table_info(\"{}\")", table_name))
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(_, name, _, _, _, _)| name).collect())
}

/// Drop every registered table, last registered first.
pub async fn drop_all(pool: &SqlitePool, schema: &Schema) -> SchemaSyncResult {
    let mut result = SchemaSyncResult::default();
    let mappings: Vec<&EntityMapping> = schema.registry().iter().collect();

    for mapping in mappings.into_iter().rev() {
        match sqlx::query(&mapping.drop_table_sql()).execute(pool).await {
            Ok(_) => {
                debug!(table = %mapping.table, "Dropped table");
                result.tables_dropped.push(mapping.table.clone());
            }
            Err(e) => {
                let msg = format!("Failed to drop table {}: {}", mapping.table, e);
                warn!("{}", msg);
                result.errors.push(msg);
            }
        }
    }
    result
}

/// Sync a single entity's table to the database
pub async fn sync_entity(
    pool: &SqlitePool,
    mapping: &EntityMapping,
) -> Result<SchemaSyncResult, sqlx::Error> {
    let mut result = SchemaSyncResult::default();
    let table_name = mapping.table.as_str();

    if !table_exists(pool, table_name).await? {
        let create_sql = mapping.create_table_sql();
        debug!("Creating table {}: {}", table_name, create_sql);

        match sqlx::query(&create_sql).execute(pool).await {
            Ok(_) => {
                info!("Created table: {}", table_name);
                result.tables_created.push(table_name.to_string());
            }
            Err(e) => {
                let msg = format!("Failed to create table {}: {}", table_name, e);
                warn!("{}", msg);
                result.errors.push(msg);
            }
        }
    } else {
        let existing_columns = get_table_columns(pool, table_name).await?;

        for column in mapping.columns() {
            if existing_columns.iter().any(|c| c == &column.column) {
                continue;
            }
            let alter_sql = generate_add_column_sql(table_name, column);
            debug!("Adding column to {}: {}", table_name, alter_sql);

            match sqlx::query(&alter_sql).execute(pool).await {
                Ok(_) => {
                    info!("Added column {}.{}", table_name, column.column);
                    result
                        .columns_added
                        .push((table_name.to_string(), column.column.clone()));
                }
                Err(e) => {
                    let msg = format!(
                        "Failed to add column {}.{}: {}",
                        table_name, column.column, e
                    );
                    warn!("{}", msg);
                    result.errors.push(msg);
                }
            }
        }
    }

    Ok(result)
}

/// Generate ALTER TABLE ADD COLUMN SQL
fn generate_add_column_sql(table_name: &str, column: &ColumnMapping) -> String {
    let sql_type = column.column_type.sql_type();
    let mut sql = format!(
        "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
        table_name, column.column, sql_type
    );

    // SQLite cannot add a NOT NULL column without a default
    if let Some(default) = &column.default {
        sql.push_str(&format!(" DEFAULT {}", default));
    } else if !column.nullable {
        let default_val = match sql_type {
            "TEXT" => "''",
            "REAL" => "0.0",
            "BLOB" => "x''",
            _ => "0",
        };
        sql.push_str(&format!(" NOT NULL DEFAULT {}", default_val));
    }

    sql
}

/// Sync every registered entity table, optionally dropping them first.
pub async fn sync_all(pool: &SqlitePool, schema: &Schema, drop_first: bool) -> SchemaSyncResult {
    let mut total = SchemaSyncResult::default();

    if drop_first {
        total.merge(drop_all(pool, schema).await);
    }

    for mapping in schema.registry().iter() {
        match sync_entity(pool, mapping).await {
            Ok(result) => total.merge(result),
            Err(e) => total
                .errors
                .push(format!("Error syncing {}: {}", mapping.name, e)),
        }
    }

    if !total.tables_created.is_empty() {
        info!(tables = ?total.tables_created, "Created tables");
    }
    for err in &total.errors {
        warn!(error = %err, "Schema sync error");
    }
    total
}
