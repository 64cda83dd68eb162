//! Entity repository: save by primary key, query builders, counts

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use super::builder::QueryBuilder;
use super::compiler::CompiledQuery;
use super::schema::{EntityMapping, Schema};
use super::value::SqlValue;
use crate::db::{Database, RowSource};
use crate::error::{OrmError, Result};

/// Repository for one registered entity.
#[derive(Debug, Clone)]
pub struct Repository {
    schema: Arc<Schema>,
    entity: String,
}

impl Repository {
    pub fn new(schema: Arc<Schema>, entity: &str) -> Result<Self> {
        schema.resolve(entity)?;
        Ok(Self {
            schema,
            entity: entity.to_string(),
        })
    }

    pub fn mapping(&self) -> Result<&EntityMapping> {
        self.schema.resolve(&self.entity)
    }

    /// Insert the entity, or update the row with the same primary key.
    ///
    /// Returns the saved entity with a generated primary key filled in.
    pub async fn save(
        &self,
        db: &Database,
        entity: &JsonMap<String, JsonValue>,
    ) -> Result<JsonMap<String, JsonValue>> {
        let mapping = self.mapping()?;
        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        let mut pending_key: Option<&str> = None;

        for column in mapping.columns() {
            let value = entity.get(&column.field).unwrap_or(&JsonValue::Null);
            if column.generated && value.is_null() {
                pending_key = Some(column.field.as_str());
                continue;
            }
            if value.is_null() && column.default.is_some() && !entity.contains_key(&column.field) {
                continue;
            }
            columns.push(column.column.as_str());
            values.push(column.encode(value)?);
        }

        let sql = upsert_sql(mapping, &columns);
        debug!(entity = %mapping.name, sql = %sql, "Saving entity");
        let result = db.execute(&sql, &values).await?;

        let mut saved = entity.clone();
        if let Some(field) = pending_key {
            saved.insert(field.to_string(), JsonValue::from(result.last_insert_rowid()));
        }
        Ok(saved)
    }

    /// [save](Self::save) for any serde type that serializes to an object.
    pub async fn save_as<T>(&self, db: &Database, entity: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = match serde_json::to_value(entity)? {
            JsonValue::Object(map) => map,
            other => {
                return Err(OrmError::mapping(format!(
                    "{} must serialize to an object, got {}",
                    self.entity, other
                )));
            }
        };
        let saved = self.save(db, &value).await?;
        Ok(serde_json::from_value(JsonValue::Object(saved))?)
    }

    /// A builder selecting this entity under `alias`.
    pub fn find(&self, alias: &str) -> Result<QueryBuilder> {
        QueryBuilder::new(self.schema.clone())
            .select([alias])
            .from(&self.entity, alias)
    }

    /// Number of rows in the entity's table.
    pub async fn count<S>(&self, source: &S) -> Result<i64>
    where
        S: RowSource + ?Sized,
    {
        let mapping = self.mapping()?;
        let query = CompiledQuery {
            sql: format!("SELECT COUNT(*) AS \"cnt\" FROM \"{}\"", mapping.table),
            params: Vec::new(),
            shape: Default::default(),
        };
        source.fetch_count(&query).await
    }
}

fn upsert_sql(mapping: &EntityMapping, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO \"{}\" DEFAULT VALUES", mapping.table);
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();
    let keys: Vec<String> = mapping
        .primary_columns()
        .map(|c| format!("\"{}\"", c.column))
        .collect();
    let updates: Vec<String> = mapping
        .columns()
        .iter()
        .filter(|c| !c.is_primary_key && columns.contains(&c.column.as_str()))
        .map(|c| format!("\"{0}\" = excluded.\"{0}\"", c.column))
        .collect();

    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT({}) {}",
        mapping.table,
        quoted.join(", "),
        placeholders.join(", "),
        keys.join(", "),
        conflict
    )
}
