//! Schema registry: entity to table/column mappings
//!
//! Mappings are explicit configuration built with [EntityMapping::builder] and
//! registered once at startup through [SchemaBuilder]. The resulting [Schema]
//! is shared behind an `Arc` and never changes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::relations::{RelationDescriptor, RelationGraph};
use super::transformers::ValueTransformer;
use super::value::SqlValue;
use crate::error::{OrmError, Result};

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    /// Stored as INTEGER 0/1, surfaced as a JSON bool
    Boolean,
    Blob,
}

impl ColumnType {
    /// SQLite column type (TEXT, INTEGER, REAL, BLOB)
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }

    /// Decode a raw row value into its entity representation.
    pub fn decode(&self, value: &SqlValue) -> JsonValue {
        match (self, value) {
            (ColumnType::Boolean, SqlValue::Int(i)) => JsonValue::Bool(*i != 0),
            (ColumnType::Real, SqlValue::Int(i)) => JsonValue::from(*i as f64),
            _ => value.to_json(),
        }
    }
}

/// Column definition for one mapped field.
#[derive(Clone)]
pub struct ColumnMapping {
    /// Property name on the entity (e.g. "categoryId")
    pub field: String,
    /// Column name in the database
    pub column: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Whether the column is selected when its entity alias is selected
    pub selectable: bool,
    pub is_primary_key: bool,
    /// Database-generated value (INTEGER PRIMARY KEY AUTOINCREMENT)
    pub generated: bool,
    /// Default value expression (e.g., "CURRENT_TIMESTAMP")
    pub default: Option<String>,
    pub transformer: Option<Arc<dyn ValueTransformer>>,
}

impl fmt::Debug for ColumnMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnMapping")
            .field("field", &self.field)
            .field("column", &self.column)
            .field("column_type", &self.column_type)
            .field("nullable", &self.nullable)
            .field("selectable", &self.selectable)
            .field("is_primary_key", &self.is_primary_key)
            .field("generated", &self.generated)
            .field("transformer", &self.transformer.as_ref().map(|t| t.name()))
            .finish()
    }
}

impl ColumnMapping {
    /// A non-null, selectable column whose name equals the field name.
    pub fn new(field: impl Into<String>, column_type: ColumnType) -> Self {
        let field = field.into();
        Self {
            column: field.clone(),
            field,
            column_type,
            nullable: false,
            selectable: true,
            is_primary_key: false,
            generated: false,
            default: None,
            transformer: None,
        }
    }

    pub fn named(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Exclude from default selection (primary keys ignore this).
    pub fn hidden(mut self) -> Self {
        self.selectable = false;
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn transformer(mut self, transformer: impl ValueTransformer + 'static) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    /// Decode a raw row value, applying the transformer when present.
    pub fn decode(&self, value: &SqlValue) -> Result<JsonValue> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        match &self.transformer {
            Some(t) => t.from_database(value),
            None => Ok(self.column_type.decode(value)),
        }
    }

    /// Encode an entity field for binding, applying the transformer when present.
    pub fn encode(&self, value: &JsonValue) -> Result<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        match &self.transformer {
            Some(t) => t.to_database(value),
            None => Ok(SqlValue::from_json(value)),
        }
    }

    /// Generate the column definition SQL
    fn to_sql(&self, inline_primary_key: bool) -> String {
        let mut sql = format!("\"{}\" {}", self.column, self.column_type.sql_type());

        if inline_primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.generated {
                sql.push_str(" AUTOINCREMENT");
            }
        }

        if !self.nullable && !inline_primary_key {
            sql.push_str(" NOT NULL");
        }

        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {}", default));
        }

        sql
    }
}

/// Mapping of one entity onto one table.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    pub name: String,
    pub table: String,
    columns: Vec<ColumnMapping>,
    /// Field names of the primary key, in declaration order
    primary_keys: Vec<String>,
}

impl EntityMapping {
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityMappingBuilder {
        EntityMappingBuilder {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    pub fn column(&self, field: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.field == field)
    }

    /// Resolve a property by field name first, then by column name.
    pub fn resolve_property(&self, property: &str) -> Option<&ColumnMapping> {
        self.column(property)
            .or_else(|| self.columns.iter().find(|c| c.column == property))
    }

    pub fn primary_key_fields(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| c.is_primary_key)
    }

    /// Columns selected when the whole entity is selected. Primary keys are
    /// always included.
    pub fn default_selection(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| c.selectable || c.is_primary_key)
    }

    /// Generate CREATE TABLE IF NOT EXISTS SQL
    pub fn create_table_sql(&self) -> String {
        let inline_pk = self.primary_keys.len() == 1;
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.to_sql(inline_pk && c.is_primary_key))
            .collect();

        if !inline_pk {
            let cols: Vec<String> = self
                .primary_columns()
                .map(|c| format!("\"{}\"", c.column))
                .collect();
            defs.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n  {}\n)",
            self.table,
            defs.join(",\n  ")
        )
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\"", self.table)
    }
}

pub struct EntityMappingBuilder {
    name: String,
    table: String,
    columns: Vec<ColumnMapping>,
}

impl EntityMappingBuilder {
    /// Add an auto-incremented INTEGER primary key.
    pub fn generated_primary(self, field: &str) -> Self {
        self.add(ColumnMapping::new(field, ColumnType::Integer).primary().generated())
    }

    pub fn primary(self, field: &str, column_type: ColumnType) -> Self {
        self.add(ColumnMapping::new(field, column_type).primary())
    }

    pub fn column(self, field: &str, column_type: ColumnType) -> Self {
        self.add(ColumnMapping::new(field, column_type))
    }

    pub fn nullable_column(self, field: &str, column_type: ColumnType) -> Self {
        self.add(ColumnMapping::new(field, column_type).nullable())
    }

    pub fn add(mut self, column: ColumnMapping) -> Self {
        self.columns.push(column);
        self
    }

    pub fn build(self) -> Result<EntityMapping> {
        let invalid = |reason: String| OrmError::InvalidMapping {
            entity: self.name.clone(),
            reason,
        };

        let primary_keys: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.field.clone())
            .collect();
        if primary_keys.is_empty() {
            return Err(invalid("at least one primary key column is required".into()));
        }

        for (i, col) in self.columns.iter().enumerate() {
            let rest = &self.columns[i + 1..];
            if rest.iter().any(|c| c.field == col.field) {
                return Err(invalid(format!("duplicate field {}", col.field)));
            }
            if rest.iter().any(|c| c.column == col.column) {
                return Err(invalid(format!("duplicate column {}", col.column)));
            }
            if col.generated && (primary_keys.len() != 1 || col.column_type != ColumnType::Integer) {
                return Err(invalid(format!(
                    "generated column {} must be the single INTEGER primary key",
                    col.field
                )));
            }
        }

        Ok(EntityMapping {
            name: self.name,
            table: self.table,
            columns: self.columns,
            primary_keys,
        })
    }
}

/// Holds every registered entity mapping.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: Vec<EntityMapping>,
    by_name: HashMap<String, usize>,
    by_table: HashMap<String, usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mapping: EntityMapping) -> Result<()> {
        if self.by_table.contains_key(&mapping.table) {
            return Err(OrmError::DuplicateEntity(mapping.table));
        }
        if self.by_name.contains_key(&mapping.name) {
            return Err(OrmError::DuplicateEntity(mapping.name));
        }

        let idx = self.entities.len();
        self.by_name.insert(mapping.name.clone(), idx);
        self.by_table.insert(mapping.table.clone(), idx);
        tracing::debug!(entity = %mapping.name, table = %mapping.table, "Registered entity");
        self.entities.push(mapping);
        Ok(())
    }

    pub fn resolve(&self, entity: &str) -> Result<&EntityMapping> {
        self.by_name
            .get(entity)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| OrmError::UnknownEntity(entity.to_string()))
    }

    pub fn resolve_by_table(&self, table: &str) -> Result<&EntityMapping> {
        self.by_table
            .get(table)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| OrmError::UnknownEntity(table.to_string()))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.by_name.contains_key(entity)
    }

    /// Entities in registration order
    pub fn iter(&self) -> impl Iterator<Item = &EntityMapping> {
        self.entities.iter()
    }
}

/// Entity mappings plus the relations declared between them.
#[derive(Debug)]
pub struct Schema {
    registry: SchemaRegistry,
    relations: RelationGraph,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn relations(&self) -> &RelationGraph {
        &self.relations
    }

    pub fn resolve(&self, entity: &str) -> Result<&EntityMapping> {
        self.registry.resolve(entity)
    }
}

/// Startup-time builder for a [Schema]. Errors here are fatal.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    registry: SchemaRegistry,
    relations: RelationGraph,
}

impl SchemaBuilder {
    pub fn entity(mut self, mapping: EntityMapping) -> Result<Self> {
        self.registry.register(mapping)?;
        Ok(self)
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Result<Self> {
        self.relations.declare_relation(&self.registry, relation)?;
        Ok(self)
    }

    pub fn build(self) -> Arc<Schema> {
        tracing::info!(
            entities = self.registry.entities.len(),
            relations = self.relations.len(),
            "Schema built"
        );
        Arc::new(Schema {
            registry: self.registry,
            relations: self.relations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn category() -> EntityMapping {
        EntityMapping::builder("Category", "category")
            .generated_primary("id")
            .column("name", ColumnType::Text)
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_same_table_twice_fails() {
        let mut registry = SchemaRegistry::new();
        registry.register(category()).unwrap();

        let same_table = EntityMapping::builder("Other", "category")
            .generated_primary("id")
            .build()
            .unwrap();
        assert_matches!(
            registry.register(same_table),
            Err(OrmError::DuplicateEntity(t)) if t == "category"
        );
        assert_matches!(registry.register(category()), Err(OrmError::DuplicateEntity(_)));
    }

    #[test]
    fn test_resolve_unknown_entity() {
        let registry = SchemaRegistry::new();
        assert_matches!(registry.resolve("Nope"), Err(OrmError::UnknownEntity(n)) if n == "Nope");
    }

    #[test]
    fn test_mapping_requires_primary_key() {
        let result = EntityMapping::builder("NoPk", "no_pk")
            .column("name", ColumnType::Text)
            .build();
        assert_matches!(result, Err(OrmError::InvalidMapping { .. }));
    }

    #[test]
    fn test_hidden_primary_key_is_still_selected() {
        let mapping = EntityMapping::builder("Secret", "secret")
            .add(ColumnMapping::new("id", ColumnType::Integer).primary().hidden())
            .add(ColumnMapping::new("token", ColumnType::Text).hidden())
            .column("label", ColumnType::Text)
            .build()
            .unwrap();

        let selected: Vec<&str> = mapping.default_selection().map(|c| c.field.as_str()).collect();
        assert_eq!(selected, vec!["id", "label"]);
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            category().create_table_sql(),
            "CREATE TABLE IF NOT EXISTS \"category\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \"name\" TEXT NOT NULL\n)"
        );

        let composite = EntityMapping::builder("Fav", "favorite")
            .primary("userId", ColumnType::Integer)
            .primary("taskId", ColumnType::Integer)
            .build()
            .unwrap();
        assert!(
            composite
                .create_table_sql()
                .ends_with("PRIMARY KEY (\"userId\", \"taskId\")\n)")
        );
    }

    #[test]
    fn test_resolve_property_by_column_name() {
        let mapping = EntityMapping::builder("Post", "post")
            .generated_primary("id")
            .add(ColumnMapping::new("categoryId", ColumnType::Integer).named("category_id"))
            .build()
            .unwrap();
        assert_eq!(mapping.resolve_property("category_id").unwrap().field, "categoryId");
        assert_eq!(mapping.resolve_property("categoryId").unwrap().column, "category_id");
        assert!(mapping.resolve_property("missing").is_none());
    }
}
