//! Folds flat joined rows back into nested entities.
//!
//! Rows are grouped by the primary key of each selected alias, in the order
//! keys are first seen. A group whose key is entirely NULL is the empty side
//! of a LEFT JOIN and produces no entity.

use std::collections::HashMap;

use serde_json::{Map as JsonMap, Value as JsonValue};

use super::builder::MapInstruction;
use super::schema::{ColumnMapping, EntityMapping};
use crate::db::RawRow;
use crate::error::{OrmError, Result};

/// What the compiled SELECT list means, per alias.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryShape {
    pub root: String,
    pub aliases: HashMap<String, AliasProjection>,
    pub mappings: Vec<MapInstruction>,
    /// Every named output column, in select order
    pub outputs: Vec<String>,
}

impl QueryShape {
    pub fn add_output(&mut self, name: &str) -> Result<()> {
        if self.outputs.iter().any(|o| o == name) {
            return Err(OrmError::compile(format!(
                "output column \"{}\" is selected twice",
                name
            )));
        }
        self.outputs.push(name.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AliasProjection {
    pub entity: String,
    pub columns: Vec<ProjectedColumn>,
}

impl AliasProjection {
    pub fn new(mapping: &EntityMapping) -> Self {
        Self {
            entity: mapping.name.clone(),
            columns: Vec::new(),
        }
    }

    fn key_outputs(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.column.is_primary_key)
            .map(|c| c.output.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ProjectedColumn {
    pub output: String,
    pub column: ColumnMapping,
}

pub(crate) struct ResultMapper<'a> {
    shape: &'a QueryShape,
}

impl<'a> ResultMapper<'a> {
    pub fn new(shape: &'a QueryShape) -> Self {
        Self { shape }
    }

    pub fn map(&self, rows: &[RawRow]) -> Result<Vec<JsonMap<String, JsonValue>>> {
        if !self.shape.aliases.contains_key(&self.shape.root) {
            return Err(OrmError::mapping(format!(
                "root alias {} selects no entity columns; use get_raw_many for raw results",
                self.shape.root
            )));
        }
        let rows: Vec<&RawRow> = rows.iter().collect();
        self.hydrate(&self.shape.root, &rows)
    }

    fn hydrate(&self, alias: &str, rows: &[&RawRow]) -> Result<Vec<JsonMap<String, JsonValue>>> {
        let projection = self
            .shape
            .aliases
            .get(alias)
            .ok_or_else(|| OrmError::mapping(format!("alias {} has no projection", alias)))?;

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&RawRow>> = HashMap::new();

        for &row in rows {
            let Some(key) = group_key(projection, row)? else {
                continue;
            };
            match groups.get_mut(&key) {
                Some(group) => group.push(row),
                None => {
                    order.push(key.clone());
                    groups.insert(key, vec![row]);
                }
            }
        }

        let mut entities = Vec::with_capacity(order.len());
        for key in order {
            let group = groups.remove(&key).unwrap_or_default();
            let mut entity = decode_entity(projection, group[0])?;

            for instruction in self.shape.mappings.iter().filter(|m| m.parent == alias) {
                let children = self.hydrate(&instruction.child, &group)?;
                let value = if instruction.many {
                    JsonValue::Array(children.into_iter().map(JsonValue::Object).collect())
                } else {
                    children
                        .into_iter()
                        .next()
                        .map(JsonValue::Object)
                        .unwrap_or(JsonValue::Null)
                };
                entity.insert(instruction.property.clone(), value);
            }
            entities.push(entity);
        }
        Ok(entities)
    }
}

/// Identity of the alias's entity in `row`; `None` when every key is NULL.
fn group_key(projection: &AliasProjection, row: &RawRow) -> Result<Option<String>> {
    let mut parts = Vec::new();
    let mut all_null = true;
    for output in projection.key_outputs() {
        let value = row
            .get(output)
            .ok_or_else(|| OrmError::mapping(format!("result has no column {}", output)))?;
        all_null &= value.is_null();
        parts.push(value.key_fragment());
    }
    if parts.is_empty() {
        return Err(OrmError::mapping(format!(
            "{} is selected without its primary key",
            projection.entity
        )));
    }
    Ok((!all_null).then(|| parts.join("\u{1f}")))
}

fn decode_entity(projection: &AliasProjection, row: &RawRow) -> Result<JsonMap<String, JsonValue>> {
    let mut entity = JsonMap::new();
    for projected in &projection.columns {
        let value = row.get(&projected.output).ok_or_else(|| {
            OrmError::mapping(format!("result has no column {}", projected.output))
        })?;
        entity.insert(projected.column.field.clone(), projected.column.decode(value)?);
    }
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::orm::relations::RelationDescriptor;
    use crate::orm::schema::{ColumnType, Schema};
    use crate::orm::value::SqlValue;
    use crate::orm::QueryBuilder;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .entity(
                EntityMapping::builder("Category", "category")
                    .generated_primary("id")
                    .column("name", ColumnType::Text)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .entity(
                EntityMapping::builder("Post", "post")
                    .generated_primary("id")
                    .column("title", ColumnType::Text)
                    .column("published", ColumnType::Boolean)
                    .column("categoryId", ColumnType::Integer)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .relation(
                RelationDescriptor::one_to_many("Category", "posts", "Post")
                    .join_column("categoryId", "id"),
            )
            .unwrap()
            .build()
    }

    fn row(values: &[(&str, SqlValue)]) -> RawRow {
        RawRow::new(values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn category_post(cid: i64, cname: &str, post: Option<(i64, &str)>) -> RawRow {
        let (pid, title, cat) = match post {
            Some((id, title)) => (SqlValue::Int(id), SqlValue::from(title), SqlValue::Int(cid)),
            None => (SqlValue::Null, SqlValue::Null, SqlValue::Null),
        };
        row(&[
            ("category_id", SqlValue::Int(cid)),
            ("category_name", SqlValue::from(cname)),
            ("post_id", pid),
            ("post_title", title),
            ("post_published", SqlValue::Int(1)),
            ("post_categoryId", cat),
        ])
    }

    fn shape(many: bool) -> QueryShape {
        let qb = QueryBuilder::new(schema()).from("Category", "category").unwrap();
        let qb = if many {
            qb.left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")
        } else {
            qb.left_join_and_map_one("category.latest", "Post", "post", "post.categoryId = category.id")
        };
        qb.unwrap().compile().unwrap().shape
    }

    #[test]
    fn test_map_many_groups_and_dedups() {
        let rows = vec![
            category_post(1, "cat1", Some((10, "p1"))),
            category_post(1, "cat1", Some((10, "p1"))),
            category_post(1, "cat1", Some((11, "p2"))),
            category_post(2, "cat2", None),
        ];
        let shape = shape(true);
        let mapped = ResultMapper::new(&shape).map(&rows).unwrap();

        assert_eq!(
            JsonValue::Array(mapped.into_iter().map(JsonValue::Object).collect()),
            json!([
                {
                    "id": 1,
                    "name": "cat1",
                    "posts": [
                        {"id": 10, "title": "p1", "published": true, "categoryId": 1},
                        {"id": 11, "title": "p2", "published": true, "categoryId": 1}
                    ]
                },
                {"id": 2, "name": "cat2", "posts": []}
            ])
        );
    }

    #[test]
    fn test_map_one_takes_first_row() {
        let rows = vec![
            category_post(1, "cat1", Some((11, "p2"))),
            category_post(1, "cat1", Some((10, "p1"))),
            category_post(2, "cat2", None),
        ];
        let shape = shape(false);
        let mapped = ResultMapper::new(&shape).map(&rows).unwrap();
        assert_eq!(mapped[0]["latest"]["id"], json!(11));
        assert_eq!(mapped[1]["latest"], JsonValue::Null);
    }

    #[test]
    fn test_missing_key_column() {
        let shape = shape(true);
        let rows = vec![row(&[("category_name", SqlValue::from("x"))])];
        assert_matches!(
            ResultMapper::new(&shape).map(&rows),
            Err(OrmError::MappingError(_))
        );
    }

    #[test]
    fn test_raw_projection_cannot_be_mapped() {
        let shape = QueryBuilder::new(schema())
            .select_raw("count(1)", "count")
            .from("Category", "category")
            .unwrap()
            .compile()
            .unwrap()
            .shape;
        assert_matches!(
            ResultMapper::new(&shape).map(&[]),
            Err(OrmError::MappingError(_))
        );
    }
}
