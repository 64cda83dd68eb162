//! SQL compiler for [QueryBuilder] plans
//!
//! Compilation is a pure function of the plan: it reads the builder, never
//! mutates it, and produces the SQL text, the positional parameter list and
//! the shape the result mapper needs to rebuild entities.
//!
//! Rendering happens in two passes. [Compiler::render] produces SQL that
//! still carries `:name` placeholders (this is what subqueries inline), then
//! [Compiler::compile] rewrites them to `?N` in order of first occurrence.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use super::builder::{Join, JoinKind, MapInstruction, Predicate, QueryBuilder, Selection, Source};
use super::expr;
use super::mapper::{AliasProjection, ProjectedColumn, QueryShape};
use super::schema::{EntityMapping, Schema};
use super::value::SqlValue;
use crate::error::{OrmError, Result};

/// A compiled statement ready for the driver.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub(crate) shape: QueryShape,
}

/// SQL with named placeholders plus every parameter it may reference.
pub(crate) struct RenderedQuery {
    pub sql: String,
    pub params: HashMap<String, SqlValue>,
    pub shape: QueryShape,
}

/// Joins, aliases and projection resolved once per compilation.
struct Plan<'s> {
    aliases: Vec<AliasInfo<'s>>,
    joins: Cow<'s, [Join]>,
    select_list: String,
    shape: QueryShape,
    params: HashMap<String, SqlValue>,
}

/// An alias visible to expressions, in declaration order.
struct AliasInfo<'s> {
    name: String,
    mapping: Option<&'s EntityMapping>,
}

pub(crate) struct Compiler<'a> {
    qb: &'a QueryBuilder,
    schema: &'a Schema,
}

impl<'a> Compiler<'a> {
    pub fn new(qb: &'a QueryBuilder) -> Self {
        Self {
            qb,
            schema: qb.schema.as_ref(),
        }
    }

    pub fn compile(&self) -> Result<CompiledQuery> {
        let rendered = self.render()?;
        let (sql, params) = expr::bind_placeholders(&rendered.sql, &rendered.params)?;
        tracing::debug!(sql = %sql, params = params.len(), "Compiled query");
        Ok(CompiledQuery {
            sql,
            params,
            shape: rendered.shape,
        })
    }

    /// Count of the rows `get_many` pages over: distinct root entities, or
    /// the groups of a grouped plan. Projection, ordering and pagination are
    /// dropped.
    pub fn compile_count(&self) -> Result<CompiledQuery> {
        let plan = self.prepare()?;
        let mut params = plan.params;
        let body = self.render_body(&plan.aliases, &plan.joins, &mut params, None)?;

        let sql = if self.is_grouped() {
            format!(
                "SELECT COUNT(*) AS \"cnt\" FROM (SELECT {} {}{}) \"grouped\"",
                plan.select_list,
                body,
                self.render_grouping(&plan.aliases)?
            )
        } else {
            let counted = match plan.aliases[0].mapping {
                Some(mapping) => format!(
                    "COUNT(DISTINCT {})",
                    root_keys(&plan.aliases[0].name, mapping).join(" || '|' || ")
                ),
                None => "COUNT(*)".to_string(),
            };
            format!("SELECT {} AS \"cnt\" {}", counted, body)
        };

        let (sql, params) = expr::bind_placeholders(&sql, &params)?;
        tracing::debug!(sql = %sql, "Compiled count query");
        Ok(CompiledQuery {
            sql,
            params,
            shape: QueryShape::default(),
        })
    }

    pub fn render(&self) -> Result<RenderedQuery> {
        let plan = self.prepare()?;
        let mut params = plan.params;

        let pages_roots = self.pages_roots(&plan.aliases, &plan.joins);
        let root_page = if pages_roots {
            Some(self.render_root_page(&plan.aliases, &plan.joins, &plan.shape.outputs, &mut params)?)
        } else {
            None
        };

        let mut sql = format!(
            "SELECT {} {}",
            plan.select_list,
            self.render_body(&plan.aliases, &plan.joins, &mut params, root_page.as_deref())?
        );
        sql.push_str(&self.render_grouping(&plan.aliases)?);
        sql.push_str(&self.render_order(&plan.aliases, &plan.shape.outputs, false)?);
        if !pages_roots {
            sql.push_str(&self.render_paging());
        }

        Ok(RenderedQuery {
            sql,
            params,
            shape: plan.shape,
        })
    }

    /// Resolve joins, aliases and the projection shared by the row and
    /// count queries.
    fn prepare(&self) -> Result<Plan<'a>> {
        if let Some(name) = self.qb.param_conflicts.first() {
            return Err(OrmError::compile(format!(
                "parameter :{} is bound to different values",
                name
            )));
        }

        let (root_source, root_alias) = self.root()?;
        let (joins, mut mappings, eager_aliases) = self.effective_joins(root_source, root_alias)?;
        let aliases = self.aliases(root_alias, &joins)?;

        let mut selections: Vec<Selection> = if self.qb.selects.is_empty() {
            vec![Selection::Expr(root_alias.clone())]
        } else {
            self.qb.selects.clone()
        };
        selections.extend(eager_aliases.into_iter().map(Selection::Expr));

        let mut shape = QueryShape {
            root: root_alias.clone(),
            ..Default::default()
        };
        let select_list = self.render_selects(&aliases, &selections, &mut shape)?;

        mappings.extend(self.qb.mappings.iter().cloned());
        self.check_mappings(&mappings, &shape)?;
        shape.mappings = mappings;

        Ok(Plan {
            aliases,
            joins,
            select_list,
            shape,
            params: self.qb.params.clone(),
        })
    }

    fn is_grouped(&self) -> bool {
        !self.qb.group_by.is_empty() || self.qb.having.is_some()
    }

    /// Joined entity plans page over root entities, not joined rows.
    fn pages_roots(&self, aliases: &[AliasInfo<'a>], joins: &[Join]) -> bool {
        (self.qb.limit.is_some() || self.qb.offset.is_some())
            && !joins.is_empty()
            && !self.is_grouped()
            && aliases[0].mapping.is_some()
    }

    /// `<root key> IN (SELECT DISTINCT <root key> ... LIMIT n)`, rendered
    /// over the same joins and filter as the outer query.
    fn render_root_page(
        &self,
        aliases: &[AliasInfo<'a>],
        joins: &[Join],
        outputs: &[String],
        params: &mut HashMap<String, SqlValue>,
    ) -> Result<String> {
        let root = &aliases[0];
        let mapping = root
            .mapping
            .ok_or_else(|| OrmError::compile(format!("alias {} has no entity", root.name)))?;
        let keys = root_keys(&root.name, mapping).join(", ");
        let target = if mapping.primary_columns().count() > 1 {
            format!("({})", keys)
        } else {
            keys.clone()
        };

        Ok(format!(
            "{} IN (SELECT DISTINCT {} {}{}{})",
            target,
            keys,
            self.render_body(aliases, joins, params, None)?,
            self.render_order(aliases, outputs, true)?,
            self.render_paging()
        ))
    }

    fn render_grouping(&self, aliases: &[AliasInfo<'a>]) -> Result<String> {
        let mut sql = String::new();
        if !self.qb.group_by.is_empty() {
            let groups = self
                .qb
                .group_by
                .iter()
                .map(|g| self.resolve_expr(aliases, aliases.len(), g))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
        if let Some(having) = &self.qb.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.render_predicate(aliases, having, false)?);
        }
        Ok(sql)
    }

    /// ORDER BY with output names quoted. The root page has no outputs to
    /// refer to, so it orders by the remaining paths only.
    fn render_order(&self, aliases: &[AliasInfo<'a>], outputs: &[String], root_page: bool) -> Result<String> {
        let mut parts = Vec::with_capacity(self.qb.order_by.len());
        for (sort, order) in &self.qb.order_by {
            let rendered = if outputs.iter().any(|o| o == sort) {
                if root_page {
                    continue;
                }
                format!("\"{}\"", sort)
            } else {
                self.resolve_expr(aliases, aliases.len(), sort)?
            };
            parts.push(format!("{} {}", rendered, order.to_sql()));
        }
        if parts.is_empty() {
            return Ok(String::new());
        }
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    fn render_paging(&self) -> String {
        match (self.qb.limit, self.qb.offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            // SQLite only accepts OFFSET after a LIMIT
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }

    fn root(&self) -> Result<(&'a Source, &'a String)> {
        self.qb
            .from
            .as_ref()
            .map(|(s, a)| (s, a))
            .ok_or_else(|| OrmError::compile("query has no FROM source"))
    }

    /// Explicit joins, or the eager relation joins when there are none.
    fn effective_joins(
        &self,
        root_source: &Source,
        root_alias: &str,
    ) -> Result<(Cow<'a, [Join]>, Vec<MapInstruction>, Vec<String>)> {
        let root_selected = self.qb.selects.is_empty()
            || self
                .qb
                .selects
                .iter()
                .any(|s| matches!(s, Selection::Expr(e) if e == root_alias));

        let root_entity = match root_source {
            Source::Entity(e) => e,
            Source::SubQuery(_) => return Ok((Cow::Borrowed(self.qb.joins.as_slice()), Vec::new(), Vec::new())),
        };

        if !self.qb.joins.is_empty()
            || !self.qb.eager_relations
            || self.qb.is_subquery
            || !root_selected
        {
            return Ok((Cow::Borrowed(self.qb.joins.as_slice()), Vec::new(), Vec::new()));
        }

        let tree = self
            .schema
            .relations()
            .resolve_eager_tree(root_entity, self.qb.eager_depth);
        let mut joins: Vec<Join> = Vec::with_capacity(tree.len());
        let mut mappings = Vec::with_capacity(tree.len());
        let mut selected = Vec::with_capacity(tree.len());

        for step in &tree {
            let parent = match step.parent {
                Some(i) => joins[i].alias.clone(),
                None => root_alias.to_string(),
            };
            let alias = format!("{}__{}", parent, step.relation.name);
            mappings.push(MapInstruction {
                parent: parent.clone(),
                property: step.relation.name.clone(),
                child: alias.clone(),
                many: step.relation.is_many(),
            });
            selected.push(alias.clone());
            joins.push(Join {
                kind: JoinKind::Left,
                alias,
                source: Source::Entity(step.relation.target.clone()),
                on: None,
                relation: Some((parent, step.relation.name.clone())),
            });
        }

        if !tree.is_empty() {
            tracing::debug!(entity = %root_entity, joins = tree.len(), "Added eager relation joins");
        }
        Ok((Cow::Owned(joins), mappings, selected))
    }

    fn aliases(&self, root_alias: &str, joins: &[Join]) -> Result<Vec<AliasInfo<'a>>> {
        let (root_source, _) = self.root()?;
        let mut aliases = vec![AliasInfo {
            name: root_alias.to_string(),
            mapping: self.source_mapping(root_source)?,
        }];
        for join in joins {
            if aliases.iter().any(|a| a.name == join.alias) {
                return Err(OrmError::DuplicateAlias(join.alias.clone()));
            }
            aliases.push(AliasInfo {
                name: join.alias.clone(),
                mapping: self.source_mapping(&join.source)?,
            });
        }
        Ok(aliases)
    }

    fn source_mapping(&self, source: &Source) -> Result<Option<&'a EntityMapping>> {
        let entity = match source {
            Source::Entity(e) => Some(e.clone()),
            Source::SubQuery(sub) => sub.exposed_entity(),
        };
        entity.map(|e| self.schema.resolve(&e)).transpose()
    }

    /// FROM, JOIN and WHERE clauses. `restriction` is ANDed onto the filter.
    fn render_body(
        &self,
        aliases: &[AliasInfo<'a>],
        joins: &[Join],
        params: &mut HashMap<String, SqlValue>,
        restriction: Option<&str>,
    ) -> Result<String> {
        let (root_source, root_alias) = self.root()?;
        let mut sql = format!("FROM {}", self.render_source(root_source, root_alias, params)?);

        for (i, join) in joins.iter().enumerate() {
            // The root, every earlier join, and this one
            let visible = i + 2;
            let mut conditions = Vec::new();

            if let Some((parent, property)) = &join.relation {
                let parent_mapping = aliases
                    .iter()
                    .find(|a| &a.name == parent)
                    .and_then(|a| a.mapping)
                    .ok_or_else(|| OrmError::compile(format!("alias {} has no entity", parent)))?;
                let relation = self.schema.relations().resolve(&parent_mapping.name, property)?;
                conditions.push(relation.on_condition(self.schema.registry(), parent, &join.alias)?);
            }
            if let Some(on) = &join.on {
                conditions.push(self.resolve_expr(aliases, visible, on)?);
            }

            let on_sql = match conditions.len() {
                1 => conditions.remove(0),
                _ => conditions
                    .iter()
                    .map(|c| format!("({})", c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            };
            sql.push_str(&format!(
                " {} {} ON {}",
                join.kind.to_sql(),
                self.render_source(&join.source, &join.alias, params)?,
                on_sql
            ));
        }

        match (&self.qb.where_clause, restriction) {
            (Some(predicate), Some(restriction)) => {
                let filter = self.render_predicate(aliases, predicate, true)?;
                sql.push_str(&format!(" WHERE {} AND {}", filter, restriction));
            }
            (Some(predicate), None) => {
                sql.push_str(" WHERE ");
                sql.push_str(&self.render_predicate(aliases, predicate, false)?);
            }
            (None, Some(restriction)) => {
                sql.push_str(" WHERE ");
                sql.push_str(restriction);
            }
            (None, None) => {}
        }

        Ok(sql)
    }

    fn render_source(
        &self,
        source: &Source,
        alias: &str,
        params: &mut HashMap<String, SqlValue>,
    ) -> Result<String> {
        match source {
            Source::Entity(entity) => {
                let mapping = self.schema.resolve(entity)?;
                Ok(format!("\"{}\" \"{}\"", mapping.table, alias))
            }
            Source::SubQuery(sub) => {
                let rendered = Compiler::new(sub).render()?;
                for (name, value) in rendered.params {
                    match params.get(&name) {
                        Some(existing) if existing != &value => {
                            return Err(OrmError::compile(format!(
                                "parameter :{} is bound to different values in a subquery",
                                name
                            )));
                        }
                        Some(_) => {}
                        None => {
                            params.insert(name, value);
                        }
                    }
                }
                Ok(format!("({}) \"{}\"", rendered.sql, alias))
            }
        }
    }

    fn render_selects(
        &self,
        aliases: &[AliasInfo<'a>],
        selections: &[Selection],
        shape: &mut QueryShape,
    ) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        let mut emitted: HashSet<(String, String)> = HashSet::new();

        for selection in selections {
            match selection {
                Selection::Raw { expr, alias } => {
                    let rendered = self.resolve_expr(aliases, aliases.len(), expr)?;
                    shape.add_output(alias)?;
                    parts.push(format!("{} AS \"{}\"", rendered, alias));
                }
                Selection::Expr(text) => {
                    let text = text.trim();
                    if let Some(info) = aliases.iter().find(|a| a.name == text) {
                        match info.mapping {
                            Some(mapping) => {
                                for column in mapping.default_selection() {
                                    self.emit_column(info, mapping, &column.field, &mut emitted, &mut parts, shape)?;
                                }
                            }
                            None => parts.push(format!("\"{}\".*", info.name)),
                        }
                        continue;
                    }

                    let property = expr::split_path(text).and_then(|(alias, prop)| {
                        aliases
                            .iter()
                            .find(|a| a.name == alias)
                            .and_then(|info| info.mapping.map(|m| (info, m, prop)))
                    });
                    match property {
                        Some((info, mapping, prop)) => {
                            let column = mapping.resolve_property(prop).ok_or_else(|| {
                                OrmError::compile(format!("{} has no property {}", mapping.name, prop))
                            })?;
                            for key in mapping.primary_columns() {
                                self.emit_column(info, mapping, &key.field, &mut emitted, &mut parts, shape)?;
                            }
                            self.emit_column(info, mapping, &column.field, &mut emitted, &mut parts, shape)?;
                        }
                        None => parts.push(self.resolve_expr(aliases, aliases.len(), text)?),
                    }
                }
            }
        }

        if parts.is_empty() {
            return Err(OrmError::compile("empty select list"));
        }
        Ok(parts.join(", "))
    }

    fn emit_column(
        &self,
        info: &AliasInfo<'a>,
        mapping: &EntityMapping,
        field: &str,
        emitted: &mut HashSet<(String, String)>,
        parts: &mut Vec<String>,
        shape: &mut QueryShape,
    ) -> Result<()> {
        if !emitted.insert((info.name.clone(), field.to_string())) {
            return Ok(());
        }
        let column = mapping
            .column(field)
            .ok_or_else(|| OrmError::compile(format!("{} has no field {}", mapping.name, field)))?;

        // Subqueries expose their root entity's columns under their own names
        let root_of_subquery = self.qb.is_subquery && info.name == shape.root;
        let output = if root_of_subquery {
            column.column.clone()
        } else {
            format!("{}_{}", info.name, column.column)
        };

        shape.add_output(&output)?;
        parts.push(format!("\"{}\".\"{}\" AS \"{}\"", info.name, column.column, output));

        let projection = shape
            .aliases
            .entry(info.name.clone())
            .or_insert_with(|| AliasProjection::new(mapping));
        projection.columns.push(ProjectedColumn {
            output,
            column: column.clone(),
        });
        Ok(())
    }

    /// Every mapped property must hang off a selected alias and not shadow
    /// one of its columns.
    fn check_mappings(&self, mappings: &[MapInstruction], shape: &QueryShape) -> Result<()> {
        for m in mappings {
            let parent = shape.aliases.get(&m.parent).ok_or_else(|| {
                OrmError::compile(format!(
                    "cannot map {}.{}: alias {} is not selected as an entity",
                    m.parent, m.property, m.parent
                ))
            })?;
            if parent.columns.iter().any(|c| c.column.field == m.property) {
                return Err(OrmError::compile(format!(
                    "mapped property {}.{} shadows a column",
                    m.parent, m.property
                )));
            }
            if !shape.aliases.contains_key(&m.child) {
                return Err(OrmError::compile(format!(
                    "cannot map {} into {}.{}: it has no entity columns",
                    m.child, m.parent, m.property
                )));
            }
        }
        Ok(())
    }

    fn render_predicate(
        &self,
        aliases: &[AliasInfo<'a>],
        predicate: &Predicate,
        nested: bool,
    ) -> Result<String> {
        let (parts, joiner) = match predicate {
            Predicate::Raw(text) => {
                let rendered = self.resolve_expr(aliases, aliases.len(), text)?;
                return Ok(if nested {
                    format!("({})", rendered)
                } else {
                    rendered
                });
            }
            Predicate::And(parts) => (parts, " AND "),
            Predicate::Or(parts) => (parts, " OR "),
        };

        let rendered = parts
            .iter()
            .map(|p| self.render_predicate(aliases, p, true))
            .collect::<Result<Vec<_>>>()?
            .join(joiner);
        Ok(if nested {
            format!("({})", rendered)
        } else {
            rendered
        })
    }

    /// Resolve property paths in a fragment against the first `visible` aliases.
    fn resolve_expr(&self, aliases: &[AliasInfo<'a>], visible: usize, text: &str) -> Result<String> {
        expr::resolve_paths(text, |alias, prop| {
            let position = aliases.iter().position(|a| a.name == alias).ok_or_else(|| {
                OrmError::compile(format!("unknown alias \"{}\" in `{}`", alias, text))
            })?;
            if position >= visible {
                return Err(OrmError::compile(format!(
                    "alias \"{}\" is referenced before it is joined in `{}`",
                    alias, text
                )));
            }
            match aliases[position].mapping {
                Some(mapping) => {
                    let column = mapping.resolve_property(prop).ok_or_else(|| {
                        OrmError::compile(format!("{} has no property {}", mapping.name, prop))
                    })?;
                    Ok(format!("\"{}\".\"{}\"", alias, column.column))
                }
                None => Ok(format!("\"{}\".\"{}\"", alias, prop)),
            }
        })
    }
}

fn root_keys(alias: &str, mapping: &EntityMapping) -> Vec<String> {
    mapping
        .primary_columns()
        .map(|c| format!("\"{}\".\"{}\"", alias, c.column))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::orm::builder::Order;
    use crate::orm::relations::RelationDescriptor;
    use crate::orm::schema::{ColumnType, EntityMapping};
    use crate::params;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

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

    fn qb() -> QueryBuilder {
        QueryBuilder::new(schema())
    }

    #[test]
    fn test_mapped_join_sql() {
        let sql = qb()
            .select(["category"])
            .from("Category", "category")
            .unwrap()
            .left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")
            .unwrap()
            .get_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"category\".\"id\" AS \"category_id\", \"category\".\"name\" AS \"category_name\", \
             \"post\".\"id\" AS \"post_id\", \"post\".\"title\" AS \"post_title\", \"post\".\"categoryId\" AS \"post_categoryId\" \
             FROM \"category\" \"category\" LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\""
        );
    }

    #[test]
    fn test_subquery_join_is_parenthesized() {
        let base = qb();
        let sub = base.sub_query().select(Vec::<String>::new()).from("Post", "post").unwrap();
        let sql = base
            .select(["category"])
            .from("Category", "category")
            .unwrap()
            .left_join_and_map_many("category.posts", sub, "post", "post.\"categoryId\" = category.id")
            .unwrap()
            .get_sql()
            .unwrap();
        assert!(sql.contains(
            "LEFT JOIN (SELECT \"post\".\"id\" AS \"id\", \"post\".\"title\" AS \"title\", \
             \"post\".\"categoryId\" AS \"categoryId\" FROM \"post\" \"post\") \"post\" \
             ON \"post\".\"categoryId\" = \"category\".\"id\""
        ), "{}", sql);
    }

    #[test]
    fn test_relation_path_join_derives_on_condition() {
        let sql = qb()
            .from("Category", "c")
            .unwrap()
            .left_join_and_select("c.posts", "p", Some("p.title <> :skip"))
            .unwrap()
            .set_parameter("skip", "draft")
            .get_sql()
            .unwrap();
        assert!(sql.ends_with(
            "LEFT JOIN \"post\" \"p\" ON (\"p\".\"categoryId\" = \"c\".\"id\") AND (\"p\".\"title\" <> ?1)"
        ), "{}", sql);
    }

    #[test]
    fn test_where_group_order_and_pagination() {
        let compiled = qb()
            .select(["category.id", "category.name"])
            .add_select_raw("count(1)", "count")
            .from("Category", "category")
            .unwrap()
            .left_join("Post", "post", "post.categoryId = category.id")
            .unwrap()
            .where_clause("category.name LIKE :name", params! { "name" => "cat%" })
            .or_where("category.id = :id", params! { "id" => 7 })
            .and_where("category.id <> :id", params![])
            .group_by("category.id")
            .add_group_by("category.name")
            .order_by("count", Order::Desc)
            .add_order_by("category.name", Order::Asc)
            .skip(5)
            .compile()
            .unwrap();

        assert_eq!(
            compiled.sql,
            "SELECT \"category\".\"id\" AS \"category_id\", \"category\".\"name\" AS \"category_name\", count(1) AS \"count\" \
             FROM \"category\" \"category\" LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\" \
             WHERE ((\"category\".\"name\" LIKE ?1) OR (\"category\".\"id\" = ?2)) AND (\"category\".\"id\" <> ?2) \
             GROUP BY \"category\".\"id\", \"category\".\"name\" ORDER BY \"count\" DESC, \"category\".\"name\" ASC \
             LIMIT -1 OFFSET 5"
        );
        assert_eq!(
            compiled.params,
            vec![SqlValue::String("cat%".into()), SqlValue::Int(7)]
        );
    }

    #[test]
    fn test_get_sql_is_pure() {
        let builder = qb()
            .from("Category", "category")
            .unwrap()
            .and_where("category.id IN (:...ids) AND category.name = :n", params! { "ids" => vec![1, 2], "n" => "x" });
        let first = builder.compile().unwrap();
        let second = builder.compile().unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(first.params, second.params);
    }

    #[test]
    fn test_unbound_parameter() {
        let result = qb()
            .from("Category", "category")
            .unwrap()
            .and_where("category.id = :id", params![])
            .get_sql();
        assert_matches!(result, Err(OrmError::UnboundParameter(n)) if n == "id");
    }

    #[test]
    fn test_duplicate_alias() {
        let result = qb()
            .from("Category", "category")
            .unwrap()
            .left_join("Post", "category", "category.id = 1");
        assert_matches!(result, Err(OrmError::DuplicateAlias(a)) if a == "category");
    }

    #[test]
    fn test_unresolvable_alias_and_property() {
        let unknown_alias = qb()
            .from("Category", "category")
            .unwrap()
            .and_where("cat.id = 1", params![])
            .get_sql();
        assert_matches!(unknown_alias, Err(OrmError::CompileError(_)));

        let unknown_property = qb()
            .from("Category", "category")
            .unwrap()
            .and_where("category.title = 1", params![])
            .get_sql();
        assert_matches!(unknown_property, Err(OrmError::CompileError(_)));
    }

    #[test]
    fn test_on_condition_cannot_reference_later_join() {
        let result = qb()
            .from("Category", "category")
            .unwrap()
            .left_join("Post", "p1", "p1.categoryId = p2.categoryId")
            .unwrap()
            .left_join("Post", "p2", "p2.categoryId = category.id")
            .unwrap()
            .get_sql();
        assert_matches!(result, Err(OrmError::CompileError(m)) if m.contains("before it is joined"));
    }

    #[test]
    fn test_duplicate_output_name() {
        let result = qb()
            .select(["category"])
            .add_select_raw("1", "category_id")
            .from("Category", "category")
            .unwrap()
            .get_sql();
        assert_matches!(result, Err(OrmError::CompileError(_)));
    }

    #[test]
    fn test_subquery_parameters_merge() {
        let base = qb();
        let sub = base
            .sub_query()
            .from("Post", "post")
            .unwrap()
            .and_where("post.title = :title", params! { "title" => "p1" });
        let sql = base
            .clone()
            .from("Category", "category")
            .unwrap()
            .left_join(sub.clone(), "p", "p.categoryId = category.id")
            .unwrap()
            .compile()
            .unwrap();
        assert_eq!(sql.params, vec![SqlValue::String("p1".into())]);

        let conflicting = base
            .from("Category", "category")
            .unwrap()
            .set_parameter("title", "other")
            .left_join(sub, "p", "p.categoryId = category.id")
            .unwrap()
            .get_sql();
        assert_matches!(conflicting, Err(OrmError::CompileError(_)));
    }

    #[test]
    fn test_get_query_keeps_named_placeholders() {
        let base = qb();
        let sub = base
            .sub_query()
            .select(["post.categoryId"])
            .from("Post", "post")
            .unwrap()
            .and_where("post.title = :title", params! { "title" => "p1" });
        let inner = sub.get_query().unwrap();
        assert_eq!(
            inner,
            "(SELECT \"post\".\"id\" AS \"id\", \"post\".\"categoryId\" AS \"categoryId\" FROM \"post\" \"post\" WHERE \"post\".\"title\" = :title)"
        );

        let compiled = base
            .from("Category", "category")
            .unwrap()
            .and_where(&format!("category.id IN (SELECT \"categoryId\" FROM {} \"s\")", inner), sub.parameters())
            .compile()
            .unwrap();
        assert!(compiled.sql.contains("WHERE \"category\".\"id\" IN (SELECT \"categoryId\" FROM (SELECT"));
        assert_eq!(compiled.params, vec![SqlValue::String("p1".into())]);
    }

    #[test]
    fn test_count_query_strips_projection_and_paging() {
        let builder = qb()
            .select(["category"])
            .from("Category", "category")
            .unwrap()
            .left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")
            .unwrap()
            .and_where("post.title = :t", params! { "t" => "p1" })
            .order_by("category.name", Order::Asc)
            .take(10)
            .skip(20);
        let count = builder.compile_count().unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(DISTINCT \"category\".\"id\") AS \"cnt\" FROM \"category\" \"category\" \
             LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\" WHERE \"post\".\"title\" = ?1"
        );
    }

    #[test]
    fn test_rebinding_a_parameter_to_another_value_fails() {
        let result = qb()
            .from("Category", "category")
            .unwrap()
            .and_where("category.id = :v", params! { "v" => 1 })
            .and_where("category.name = :v", params! { "v" => "cat1" })
            .compile();
        assert_matches!(result, Err(OrmError::CompileError(m)) if m.contains(":v"));

        let same_value = qb()
            .from("Category", "category")
            .unwrap()
            .and_where("category.id = :v", params! { "v" => 1 })
            .or_where("category.id > :v", params! { "v" => 1 })
            .compile()
            .unwrap();
        assert_eq!(same_value.params, vec![SqlValue::Int(1)]);
    }

    #[test]
    fn test_joined_pagination_pages_over_root_keys() {
        let compiled = qb()
            .select(["category"])
            .from("Category", "category")
            .unwrap()
            .left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")
            .unwrap()
            .and_where("post.title <> :t", params! { "t" => "x" })
            .order_by("category.id", Order::Asc)
            .take(1)
            .skip(2)
            .compile()
            .unwrap();
        assert!(compiled.sql.ends_with(
            "FROM \"category\" \"category\" LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\" \
             WHERE (\"post\".\"title\" <> ?1) AND \"category\".\"id\" IN (SELECT DISTINCT \"category\".\"id\" \
             FROM \"category\" \"category\" LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\" \
             WHERE \"post\".\"title\" <> ?1 ORDER BY \"category\".\"id\" ASC LIMIT 1 OFFSET 2) \
             ORDER BY \"category\".\"id\" ASC"
        ), "{}", compiled.sql);
        assert_eq!(compiled.params, vec![SqlValue::String("x".into())]);
    }

    #[test]
    fn test_root_page_skips_output_name_ordering() {
        let sql = qb()
            .select(["category"])
            .from("Category", "category")
            .unwrap()
            .left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")
            .unwrap()
            .order_by("category_name", Order::Desc)
            .take(3)
            .get_sql()
            .unwrap();
        assert!(sql.ends_with(
            "WHERE \"category\".\"id\" IN (SELECT DISTINCT \"category\".\"id\" FROM \"category\" \"category\" \
             LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\" LIMIT 3) \
             ORDER BY \"category_name\" DESC"
        ), "{}", sql);
    }

    #[test]
    fn test_count_query_keeps_grouping() {
        let count = qb()
            .select(["category.id"])
            .from("Category", "category")
            .unwrap()
            .left_join("Post", "post", "post.categoryId = category.id")
            .unwrap()
            .group_by("category.id")
            .having("COUNT(post.id) > :n", params! { "n" => 1 })
            .take(5)
            .compile_count()
            .unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) AS \"cnt\" FROM (SELECT \"category\".\"id\" AS \"category_id\" \
             FROM \"category\" \"category\" LEFT JOIN \"post\" \"post\" ON \"post\".\"categoryId\" = \"category\".\"id\" \
             GROUP BY \"category\".\"id\" HAVING COUNT(\"post\".\"id\") > ?1) \"grouped\""
        );
        assert_eq!(count.params, vec![SqlValue::Int(1)]);
    }

    fn eager_schema() -> Arc<Schema> {
        Schema::builder()
            .entity(
                EntityMapping::builder("Category", "category")
                    .generated_primary("id")
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .entity(
                EntityMapping::builder("Post", "post")
                    .generated_primary("id")
                    .column("categoryId", ColumnType::Integer)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .relation(
                RelationDescriptor::many_to_one("Post", "category", "Category")
                    .join_column("categoryId", "id")
                    .eager(),
            )
            .unwrap()
            .build()
    }

    #[test]
    fn test_eager_relations_are_joined_without_explicit_joins() {
        let schema = eager_schema();

        let compiled = QueryBuilder::new(schema.clone())
            .from("Post", "post")
            .unwrap()
            .compile()
            .unwrap();
        assert!(compiled.sql.contains(
            "LEFT JOIN \"category\" \"post__category\" ON \"post\".\"categoryId\" = \"post__category\".\"id\""
        ), "{}", compiled.sql);
        assert_eq!(compiled.shape.mappings.len(), 1);

        let without = QueryBuilder::new(schema)
            .from("Post", "post")
            .unwrap()
            .eager_relations(false)
            .get_sql()
            .unwrap();
        assert!(!without.contains("JOIN"));
    }

    #[test]
    fn test_count_query_sees_eager_aliases() {
        let count = QueryBuilder::new(eager_schema())
            .from("Post", "post")
            .unwrap()
            .and_where("post__category.id = :c", params! { "c" => 1 })
            .compile_count()
            .unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(DISTINCT \"post\".\"id\") AS \"cnt\" FROM \"post\" \"post\" \
             LEFT JOIN \"category\" \"post__category\" ON \"post\".\"categoryId\" = \"post__category\".\"id\" \
             WHERE \"post__category\".\"id\" = ?1"
        );
    }
}
