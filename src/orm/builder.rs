//! SQL Query Builder
//!
//! Builds SELECT statements against registered entities. Every builder
//! method consumes the builder and returns it, so a plan is assembled by
//! chaining. Methods that resolve metadata (`from`, joins) return
//! `Result<Self>` and fail fast on unknown entities or reused aliases.
//!
//! ```rust,ignore
//! let categories = QueryBuilder::new(schema.clone())
//!     .select(["category"])
//!     .from("Category", "category")?
//!     .left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")?
//!     .get_many(&db)
//!     .await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::compiler::{CompiledQuery, Compiler};
use super::expr;
use super::mapper::ResultMapper;
use super::relations::DEFAULT_EAGER_DEPTH;
use super::schema::Schema;
use super::value::SqlValue;
use crate::db::RowSource;
use crate::error::{OrmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub(crate) fn to_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

/// Sort direction for ORDER BY clauses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn to_sql(&self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// What a join reads from.
#[derive(Debug, Clone)]
pub enum JoinTarget {
    /// A registered entity, by name
    Entity(String),
    /// A relation path such as `category.posts`; the ON condition comes from
    /// the relation graph
    Relation(String),
    /// A nested builder rendered inline as `(<sql>) "alias"`
    SubQuery(Box<QueryBuilder>),
}

impl From<&str> for JoinTarget {
    fn from(value: &str) -> Self {
        if value.contains('.') {
            JoinTarget::Relation(value.to_string())
        } else {
            JoinTarget::Entity(value.to_string())
        }
    }
}

impl From<String> for JoinTarget {
    fn from(value: String) -> Self {
        JoinTarget::from(value.as_str())
    }
}

impl From<QueryBuilder> for JoinTarget {
    fn from(value: QueryBuilder) -> Self {
        JoinTarget::SubQuery(Box::new(value))
    }
}

/// A projection as written by the caller. Classified at compile time, once
/// every alias is known.
#[derive(Debug, Clone)]
pub(crate) enum Selection {
    /// `alias`, `alias.property` or a raw expression
    Expr(String),
    /// Raw expression with an output name
    Raw { expr: String, alias: String },
}

#[derive(Debug, Clone)]
pub(crate) enum Source {
    Entity(String),
    SubQuery(Box<QueryBuilder>),
}

#[derive(Debug, Clone)]
pub(crate) struct Join {
    pub kind: JoinKind,
    pub alias: String,
    pub source: Source,
    pub on: Option<String>,
    /// `(parent alias, relation property)` for relation-path joins
    pub relation: Option<(String, String)>,
}

/// Fold the joined alias's rows into `parent.property`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MapInstruction {
    pub parent: String,
    pub property: String,
    pub child: String,
    pub many: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    Raw(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    fn and(existing: Option<Predicate>, next: Predicate) -> Predicate {
        match existing {
            None => next,
            Some(Predicate::And(mut parts)) => {
                parts.push(next);
                Predicate::And(parts)
            }
            Some(other) => Predicate::And(vec![other, next]),
        }
    }

    fn or(existing: Option<Predicate>, next: Predicate) -> Predicate {
        match existing {
            None => next,
            Some(Predicate::Or(mut parts)) => {
                parts.push(next);
                Predicate::Or(parts)
            }
            Some(other) => Predicate::Or(vec![other, next]),
        }
    }

    fn all(fragments: &[&str]) -> Predicate {
        match fragments {
            [single] => Predicate::Raw(single.to_string()),
            many => Predicate::And(many.iter().map(|f| Predicate::Raw(f.to_string())).collect()),
        }
    }
}

/// A query builder for SELECT statements.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    pub(crate) schema: Arc<Schema>,
    pub(crate) selects: Vec<Selection>,
    pub(crate) from: Option<(Source, String)>,
    pub(crate) joins: Vec<Join>,
    pub(crate) mappings: Vec<MapInstruction>,
    pub(crate) where_clause: Option<Predicate>,
    pub(crate) group_by: Vec<String>,
    pub(crate) having: Option<Predicate>,
    pub(crate) order_by: Vec<(String, Order)>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) params: HashMap<String, SqlValue>,
    /// Names bound to two different values; compiling fails while non-empty.
    pub(crate) param_conflicts: Vec<String>,
    pub(crate) eager_relations: bool,
    pub(crate) eager_depth: usize,
    pub(crate) is_subquery: bool,
}

impl QueryBuilder {
    /// Create a new top-level query builder.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            selects: Vec::new(),
            from: None,
            joins: Vec::new(),
            mappings: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            params: HashMap::new(),
            param_conflicts: Vec::new(),
            eager_relations: true,
            eager_depth: DEFAULT_EAGER_DEPTH,
            is_subquery: false,
        }
    }

    /// A nested builder sharing this builder's schema, for use as a join
    /// target, a FROM source or inside a where fragment via [get_query](Self::get_query).
    pub fn sub_query(&self) -> Self {
        let mut sub = Self::new(self.schema.clone());
        sub.is_subquery = true;
        sub.eager_relations = false;
        sub
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    /// Replace the projection list.
    pub fn select<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selects.clear();
        self.add_select(exprs)
    }

    /// Extend the projection list.
    pub fn add_select<I, S>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selects
            .extend(exprs.into_iter().map(|e| Selection::Expr(e.into())));
        self
    }

    /// Replace the projection list with one raw expression and output name.
    pub fn select_raw(mut self, expr: &str, alias: &str) -> Self {
        self.selects.clear();
        self.add_select_raw(expr, alias)
    }

    /// Add a raw expression (e.g. an aggregate) with an output name.
    pub fn add_select_raw(mut self, expr: &str, alias: &str) -> Self {
        self.selects.push(Selection::Raw {
            expr: expr.to_string(),
            alias: alias.to_string(),
        });
        self
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    /// Set the root entity and its alias.
    pub fn from(mut self, entity: &str, alias: &str) -> Result<Self> {
        self.schema.resolve(entity)?;
        self.check_alias(alias)?;
        self.from = Some((Source::Entity(entity.to_string()), alias.to_string()));
        self.select_root_by_default(alias);
        Ok(self)
    }

    /// Use a subquery as the root source.
    pub fn from_subquery(mut self, sub: QueryBuilder, alias: &str) -> Result<Self> {
        self.check_alias(alias)?;
        self.from = Some((Source::SubQuery(Box::new(sub.into_subquery())), alias.to_string()));
        self.select_root_by_default(alias);
        Ok(self)
    }

    /// The root alias is selected unless a projection was given first;
    /// a later `select` replaces it.
    fn select_root_by_default(&mut self, alias: &str) {
        if self.selects.is_empty() {
            self.selects.push(Selection::Expr(alias.to_string()));
        }
    }

    fn check_alias(&self, alias: &str) -> Result<()> {
        if !expr::is_identifier(alias) {
            return Err(OrmError::compile(format!("invalid alias \"{}\"", alias)));
        }
        let taken = self.from.as_ref().is_some_and(|(_, a)| a == alias)
            || self.joins.iter().any(|j| j.alias == alias);
        if taken {
            return Err(OrmError::DuplicateAlias(alias.to_string()));
        }
        Ok(())
    }

    fn alias_entity(&self, alias: &str) -> Option<String> {
        let source = match &self.from {
            Some((source, a)) if a == alias => Some(source),
            _ => self.joins.iter().find(|j| j.alias == alias).map(|j| &j.source),
        }?;
        match source {
            Source::Entity(e) => Some(e.clone()),
            Source::SubQuery(sub) => sub.exposed_entity(),
        }
    }

    /// Entity whose columns a subquery exposes under their own names: its
    /// root entity when only the root alias is selected.
    pub(crate) fn exposed_entity(&self) -> Option<String> {
        let (source, root) = self.from.as_ref()?;
        let only_root = self
            .selects
            .iter()
            .all(|s| matches!(s, Selection::Expr(e) if e == root));
        if !only_root || !self.joins.is_empty() {
            return None;
        }
        match source {
            Source::Entity(e) => Some(e.clone()),
            Source::SubQuery(sub) => sub.exposed_entity(),
        }
    }

    fn into_subquery(mut self) -> Self {
        self.is_subquery = true;
        self.eager_relations = false;
        self
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    /// Add a join. `on` is ANDed with the relation condition for relation-path
    /// targets and is required for entity and subquery targets.
    pub fn join(
        mut self,
        kind: JoinKind,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: Option<&str>,
    ) -> Result<Self> {
        self.check_alias(alias)?;
        let on = on.map(str::to_string);

        let join = match target.into() {
            JoinTarget::Entity(entity) => {
                self.schema.resolve(&entity)?;
                Join {
                    kind,
                    alias: alias.to_string(),
                    source: Source::Entity(entity),
                    on,
                    relation: None,
                }
            }
            JoinTarget::SubQuery(sub) => Join {
                kind,
                alias: alias.to_string(),
                source: Source::SubQuery(Box::new(sub.into_subquery())),
                on,
                relation: None,
            },
            JoinTarget::Relation(path) => {
                let (parent, property) = self.relation_path(&path)?;
                let parent_entity = self.alias_entity(&parent).ok_or_else(|| {
                    OrmError::compile(format!("alias {} has no entity to resolve {}", parent, path))
                })?;
                let relation = self.schema.relations().resolve(&parent_entity, &property)?;
                Join {
                    kind,
                    alias: alias.to_string(),
                    source: Source::Entity(relation.target.clone()),
                    on,
                    relation: Some((parent, property)),
                }
            }
        };

        if join.on.is_none() && join.relation.is_none() {
            return Err(OrmError::compile(format!("join {} needs an ON condition", alias)));
        }
        self.joins.push(join);
        Ok(self)
    }

    /// Split `parent.property` and check the parent alias is declared.
    fn relation_path(&self, path: &str) -> Result<(String, String)> {
        let (parent, property) = expr::split_path(path)
            .ok_or_else(|| OrmError::compile(format!("invalid property path {}", path)))?;
        let declared = self.from.as_ref().is_some_and(|(_, a)| a == parent)
            || self.joins.iter().any(|j| j.alias == parent);
        if !declared {
            return Err(OrmError::compile(format!(
                "alias {} in {} is not declared yet",
                parent, path
            )));
        }
        Ok((parent.to_string(), property.to_string()))
    }

    pub fn inner_join(self, target: impl Into<JoinTarget>, alias: &str, on: &str) -> Result<Self> {
        self.join(JoinKind::Inner, target, alias, Some(on))
    }

    pub fn left_join(self, target: impl Into<JoinTarget>, alias: &str, on: &str) -> Result<Self> {
        self.join(JoinKind::Left, target, alias, Some(on))
    }

    /// Join and add the joined alias to the selection. Relation-path targets
    /// are also mapped into their property.
    pub fn inner_join_and_select(
        self,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: Option<&str>,
    ) -> Result<Self> {
        self.join_and_select(JoinKind::Inner, target.into(), alias, on)
    }

    pub fn left_join_and_select(
        self,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: Option<&str>,
    ) -> Result<Self> {
        self.join_and_select(JoinKind::Left, target.into(), alias, on)
    }

    fn join_and_select(
        self,
        kind: JoinKind,
        target: JoinTarget,
        alias: &str,
        on: Option<&str>,
    ) -> Result<Self> {
        let mut qb = self.join(kind, target, alias, on)?.add_select([alias]);
        let relation = qb.joins.last().and_then(|j| j.relation.clone());
        if let Some((parent, property)) = relation {
            let parent_entity = qb.alias_entity(&parent).unwrap_or_default();
            let many = qb.schema.relations().resolve(&parent_entity, &property)?.is_many();
            qb.mappings.push(MapInstruction {
                parent,
                property,
                child: alias.to_string(),
                many,
            });
        }
        Ok(qb)
    }

    /// Join, select, and nest the first joined row into `parent.property`.
    pub fn left_join_and_map_one(
        self,
        property: &str,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: &str,
    ) -> Result<Self> {
        self.join_and_map(JoinKind::Left, property, target.into(), alias, on, false)
    }

    /// Join, select, and nest every joined row into `parent.property`.
    pub fn left_join_and_map_many(
        self,
        property: &str,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: &str,
    ) -> Result<Self> {
        self.join_and_map(JoinKind::Left, property, target.into(), alias, on, true)
    }

    pub fn inner_join_and_map_one(
        self,
        property: &str,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: &str,
    ) -> Result<Self> {
        self.join_and_map(JoinKind::Inner, property, target.into(), alias, on, false)
    }

    pub fn inner_join_and_map_many(
        self,
        property: &str,
        target: impl Into<JoinTarget>,
        alias: &str,
        on: &str,
    ) -> Result<Self> {
        self.join_and_map(JoinKind::Inner, property, target.into(), alias, on, true)
    }

    fn join_and_map(
        self,
        kind: JoinKind,
        property: &str,
        target: JoinTarget,
        alias: &str,
        on: &str,
        many: bool,
    ) -> Result<Self> {
        let (parent, property) = self.relation_path(property)?;
        let mut qb = self.join(kind, target, alias, Some(on))?.add_select([alias]);
        qb.mappings.push(MapInstruction {
            parent,
            property,
            child: alias.to_string(),
            many,
        });
        Ok(qb)
    }

    /// Enable or disable automatic joins for eager relations. They are only
    /// added when the plan has no explicit joins.
    pub fn eager_relations(mut self, enabled: bool) -> Self {
        self.eager_relations = enabled;
        self
    }

    /// Depth of eager relation expansion (default 1).
    pub fn eager_depth(mut self, depth: usize) -> Self {
        self.eager_depth = depth;
        self
    }

    // ------------------------------------------------------------------
    // Filtering
    // ------------------------------------------------------------------

    /// Add a WHERE condition. Subsequent calls are ANDed.
    pub fn where_clause<P>(self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        self.and_where(predicate, params)
    }

    pub fn and_where<P>(mut self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        self.where_clause = Some(Predicate::and(
            self.where_clause.take(),
            Predicate::Raw(predicate.to_string()),
        ));
        self.set_parameters(params)
    }

    /// AND several fragments supplied together.
    pub fn and_where_all<P>(mut self, fragments: &[&str], params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        if !fragments.is_empty() {
            self.where_clause = Some(Predicate::and(
                self.where_clause.take(),
                Predicate::all(fragments),
            ));
        }
        self.set_parameters(params)
    }

    /// OR a condition with everything added so far.
    pub fn or_where<P>(mut self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        self.where_clause = Some(Predicate::or(
            self.where_clause.take(),
            Predicate::Raw(predicate.to_string()),
        ));
        self.set_parameters(params)
    }

    pub fn having<P>(mut self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        self.having = Some(Predicate::Raw(predicate.to_string()));
        self.set_parameters(params)
    }

    pub fn and_having<P>(mut self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        self.having = Some(Predicate::and(
            self.having.take(),
            Predicate::Raw(predicate.to_string()),
        ));
        self.set_parameters(params)
    }

    /// Bind `:name`. Rebinding a name to a different value makes the plan
    /// fail to compile.
    pub fn set_parameter(mut self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.bind(name.to_string(), value.into());
        self
    }

    pub fn set_parameters<P>(mut self, params: P) -> Self
    where
        P: IntoIterator<Item = (String, SqlValue)>,
    {
        for (name, value) in params {
            self.bind(name, value);
        }
        self
    }

    fn bind(&mut self, name: String, value: SqlValue) {
        match self.params.get(&name) {
            Some(existing) if existing != &value => {
                if !self.param_conflicts.contains(&name) {
                    self.param_conflicts.push(name);
                }
            }
            Some(_) => {}
            None => {
                self.params.insert(name, value);
            }
        }
    }

    /// Parameters set on this builder, sorted by name.
    pub fn parameters(&self) -> Vec<(String, SqlValue)> {
        let mut params: Vec<(String, SqlValue)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    // ------------------------------------------------------------------
    // Grouping, ordering, pagination
    // ------------------------------------------------------------------

    pub fn group_by(mut self, expr: &str) -> Self {
        self.group_by = vec![expr.to_string()];
        self
    }

    pub fn add_group_by(mut self, expr: &str) -> Self {
        self.group_by.push(expr.to_string());
        self
    }

    /// Replace the ORDER BY list. `sort` is a property path or an output name.
    pub fn order_by(mut self, sort: &str, order: Order) -> Self {
        self.order_by = vec![(sort.to_string(), order)];
        self
    }

    pub fn add_order_by(mut self, sort: &str, order: Order) -> Self {
        self.order_by.push((sort.to_string(), order));
        self
    }

    /// Number of rows to skip (OFFSET). Ungrouped plans with joins skip root
    /// entities instead of joined rows.
    pub fn skip(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Maximum number of rows (LIMIT), counted in root entities when the
    /// plan has joins and no grouping.
    pub fn take(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    /// Compile to SQL with positional parameters, without executing.
    pub fn compile(&self) -> Result<CompiledQuery> {
        Compiler::new(self).compile()
    }

    pub fn get_sql(&self) -> Result<String> {
        self.compile().map(|q| q.sql)
    }

    /// Render as a parenthesized subquery with `:name` placeholders intact,
    /// for inlining into a where fragment of another builder.
    pub fn get_query(&self) -> Result<String> {
        let rendered = Compiler::new(self).render()?;
        Ok(format!("({})", rendered.sql))
    }

    pub(crate) fn compile_count(&self) -> Result<CompiledQuery> {
        Compiler::new(self).compile_count()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute and map rows into entity graphs.
    pub async fn get_many<S>(&self, source: &S) -> Result<Vec<JsonMap<String, JsonValue>>>
    where
        S: RowSource + ?Sized,
    {
        let compiled = self.compile()?;
        let rows = source.fetch_rows(&compiled).await?;
        ResultMapper::new(&compiled.shape).map(&rows)
    }

    /// Execute and return the first mapped entity.
    pub async fn get_one<S>(&self, source: &S) -> Result<Option<JsonMap<String, JsonValue>>>
    where
        S: RowSource + ?Sized,
    {
        Ok(self.get_many(source).await?.into_iter().next())
    }

    /// Execute and deserialize the mapped entities.
    pub async fn get_many_as<T, S>(&self, source: &S) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        S: RowSource + ?Sized,
    {
        self.get_many(source)
            .await?
            .into_iter()
            .map(|e| serde_json::from_value(JsonValue::Object(e)).map_err(OrmError::from))
            .collect()
    }

    /// Execute the query plus a count of distinct root entities (or groups,
    /// for a grouped plan), ignoring pagination.
    pub async fn get_many_and_count<S>(
        &self,
        source: &S,
    ) -> Result<(Vec<JsonMap<String, JsonValue>>, i64)>
    where
        S: RowSource + ?Sized,
    {
        let count_query = self.compile_count()?;
        let entities = self.get_many(source).await?;
        let total = source.fetch_count(&count_query).await?;
        Ok((entities, total))
    }

    /// Execute and return flat rows keyed by output column name.
    pub async fn get_raw_many<S>(&self, source: &S) -> Result<Vec<JsonMap<String, JsonValue>>>
    where
        S: RowSource + ?Sized,
    {
        let compiled = self.compile()?;
        let rows = source.fetch_rows(&compiled).await?;
        Ok(rows.iter().map(|r| r.to_json()).collect())
    }
}
