//! Relation graph between registered entities
//!
//! Relations are declared after the entities they connect. Each relation
//! names the side that owns the join column: many-to-one relations are owned
//! by their source, one-to-many by their target, one-to-one by whichever side
//! is declared. Cycles are allowed; eager expansion is depth bounded.

use std::collections::HashMap;

use super::schema::{EntityMapping, SchemaRegistry};
use crate::error::{OrmError, Result};

/// Default depth of eager relation expansion.
pub const DEFAULT_EAGER_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
}

/// Which end of the relation holds the join column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerSide {
    Source,
    Target,
}

/// Join column pair: `column` lives on the owning entity and references
/// `referenced` on the other one. Both are field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub column: String,
    pub referenced: String,
}

#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    /// Property on the source entity that holds the related value(s)
    pub name: String,
    pub source: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub join_columns: Vec<JoinColumn>,
    pub owner: OwnerSide,
    pub eager: bool,
    /// Property on the target that points back at the source
    pub inverse: Option<String>,
}

impl RelationDescriptor {
    fn new(source: &str, name: &str, target: &str, cardinality: Cardinality, owner: OwnerSide) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            cardinality,
            join_columns: Vec::new(),
            owner,
            eager: false,
            inverse: None,
        }
    }

    /// `source.name` holds one `target`; the foreign key lives on `source`.
    pub fn many_to_one(source: &str, name: &str, target: &str) -> Self {
        Self::new(source, name, target, Cardinality::ManyToOne, OwnerSide::Source)
    }

    /// `source.name` holds many `target`s; the foreign key lives on `target`.
    pub fn one_to_many(source: &str, name: &str, target: &str) -> Self {
        Self::new(source, name, target, Cardinality::OneToMany, OwnerSide::Target)
    }

    /// `source.name` holds one `target`; the foreign key lives on `source`
    /// unless [owned_by_target](Self::owned_by_target) is called.
    pub fn one_to_one(source: &str, name: &str, target: &str) -> Self {
        Self::new(source, name, target, Cardinality::OneToOne, OwnerSide::Source)
    }

    pub fn owned_by_target(mut self) -> Self {
        self.owner = OwnerSide::Target;
        self
    }

    /// Add a join column pair (field on the owning side, field it references).
    pub fn join_column(mut self, column: &str, referenced: &str) -> Self {
        self.join_columns.push(JoinColumn {
            column: column.to_string(),
            referenced: referenced.to_string(),
        });
        self
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn inverse(mut self, property: &str) -> Self {
        self.inverse = Some(property.to_string());
        self
    }

    pub fn is_many(&self) -> bool {
        self.cardinality == Cardinality::OneToMany
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.source, self.name)
    }

    pub fn owning_entity(&self) -> &str {
        match self.owner {
            OwnerSide::Source => &self.source,
            OwnerSide::Target => &self.target,
        }
    }

    fn referenced_entity(&self) -> &str {
        match self.owner {
            OwnerSide::Source => &self.target,
            OwnerSide::Target => &self.source,
        }
    }

    /// Render the ON condition joining `target_alias` to `source_alias`.
    pub fn on_condition(
        &self,
        registry: &SchemaRegistry,
        source_alias: &str,
        target_alias: &str,
    ) -> Result<String> {
        let (owning_alias, referenced_alias) = match self.owner {
            OwnerSide::Source => (source_alias, target_alias),
            OwnerSide::Target => (target_alias, source_alias),
        };
        let owning = registry.resolve(self.owning_entity())?;
        let referenced = registry.resolve(self.referenced_entity())?;

        let mut parts = Vec::with_capacity(self.join_columns.len());
        for jc in &self.join_columns {
            let left = column_name(owning, &jc.column, self)?;
            let right = column_name(referenced, &jc.referenced, self)?;
            parts.push(format!(
                "\"{}\".\"{}\" = \"{}\".\"{}\"",
                owning_alias, left, referenced_alias, right
            ));
        }
        Ok(parts.join(" AND "))
    }
}

fn column_name<'a>(
    mapping: &'a EntityMapping,
    field: &str,
    relation: &RelationDescriptor,
) -> Result<&'a str> {
    mapping
        .column(field)
        .map(|c| c.column.as_str())
        .ok_or_else(|| {
            OrmError::relation(
                relation.qualified_name(),
                format!("{} has no field {}", mapping.name, field),
            )
        })
}

/// One step of an eager expansion. `parent` indexes into the same list;
/// `None` means the root entity.
#[derive(Debug, Clone, Copy)]
pub struct EagerJoin<'a> {
    pub parent: Option<usize>,
    pub relation: &'a RelationDescriptor,
    pub depth: usize,
}

#[derive(Debug, Default)]
pub struct RelationGraph {
    relations: Vec<RelationDescriptor>,
    by_property: HashMap<(String, String), usize>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn declare_relation(
        &mut self,
        registry: &SchemaRegistry,
        relation: RelationDescriptor,
    ) -> Result<()> {
        let name = relation.qualified_name();
        let invalid = |reason: String| OrmError::relation(name.clone(), reason);

        let source = registry
            .resolve(&relation.source)
            .map_err(|_| invalid(format!("source entity {} is not registered", relation.source)))?;
        registry
            .resolve(&relation.target)
            .map_err(|_| invalid(format!("target entity {} is not registered", relation.target)))?;

        match (relation.cardinality, relation.owner) {
            (Cardinality::ManyToOne, OwnerSide::Target) => {
                return Err(invalid("many-to-one must own its join column".into()));
            }
            (Cardinality::OneToMany, OwnerSide::Source) => {
                return Err(invalid("one-to-many join column must live on the target".into()));
            }
            _ => {}
        }

        if source.column(&relation.name).is_some() {
            return Err(invalid(format!("{} already has a column named {}", source.name, relation.name)));
        }
        let key = (relation.source.clone(), relation.name.clone());
        if self.by_property.contains_key(&key) {
            return Err(invalid("relation declared twice".into()));
        }

        if relation.join_columns.is_empty() {
            return Err(invalid("at least one join column is required".into()));
        }
        let owning = registry.resolve(relation.owning_entity())?;
        let referenced = registry.resolve(relation.referenced_entity())?;
        for jc in &relation.join_columns {
            column_name(owning, &jc.column, &relation)?;
            column_name(referenced, &jc.referenced, &relation)?;
        }

        self.check_inverse_ownership(&relation)?;

        tracing::debug!(relation = %name, eager = relation.eager, "Declared relation");
        self.by_property.insert(key, self.relations.len());
        self.relations.push(relation);
        Ok(())
    }

    /// Both halves of an inverse pair must agree on who owns the join column.
    fn check_inverse_ownership(&self, relation: &RelationDescriptor) -> Result<()> {
        let counterpart = self.relations.iter().find(|other| {
            other.source == relation.target
                && other.target == relation.source
                && (relation.inverse.as_deref() == Some(other.name.as_str())
                    || other.inverse.as_deref() == Some(relation.name.as_str()))
        });

        if let Some(other) = counterpart {
            if other.owning_entity() != relation.owning_entity()
                || other.join_columns != relation.join_columns
            {
                return Err(OrmError::relation(
                    relation.qualified_name(),
                    format!(
                        "inverse {} disagrees on the owner of the join column",
                        other.qualified_name()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn resolve(&self, entity: &str, property: &str) -> Result<&RelationDescriptor> {
        self.by_property
            .get(&(entity.to_string(), property.to_string()))
            .map(|&i| &self.relations[i])
            .ok_or_else(|| {
                OrmError::relation(format!("{}.{}", entity, property), "no such relation")
            })
    }

    pub fn relations_of<'a>(
        &'a self,
        entity: &str,
    ) -> impl Iterator<Item = &'a RelationDescriptor> + use<'a> {
        let entity = entity.to_string();
        self.relations.iter().filter(move |r| r.source == entity)
    }

    /// Relations flagged eager on `entity`.
    pub fn resolve_eager(&self, entity: &str) -> Vec<&RelationDescriptor> {
        self.relations_of(entity).filter(|r| r.eager).collect()
    }

    /// Expand eager relations from `entity` down to `max_depth` levels.
    /// Parents always precede their children in the result.
    pub fn resolve_eager_tree(&self, entity: &str, max_depth: usize) -> Vec<EagerJoin<'_>> {
        let mut out = Vec::new();
        self.expand_eager(entity, None, 1, max_depth, &mut out);
        out
    }

    fn expand_eager<'a>(
        &'a self,
        entity: &str,
        parent: Option<usize>,
        depth: usize,
        max_depth: usize,
        out: &mut Vec<EagerJoin<'a>>,
    ) {
        if depth > max_depth {
            return;
        }
        for relation in self.resolve_eager(entity) {
            let idx = out.len();
            out.push(EagerJoin {
                parent,
                relation,
                depth,
            });
            self.expand_eager(&relation.target, Some(idx), depth + 1, max_depth, out);
        }
    }
}
