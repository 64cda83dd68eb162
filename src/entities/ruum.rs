//! Collaboration workspace entities: users, ruums, tasks and what hangs off them
//!
//! The eager relations form a cycle (User.participations ->
//! RuumParticipation.ruum -> Ruum.owner -> User), so automatic joins rely on
//! the eager depth bound.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orm::{
    ColumnMapping, ColumnType, DayTransformer, EntityMapping, RelationDescriptor, SchemaBuilder,
    TimestampTransformer,
};

/// Calendar day as exposed by [DayTransformer].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Day {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Option<i64>,
    pub email: String,
    pub name: String,
    /// RFC 3339
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Option<i64>,
    pub ruum_id: i64,
    pub title: String,
    pub done: bool,
    pub due_day: Option<Day>,
    pub created_at: String,
}

fn created_at() -> ColumnMapping {
    ColumnMapping::new("createdAt", ColumnType::Integer).transformer(TimestampTransformer)
}

fn mappings() -> Result<Vec<EntityMapping>> {
    Ok(vec![
        EntityMapping::builder("User", "user")
            .generated_primary("id")
            .column("email", ColumnType::Text)
            .column("name", ColumnType::Text)
            .add(ColumnMapping::new("passwordHash", ColumnType::Text).nullable().hidden())
            .add(created_at())
            .build()?,
        EntityMapping::builder("Ruum", "ruum")
            .generated_primary("id")
            .column("title", ColumnType::Text)
            .column("ownerId", ColumnType::Integer)
            .add(created_at())
            .build()?,
        EntityMapping::builder("RuumParticipation", "ruum_participation")
            .primary("userId", ColumnType::Integer)
            .primary("ruumId", ColumnType::Integer)
            .add(ColumnMapping::new("role", ColumnType::Text).default_sql("'member'"))
            .build()?,
        EntityMapping::builder("Task", "task")
            .generated_primary("id")
            .column("ruumId", ColumnType::Integer)
            .column("title", ColumnType::Text)
            .add(ColumnMapping::new("done", ColumnType::Boolean).default_sql("0"))
            .add(
                ColumnMapping::new("dueDay", ColumnType::Text)
                    .nullable()
                    .transformer(DayTransformer),
            )
            .add(created_at())
            .build()?,
        EntityMapping::builder("Comment", "comment")
            .generated_primary("id")
            .column("taskId", ColumnType::Integer)
            .column("authorId", ColumnType::Integer)
            .column("body", ColumnType::Text)
            .add(created_at())
            .build()?,
        EntityMapping::builder("Tag", "tag")
            .generated_primary("id")
            .column("taskId", ColumnType::Integer)
            .column("label", ColumnType::Text)
            .build()?,
        EntityMapping::builder("Favorite", "favorite")
            .primary("userId", ColumnType::Integer)
            .primary("taskId", ColumnType::Integer)
            .build()?,
    ])
}

fn relations() -> Vec<RelationDescriptor> {
    vec![
        // User
        RelationDescriptor::one_to_many("User", "participations", "RuumParticipation")
            .join_column("userId", "id")
            .inverse("user")
            .eager(),
        RelationDescriptor::one_to_many("User", "ruums", "Ruum")
            .join_column("ownerId", "id")
            .inverse("owner"),
        RelationDescriptor::one_to_many("User", "favorites", "Favorite").join_column("userId", "id"),
        // Ruum
        RelationDescriptor::many_to_one("Ruum", "owner", "User")
            .join_column("ownerId", "id")
            .inverse("ruums")
            .eager(),
        RelationDescriptor::one_to_many("Ruum", "participations", "RuumParticipation")
            .join_column("ruumId", "id")
            .inverse("ruum"),
        RelationDescriptor::one_to_many("Ruum", "tasks", "Task")
            .join_column("ruumId", "id")
            .inverse("ruum"),
        // RuumParticipation
        RelationDescriptor::many_to_one("RuumParticipation", "user", "User")
            .join_column("userId", "id")
            .inverse("participations"),
        RelationDescriptor::many_to_one("RuumParticipation", "ruum", "Ruum")
            .join_column("ruumId", "id")
            .inverse("participations")
            .eager(),
        // Task
        RelationDescriptor::many_to_one("Task", "ruum", "Ruum")
            .join_column("ruumId", "id")
            .inverse("tasks"),
        RelationDescriptor::one_to_many("Task", "comments", "Comment")
            .join_column("taskId", "id")
            .inverse("task"),
        RelationDescriptor::one_to_many("Task", "tags", "Tag").join_column("taskId", "id"),
        // Comment
        RelationDescriptor::many_to_one("Comment", "task", "Task")
            .join_column("taskId", "id")
            .inverse("comments"),
        RelationDescriptor::many_to_one("Comment", "author", "User")
            .join_column("authorId", "id")
            .eager(),
        // Favorite
        RelationDescriptor::many_to_one("Favorite", "task", "Task")
            .join_column("taskId", "id")
            .eager(),
    ]
}

/// Register every ruum entity and relation.
pub fn register(builder: SchemaBuilder) -> Result<SchemaBuilder> {
    let builder = mappings()?
        .into_iter()
        .try_fold(builder, |b, mapping| b.entity(mapping))?;
    relations()
        .into_iter()
        .try_fold(builder, |b, relation| b.relation(relation))
}
