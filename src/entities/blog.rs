//! Category / Post entities

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orm::{ColumnType, EntityMapping, RelationDescriptor, SchemaBuilder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Option<i64>,
    pub title: String,
    pub category_id: i64,
}

pub fn category_mapping() -> Result<EntityMapping> {
    EntityMapping::builder("Category", "category")
        .generated_primary("id")
        .column("name", ColumnType::Text)
        .build()
}

pub fn post_mapping() -> Result<EntityMapping> {
    EntityMapping::builder("Post", "post")
        .generated_primary("id")
        .column("title", ColumnType::Text)
        .column("categoryId", ColumnType::Integer)
        .build()
}

/// Register Category, Post and the relation between them.
pub fn register(builder: SchemaBuilder) -> Result<SchemaBuilder> {
    builder
        .entity(category_mapping()?)?
        .entity(post_mapping()?)?
        .relation(
            RelationDescriptor::one_to_many("Category", "posts", "Post")
                .join_column("categoryId", "id")
                .inverse("category"),
        )?
        .relation(
            RelationDescriptor::many_to_one("Post", "category", "Category")
                .join_column("categoryId", "id")
                .inverse("posts"),
        )
}
