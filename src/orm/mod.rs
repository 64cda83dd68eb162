//! Query construction and entity mapping over SQLite
//!
//! This module provides:
//! - Explicit entity mappings registered once into a [Schema]
//! - Relations between entities, including eager relations that are joined
//!   automatically
//! - A chainable [QueryBuilder] with joins, subqueries, grouping and paging
//! - A compiler that produces SQL plus positional parameters
//! - A result mapper that rebuilds nested entities from joined rows
//!
//! # Usage
//!
//! ```rust,ignore
//! let schema = Schema::builder()
//!     .entity(category_mapping)?
//!     .entity(post_mapping)?
//!     .relation(RelationDescriptor::one_to_many("Category", "posts", "Post").join_column("categoryId", "id"))?
//!     .build();
//!
//! let categories = QueryBuilder::new(schema)
//!     .from("Category", "category")?
//!     .left_join_and_select("category.posts", "post", None)?
//!     .get_many(&db)
//!     .await?;
//! ```

pub mod builder;
pub mod compiler;
pub(crate) mod expr;
pub(crate) mod mapper;
pub mod relations;
pub mod repository;
pub mod schema;
pub mod transformers;
pub mod value;

pub use builder::{JoinKind, JoinTarget, Order, QueryBuilder};
pub use compiler::CompiledQuery;
pub use relations::{
    Cardinality, DEFAULT_EAGER_DEPTH, JoinColumn, OwnerSide, RelationDescriptor, RelationGraph,
};
pub use repository::Repository;
pub use schema::{
    ColumnMapping, ColumnType, EntityMapping, EntityMappingBuilder, Schema, SchemaBuilder,
    SchemaRegistry,
};
pub use transformers::{DayTransformer, TimestampTransformer, ValueTransformer};
pub use value::SqlValue;
