//! Joinery - relational query construction and entity mapping
//!
//! Entities are mapped explicitly onto SQLite tables, queried through a
//! chainable builder and returned as nested JSON objects (or any serde type).

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod logging;
pub mod orm;

pub use db::{ConnectionCache, Database, RawRow, RowSource};
pub use error::{OrmError, Result};
pub use orm::{QueryBuilder, Repository, Schema};
