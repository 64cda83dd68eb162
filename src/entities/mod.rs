//! Sample entity schemas used by the demo binary and the integration tests

use std::sync::Arc;

use crate::error::Result;
use crate::orm::Schema;

pub mod blog;
pub mod ruum;

/// Blog and ruum entities in one schema.
pub fn schema() -> Result<Arc<Schema>> {
    let builder = blog::register(Schema::builder())?;
    Ok(ruum::register(builder)?.build())
}

pub fn blog_schema() -> Result<Arc<Schema>> {
    Ok(blog::register(Schema::builder())?.build())
}

pub fn ruum_schema() -> Result<Arc<Schema>> {
    Ok(ruum::register(Schema::builder())?.build())
}
