//! Joinery demo
//!
//! Builds the sample schemas, synchronizes the tables, saves a little data
//! and runs the mapped join, subquery join and grouped aggregate queries,
//! logging the SQL and the mapped results.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value as JsonValue, json};
use tracing::{error, info, warn};

use joinery::config::Config;
use joinery::db::schema_sync;
use joinery::entities::{self, blog};
use joinery::logging::init_tracing;
use joinery::orm::{Order, QueryBuilder, Repository, Schema};
use joinery::{ConnectionCache, Database};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    info!("Starting joinery demo");
    let schema = entities::schema().context("Failed to build entity schema")?;
    let cache = ConnectionCache::new(config.database.clone());

    let result = run(&config, &schema, &cache).await;
    cache.close().await;
    result
}

async fn run(config: &Config, schema: &Arc<Schema>, cache: &ConnectionCache) -> Result<()> {
    let db = cache.get().await.context("Failed to connect to database")?;

    if config.synchronize {
        let sync = schema_sync::sync_all(db.pool(), schema, config.drop_schema).await;
        if !sync.is_ok() {
            anyhow::bail!("Schema sync failed: {}", sync.errors.join("; "));
        }
    } else if config.drop_schema {
        let dropped = schema_sync::drop_all(db.pool(), schema).await;
        info!(tables = ?dropped.tables_dropped, "Dropped tables");
    }

    add_data(&db, schema).await?;

    let normal = QueryBuilder::new(schema.clone())
        .select(["category"])
        .from("Category", "category")?
        .left_join_and_map_many("category.posts", "Post", "post", "post.categoryId = category.id")?;
    run_query("normal", &normal, &db).await;

    let posts = normal.sub_query().select(Vec::<String>::new()).from("Post", "post")?;
    let with_sub_query = QueryBuilder::new(schema.clone())
        .select(["category"])
        .from("Category", "category")?
        .left_join_and_map_many("category.posts", posts, "post", "post.\"categoryId\" = category.id")?;
    run_query("with_sub_query", &with_sub_query, &db).await;

    let post_counts = QueryBuilder::new(schema.clone())
        .select(["category.id", "category.name"])
        .add_select_raw("COUNT(post.id)", "postCount")
        .from("Category", "category")?
        .left_join("Post", "post", "post.categoryId = category.id")?
        .group_by("category.id")
        .add_group_by("category.name")
        .order_by("postCount", Order::Desc);
    info!(sql = %post_counts.get_sql()?, "post_counts");
    match post_counts.get_raw_many(&db).await {
        Ok(rows) => info!(result = %to_pretty(&rows), "post_counts"),
        Err(e) => error!(error = %e, "post_counts failed"),
    }

    let users = Repository::new(schema.clone(), "User")?
        .find("user")?
        .eager_depth(config.eager_depth);
    run_query("users_with_eager_relations", &users, &db).await;

    Ok(())
}

async fn add_data(db: &Database, schema: &Arc<Schema>) -> Result<()> {
    let categories = Repository::new(schema.clone(), "Category")?;
    let posts = Repository::new(schema.clone(), "Post")?;

    let category = blog::Category {
        id: Some(1),
        name: "cat1".to_string(),
        posts: Vec::new(),
    };
    let post = blog::Post {
        id: Some(2),
        title: "p1".to_string(),
        category_id: 1,
    };

    // The same post twice still leaves one row
    tokio::try_join!(
        categories.save_as(db, &category),
        posts.save_as(db, &post),
        posts.save_as(db, &post),
    )
    .context("Failed to save blog data")?;

    let save = |entity: &'static str, value: JsonValue| {
        let repo = Repository::new(schema.clone(), entity);
        async move {
            let JsonValue::Object(value) = value else {
                anyhow::bail!("{} sample is not an object", entity);
            };
            repo?
                .save(db, &value)
                .await
                .with_context(|| format!("Failed to save {}", entity))
        }
    };

    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let user = save("User", json!({"email": "ada@example.com", "name": "Ada", "createdAt": now})).await?;
    let ruum = save("Ruum", json!({"title": "Launch", "ownerId": user["id"], "createdAt": now})).await?;
    save(
        "RuumParticipation",
        json!({"userId": user["id"], "ruumId": ruum["id"], "role": "owner"}),
    )
    .await?;
    save(
        "Task",
        json!({
            "ruumId": ruum["id"],
            "title": "Write release notes",
            "done": false,
            "dueDay": {"year": 2024, "month": 3, "day": 1},
            "createdAt": now,
        }),
    )
    .await?;

    info!(
        categories = categories.count(db).await?,
        posts = posts.count(db).await?,
        "Sample data saved"
    );
    Ok(())
}

async fn run_query(name: &str, qb: &QueryBuilder, db: &Database) {
    match qb.get_sql() {
        Ok(sql) => info!(query = name, sql = %sql, "Compiled query"),
        Err(e) => {
            warn!(query = name, error = %e, "Failed to compile query");
            return;
        }
    }
    match qb.get_many(db).await {
        Ok(entities) => info!(query = name, result = %to_pretty(&entities), "Query result"),
        Err(e) => error!(query = name, error = %e, "Query failed"),
    }
}

fn to_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
