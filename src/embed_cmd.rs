use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::store;

/// Backfill embeddings for fragments whose text is missing from the
/// content-addressed cache under the configured model.
pub async fn run_embed_pending(config: &Config, limit: Option<usize>, dry_run: bool) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;

    let pending = find_pending_texts(&pool, provider.model_name(), limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  texts needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all fragments up to date");
        pool.close().await;
        return Ok(());
    }

    let total = pending.len();
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(config.embedding.batch_size) {
        match store::ensure_embeddings(&pool, provider.as_ref(), batch).await {
            Ok(map) => {
                embedded += map.len() as u64;
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    println!("embed pending");
    println!("  total pending: {}", total);
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all cached embeddings and regenerate from fragment texts.
pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    sqlx::query("DELETE FROM embedding_cache").execute(&pool).await?;
    println!("embed rebuild — cleared existing embeddings");
    pool.close().await;

    run_embed_pending(config, None, false).await
}

/// Distinct fragment texts without a cached vector for this model.
async fn find_pending_texts(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<String>> {
    let limit_val = limit.unwrap_or(usize::MAX) as i64;

    let rows = sqlx::query(
        r#"
        SELECT DISTINCT f.text, f.text_hash
        FROM fragments f
        LEFT JOIN embedding_cache e ON e.text_hash = f.text_hash AND e.model = ?
        WHERE e.text_hash IS NULL
        ORDER BY f.text_hash
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|row| row.get("text")).collect())
}
