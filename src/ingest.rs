//! Ingestion pipeline orchestration.
//!
//! Coordinates the flow for new act versions and documents: plain-text
//! file → fragment splitting → storage → inline embedding. Source-format
//! parsing (PDF, HTML) happens upstream; this module only ever sees text.
//!
//! Act versions are append-only snapshots: re-ingesting an act creates
//! the next version rather than touching previous ones. Inline embedding
//! is non-fatal; missing vectors can be backfilled with `lex embed
//! pending`.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::fragment;
use crate::models::Fragment;
use crate::store;

pub async fn run_ingest_act(
    config: &Config,
    slug: &str,
    title: &str,
    file: &std::path::Path,
    published: Option<String>,
) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read act text: {}", file.display()))?;

    let pool = db::connect(config).await?;
    let now = chrono::Utc::now().timestamp();

    // Upsert the act by slug; versions are append-only below it.
    let act_id = match store::find_act_by_slug(&pool, slug).await? {
        Some(act) => act.id,
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query("INSERT INTO acts (id, slug, title, created_at) VALUES (?, ?, ?, ?)")
                .bind(&id)
                .bind(slug)
                .bind(title)
                .bind(now)
                .execute(&pool)
                .await?;
            id
        }
    };

    let next_no: i64 = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(version_no) FROM act_versions WHERE act_id = ?",
    )
    .bind(&act_id)
    .fetch_one(&pool)
    .await?
    .unwrap_or(0)
        + 1;

    let version_id = Uuid::new_v4().to_string();
    let fragments = fragment::split_act(&version_id, &text);
    if fragments.is_empty() {
        bail!("Act text produced no fragments: {}", file.display());
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO act_versions (id, act_id, version_no, published_at, ingested_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&version_id)
    .bind(&act_id)
    .bind(next_no)
    .bind(&published)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    insert_fragments(&mut tx, &fragments).await?;
    tx.commit().await?;

    info!(act = slug, version = next_no, fragments = fragments.len(), "ingested act version");

    let (embedded, pending) = embed_inline(config, &pool, &fragments).await;

    println!("ingest act {}", slug);
    println!("  version: {}", next_no);
    println!("  fragments written: {}", fragments.len());
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", embedded);
        println!("  embeddings pending: {}", pending);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

pub async fn run_ingest_doc(config: &Config, title: &str, file: &std::path::Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read document text: {}", file.display()))?;

    let pool = db::connect(config).await?;
    let now = chrono::Utc::now().timestamp();

    let document_id = Uuid::new_v4().to_string();
    let fragments =
        fragment::split_document(&document_id, &text, config.fragmenting.max_fragment_chars);
    if fragments.is_empty() {
        bail!("Document text produced no fragments: {}", file.display());
    }

    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO documents (id, title, ingested_at) VALUES (?, ?, ?)")
        .bind(&document_id)
        .bind(title)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    insert_fragments(&mut tx, &fragments).await?;
    tx.commit().await?;

    info!(document = %document_id, fragments = fragments.len(), "ingested document");

    let (embedded, pending) = embed_inline(config, &pool, &fragments).await;

    println!("ingest doc \"{}\"", title);
    println!("  id: {}", document_id);
    println!("  fragments written: {}", fragments.len());
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", embedded);
        println!("  embeddings pending: {}", pending);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

async fn insert_fragments(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fragments: &[Fragment],
) -> Result<()> {
    for fragment in fragments {
        sqlx::query(
            "INSERT INTO fragments (id, owner_id, seq_index, text, text_hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&fragment.id)
        .bind(&fragment.owner_id)
        .bind(fragment.seq_index)
        .bind(&fragment.text)
        .bind(&fragment.text_hash)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Embed fragments during ingest. Non-fatal on failure: whatever is
/// missed stays pending for the backfill command.
async fn embed_inline(config: &Config, pool: &SqlitePool, fragments: &[Fragment]) -> (u64, u64) {
    if !config.embedding.is_enabled() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Warning: could not create embedding provider: {}", e);
            return (0, fragments.len() as u64);
        }
    };

    let mut embedded = 0u64;
    let mut pending = 0u64;

    for batch in fragments.chunks(config.embedding.batch_size) {
        match store::fragment_embeddings(pool, provider.as_ref(), batch).await {
            Ok(map) => {
                embedded += map.len() as u64;
                pending += (batch.len() - map.len()) as u64;
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                pending += batch.len() as u64;
            }
        }
    }

    (embedded, pending)
}
