use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS acts (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS act_versions (
            id TEXT PRIMARY KEY,
            act_id TEXT NOT NULL,
            version_no INTEGER NOT NULL,
            published_at TEXT,
            ingested_at INTEGER NOT NULL,
            UNIQUE(act_id, version_no),
            FOREIGN KEY (act_id) REFERENCES acts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // owner_id is an act_versions.id or documents.id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fragments (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            seq_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            UNIQUE(owner_id, seq_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content-addressed: one row per distinct (text_hash, model), never
    // keyed by fragment identity.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            text_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (text_hash, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hierarchy_builds (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            state TEXT NOT NULL,
            last_level INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id TEXT PRIMARY KEY,
            build_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            level INTEGER NOT NULL,
            member_ids TEXT NOT NULL,
            centroid BLOB NOT NULL,
            FOREIGN KEY (build_id) REFERENCES hierarchy_builds(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS summaries (
            id TEXT PRIMARY KEY,
            cluster_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            build_id TEXT NOT NULL,
            source_level INTEGER NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            relevant INTEGER NOT NULL,
            superseded INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS changesets (
            id TEXT PRIMARY KEY,
            act_id TEXT NOT NULL,
            from_version_id TEXT NOT NULL,
            to_version_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(from_version_id, to_version_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_entries (
            id TEXT PRIMARY KEY,
            changeset_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            change_type TEXT NOT NULL,
            before_fragment_id TEXT,
            after_fragment_id TEXT,
            FOREIGN KEY (changeset_id) REFERENCES changesets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS impact_assessments (
            id TEXT PRIMARY KEY,
            change_entry_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            score REAL NOT NULL,
            justification TEXT NOT NULL,
            status TEXT NOT NULL,
            evaluated_at INTEGER NOT NULL,
            UNIQUE(change_entry_id, document_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_owner ON fragments(owner_id, seq_index)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_clusters_build ON clusters(build_id, level)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_summaries_owner ON summaries(owner_id, superseded)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_owner ON hierarchy_builds(owner_id, started_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_changeset ON change_entries(changeset_id, position)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assessments_entry ON impact_assessments(change_entry_id)")
        .execute(pool)
        .await?;

    Ok(())
}
