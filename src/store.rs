//! Fragment store adapter.
//!
//! Exposes ordered, versioned fragments of an act or document plus the
//! content-addressed embedding cache. Embeddings are keyed by the SHA-256
//! hash of the text (and the model name), never by fragment identity, so
//! identical text anywhere in the corpus is embedded exactly once.
//!
//! The adapter performs no retries of its own: transient HTTP retries
//! belong to the providers, and storage failures surface as
//! `CollaboratorUnavailable` so the enclosing operation fails atomically.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingProvider};
use crate::error::EngineResult;
use crate::fragment::hash_text;
use crate::models::{Act, ActVersion, Document, Fragment};

/// List an owner's fragments in reading order.
pub async fn list_fragments(pool: &SqlitePool, owner_id: &str) -> EngineResult<Vec<Fragment>> {
    let rows = sqlx::query(
        "SELECT id, owner_id, seq_index, text, text_hash FROM fragments \
         WHERE owner_id = ? ORDER BY seq_index",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Fragment {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            seq_index: row.get("seq_index"),
            text: row.get("text"),
            text_hash: row.get("text_hash"),
        })
        .collect())
}

/// Look up a cached embedding by content hash.
pub async fn cached_embedding(
    pool: &SqlitePool,
    text_hash: &str,
    model: &str,
) -> EngineResult<Option<Vec<f32>>> {
    let blob: Option<Vec<u8>> = sqlx::query_scalar(
        "SELECT embedding FROM embedding_cache WHERE text_hash = ? AND model = ?",
    )
    .bind(text_hash)
    .bind(model)
    .fetch_optional(pool)
    .await?;

    Ok(blob.map(|b| blob_to_vec(&b)))
}

/// Fetch the embedding for one text, computing and caching it on a miss.
pub async fn get_or_compute_embedding(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> EngineResult<Vec<f32>> {
    let hash = hash_text(text);
    let mut map = ensure_embeddings(pool, provider, &[text.to_string()]).await?;
    // ensure_embeddings always yields an entry per distinct input hash
    Ok(map.remove(&hash).unwrap_or_default())
}

/// Ensure every text has a cached embedding; returns hash → vector.
///
/// Cache misses are embedded in provider-sized batches and inserted
/// before the map is returned. Duplicate texts collapse to one provider
/// input.
pub async fn ensure_embeddings(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> EngineResult<HashMap<String, Vec<f32>>> {
    let model = provider.model_name().to_string();
    let mut result: HashMap<String, Vec<f32>> = HashMap::new();
    let mut missing: Vec<(String, String)> = Vec::new();

    for text in texts {
        let hash = hash_text(text);
        if result.contains_key(&hash) || missing.iter().any(|(h, _)| h == &hash) {
            continue;
        }
        match cached_embedding(pool, &hash, &model).await? {
            Some(vec) => {
                result.insert(hash, vec);
            }
            None => missing.push((hash, text.clone())),
        }
    }

    if missing.is_empty() {
        return Ok(result);
    }

    let batch_texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
    let vectors = provider.embed(&batch_texts).await?;

    let now = chrono::Utc::now().timestamp();
    for ((hash, _), vector) in missing.iter().zip(vectors.iter()) {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (text_hash, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(text_hash, model) DO NOTHING
            "#,
        )
        .bind(hash)
        .bind(&model)
        .bind(provider.dims() as i64)
        .bind(vec_to_blob(vector))
        .bind(now)
        .execute(pool)
        .await?;

        result.insert(hash.clone(), vector.clone());
    }

    Ok(result)
}

/// Look up an act by its stable slug.
pub async fn find_act_by_slug(pool: &SqlitePool, slug: &str) -> EngineResult<Option<Act>> {
    let row = sqlx::query_as::<_, (String, String, String, i64)>(
        "SELECT id, slug, title, created_at FROM acts WHERE slug = ?",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, slug, title, created_at)| Act {
        id,
        slug,
        title,
        created_at,
    }))
}

/// Look up one version of an act by its 1-based number.
pub async fn find_version(
    pool: &SqlitePool,
    act_id: &str,
    version_no: i64,
) -> EngineResult<Option<ActVersion>> {
    let row = sqlx::query_as::<_, (String, String, i64, Option<String>, i64)>(
        "SELECT id, act_id, version_no, published_at, ingested_at FROM act_versions \
         WHERE act_id = ? AND version_no = ?",
    )
    .bind(act_id)
    .bind(version_no)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, act_id, version_no, published_at, ingested_at)| ActVersion {
        id,
        act_id,
        version_no,
        published_at,
        ingested_at,
    }))
}

/// List an act's versions in chronological (append) order.
pub async fn list_versions(pool: &SqlitePool, act_id: &str) -> EngineResult<Vec<ActVersion>> {
    let rows = sqlx::query_as::<_, (String, String, i64, Option<String>, i64)>(
        "SELECT id, act_id, version_no, published_at, ingested_at FROM act_versions \
         WHERE act_id = ? ORDER BY version_no",
    )
    .bind(act_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, act_id, version_no, published_at, ingested_at)| ActVersion {
            id,
            act_id,
            version_no,
            published_at,
            ingested_at,
        })
        .collect())
}

/// Look up a document by id.
pub async fn find_document(pool: &SqlitePool, document_id: &str) -> EngineResult<Option<Document>> {
    let row = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT id, title, ingested_at FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, title, ingested_at)| Document {
        id,
        title,
        ingested_at,
    }))
}

/// Embeddings for a set of fragments, keyed by fragment id.
pub async fn fragment_embeddings(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    fragments: &[Fragment],
) -> EngineResult<HashMap<String, Vec<f32>>> {
    let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
    let by_hash = ensure_embeddings(pool, provider, &texts).await?;

    Ok(fragments
        .iter()
        .filter_map(|f| {
            by_hash
                .get(&f.text_hash)
                .map(|v| (f.id.clone(), v.clone()))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::migrate::create_schema;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        texts_embedded: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_embedded: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let len = t.len() as f32;
                    vec![len, len + 1.0, len + 2.0, len + 3.0]
                })
                .collect())
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_reembedding_hits_cache() {
        let pool = test_pool().await;
        let embedder = CountingEmbedder::new();

        let v1 = get_or_compute_embedding(&pool, &embedder, "Art. 1. Text.")
            .await
            .unwrap();
        let v2 = get_or_compute_embedding(&pool, &embedder, "Art. 1. Text.")
            .await
            .unwrap();

        assert_eq!(v1, v2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_texts_collapse_to_one_input() {
        let pool = test_pool().await;
        let embedder = CountingEmbedder::new();

        let texts = vec![
            "same".to_string(),
            "same".to_string(),
            "other".to_string(),
        ];
        let map = ensure_embeddings(&pool, &embedder, &texts).await.unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_is_content_addressed_across_owners() {
        let pool = test_pool().await;
        let embedder = CountingEmbedder::new();

        // Same text under two different fragment identities
        let frag_a = Fragment {
            id: "a".into(),
            owner_id: "v1".into(),
            seq_index: 0,
            text: "shared text".into(),
            text_hash: hash_text("shared text"),
        };
        let frag_b = Fragment {
            id: "b".into(),
            owner_id: "v2".into(),
            seq_index: 0,
            text: "shared text".into(),
            text_hash: hash_text("shared text"),
        };

        let map_a = fragment_embeddings(&pool, &embedder, &[frag_a]).await.unwrap();
        let map_b = fragment_embeddings(&pool, &embedder, &[frag_b]).await.unwrap();

        assert_eq!(map_a["a"], map_b["b"]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_fragments_ordered() {
        let pool = test_pool().await;

        for (i, text) in ["b", "a", "c"].iter().enumerate() {
            sqlx::query(
                "INSERT INTO fragments (id, owner_id, seq_index, text, text_hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(format!("f{}", i))
            .bind("owner")
            .bind(i as i64)
            .bind(text)
            .bind(hash_text(text))
            .execute(&pool)
            .await
            .unwrap();
        }

        let fragments = list_fragments(&pool, "owner").await.unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].seq_index, 0);
        assert_eq!(fragments[2].seq_index, 2);
    }
}
