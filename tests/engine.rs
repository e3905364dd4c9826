//! End-to-end engine tests over an in-memory SQLite database with
//! deterministic provider fakes: a stub embedder with fixed vectors per
//! text and a scripted generator. Generation output is never assumed
//! bit-identical in spirit — assertions target schema conformance and
//! pipeline invariants, not exact wording.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lex_sentinel::assess::assess_changeset;
use lex_sentinel::config::Config;
use lex_sentinel::diff::compute_changeset;
use lex_sentinel::embedding::EmbeddingProvider;
use lex_sentinel::error::EngineResult;
use lex_sentinel::fragment::hash_text;
use lex_sentinel::generation::GenerationProvider;
use lex_sentinel::migrate::create_schema;
use lex_sentinel::models::{AssessmentStatus, BuildState, ChangeType};
use lex_sentinel::prompts::{OperationKind, PromptRegistry};
use lex_sentinel::summarize::{build_hierarchy, verify_tree_completeness};

/// Embedder with a fixed vector per known text; unknown texts share a
/// default direction (so generated summaries cluster together).
struct StubEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    default: Vec<f32>,
    calls: AtomicUsize,
}

impl StubEmbedder {
    fn new(entries: &[(&str, [f32; 3])]) -> Self {
        Self {
            vectors: entries
                .iter()
                .map(|(text, v)| (text.to_string(), v.to_vec()))
                .collect(),
            default: vec![0.5, 0.5, 0.5],
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| self.default.clone()))
            .collect())
    }
}

/// Generator returning a fixed valid reply, except for prompts containing
/// `poison`, which get unparseable output.
struct StubGenerator {
    reply: String,
    poison: Option<String>,
    calls: AtomicUsize,
}

impl StubGenerator {
    fn summaries() -> Self {
        Self {
            reply: r#"{"title": "Provisions", "summary": "Covers obligations and deadlines.", "relevant": true}"#
                .to_string(),
            poison: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn impacts(score: f64) -> Self {
        Self {
            reply: format!(r#"{{"score": {}, "justification": "The passage cites the changed article."}}"#, score),
            poison: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_poison(mut self, marker: &str) -> Self {
        self.poison = Some(marker.to_string());
        self
    }
}

#[async_trait]
impl GenerationProvider for StubGenerator {
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn complete(&self, prompt: &str) -> EngineResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref marker) = self.poison {
            if prompt.contains(marker.as_str()) {
                return Ok("### not a JSON object ###".to_string());
            }
        }
        Ok(self.reply.clone())
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

fn test_config() -> Config {
    let mut config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
    config.generation.malformed_retries = 0;
    config.generation.max_concurrent = 4;
    config
}

async fn insert_fragments(pool: &SqlitePool, owner_id: &str, texts: &[&str]) -> Vec<String> {
    let mut ids = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        let id = format!("{}-f{}", owner_id, i);
        sqlx::query(
            "INSERT INTO fragments (id, owner_id, seq_index, text, text_hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(i as i64)
        .bind(text)
        .bind(hash_text(text))
        .execute(pool)
        .await
        .unwrap();
        ids.push(id);
    }
    ids
}

async fn insert_act(pool: &SqlitePool, slug: &str, versions: &[&str]) {
    sqlx::query("INSERT INTO acts (id, slug, title, created_at) VALUES (?, ?, ?, 0)")
        .bind(format!("act-{}", slug))
        .bind(slug)
        .bind(format!("{} act", slug))
        .execute(pool)
        .await
        .unwrap();
    for (i, version_id) in versions.iter().enumerate() {
        sqlx::query(
            "INSERT INTO act_versions (id, act_id, version_no, ingested_at) VALUES (?, ?, ?, 0)",
        )
        .bind(version_id)
        .bind(format!("act-{}", slug))
        .bind((i + 1) as i64)
        .execute(pool)
        .await
        .unwrap();
    }
}

async fn insert_document(pool: &SqlitePool, id: &str, title: &str) {
    sqlx::query("INSERT INTO documents (id, title, ingested_at) VALUES (?, ?, 0)")
        .bind(id)
        .bind(title)
        .execute(pool)
        .await
        .unwrap();
}

// ============ Summarization ============

#[tokio::test]
async fn test_singletons_then_single_root_reduction() {
    let pool = test_pool().await;
    insert_fragments(&pool, "v1", &["alpha text", "beta text", "gamma text"]).await;

    // Orthogonal fragment vectors: no pair clears any positive threshold.
    let embedder = StubEmbedder::new(&[
        ("alpha text", [1.0, 0.0, 0.0]),
        ("beta text", [0.0, 1.0, 0.0]),
        ("gamma text", [0.0, 0.0, 1.0]),
    ]);
    let generator = Arc::new(StubGenerator::summaries());
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let mut config = test_config();
    config.clustering.min_similarity = 0.95;

    let outcome = build_hierarchy(
        &pool,
        &embedder,
        generator.clone(),
        registry,
        &config,
        "v1",
        "Test Act",
        OperationKind::ClusterSummary,
    )
    .await
    .unwrap();

    // 3 singleton clusters summarized, then one reduction over the three
    // identical summary vectors.
    assert_eq!(outcome.state, BuildState::Done);
    assert_eq!(outcome.levels, 2);
    assert_eq!(outcome.clusters_summarized, 4);
    assert_eq!(outcome.clusters_failed, 0);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 4);
    assert!(outcome.root.is_some());

    assert!(verify_tree_completeness(&pool, &outcome.build_id).await.unwrap());
}

#[tokio::test]
async fn test_failed_cluster_fails_build_but_keeps_siblings() {
    let pool = test_pool().await;
    insert_fragments(&pool, "v1", &["good one", "good two", "poisoned text"]).await;

    let embedder = StubEmbedder::new(&[
        ("good one", [1.0, 0.0, 0.0]),
        ("good two", [0.0, 1.0, 0.0]),
        ("poisoned text", [0.0, 0.0, 1.0]),
    ]);
    let generator = Arc::new(StubGenerator::summaries().with_poison("poisoned text"));
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let mut config = test_config();
    config.clustering.min_similarity = 0.95;

    let outcome = build_hierarchy(
        &pool,
        &embedder,
        generator,
        registry,
        &config,
        "v1",
        "Test Act",
        OperationKind::ClusterSummary,
    )
    .await
    .unwrap();

    // The poisoned cluster is terminal after retries; its parent is never
    // summarized, the siblings' summaries survive.
    assert_eq!(outcome.state, BuildState::Failed);
    assert_eq!(outcome.clusters_failed, 1);
    assert_eq!(outcome.clusters_summarized, 2);
    assert!(outcome.root.is_none());

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM summaries WHERE superseded = 0")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(stored, 2);

    let (state, error): (String, Option<String>) =
        sqlx::query_as("SELECT state, error FROM hierarchy_builds WHERE id = ?")
            .bind(&outcome.build_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(state, "failed");
    assert!(error.unwrap_or_default().contains("failed"));
}

#[tokio::test]
async fn test_rebuild_supersedes_previous_summaries() {
    let pool = test_pool().await;
    insert_fragments(&pool, "v1", &["only fragment"]).await;

    let embedder = StubEmbedder::new(&[("only fragment", [1.0, 0.0, 0.0])]);
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let config = test_config();

    for _ in 0..2 {
        build_hierarchy(
            &pool,
            &embedder,
            Arc::new(StubGenerator::summaries()),
            registry.clone(),
            &config,
            "v1",
            "Test Act",
            OperationKind::ClusterSummary,
        )
        .await
        .unwrap();
    }

    let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM summaries WHERE superseded = 0")
        .fetch_one(&pool)
        .await
        .unwrap();
    let superseded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM summaries WHERE superseded = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(live, 1);
    assert_eq!(superseded, 1);

    // Clusters are replaced wholesale, not accumulated.
    let builds_with_clusters: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT build_id) FROM clusters")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(builds_with_clusters, 1);
}

#[tokio::test]
async fn test_identical_text_embedded_once_across_builds() {
    let pool = test_pool().await;
    insert_fragments(&pool, "v1", &["alpha text", "beta text"]).await;
    insert_fragments(&pool, "v2", &["alpha text", "beta text"]).await;

    let embedder = StubEmbedder::new(&[
        ("alpha text", [1.0, 0.0, 0.0]),
        ("beta text", [0.0, 1.0, 0.0]),
    ]);
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let config = test_config();

    for owner in ["v1", "v2"] {
        build_hierarchy(
            &pool,
            &embedder,
            Arc::new(StubGenerator::summaries()),
            registry.clone(),
            &config,
            owner,
            "Test Act",
            OperationKind::ClusterSummary,
        )
        .await
        .unwrap();
    }

    // 2 fragment texts + 1 shared summary text (identical replies):
    // the second build hits the cache for everything.
    let cached: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(cached as usize, embedder.calls.load(Ordering::SeqCst));
}

// ============ Diff ============

#[tokio::test]
async fn test_changeset_persisted_and_stable() {
    let pool = test_pool().await;
    insert_act(&pool, "vat", &["v1", "v2"]).await;
    insert_fragments(&pool, "v1", &["Art. 1: X", "Art. 2: Y"]).await;
    insert_fragments(&pool, "v2", &["Art. 1: X", "Art. 2: Z"]).await;

    let first = compute_changeset(&pool, "act-vat", "v1", "v2").await.unwrap();
    assert_eq!(first.entries.len(), 1);
    assert_eq!(first.entries[0].change_type, ChangeType::Modified);

    // Versions are immutable, so recomputation returns the stored diff.
    let second = compute_changeset(&pool, "act-vat", "v1", "v2").await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.entries.len(), 1);
}

// ============ Impact assessment ============

async fn scenario_pool() -> (SqlitePool, StubEmbedder) {
    let pool = test_pool().await;
    insert_act(&pool, "vat", &["v1", "v2"]).await;
    insert_fragments(&pool, "v1", &["Art. 1: X", "Art. 2: Y"]).await;
    insert_fragments(&pool, "v2", &["Art. 1: X", "Art. 2: Z"]).await;
    insert_document(&pool, "doc-1", "Invoicing policy").await;
    insert_fragments(&pool, "doc-1", &["Policy referencing Art. 2"]).await;

    // The changed article and the policy point the same way; Art. 1 is
    // orthogonal.
    let embedder = StubEmbedder::new(&[
        ("Art. 1: X", [1.0, 0.0, 0.0]),
        ("Art. 2: Y", [0.0, 1.0, 0.0]),
        ("Art. 2: Z", [0.0, 0.9, 0.1]),
        ("Policy referencing Art. 2", [0.0, 1.0, 0.0]),
    ]);
    (pool, embedder)
}

#[tokio::test]
async fn test_modified_article_scores_against_referencing_policy() {
    let (pool, embedder) = scenario_pool().await;
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let config = test_config();

    // Summarize the document so it becomes a retrieval candidate.
    build_hierarchy(
        &pool,
        &embedder,
        Arc::new(StubGenerator::summaries()),
        registry.clone(),
        &config,
        "doc-1",
        "Invoicing policy",
        OperationKind::DocumentSummary,
    )
    .await
    .unwrap();

    let changeset = compute_changeset(&pool, "act-vat", "v1", "v2").await.unwrap();
    assert_eq!(changeset.entries.len(), 1);

    let outcome = assess_changeset(
        &pool,
        &embedder,
        Arc::new(StubGenerator::impacts(0.85)),
        registry,
        &config,
        &changeset,
        "VAT act",
    )
    .await
    .unwrap();

    assert_eq!(outcome.pairs_selected, 1);
    assert_eq!(outcome.assessed_ok, 1);

    let (score, status): (f64, String) = sqlx::query_as(
        "SELECT score, status FROM impact_assessments WHERE document_id = 'doc-1'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "ok");
    assert!(score >= 0.5, "expected likely-impact score, got {}", score);
    assert!((0.0..=1.0).contains(&score));
}

#[tokio::test]
async fn test_assessment_is_resumable_without_duplicates() {
    let (pool, embedder) = scenario_pool().await;
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let config = test_config();

    build_hierarchy(
        &pool,
        &embedder,
        Arc::new(StubGenerator::summaries()),
        registry.clone(),
        &config,
        "doc-1",
        "Invoicing policy",
        OperationKind::DocumentSummary,
    )
    .await
    .unwrap();

    let changeset = compute_changeset(&pool, "act-vat", "v1", "v2").await.unwrap();

    let first = assess_changeset(
        &pool,
        &embedder,
        Arc::new(StubGenerator::impacts(0.7)),
        registry.clone(),
        &config,
        &changeset,
        "VAT act",
    )
    .await
    .unwrap();
    assert_eq!(first.assessed_ok, 1);

    // Re-running after a "crash" must only fill gaps, never duplicate.
    let second = assess_changeset(
        &pool,
        &embedder,
        Arc::new(StubGenerator::impacts(0.7)),
        registry,
        &config,
        &changeset,
        "VAT act",
    )
    .await
    .unwrap();
    assert_eq!(second.pairs_existing, 1);
    assert_eq!(second.assessed_ok, 0);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM impact_assessments")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn test_unjudgeable_pair_flagged_insufficient_with_zero_score() {
    let pool = test_pool().await;
    insert_act(&pool, "vat", &["v1", "v2"]).await;
    insert_fragments(&pool, "v1", &["Art. 1: X", "Art. 2: Y"]).await;
    insert_fragments(&pool, "v2", &["Art. 1: X", "Art. 2: Z"]).await;

    // Document with a completed hierarchy but no fragments on record:
    // there is no passage to judge against.
    insert_document(&pool, "doc-empty", "Orphaned policy").await;
    sqlx::query(
        "INSERT INTO hierarchy_builds (id, owner_id, state, last_level, started_at, finished_at) \
         VALUES ('b1', 'doc-empty', 'done', 0, 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO clusters (id, build_id, owner_id, level, member_ids, centroid) \
         VALUES ('c1', 'b1', 'doc-empty', 0, '[]', X'')",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO summaries (id, cluster_id, owner_id, build_id, source_level, title, body, relevant, superseded, created_at) \
         VALUES ('s1', 'c1', 'doc-empty', 'b1', 0, 'Orphaned', 'References Art. 2 duties.', 1, 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let embedder = StubEmbedder::new(&[
        ("Art. 2: Y", [0.0, 1.0, 0.0]),
        ("Art. 2: Z", [0.0, 1.0, 0.0]),
        ("References Art. 2 duties.", [0.0, 1.0, 0.0]),
    ]);
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let config = test_config();

    let changeset = compute_changeset(&pool, "act-vat", "v1", "v2").await.unwrap();
    let generator = Arc::new(StubGenerator::impacts(0.9));
    let outcome = assess_changeset(
        &pool,
        &embedder,
        generator.clone(),
        registry,
        &config,
        &changeset,
        "VAT act",
    )
    .await
    .unwrap();

    assert_eq!(outcome.assessed_insufficient, 1);
    assert_eq!(outcome.assessed_ok, 0);
    // Unjudgeable pairs never reach the generation collaborator.
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

    let (score, status): (f64, String) =
        sqlx::query_as("SELECT score, status FROM impact_assessments LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, AssessmentStatus::Insufficient.as_str());
    assert_eq!(score, 0.0);
}

#[tokio::test]
async fn test_irrelevant_entries_skip_assessment() {
    let (pool, embedder) = scenario_pool().await;
    let registry = Arc::new(PromptRegistry::load().unwrap());
    let config = test_config();

    build_hierarchy(
        &pool,
        &embedder,
        Arc::new(StubGenerator::summaries()),
        registry.clone(),
        &config,
        "doc-1",
        "Invoicing policy",
        OperationKind::DocumentSummary,
    )
    .await
    .unwrap();

    // Mark every v2 fragment's level-0 cluster irrelevant by building a
    // hierarchy whose generator flags everything out of scope.
    let irrelevant = Arc::new(StubGenerator {
        reply: r#"{"title": "Noise", "summary": "Publication boilerplate.", "relevant": false}"#
            .to_string(),
        poison: None,
        calls: AtomicUsize::new(0),
    });
    build_hierarchy(
        &pool,
        &embedder,
        irrelevant,
        registry.clone(),
        &config,
        "v2",
        "VAT act",
        OperationKind::ClusterSummary,
    )
    .await
    .unwrap();

    let changeset = compute_changeset(&pool, "act-vat", "v1", "v2").await.unwrap();
    let outcome = assess_changeset(
        &pool,
        &embedder,
        Arc::new(StubGenerator::impacts(0.9)),
        registry,
        &config,
        &changeset,
        "VAT act",
    )
    .await
    .unwrap();

    assert_eq!(outcome.entries_skipped_irrelevant, 1);
    assert_eq!(outcome.pairs_selected, 0);
}
