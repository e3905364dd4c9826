//! Impact assessment engine.
//!
//! For each relevant change entry, retrieves the top-K internal documents
//! by similarity between the changed fragment's embedding and each
//! document's root-summary embedding, then issues one generation request
//! per (change, document) pair. Responses carry a score in [0.00, 1.00]
//! with fixed band semantics (1.00 certain, ≥0.50 likely, <0.50 unlikely,
//! 0.00 none-or-unjudgeable) and a bounded justification.
//!
//! Every selected pair produces exactly one row: `ok` for a scored
//! judgment, `insufficient` when the inputs needed to judge are missing
//! (no generation call is made; score 0.00), `failed` when generation
//! exhausted its retries (score 0.00, the error as justification).
//! Rows are keyed by (change_entry_id, document_id), so re-running after
//! a crash fills gaps without duplicating work.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::generation::{request_impact, GenerationProvider};
use crate::models::{AssessmentStatus, ChangeEntry, Changeset, ImpactAssessment};
use crate::prompts::PromptRegistry;
use crate::store;
use crate::summarize;

/// Aggregate counts for one assessment run.
#[derive(Debug, Clone, Default)]
pub struct AssessOutcome {
    pub entries_considered: usize,
    pub entries_skipped_irrelevant: usize,
    pub pairs_selected: usize,
    pub pairs_existing: usize,
    pub assessed_ok: usize,
    pub assessed_insufficient: usize,
    pub assessed_failed: usize,
}

struct DocumentCandidate {
    id: String,
    title: String,
    summary: String,
    root_embedding: Vec<f32>,
}

struct PairJob {
    entry_id: String,
    document_id: String,
    fields: Option<HashMap<&'static str, String>>,
    insufficient_reason: Option<String>,
}

/// Run impact assessment for every entry of a changeset.
#[allow(clippy::too_many_arguments)]
pub async fn assess_changeset(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    generator: Arc<dyn GenerationProvider>,
    registry: Arc<PromptRegistry>,
    config: &Config,
    changeset: &Changeset,
    act_title: &str,
) -> EngineResult<AssessOutcome> {
    let mut outcome = AssessOutcome::default();

    // Relevance comes from the changed fragment's level-0 cluster in the
    // owning version's latest completed hierarchy; fragments without
    // coverage count as relevant.
    let relevance_before = summarize::fragment_relevance(pool, &changeset.from_version_id).await?;
    let relevance_after = summarize::fragment_relevance(pool, &changeset.to_version_id).await?;

    let act_summary = summarize::root_summary(pool, &changeset.to_version_id)
        .await?
        .map(|s| s.body)
        .unwrap_or_default();

    let candidates = document_candidates(pool, embedder).await?;
    if candidates.is_empty() {
        info!("no documents with completed summaries; nothing to assess");
        return Ok(outcome);
    }

    let fragment_texts = load_fragment_texts(pool, changeset).await?;

    let mut jobs: Vec<PairJob> = Vec::new();

    for entry in &changeset.entries {
        outcome.entries_considered += 1;

        if !entry_is_relevant(entry, &relevance_before, &relevance_after) {
            outcome.entries_skipped_irrelevant += 1;
            continue;
        }

        // The fragment that anchors retrieval: the new text when present,
        // else the removed text.
        let anchor_id = entry
            .after_fragment_id
            .as_deref()
            .or(entry.before_fragment_id.as_deref());
        let Some(anchor_id) = anchor_id else {
            continue;
        };
        let Some(anchor_text) = fragment_texts.get(anchor_id) else {
            continue;
        };

        let anchor_embedding =
            store::get_or_compute_embedding(pool, embedder, anchor_text).await?;

        let mut ranked: Vec<(&DocumentCandidate, f32)> = candidates
            .iter()
            .map(|c| (c, cosine_similarity(&anchor_embedding, &c.root_embedding)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(config.assessment.top_k);

        let changed_text = entry
            .before_fragment_id
            .as_deref()
            .and_then(|id| fragment_texts.get(id))
            .cloned()
            .unwrap_or_else(|| "(not present in the older version)".to_string());
        let changing_text = entry
            .after_fragment_id
            .as_deref()
            .and_then(|id| fragment_texts.get(id))
            .cloned()
            .unwrap_or_else(|| "(removed in the newer version)".to_string());

        for (candidate, _) in ranked {
            outcome.pairs_selected += 1;

            if assessment_exists(pool, &entry.id, &candidate.id).await? {
                outcome.pairs_existing += 1;
                continue;
            }

            let doc_text =
                best_document_passage(pool, embedder, &candidate.id, &anchor_embedding).await?;

            // Judging requires a document summary and a passage; without
            // them the pair is explicitly unjudgeable.
            let job = if candidate.summary.trim().is_empty() || doc_text.is_none() {
                PairJob {
                    entry_id: entry.id.clone(),
                    document_id: candidate.id.clone(),
                    fields: None,
                    insufficient_reason: Some(format!(
                        "document {} lacks {} for judgment",
                        candidate.id,
                        if doc_text.is_none() { "fragments" } else { "a summary" }
                    )),
                }
            } else {
                let fields: HashMap<&'static str, String> = [
                    ("act_title", act_title.to_string()),
                    ("act_summary", act_summary.clone()),
                    ("change_type", entry.change_type.as_str().to_string()),
                    ("changed_text", changed_text.clone()),
                    ("changing_text", changing_text.clone()),
                    ("doc_title", candidate.title.clone()),
                    ("doc_summary", candidate.summary.clone()),
                    ("doc_text", doc_text.unwrap_or_default()),
                ]
                .into_iter()
                .collect();
                PairJob {
                    entry_id: entry.id.clone(),
                    document_id: candidate.id.clone(),
                    fields: Some(fields),
                    insufficient_reason: None,
                }
            };
            jobs.push(job);
        }
    }

    run_jobs(pool, generator, registry, config, jobs, &mut outcome).await?;

    info!(
        considered = outcome.entries_considered,
        skipped = outcome.entries_skipped_irrelevant,
        pairs = outcome.pairs_selected,
        ok = outcome.assessed_ok,
        insufficient = outcome.assessed_insufficient,
        failed = outcome.assessed_failed,
        "impact assessment finished"
    );
    Ok(outcome)
}

fn entry_is_relevant(
    entry: &ChangeEntry,
    relevance_before: &HashMap<String, bool>,
    relevance_after: &HashMap<String, bool>,
) -> bool {
    let after = entry
        .after_fragment_id
        .as_deref()
        .map(|id| relevance_after.get(id).copied().unwrap_or(true));
    let before = entry
        .before_fragment_id
        .as_deref()
        .map(|id| relevance_before.get(id).copied().unwrap_or(true));
    after.or(before).unwrap_or(true)
}

/// Documents with a completed hierarchy, keyed for retrieval by their
/// root-summary embedding. Irrelevant-flagged roots are excluded.
async fn document_candidates(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
) -> EngineResult<Vec<DocumentCandidate>> {
    let docs = sqlx::query_as::<_, (String, String)>("SELECT id, title FROM documents")
        .fetch_all(pool)
        .await?;

    let mut candidates = Vec::new();
    for (id, title) in docs {
        let Some(root) = summarize::root_summary(pool, &id).await? else {
            continue;
        };
        if !root.relevant {
            continue;
        }
        let embedding = store::get_or_compute_embedding(pool, embedder, &root.body).await?;
        candidates.push(DocumentCandidate {
            id,
            title,
            summary: root.body,
            root_embedding: embedding,
        });
    }
    Ok(candidates)
}

async fn load_fragment_texts(
    pool: &SqlitePool,
    changeset: &Changeset,
) -> EngineResult<HashMap<String, String>> {
    let mut texts = HashMap::new();
    for owner in [&changeset.from_version_id, &changeset.to_version_id] {
        for fragment in store::list_fragments(pool, owner).await? {
            texts.insert(fragment.id, fragment.text);
        }
    }
    Ok(texts)
}

async fn assessment_exists(
    pool: &SqlitePool,
    change_entry_id: &str,
    document_id: &str,
) -> EngineResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM impact_assessments WHERE change_entry_id = ? AND document_id = ?",
    )
    .bind(change_entry_id)
    .bind(document_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// The document fragment most similar to the change, for the prompt's
/// `doc_text` field.
async fn best_document_passage(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    document_id: &str,
    anchor_embedding: &[f32],
) -> EngineResult<Option<String>> {
    let fragments = store::list_fragments(pool, document_id).await?;
    if fragments.is_empty() {
        return Ok(None);
    }

    let embeddings = store::fragment_embeddings(pool, embedder, &fragments).await?;
    let best = fragments
        .iter()
        .filter_map(|f| {
            embeddings
                .get(&f.id)
                .map(|v| (f, cosine_similarity(anchor_embedding, v)))
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    Ok(best.map(|(f, _)| f.text.clone()))
}

/// Execute the pair jobs concurrently and persist one row per pair.
async fn run_jobs(
    pool: &SqlitePool,
    generator: Arc<dyn GenerationProvider>,
    registry: Arc<PromptRegistry>,
    config: &Config,
    jobs: Vec<PairJob>,
    outcome: &mut AssessOutcome,
) -> EngineResult<()> {
    let semaphore = Arc::new(Semaphore::new(config.generation.max_concurrent.max(1)));
    let malformed_retries = config.generation.malformed_retries;

    let mut join_set: JoinSet<(String, String, Result<crate::generation::ImpactResponse, EngineError>)> =
        JoinSet::new();

    for job in jobs {
        let generator = Arc::clone(&generator);
        let registry = Arc::clone(&registry);
        let semaphore = Arc::clone(&semaphore);

        join_set.spawn(async move {
            if let Some(reason) = job.insufficient_reason {
                return (
                    job.entry_id,
                    job.document_id,
                    Err(EngineError::InsufficientData(reason)),
                );
            }
            let _permit = semaphore.acquire_owned().await;
            let fields = job.fields.unwrap_or_default();
            let result =
                request_impact(generator.as_ref(), &registry, &fields, malformed_retries).await;
            (job.entry_id, job.document_id, result)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        let (entry_id, document_id, result) = joined.map_err(|e| {
            EngineError::CollaboratorUnavailable {
                collaborator: "generation",
                detail: format!("assessment task panicked: {}", e),
            }
        })?;

        let (score, justification, status) = match result {
            Ok(response) => {
                outcome.assessed_ok += 1;
                (response.score, response.justification, AssessmentStatus::Ok)
            }
            Err(EngineError::InsufficientData(reason)) => {
                outcome.assessed_insufficient += 1;
                (0.0, reason, AssessmentStatus::Insufficient)
            }
            Err(e) => {
                warn!(entry = %entry_id, document = %document_id, error = %e, "assessment pair failed");
                outcome.assessed_failed += 1;
                (0.0, e.to_string(), AssessmentStatus::Failed)
            }
        };

        insert_assessment(pool, &entry_id, &document_id, score, &justification, status).await?;
    }

    Ok(())
}

async fn insert_assessment(
    pool: &SqlitePool,
    change_entry_id: &str,
    document_id: &str,
    score: f64,
    justification: &str,
    status: AssessmentStatus,
) -> EngineResult<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO impact_assessments (id, change_entry_id, document_id, score, justification, status, evaluated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(change_entry_id, document_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(change_entry_id)
    .bind(document_id)
    .bind(score)
    .bind(justification)
    .bind(status.as_str())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn run_assess(
    config: &Config,
    slug: &str,
    from: i64,
    to: i64,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;

    let act = store::find_act_by_slug(&pool, slug)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown act: {}", slug))?;
    let from_version = store::find_version(&pool, &act.id, from)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Act {} has no version {}", slug, from))?;
    let to_version = store::find_version(&pool, &act.id, to)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Act {} has no version {}", slug, to))?;

    let changeset =
        crate::diff::compute_changeset(&pool, &act.id, &from_version.id, &to_version.id).await?;

    let mut effective = config.clone();
    if let Some(k) = top_k {
        effective.assessment.top_k = k;
    }

    let embedder = crate::embedding::create_provider(&effective.embedding)?;
    let generator: Arc<dyn GenerationProvider> =
        Arc::from(crate::generation::create_provider(&effective.generation)?);
    let registry = Arc::new(PromptRegistry::load()?);

    let outcome = assess_changeset(
        &pool,
        embedder.as_ref(),
        generator,
        registry,
        &effective,
        &changeset,
        &act.title,
    )
    .await?;

    println!("assess {} v{} -> v{}", slug, from, to);
    println!("  change entries: {}", outcome.entries_considered);
    println!("  skipped irrelevant: {}", outcome.entries_skipped_irrelevant);
    println!("  pairs selected: {}", outcome.pairs_selected);
    println!("  already assessed: {}", outcome.pairs_existing);
    println!("  assessed: {}", outcome.assessed_ok);
    println!("  insufficient data: {}", outcome.assessed_insufficient);
    println!("  failed: {}", outcome.assessed_failed);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Load the stored assessments for a changeset, keyed by entry.
pub async fn assessments_for_changeset(
    pool: &SqlitePool,
    changeset_id: &str,
) -> EngineResult<Vec<ImpactAssessment>> {
    let rows = sqlx::query_as::<_, (String, String, String, f64, String, String, i64)>(
        "SELECT a.id, a.change_entry_id, a.document_id, a.score, a.justification, a.status, a.evaluated_at \
         FROM impact_assessments a \
         JOIN change_entries e ON e.id = a.change_entry_id \
         WHERE e.changeset_id = ? \
         ORDER BY e.position, a.score DESC",
    )
    .bind(changeset_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, change_entry_id, document_id, score, justification, status, evaluated_at)| {
            AssessmentStatus::parse(&status).map(|status| ImpactAssessment {
                id,
                change_entry_id,
                document_id,
                score,
                justification,
                status,
                evaluated_at,
            })
        })
        .collect())
}
