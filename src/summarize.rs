//! Recursive summarization engine.
//!
//! Bottom-up tree reduction over an owner's fragments: cluster the
//! fragment embeddings, summarize each cluster, then cluster and
//! summarize the summaries, until a single root summary remains or the
//! depth cap force-merges the remainder. Implemented as an explicit
//! per-level worklist (no call-stack recursion), so partial failure is
//! ordinary state, not exception propagation.
//!
//! Ordering guarantee: a cluster is summarized only after all its members
//! have summaries. Siblings within a level run concurrently under the
//! configured limit; levels are sequential. Total generation calls are
//! O(n) over the whole tree.
//!
//! The computed tree is installed atomically in one transaction (prior
//! clusters of the owner are deleted, prior summaries marked superseded),
//! so readers never observe a half-built hierarchy. The build row itself
//! is progress bookkeeping and advances level by level.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::{cluster_vectors, force_merge, ClusterDraft};
use crate::config::Config;
use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::generation::{request_summary, GenerationProvider};
use crate::models::{BuildState, Cluster, HierarchyBuild, Summary};
use crate::prompts::{OperationKind, PromptRegistry};
use crate::store;

/// One node of the computed hierarchy; `summary` is `None` when the
/// generation call for the cluster terminally failed.
struct Node {
    id: String,
    level: i64,
    member_ids: Vec<String>,
    centroid: Vec<f32>,
    summary: Option<NodeSummary>,
}

#[derive(Clone)]
struct NodeSummary {
    title: String,
    body: String,
    relevant: bool,
}

/// Result of one hierarchy build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub build_id: String,
    pub state: BuildState,
    pub levels: i64,
    pub clusters_summarized: usize,
    pub clusters_failed: usize,
    pub root: Option<Summary>,
}

/// Run a full hierarchy build for `owner_id`.
///
/// `kind` selects the prompt contract: [`OperationKind::ClusterSummary`]
/// for act versions, [`OperationKind::DocumentSummary`] for documents.
pub async fn build_hierarchy(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    generator: Arc<dyn GenerationProvider>,
    registry: Arc<PromptRegistry>,
    config: &Config,
    owner_id: &str,
    owner_title: &str,
    kind: OperationKind,
) -> EngineResult<BuildOutcome> {
    let fragments = store::list_fragments(pool, owner_id).await?;
    if fragments.is_empty() {
        return Err(EngineError::InsufficientData(format!(
            "owner {} has no fragments to summarize",
            owner_id
        )));
    }

    let build_id = Uuid::new_v4().to_string();
    let started_at = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO hierarchy_builds (id, owner_id, state, last_level, started_at) VALUES (?, ?, ?, 0, ?)",
    )
    .bind(&build_id)
    .bind(owner_id)
    .bind(BuildState::Pending.as_str())
    .bind(started_at)
    .execute(pool)
    .await?;

    let embeddings = store::fragment_embeddings(pool, embedder, &fragments).await?;
    let fragment_texts: HashMap<String, String> = fragments
        .iter()
        .map(|f| (f.id.clone(), f.text.clone()))
        .collect();

    let items: Vec<(String, Vec<f32>)> = fragments
        .iter()
        .filter_map(|f| embeddings.get(&f.id).map(|v| (f.id.clone(), v.clone())))
        .collect();
    if items.len() != fragments.len() {
        return Err(EngineError::InsufficientData(format!(
            "owner {} is missing embeddings for {} fragments",
            owner_id,
            fragments.len() - items.len()
        )));
    }

    let semaphore = Arc::new(Semaphore::new(config.generation.max_concurrent.max(1)));
    let mut tree: Vec<Vec<Node>> = Vec::new();
    let mut failed_clusters = 0usize;
    let mut level: i64 = 0;

    // Level 0: clusters of fragments, summarized from raw member text.
    let drafts = cluster_vectors(&items, &config.clustering);
    info!(owner = owner_id, clusters = drafts.len(), "clustered fragments");
    let nodes = summarize_level(
        &generator,
        &registry,
        config,
        &semaphore,
        kind,
        owner_title,
        level,
        drafts,
        |member_ids| concat_texts(member_ids, &fragment_texts),
    )
    .await?;
    failed_clusters += nodes.iter().filter(|n| n.summary.is_none()).count();
    tree.push(nodes);
    mark_level(pool, &build_id, level).await?;

    // Upper levels: clusters of summaries, until one root remains.
    let final_state = loop {
        let current = tree.last().map(|nodes| nodes.len()).unwrap_or(0);

        if failed_clusters > 0 {
            // A missing child is fatal to its parent: stop reducing.
            break BuildState::Failed;
        }
        if current == 1 {
            break BuildState::RootSummarized;
        }

        level += 1;

        let Some(prev) = tree.last() else {
            break BuildState::Failed;
        };
        let summary_texts: HashMap<String, String> = prev
            .iter()
            .filter_map(|n| n.summary.as_ref().map(|s| (n.id.clone(), s.body.clone())))
            .collect();

        let texts: Vec<String> = summary_texts.values().cloned().collect();
        let by_hash = store::ensure_embeddings(pool, embedder, &texts).await?;
        let upper_items: Vec<(String, Vec<f32>)> = prev
            .iter()
            .filter_map(|n| {
                let body = summary_texts.get(&n.id)?;
                by_hash
                    .get(&crate::fragment::hash_text(body))
                    .map(|v| (n.id.clone(), v.clone()))
            })
            .collect();

        let mut drafts = cluster_vectors(&upper_items, &config.clustering);

        // Depth cap: force-merge the remainder into one final call.
        if level >= config.summarize.max_depth && drafts.len() > 1 {
            warn!(
                owner = owner_id,
                level,
                clusters = drafts.len(),
                "max depth reached, force-merging remaining clusters"
            );
            drafts = force_merge(drafts).into_iter().collect();
        }

        let child_relevance: HashMap<String, bool> = prev
            .iter()
            .filter_map(|n| n.summary.as_ref().map(|s| (n.id.clone(), s.relevant)))
            .collect();

        let mut nodes = summarize_level(
            &generator,
            &registry,
            config,
            &semaphore,
            kind,
            owner_title,
            level,
            drafts,
            |member_ids| concat_texts(member_ids, &summary_texts),
        )
        .await?;

        // Majority-irrelevant members force the parent irrelevant.
        for node in nodes.iter_mut() {
            if let Some(summary) = node.summary.as_mut() {
                let irrelevant = node
                    .member_ids
                    .iter()
                    .filter(|id| child_relevance.get(*id) == Some(&false))
                    .count();
                if irrelevant * 2 > node.member_ids.len() {
                    summary.relevant = false;
                }
            }
        }

        failed_clusters += nodes.iter().filter(|n| n.summary.is_none()).count();
        tree.push(nodes);
        mark_level(pool, &build_id, level).await?;
    };

    let outcome = install_tree(pool, &build_id, owner_id, tree, final_state, failed_clusters).await?;
    info!(
        owner = owner_id,
        build = %outcome.build_id,
        state = %outcome.state,
        levels = outcome.levels,
        summarized = outcome.clusters_summarized,
        failed = outcome.clusters_failed,
        "hierarchy build finished"
    );
    Ok(outcome)
}

fn concat_texts(member_ids: &[String], texts: &HashMap<String, String>) -> String {
    member_ids
        .iter()
        .filter_map(|id| texts.get(id).map(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Issue one generation call per cluster draft, siblings concurrently.
#[allow(clippy::too_many_arguments)]
async fn summarize_level<F>(
    generator: &Arc<dyn GenerationProvider>,
    registry: &Arc<PromptRegistry>,
    config: &Config,
    semaphore: &Arc<Semaphore>,
    kind: OperationKind,
    owner_title: &str,
    level: i64,
    drafts: Vec<ClusterDraft>,
    combined_text: F,
) -> EngineResult<Vec<Node>>
where
    F: Fn(&[String]) -> String,
{
    let title_field = match kind {
        OperationKind::DocumentSummary => "doc_title",
        _ => "act_title",
    };

    let mut join_set: JoinSet<(usize, EngineResult<crate::generation::SummaryResponse>)> =
        JoinSet::new();

    for (idx, draft) in drafts.iter().enumerate() {
        let text = combined_text(&draft.member_ids);
        if text.trim().is_empty() {
            continue;
        }

        let generator = Arc::clone(generator);
        let registry = Arc::clone(registry);
        let semaphore = Arc::clone(semaphore);
        let owner_title = owner_title.to_string();
        let malformed_retries = config.generation.malformed_retries;

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let fields: HashMap<&str, String> = [
                (title_field, owner_title),
                ("cluster_level", level.to_string()),
                ("text", text),
            ]
            .into_iter()
            .collect();
            let result =
                request_summary(generator.as_ref(), &registry, kind, &fields, malformed_retries)
                    .await;
            (idx, result)
        });
    }

    let mut results: HashMap<usize, EngineResult<crate::generation::SummaryResponse>> =
        HashMap::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, result)) => {
                results.insert(idx, result);
            }
            Err(e) => {
                return Err(EngineError::CollaboratorUnavailable {
                    collaborator: "generation",
                    detail: format!("summarization task panicked: {}", e),
                })
            }
        }
    }

    let mut nodes = Vec::with_capacity(drafts.len());
    for (idx, draft) in drafts.into_iter().enumerate() {
        let summary = match results.remove(&idx) {
            Some(Ok(response)) => Some(NodeSummary {
                title: response.title,
                body: response.summary,
                relevant: response.relevant,
            }),
            Some(Err(e)) => {
                warn!(level, cluster = idx, error = %e, "cluster summarization failed");
                None
            }
            // Empty combined text: nothing to summarize, nothing to fail.
            None => None,
        };
        nodes.push(Node {
            id: Uuid::new_v4().to_string(),
            level,
            member_ids: draft.member_ids,
            centroid: draft.centroid,
            summary,
        });
    }

    Ok(nodes)
}

async fn mark_level(pool: &SqlitePool, build_id: &str, level: i64) -> EngineResult<()> {
    sqlx::query("UPDATE hierarchy_builds SET state = ?, last_level = ? WHERE id = ?")
        .bind(BuildState::LevelSummarized.as_str())
        .bind(level)
        .bind(build_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Install the computed tree in one transaction: supersede the owner's
/// previous summaries, replace its clusters wholesale, write the new
/// summaries, and finalize the build row.
async fn install_tree(
    pool: &SqlitePool,
    build_id: &str,
    owner_id: &str,
    tree: Vec<Vec<Node>>,
    final_state: BuildState,
    failed_clusters: usize,
) -> EngineResult<BuildOutcome> {
    let state = match final_state {
        BuildState::RootSummarized => BuildState::Done,
        other => other,
    };
    let now = chrono::Utc::now().timestamp();
    let levels = tree.len() as i64;

    let mut summarized = 0usize;
    let mut root: Option<Summary> = None;

    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE summaries SET superseded = 1 WHERE owner_id = ? AND superseded = 0")
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM clusters WHERE owner_id = ?")
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;

    for nodes in &tree {
        for node in nodes {
            let member_json = serde_json::to_string(&node.member_ids).map_err(|e| {
                EngineError::CollaboratorUnavailable {
                    collaborator: "store",
                    detail: format!("member id encoding failed: {}", e),
                }
            })?;

            sqlx::query(
                "INSERT INTO clusters (id, build_id, owner_id, level, member_ids, centroid) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&node.id)
            .bind(build_id)
            .bind(owner_id)
            .bind(node.level)
            .bind(&member_json)
            .bind(vec_to_blob(&node.centroid))
            .execute(&mut *tx)
            .await?;

            if let Some(ref summary) = node.summary {
                let summary_row = Summary {
                    id: Uuid::new_v4().to_string(),
                    cluster_id: node.id.clone(),
                    owner_id: owner_id.to_string(),
                    build_id: build_id.to_string(),
                    source_level: node.level,
                    title: summary.title.clone(),
                    body: summary.body.clone(),
                    relevant: summary.relevant,
                    superseded: false,
                    created_at: now,
                };
                sqlx::query(
                    "INSERT INTO summaries (id, cluster_id, owner_id, build_id, source_level, title, body, relevant, superseded, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
                )
                .bind(&summary_row.id)
                .bind(&summary_row.cluster_id)
                .bind(&summary_row.owner_id)
                .bind(&summary_row.build_id)
                .bind(summary_row.source_level)
                .bind(&summary_row.title)
                .bind(&summary_row.body)
                .bind(summary_row.relevant)
                .bind(summary_row.created_at)
                .execute(&mut *tx)
                .await?;

                summarized += 1;
                let is_root = state == BuildState::Done
                    && node.level == levels - 1
                    && nodes.len() == 1;
                if is_root {
                    root = Some(summary_row);
                }
            }
        }
    }

    let error = if state == BuildState::Failed {
        Some(format!("{} cluster summarization(s) failed", failed_clusters))
    } else {
        None
    };

    sqlx::query(
        "UPDATE hierarchy_builds SET state = ?, last_level = ?, error = ?, finished_at = ? WHERE id = ?",
    )
    .bind(state.as_str())
    .bind(levels - 1)
    .bind(&error)
    .bind(now)
    .bind(build_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(BuildOutcome {
        build_id: build_id.to_string(),
        state,
        levels,
        clusters_summarized: summarized,
        clusters_failed: failed_clusters,
        root,
    })
}

/// The latest completed build for an owner, if any.
pub async fn latest_done_build(pool: &SqlitePool, owner_id: &str) -> EngineResult<Option<String>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM hierarchy_builds WHERE owner_id = ? AND state = 'done' \
         ORDER BY started_at DESC, id DESC LIMIT 1",
    )
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// The latest build for an owner in any state (partial results from a
/// failed build are still worth surfacing).
pub async fn latest_build(pool: &SqlitePool, owner_id: &str) -> EngineResult<Option<String>> {
    let id: Option<String> = sqlx::query_scalar(
        "SELECT id FROM hierarchy_builds WHERE owner_id = ? \
         ORDER BY started_at DESC, id DESC LIMIT 1",
    )
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Load one build's bookkeeping row.
pub async fn load_build(pool: &SqlitePool, build_id: &str) -> EngineResult<Option<HierarchyBuild>> {
    let row = sqlx::query_as::<_, (String, String, String, i64, Option<String>, i64, Option<i64>)>(
        "SELECT id, owner_id, state, last_level, error, started_at, finished_at \
         FROM hierarchy_builds WHERE id = ?",
    )
    .bind(build_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(id, owner_id, state, last_level, error, started_at, finished_at)| {
        BuildState::parse(&state).map(|state| HierarchyBuild {
            id,
            owner_id,
            state,
            last_level,
            error,
            started_at,
            finished_at,
        })
    }))
}

/// Load a build's clusters, leaves first.
pub async fn clusters_for_build(pool: &SqlitePool, build_id: &str) -> EngineResult<Vec<Cluster>> {
    let rows = sqlx::query_as::<_, (String, String, String, i64, String, Vec<u8>)>(
        "SELECT id, build_id, owner_id, level, member_ids, centroid \
         FROM clusters WHERE build_id = ? ORDER BY level",
    )
    .bind(build_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, build_id, owner_id, level, member_json, centroid)| Cluster {
            id,
            build_id,
            owner_id,
            level,
            member_ids: serde_json::from_str(&member_json).unwrap_or_default(),
            centroid: blob_to_vec(&centroid),
        })
        .collect())
}

/// The root summary of an owner's latest completed build.
pub async fn root_summary(pool: &SqlitePool, owner_id: &str) -> EngineResult<Option<Summary>> {
    let Some(build_id) = latest_done_build(pool, owner_id).await? else {
        return Ok(None);
    };

    let row = sqlx::query_as::<_, (String, String, String, String, i64, String, String, bool, bool, i64)>(
        "SELECT id, cluster_id, owner_id, build_id, source_level, title, body, relevant, superseded, created_at \
         FROM summaries WHERE build_id = ? ORDER BY source_level DESC LIMIT 1",
    )
    .bind(&build_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(id, cluster_id, owner_id, build_id, source_level, title, body, relevant, superseded, created_at)| Summary {
            id,
            cluster_id,
            owner_id,
            build_id,
            source_level,
            title,
            body,
            relevant,
            superseded,
            created_at,
        },
    ))
}

/// Relevance of each fragment, derived from its level-0 cluster in the
/// owner's latest completed build. Fragments without hierarchy coverage
/// are absent from the map (treated as relevant by callers).
pub async fn fragment_relevance(
    pool: &SqlitePool,
    owner_id: &str,
) -> EngineResult<HashMap<String, bool>> {
    let Some(build_id) = latest_done_build(pool, owner_id).await? else {
        return Ok(HashMap::new());
    };

    let rows = sqlx::query_as::<_, (String, bool)>(
        "SELECT c.member_ids, s.relevant FROM clusters c \
         JOIN summaries s ON s.cluster_id = c.id \
         WHERE c.build_id = ? AND c.level = 0",
    )
    .bind(&build_id)
    .fetch_all(pool)
    .await?;

    let mut map = HashMap::new();
    for (member_json, relevant) in rows {
        let member_ids: Vec<String> = serde_json::from_str(&member_json).unwrap_or_default();
        for id in member_ids {
            map.insert(id, relevant);
        }
    }
    Ok(map)
}

pub async fn run_summarize_act(
    config: &Config,
    slug: &str,
    version: Option<i64>,
) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;

    let act = store::find_act_by_slug(&pool, slug)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown act: {}", slug))?;
    let versions = store::list_versions(&pool, &act.id).await?;
    let target = match version {
        Some(no) => versions
            .iter()
            .find(|v| v.version_no == no)
            .ok_or_else(|| anyhow::anyhow!("Act {} has no version {}", slug, no))?,
        None => versions
            .last()
            .ok_or_else(|| anyhow::anyhow!("Act {} has no ingested versions", slug))?,
    };

    let embedder = crate::embedding::create_provider(&config.embedding)?;
    let generator: Arc<dyn GenerationProvider> =
        Arc::from(crate::generation::create_provider(&config.generation)?);
    let registry = Arc::new(PromptRegistry::load()?);

    let outcome = build_hierarchy(
        &pool,
        embedder.as_ref(),
        generator,
        registry,
        config,
        &target.id,
        &act.title,
        OperationKind::ClusterSummary,
    )
    .await?;

    print_outcome(&format!("summarize act {} v{}", slug, target.version_no), &outcome);
    pool.close().await;
    Ok(())
}

pub async fn run_summarize_doc(config: &Config, document_id: &str) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;

    let document = store::find_document(&pool, document_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown document: {}", document_id))?;

    let embedder = crate::embedding::create_provider(&config.embedding)?;
    let generator: Arc<dyn GenerationProvider> =
        Arc::from(crate::generation::create_provider(&config.generation)?);
    let registry = Arc::new(PromptRegistry::load()?);

    let outcome = build_hierarchy(
        &pool,
        embedder.as_ref(),
        generator,
        registry,
        config,
        &document.id,
        &document.title,
        OperationKind::DocumentSummary,
    )
    .await?;

    print_outcome(&format!("summarize doc {}", document_id), &outcome);
    pool.close().await;
    Ok(())
}

fn print_outcome(header: &str, outcome: &BuildOutcome) {
    println!("{}", header);
    println!("  build: {}", outcome.build_id);
    println!("  state: {}", outcome.state);
    println!("  levels: {}", outcome.levels);
    println!("  clusters summarized: {}", outcome.clusters_summarized);
    if outcome.clusters_failed > 0 {
        println!("  clusters failed: {}", outcome.clusters_failed);
    }
    if let Some(ref root) = outcome.root {
        println!("  root: {}", root.title);
        println!("    {}", root.body.replace('\n', " "));
    }
    println!("ok");
}

/// Tree-shape check: every non-root cluster of the build has exactly one
/// parent, and the single root has none.
pub async fn verify_tree_completeness(pool: &SqlitePool, build_id: &str) -> EngineResult<bool> {
    let clusters = clusters_for_build(pool, build_id).await?;

    if clusters.is_empty() {
        return Ok(false);
    }

    let max_level = clusters.iter().map(|c| c.level).max().unwrap_or(0);
    let mut parent_count: HashMap<String, usize> = HashMap::new();

    for cluster in &clusters {
        if cluster.level < max_level {
            parent_count.insert(cluster.id.clone(), 0);
        }
    }

    let roots = clusters.iter().filter(|c| c.level == max_level).count();
    if roots != 1 {
        return Ok(false);
    }

    for cluster in &clusters {
        if cluster.level == 0 {
            continue;
        }
        for member in &cluster.member_ids {
            if let Some(count) = parent_count.get_mut(member) {
                *count += 1;
            }
        }
    }

    Ok(parent_count.values().all(|&c| c == 1))
}
