//! Read-only result printing: summary trees, changesets with their
//! assessments. Issues no engine writes.

use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::config::Config;
use crate::db;
use crate::models::{AssessmentStatus, ChangeType};
use crate::store;
use crate::summarize;

pub async fn run_show_act(config: &Config, slug: &str) -> Result<()> {
    let pool = db::connect(config).await?;

    let act = store::find_act_by_slug(&pool, slug)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown act: {}", slug))?;
    let versions = store::list_versions(&pool, &act.id).await?;

    println!("act {} — {}", act.slug, act.title);
    for version in &versions {
        let fragments = store::list_fragments(&pool, &version.id).await?;
        println!(
            "  v{} ({} fragments{})",
            version.version_no,
            fragments.len(),
            version
                .published_at
                .as_deref()
                .map(|d| format!(", published {}", d))
                .unwrap_or_default()
        );
    }

    if let Some(latest) = versions.last() {
        print_summary_tree(&pool, &latest.id).await?;
    }

    pool.close().await;
    Ok(())
}

pub async fn run_show_doc(config: &Config, document_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;

    let document = store::find_document(&pool, document_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown document: {}", document_id))?;
    let fragments = store::list_fragments(&pool, &document.id).await?;

    println!("doc {} — {}", document.id, document.title);
    println!("  fragments: {}", fragments.len());

    print_summary_tree(&pool, &document.id).await?;

    pool.close().await;
    Ok(())
}

async fn print_summary_tree(pool: &SqlitePool, owner_id: &str) -> Result<()> {
    // Prefer the completed hierarchy, but surface partial results of a
    // failed build rather than hiding them.
    let build_id = match summarize::latest_done_build(pool, owner_id).await? {
        Some(id) => id,
        None => match summarize::latest_build(pool, owner_id).await? {
            Some(id) => id,
            None => {
                println!("  (no summary hierarchy)");
                return Ok(());
            }
        },
    };

    if let Some(build) = summarize::load_build(pool, &build_id).await? {
        println!("  hierarchy: {} ({} levels)", build.state, build.last_level + 1);
        if let Some(error) = build.error {
            println!("  gap: {}", error);
        }
    }

    let rows = sqlx::query_as::<_, (i64, String, String, bool)>(
        "SELECT source_level, title, body, relevant FROM summaries \
         WHERE build_id = ? ORDER BY source_level DESC, created_at",
    )
    .bind(&build_id)
    .fetch_all(pool)
    .await?;

    let clusters = summarize::clusters_for_build(pool, &build_id).await?;
    let unsummarized = clusters.len().saturating_sub(rows.len());
    if unsummarized > 0 {
        println!("  clusters without a summary: {}", unsummarized);
    }

    let mut current_level: Option<i64> = None;
    for (level, title, body, relevant) in rows {
        if current_level != Some(level) {
            println!("  level {}:", level);
            current_level = Some(level);
        }
        let marker = if relevant { "" } else { " [out of scope]" };
        println!("    - {}{}", title, marker);
        println!("      {}", body.replace('\n', " "));
    }

    Ok(())
}

pub async fn run_report(config: &Config, slug: &str, from: i64, to: i64) -> Result<()> {
    let pool = db::connect(config).await?;

    let act = store::find_act_by_slug(&pool, slug)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown act: {}", slug))?;
    let from_version = store::find_version(&pool, &act.id, from)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Act {} has no version {}", slug, from))?;
    let to_version = store::find_version(&pool, &act.id, to)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Act {} has no version {}", slug, to))?;

    let Some(changeset) =
        crate::diff::load_changeset(&pool, &from_version.id, &to_version.id).await?
    else {
        println!("No changeset for {} v{} -> v{}. Run `lex diff` first.", slug, from, to);
        pool.close().await;
        return Ok(());
    };

    let assessments = crate::assess::assessments_for_changeset(&pool, &changeset.id).await?;
    let mut by_entry: HashMap<&str, Vec<&crate::models::ImpactAssessment>> = HashMap::new();
    for assessment in &assessments {
        by_entry
            .entry(assessment.change_entry_id.as_str())
            .or_default()
            .push(assessment);
    }

    let doc_titles: HashMap<String, String> =
        sqlx::query_as::<_, (String, String)>("SELECT id, title FROM documents")
            .fetch_all(&pool)
            .await?
            .into_iter()
            .collect();

    println!("report {} v{} -> v{}", slug, from, to);
    println!("  entries: {}", changeset.entries.len());

    for entry in &changeset.entries {
        let kind = match entry.change_type {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Modified => "modified",
        };
        println!("  [{}] {}", entry.position, kind);

        let Some(entry_assessments) = by_entry.get(entry.id.as_str()) else {
            println!("      (not assessed)");
            continue;
        };
        for assessment in entry_assessments {
            let title = doc_titles
                .get(&assessment.document_id)
                .map(|t| t.as_str())
                .unwrap_or("(unknown document)");
            match assessment.status {
                AssessmentStatus::Ok => {
                    println!("      [{:.2}] {}", assessment.score, title);
                    println!("             {}", assessment.justification.replace('\n', " "));
                }
                AssessmentStatus::Insufficient => {
                    println!("      [----] {} — insufficient data", title);
                }
                AssessmentStatus::Failed => {
                    println!("      [----] {} — assessment failed", title);
                }
            }
        }
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
