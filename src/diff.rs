//! Change detection engine.
//!
//! Aligns the fragments of two versions of the same act by content hash
//! and sequence proximity, emitting a changeset of added / removed /
//! modified entries. Identical text is matched to its nearest-position
//! occurrence and excluded; text with no hash match pairs with its
//! nearest unconsumed positional predecessor within the window
//! (`modified`) or stands alone (`added`). Older fragments never consumed
//! are `removed`. No fuzzy realignment beyond position proximity; legal
//! renumbering makes deeper diffing unreliable, so precision wins over
//! recall.

use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{ChangeEntry, Changeset, ChangeType, Fragment};
use crate::store;

/// How far apart (in fragment positions) an old and a new fragment may
/// sit and still be paired as `modified`.
const POSITION_WINDOW: i64 = 2;

/// Compute the changes between two fragment sequences.
///
/// Pure alignment over in-memory fragments; persistence is layered on by
/// [`compute_changeset`]. Entries come back ordered by position.
pub fn align_fragments(older: &[Fragment], newer: &[Fragment]) -> Vec<(ChangeType, Option<usize>, Option<usize>)> {
    // hash → older positions holding it, in order
    let mut old_by_hash: HashMap<&str, Vec<usize>> = HashMap::new();
    for (pos, fragment) in older.iter().enumerate() {
        old_by_hash.entry(fragment.text_hash.as_str()).or_default().push(pos);
    }

    // Zero hash overlap means nothing anchors the alignment: treat it as
    // whole-document replacement instead of pairing unrelated text by
    // coincidental position.
    let any_overlap = newer
        .iter()
        .any(|f| old_by_hash.contains_key(f.text_hash.as_str()));
    if !any_overlap && !older.is_empty() && !newer.is_empty() {
        let mut entries: Vec<(ChangeType, Option<usize>, Option<usize>)> = Vec::new();
        let mut old_iter = (0..older.len()).peekable();
        for new_pos in 0..newer.len() {
            while let Some(&old_pos) = old_iter.peek() {
                if (old_pos as i64) < new_pos as i64 {
                    entries.push((ChangeType::Removed, Some(old_pos), None));
                    old_iter.next();
                } else {
                    break;
                }
            }
            entries.push((ChangeType::Added, None, Some(new_pos)));
        }
        for old_pos in old_iter {
            entries.push((ChangeType::Removed, Some(old_pos), None));
        }
        return entries;
    }

    let mut consumed = vec![false; older.len()];
    // (sort position, tiebreak, change, old index, new index)
    let mut entries: Vec<(i64, i64, ChangeType, Option<usize>, Option<usize>)> = Vec::new();

    for (new_pos, fragment) in newer.iter().enumerate() {
        // Identical content: consume the nearest occurrence, emit nothing.
        if let Some(positions) = old_by_hash.get(fragment.text_hash.as_str()) {
            let nearest = positions
                .iter()
                .filter(|&&p| !consumed[p])
                .min_by_key(|&&p| (p as i64 - new_pos as i64).abs());
            if let Some(&p) = nearest {
                consumed[p] = true;
                continue;
            }
        }

        // Changed content: pair with the nearest unconsumed older
        // fragment within the window, else the fragment is new.
        let candidate = (0..older.len())
            .filter(|&p| !consumed[p])
            .map(|p| (p, (p as i64 - new_pos as i64).abs()))
            .filter(|&(_, dist)| dist <= POSITION_WINDOW)
            .min_by_key(|&(_, dist)| dist);

        match candidate {
            Some((old_pos, _)) => {
                consumed[old_pos] = true;
                entries.push((new_pos as i64, 0, ChangeType::Modified, Some(old_pos), Some(new_pos)));
            }
            None => {
                entries.push((new_pos as i64, 0, ChangeType::Added, None, Some(new_pos)));
            }
        }
    }

    // Whatever was never consumed disappeared; interleave at its
    // last-known position.
    for (old_pos, flag) in consumed.iter().enumerate() {
        if !flag {
            entries.push((old_pos as i64, 1, ChangeType::Removed, Some(old_pos), None));
        }
    }

    entries.sort_by_key(|&(pos, tiebreak, _, _, _)| (pos, tiebreak));
    entries
        .into_iter()
        .map(|(_, _, change, old, new)| (change, old, new))
        .collect()
}

/// Compute (or fetch, if already stored) the changeset between two
/// versions of an act. Recomputation for the same pair returns the stored
/// result, since versions are immutable and so is their diff.
pub async fn compute_changeset(
    pool: &SqlitePool,
    act_id: &str,
    from_version_id: &str,
    to_version_id: &str,
) -> EngineResult<Changeset> {
    if let Some(existing) = load_changeset(pool, from_version_id, to_version_id).await? {
        return Ok(existing);
    }

    let older = store::list_fragments(pool, from_version_id).await?;
    let newer = store::list_fragments(pool, to_version_id).await?;

    let aligned = align_fragments(&older, &newer);
    info!(
        act = act_id,
        from = from_version_id,
        to = to_version_id,
        entries = aligned.len(),
        "computed changeset"
    );

    let changeset_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    let mut entries = Vec::with_capacity(aligned.len());
    for (position, (change_type, old_idx, new_idx)) in aligned.into_iter().enumerate() {
        entries.push(ChangeEntry {
            id: Uuid::new_v4().to_string(),
            changeset_id: changeset_id.clone(),
            position: position as i64,
            change_type,
            before_fragment_id: old_idx.map(|i| older[i].id.clone()),
            after_fragment_id: new_idx.map(|i| newer[i].id.clone()),
        });
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO changesets (id, act_id, from_version_id, to_version_id, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&changeset_id)
    .bind(act_id)
    .bind(from_version_id)
    .bind(to_version_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for entry in &entries {
        sqlx::query(
            "INSERT INTO change_entries (id, changeset_id, position, change_type, before_fragment_id, after_fragment_id) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.changeset_id)
        .bind(entry.position)
        .bind(entry.change_type.as_str())
        .bind(&entry.before_fragment_id)
        .bind(&entry.after_fragment_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    Ok(Changeset {
        id: changeset_id,
        act_id: act_id.to_string(),
        from_version_id: from_version_id.to_string(),
        to_version_id: to_version_id.to_string(),
        created_at: now,
        entries,
    })
}

/// Load a stored changeset for a version pair, entries in position order.
pub async fn load_changeset(
    pool: &SqlitePool,
    from_version_id: &str,
    to_version_id: &str,
) -> EngineResult<Option<Changeset>> {
    let header = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT id, act_id, created_at FROM changesets WHERE from_version_id = ? AND to_version_id = ?",
    )
    .bind(from_version_id)
    .bind(to_version_id)
    .fetch_optional(pool)
    .await?;

    let Some((id, act_id, created_at)) = header else {
        return Ok(None);
    };

    let rows = sqlx::query_as::<_, (String, i64, String, Option<String>, Option<String>)>(
        "SELECT id, position, change_type, before_fragment_id, after_fragment_id \
         FROM change_entries WHERE changeset_id = ? ORDER BY position",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    let entries = rows
        .into_iter()
        .filter_map(|(entry_id, position, change_type, before, after)| {
            ChangeType::parse(&change_type).map(|ct| ChangeEntry {
                id: entry_id,
                changeset_id: id.clone(),
                position,
                change_type: ct,
                before_fragment_id: before,
                after_fragment_id: after,
            })
        })
        .collect();

    Ok(Some(Changeset {
        id,
        act_id,
        from_version_id: from_version_id.to_string(),
        to_version_id: to_version_id.to_string(),
        created_at,
        entries,
    }))
}

pub async fn run_diff(config: &crate::config::Config, slug: &str, from: i64, to: i64) -> anyhow::Result<()> {
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

    let changeset = compute_changeset(&pool, &act.id, &from_version.id, &to_version.id).await?;

    let mut texts: HashMap<String, String> = HashMap::new();
    for owner in [&from_version.id, &to_version.id] {
        for fragment in store::list_fragments(&pool, owner).await? {
            texts.insert(fragment.id, fragment.text);
        }
    }

    println!("diff {} v{} -> v{}", slug, from, to);
    if changeset.entries.is_empty() {
        println!("  no changes");
    }
    for entry in &changeset.entries {
        let snippet = |id: &Option<String>| {
            id.as_deref()
                .and_then(|i| texts.get(i))
                .map(|t| excerpt(t))
                .unwrap_or_default()
        };
        match entry.change_type {
            crate::models::ChangeType::Added => {
                println!("  + added    \"{}\"", snippet(&entry.after_fragment_id));
            }
            crate::models::ChangeType::Removed => {
                println!("  - removed  \"{}\"", snippet(&entry.before_fragment_id));
            }
            crate::models::ChangeType::Modified => {
                println!("  ~ modified \"{}\"", snippet(&entry.before_fragment_id));
                println!("          -> \"{}\"", snippet(&entry.after_fragment_id));
            }
        }
    }
    println!("  entries: {}", changeset.entries.len());
    println!("ok");

    pool.close().await;
    Ok(())
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() > 96 {
        let cut: String = flat.chars().take(96).collect();
        format!("{}...", cut)
    } else {
        flat.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::hash_text;

    fn fragments(owner: &str, texts: &[&str]) -> Vec<Fragment> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| Fragment {
                id: format!("{}-{}", owner, i),
                owner_id: owner.to_string(),
                seq_index: i as i64,
                text: text.to_string(),
                text_hash: hash_text(text),
            })
            .collect()
    }

    #[test]
    fn test_identical_versions_empty_changeset() {
        let v1 = fragments("v1", &["Art. 1: X", "Art. 2: Y"]);
        let v2 = fragments("v2", &["Art. 1: X", "Art. 2: Y"]);
        assert!(align_fragments(&v1, &v2).is_empty());
    }

    #[test]
    fn test_single_modification() {
        let v1 = fragments("v1", &["Art. 1: X", "Art. 2: Y"]);
        let v2 = fragments("v2", &["Art. 1: X", "Art. 2: Z"]);
        let aligned = align_fragments(&v1, &v2);
        assert_eq!(aligned.len(), 1);
        let (change, old, new) = &aligned[0];
        assert_eq!(*change, ChangeType::Modified);
        assert_eq!(*old, Some(1));
        assert_eq!(*new, Some(1));
    }

    #[test]
    fn test_appended_fragment() {
        let v1 = fragments("v1", &["Art. 1: X"]);
        let v2 = fragments("v2", &["Art. 1: X", "Art. 2: new", "Art. 3: newer", "Art. 4: newest"]);
        let aligned = align_fragments(&v1, &v2);
        // The only old fragment is consumed by its hash match, so every
        // new article surfaces as added.
        assert_eq!(aligned.len(), 3);
        assert!(aligned.iter().all(|(c, _, _)| *c == ChangeType::Added));
    }

    #[test]
    fn test_removed_fragment() {
        let v1 = fragments("v1", &["Art. 1: X", "Art. 2: Y", "Art. 3: Z"]);
        let v2 = fragments("v2", &["Art. 1: X", "Art. 3: Z"]);
        let aligned = align_fragments(&v1, &v2);
        assert_eq!(aligned.len(), 1);
        let (change, old, new) = &aligned[0];
        assert_eq!(*change, ChangeType::Removed);
        assert_eq!(*old, Some(1));
        assert_eq!(*new, None::<usize>);
    }

    #[test]
    fn test_moved_identical_text_is_unchanged() {
        let v1 = fragments("v1", &["A", "B", "C"]);
        let v2 = fragments("v2", &["C", "A", "B"]);
        assert!(align_fragments(&v1, &v2).is_empty());
    }

    #[test]
    fn test_whole_document_replacement() {
        let v1 = fragments("v1", &["old 1", "old 2", "old 3"]);
        let v2 = fragments("v2", &["fresh 1", "fresh 2"]);
        let aligned = align_fragments(&v1, &v2);
        // No hash overlap: one removed per old fragment, one added per
        // new fragment, no modified pairings.
        let removed = aligned.iter().filter(|(c, _, _)| *c == ChangeType::Removed).count();
        let added = aligned.iter().filter(|(c, _, _)| *c == ChangeType::Added).count();
        let modified = aligned.iter().filter(|(c, _, _)| *c == ChangeType::Modified).count();
        assert_eq!(removed, 3);
        assert_eq!(added, 2);
        assert_eq!(modified, 0);
    }

    #[test]
    fn test_anchored_change_pairs_as_modified() {
        let v1 = fragments("v1", &["A", "B"]);
        let v2 = fragments("v2", &["A2", "B"]);
        let aligned = align_fragments(&v1, &v2);
        // B anchors the alignment by hash; A2 pairs with A.
        assert_eq!(aligned.len(), 1);
        assert_eq!(aligned[0].0, ChangeType::Modified);
    }

    #[test]
    fn test_emit_order_ascending_position() {
        let v1 = fragments("v1", &["keep 0", "drop 1", "keep 2", "change 3"]);
        let v2 = fragments("v2", &["keep 0", "keep 2", "changed 3", "added 4"]);
        let aligned = align_fragments(&v1, &v2);
        let kinds: Vec<ChangeType> = aligned.iter().map(|(c, _, _)| *c).collect();
        // Whatever the exact pairings, the emitted order must ascend.
        let positions: Vec<i64> = aligned
            .iter()
            .map(|(c, old, new)| match c {
                ChangeType::Removed => old.unwrap() as i64,
                _ => new.unwrap() as i64,
            })
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        assert!(!kinds.is_empty());
    }

    #[test]
    fn test_empty_versions() {
        assert!(align_fragments(&[], &[]).is_empty());
        let v = fragments("v", &["only"]);
        let added = align_fragments(&[], &v);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, ChangeType::Added);
        let removed = align_fragments(&v, &[]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, ChangeType::Removed);
    }
}
