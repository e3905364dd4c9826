//! Core data models used throughout lex-sentinel.
//!
//! These types represent the acts, fragments, clusters, summaries, change
//! entries, and impact assessments that flow through the summarization and
//! assessment pipeline.

use std::fmt;

/// A piece of generally-binding legislation, versioned over time.
#[derive(Debug, Clone)]
pub struct Act {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub created_at: i64,
}

/// Immutable snapshot of an act's fragments at a point in time.
///
/// An act owns an append-only chronological sequence of versions; a
/// version's fragment set never changes after ingestion.
#[derive(Debug, Clone)]
pub struct ActVersion {
    pub id: String,
    pub act_id: String,
    pub version_no: i64,
    pub published_at: Option<String>,
    pub ingested_at: i64,
}

/// An internal document (template, policy, contract) tracked for impact.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub ingested_at: i64,
}

/// Smallest addressable unit of legal or organizational text.
///
/// Owned by exactly one act version or document; `seq_index` defines
/// reading order and is unique within the owner. The embedding vector is
/// not stored here; it lives in the content-addressed cache keyed by
/// `text_hash`, so identical text anywhere in the corpus is embedded once.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: String,
    pub owner_id: String,
    pub seq_index: i64,
    pub text: String,
    pub text_hash: String,
}

/// A grouping node in a summary hierarchy.
///
/// `member_ids` holds fragment ids at level 0 and cluster ids above;
/// members partition their level. The centroid is derived from member
/// embeddings and never independently mutated.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: String,
    pub build_id: String,
    pub owner_id: String,
    pub level: i64,
    pub member_ids: Vec<String>,
    pub centroid: Vec<f32>,
}

/// Generated summary of a cluster (or, at the root, of a whole owner).
///
/// Superseded rows are retained for audit when a newer hierarchy build
/// replaces the cluster set; they are never mutated in place.
#[derive(Debug, Clone)]
pub struct Summary {
    pub id: String,
    pub cluster_id: String,
    pub owner_id: String,
    pub build_id: String,
    pub source_level: i64,
    pub title: String,
    pub body: String,
    pub relevant: bool,
    pub superseded: bool,
    pub created_at: i64,
}

/// Lifecycle state of one hierarchy build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    LevelSummarized,
    RootSummarized,
    Done,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::LevelSummarized => "level_summarized",
            BuildState::RootSummarized => "root_summarized",
            BuildState::Done => "done",
            BuildState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<BuildState> {
        match s {
            "pending" => Some(BuildState::Pending),
            "level_summarized" => Some(BuildState::LevelSummarized),
            "root_summarized" => Some(BuildState::RootSummarized),
            "done" => Some(BuildState::Done),
            "failed" => Some(BuildState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bottom-up summarization run over an owner's fragments.
#[derive(Debug, Clone)]
pub struct HierarchyBuild {
    pub id: String,
    pub owner_id: String,
    pub state: BuildState,
    pub last_level: i64,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Kind of difference between two act versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Modified => "modified",
        }
    }

    pub fn parse(s: &str) -> Option<ChangeType> {
        match s {
            "added" => Some(ChangeType::Added),
            "removed" => Some(ChangeType::Removed),
            "modified" => Some(ChangeType::Modified),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The diff between two versions of an act.
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: String,
    pub act_id: String,
    pub from_version_id: String,
    pub to_version_id: String,
    pub created_at: i64,
    pub entries: Vec<ChangeEntry>,
}

/// One added/removed/modified span within a changeset.
///
/// `position` is the emit index. Entries are emitted ascending by
/// newer-version position, with removed entries interleaved at their
/// last-known older-version position.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub id: String,
    pub changeset_id: String,
    pub position: i64,
    pub change_type: ChangeType,
    pub before_fragment_id: Option<String>,
    pub after_fragment_id: Option<String>,
}

/// Outcome status of one impact assessment.
///
/// `Insufficient` and `Failed` rows always carry score 0.00, keeping the
/// "cannot judge" causes distinct from a genuine no-impact judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentStatus {
    Ok,
    Insufficient,
    Failed,
}

impl AssessmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentStatus::Ok => "ok",
            AssessmentStatus::Insufficient => "insufficient",
            AssessmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<AssessmentStatus> {
        match s {
            "ok" => Some(AssessmentStatus::Ok),
            "insufficient" => Some(AssessmentStatus::Insufficient),
            "failed" => Some(AssessmentStatus::Failed),
            _ => None,
        }
    }
}

/// Scored judgment linking one change entry to one internal document.
#[derive(Debug, Clone)]
pub struct ImpactAssessment {
    pub id: String,
    pub change_entry_id: String,
    pub document_id: String,
    pub score: f64,
    pub justification: String,
    pub status: AssessmentStatus,
    pub evaluated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_state_roundtrip() {
        for state in [
            BuildState::Pending,
            BuildState::LevelSummarized,
            BuildState::RootSummarized,
            BuildState::Done,
            BuildState::Failed,
        ] {
            assert_eq!(BuildState::parse(state.as_str()), Some(state));
        }
        assert_eq!(BuildState::parse("bogus"), None);
    }

    #[test]
    fn test_change_type_roundtrip() {
        for ct in [ChangeType::Added, ChangeType::Removed, ChangeType::Modified] {
            assert_eq!(ChangeType::parse(ct.as_str()), Some(ct));
        }
        assert_eq!(ChangeType::parse(""), None);
    }

    #[test]
    fn test_assessment_status_roundtrip() {
        for st in [
            AssessmentStatus::Ok,
            AssessmentStatus::Insufficient,
            AssessmentStatus::Failed,
        ] {
            assert_eq!(AssessmentStatus::parse(st.as_str()), Some(st));
        }
    }
}
