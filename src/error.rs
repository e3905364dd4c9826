//! Engine error taxonomy.
//!
//! Leaf-level failures are recorded against the specific cluster, change
//! entry, or assessment and never abort sibling work; only the owning
//! operation observes them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A collaborator (store, embedding or generation endpoint) could not
    /// be reached. Transient; HTTP providers retry with backoff before
    /// surfacing this.
    #[error("{collaborator} unavailable: {detail}")]
    CollaboratorUnavailable { collaborator: &'static str, detail: String },

    /// The generation collaborator returned a response that does not
    /// conform to the expected schema, even after bounded retries with
    /// reinforced formatting instructions.
    #[error("malformed {kind} response after {attempts} attempts: {detail}")]
    MalformedResponse {
        kind: &'static str,
        attempts: u32,
        detail: String,
    },

    /// A required child summary is missing or failed. Fatal to the parent
    /// cluster's summarization, never silently skipped.
    #[error("incomplete hierarchy for {owner_id} at level {level}: {detail}")]
    IncompleteHierarchy {
        owner_id: String,
        level: i64,
        detail: String,
    },

    /// An impact pair cannot be judged from the available inputs.
    /// Surfaced downstream as score 0.00 with a distinct status, never
    /// merged with a genuine no-impact judgment.
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::CollaboratorUnavailable {
            collaborator: "store",
            detail: e.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
