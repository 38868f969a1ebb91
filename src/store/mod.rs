//! Durable match snapshot stores
//!
//! The engine is persistence-agnostic: it loads on recovery and commits
//! every transition through this trait. `commit_if_version` is optimistic
//! concurrency; a conflict means another writer touched the row, which
//! under the one-engine-per-match invariant is a defect, not routine.

pub mod memory;
pub mod supabase;

pub use memory::MemoryMatchStore;
pub use supabase::{SupabaseClient, SupabaseMatchStore};

use async_trait::async_trait;
use uuid::Uuid;

use crate::game::Match;

/// Result of an optimistic commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The stored version no longer matches what the caller expected
    Conflict,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Fetch the latest committed snapshot, or `None` for an unknown match
    async fn load(&self, match_id: Uuid) -> Result<Option<Match>, StoreError>;

    /// Persist `next` only if the stored version still equals `expected`.
    /// `expected == 0` means "no committed row yet" and inserts.
    async fn commit_if_version(
        &self,
        match_id: Uuid,
        expected: u64,
        next: &Match,
    ) -> Result<CommitOutcome, StoreError>;
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse stored snapshot: {0}")]
    Parse(String),
}
