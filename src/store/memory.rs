//! In-process match store for development and tests

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::game::Match;

use super::{CommitOutcome, MatchStore, StoreError};

/// Keeps committed snapshots in a concurrent map. Rows survive match
/// retirement (terminal snapshots stay queryable) but not a restart.
#[derive(Default)]
pub struct MemoryMatchStore {
    rows: DashMap<Uuid, Match>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn load(&self, match_id: Uuid) -> Result<Option<Match>, StoreError> {
        Ok(self.rows.get(&match_id).map(|row| row.value().clone()))
    }

    async fn commit_if_version(
        &self,
        match_id: Uuid,
        expected: u64,
        next: &Match,
    ) -> Result<CommitOutcome, StoreError> {
        // The entry guard makes the compare-and-swap atomic.
        match self.rows.entry(match_id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().version == expected {
                    entry.insert(next.clone());
                    Ok(CommitOutcome::Committed)
                } else {
                    Ok(CommitOutcome::Conflict)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                if expected == 0 {
                    entry.insert(next.clone());
                    Ok(CommitOutcome::Committed)
                } else {
                    Ok(CommitOutcome::Conflict)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time::unix_millis;

    fn sample(version: u64) -> Match {
        let mut m = Match::new(Uuid::from_u128(9), 1, unix_millis());
        m.version = version;
        m
    }

    #[tokio::test]
    async fn insert_then_load_roundtrips() {
        let store = MemoryMatchStore::new();
        let m = sample(1);
        assert_eq!(
            store.commit_if_version(m.id, 0, &m).await.unwrap(),
            CommitOutcome::Committed
        );
        let loaded = store.load(m.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = MemoryMatchStore::new();
        let m1 = sample(1);
        store.commit_if_version(m1.id, 0, &m1).await.unwrap();

        // a commit that did not observe version 1 must be rejected
        let stale = sample(2);
        assert_eq!(
            store.commit_if_version(m1.id, 0, &stale).await.unwrap(),
            CommitOutcome::Conflict
        );
        // and an insert against a missing row with nonzero expectation too
        assert_eq!(
            store
                .commit_if_version(Uuid::from_u128(77), 3, &stale)
                .await
                .unwrap(),
            CommitOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn load_of_unknown_match_is_none() {
        let store = MemoryMatchStore::new();
        assert!(store.load(Uuid::from_u128(123)).await.unwrap().is_none());
    }
}
