//! Registry of active match engines
//!
//! The only place where match-id -> engine mappings are created or
//! removed. Creation is first-writer-wins: a second concurrent create for
//! the same id is routed to the existing engine, never a duplicate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::config::PhaseDurations;
use crate::notify::NotificationSink;
use crate::store::MatchStore;
use crate::util::time::unix_millis;

use super::engine::{MatchEngine, MatchHandle};
use super::r#match::{Match, Phase};
use super::GameError;

pub struct MatchRegistry {
    matches: Arc<DashMap<Uuid, MatchHandle>>,
    /// Terminal snapshots of retired matches, kept queryable for audit
    archive: Arc<RwLock<HashMap<Uuid, Match>>>,
    store: Arc<dyn MatchStore>,
    notifier: Arc<dyn NotificationSink>,
    durations: PhaseDurations,
    retire_grace: Duration,
}

impl MatchRegistry {
    pub fn new(
        store: Arc<dyn MatchStore>,
        notifier: Arc<dyn NotificationSink>,
        durations: PhaseDurations,
        retire_grace: Duration,
    ) -> Self {
        Self {
            matches: Arc::new(DashMap::new()),
            archive: Arc::new(RwLock::new(HashMap::new())),
            store,
            notifier,
            durations,
            retire_grace,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    /// Resolve the engine for a match, recovering it from the store or
    /// creating a fresh lobby. At most one engine per id ever runs.
    pub async fn get_or_create(&self, id: Uuid) -> Result<MatchHandle, GameError> {
        if let Some(handle) = self.resolve_existing(id).await? {
            return Ok(handle);
        }
        Ok(self.install(Match::new(id, rand::random(), unix_millis())))
    }

    /// Like `get_or_create` but never creates: a match unknown to both the
    /// registry and the store resolves to `None`
    pub async fn resolve_existing(&self, id: Uuid) -> Result<Option<MatchHandle>, GameError> {
        if let Some(handle) = self.get(&id) {
            return Ok(Some(handle));
        }

        // Load outside the map lock; `install` decides the winner if two
        // callers race here.
        match self.store.load(id).await {
            Ok(Some(stored)) => {
                stored.check_invariants().map_err(GameError::Corrupt)?;
                Ok(Some(self.install(stored)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(GameError::Unavailable(e.to_string())),
        }
    }

    /// Insert an engine for the aggregate unless one already runs
    /// (first-writer-wins), and spawn its task.
    fn install(&self, state: Match) -> MatchHandle {
        let id = state.id;
        match self.matches.entry(id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (engine, handle) = MatchEngine::new(
                    state,
                    Arc::clone(&self.store),
                    Arc::clone(&self.notifier),
                    self.durations,
                    self.retire_grace,
                );
                entry.insert(handle.clone());

                let matches = Arc::clone(&self.matches);
                let archive = Arc::clone(&self.archive);
                tokio::spawn(async move {
                    let final_state = engine.run().await;
                    if final_state.phase == Phase::End {
                        archive.write().insert(id, final_state);
                    }
                    matches.remove(&id);
                    info!(match_id = %id, "match removed from registry");
                });

                handle
            }
        }
    }

    /// Terminal snapshot of a retired match, if any
    pub fn archived(&self, id: &Uuid) -> Option<Match> {
        self.archive.read().get(id).cloned()
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches.iter().map(|m| m.value().member_count()).sum()
    }
}
