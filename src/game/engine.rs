//! Match engine actor - the single writer of one match aggregate
//!
//! Every command for a match flows through one mpsc queue into one task,
//! so commands are applied strictly one at a time and never race. Each
//! valid command is committed to the store before its reply is sent; a
//! crash right after a commit can therefore never lose acknowledged state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PhaseDurations;
use crate::notify::NotificationSink;
use crate::store::{CommitOutcome, MatchStore};
use crate::util::time::unix_millis;

use super::clock::PhaseClock;
use super::r#match::{AdvanceOutcome, Match, Phase};
use super::snapshot::{self, MatchSnapshot};
use super::{GameError, MatchEvent, Notice};

const COMMAND_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 64;
/// Conflicts mean another writer touched our row; retry a bounded number
/// of times with a reloaded snapshot before giving up
const MAX_COMMIT_ATTEMPTS: u32 = 3;

type Reply = oneshot::Sender<Result<MatchSnapshot, GameError>>;

/// Commands accepted by the engine task
enum EngineCommand {
    Join {
        player_id: Uuid,
        display_name: String,
        reply: Reply,
    },
    Start {
        requester: Uuid,
        reply: Reply,
    },
    CastVote {
        voter: Uuid,
        target: Uuid,
        round: u32,
        reply: Reply,
    },
    NightAction {
        wolf: Uuid,
        target: Uuid,
        reply: Reply,
    },
    Leave {
        player_id: Uuid,
        reply: Reply,
    },
    /// Deadline-expired delivery; idempotent, also accepted externally
    AdvancePhase {
        reply: Option<Reply>,
    },
    Snapshot {
        viewer: Option<Uuid>,
        reply: Reply,
    },
}

/// Handle to a running match engine
#[derive(Clone, Debug)]
pub struct MatchHandle {
    pub id: Uuid,
    cmd_tx: mpsc::Sender<EngineCommand>,
    events_tx: broadcast::Sender<MatchEvent>,
    member_count: Arc<AtomicUsize>,
}

impl MatchHandle {
    pub async fn join(
        &self,
        player_id: Uuid,
        display_name: String,
    ) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::Join {
            player_id,
            display_name,
            reply,
        })
        .await
    }

    pub async fn start(&self, requester: Uuid) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::Start { requester, reply })
            .await
    }

    pub async fn cast_vote(
        &self,
        voter: Uuid,
        target: Uuid,
        round: u32,
    ) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::CastVote {
            voter,
            target,
            round,
            reply,
        })
        .await
    }

    pub async fn night_action(&self, wolf: Uuid, target: Uuid) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::NightAction { wolf, target, reply })
            .await
    }

    pub async fn leave(&self, player_id: Uuid) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::Leave { player_id, reply })
            .await
    }

    pub async fn advance_phase(&self) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::AdvancePhase { reply: Some(reply) })
            .await
    }

    pub async fn snapshot(&self, viewer: Option<Uuid>) -> Result<MatchSnapshot, GameError> {
        self.request(|reply| EngineCommand::Snapshot { viewer, reply })
            .await
    }

    /// Subscribe to committed-transition events
    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events_tx.subscribe()
    }

    /// Current (non-departed) membership, for registry stats
    pub fn member_count(&self) -> usize {
        self.member_count.load(Ordering::Relaxed)
    }

    /// Whether two handles point at the same engine task
    pub fn same_engine(&self, other: &MatchHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> EngineCommand,
    ) -> Result<MatchSnapshot, GameError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| GameError::Unavailable("match engine is gone".to_string()))?;
        rx.await
            .map_err(|_| GameError::Unavailable("match engine dropped the reply".to_string()))?
    }
}

/// The authoritative engine task for one match
pub struct MatchEngine {
    state: Match,
    store: Arc<dyn MatchStore>,
    notifier: Arc<dyn NotificationSink>,
    durations: PhaseDurations,
    retire_grace: Duration,
    rng: ChaCha8Rng,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    events_tx: broadcast::Sender<MatchEvent>,
    member_count: Arc<AtomicUsize>,
    phase_clock: PhaseClock,
    retire_clock: PhaseClock,
}

impl MatchEngine {
    pub fn new(
        state: Match,
        store: Arc<dyn MatchStore>,
        notifier: Arc<dyn NotificationSink>,
        durations: PhaseDurations,
        retire_grace: Duration,
    ) -> (Self, MatchHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        let member_count = Arc::new(AtomicUsize::new(
            state.players.iter().filter(|p| !p.departed).count(),
        ));

        let handle = MatchHandle {
            id: state.id,
            cmd_tx,
            events_tx: events_tx.clone(),
            member_count: member_count.clone(),
        };

        let rng = ChaCha8Rng::seed_from_u64(state.seed);
        let mut engine = Self {
            state,
            store,
            notifier,
            durations,
            retire_grace,
            rng,
            cmd_rx,
            events_tx,
            member_count,
            phase_clock: PhaseClock::new(),
            retire_clock: PhaseClock::new(),
        };
        engine.arm_clocks();

        (engine, handle)
    }

    /// Run the engine until the match retires. Returns the final aggregate
    /// so the registry can archive it.
    pub async fn run(mut self) -> Match {
        info!(match_id = %self.state.id, phase = ?self.state.phase, "match engine started");

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // every handle dropped; nobody can reach us anymore
                    None => break,
                },
                () = self.phase_clock.expired() => self.handle_deadline().await,
                () = self.retire_clock.expired() => {
                    info!(match_id = %self.state.id, phase = ?self.state.phase, "retiring match");
                    break;
                }
            }
        }

        info!(match_id = %self.state.id, version = self.state.version, "match engine stopped");
        self.state
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        let durations = self.durations;
        match cmd {
            EngineCommand::Join {
                player_id,
                display_name,
                reply,
            } => {
                let result = self
                    .apply(Some(player_id), |m, _, now| {
                        m.join(player_id, display_name.clone(), now)
                    })
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::Start { requester, reply } => {
                let result = self
                    .apply(Some(requester), |m, rng, now| {
                        m.start(requester, rng, now, &durations)
                    })
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::CastVote {
                voter,
                target,
                round,
                reply,
            } => {
                let result = self
                    .apply(Some(voter), |m, _, now| {
                        m.cast_vote(voter, target, round, now, &durations)
                    })
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::NightAction { wolf, target, reply } => {
                let result = self
                    .apply(Some(wolf), |m, _, now| {
                        m.night_action(wolf, target, now, &durations)
                    })
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::Leave { player_id, reply } => {
                let result = self
                    .apply(Some(player_id), |m, _, now| m.leave(player_id, now, &durations))
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::AdvancePhase { reply } => {
                let result = self.advance(None).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EngineCommand::Snapshot { viewer, reply } => {
                let _ = reply.send(Ok(snapshot::project(&self.state, viewer)));
            }
        }
        self.arm_clocks();
    }

    async fn handle_deadline(&mut self) {
        if let Err(e) = self.advance(None).await {
            error!(match_id = %self.state.id, error = %e, "deadline transition failed");
        }
        self.arm_clocks();
    }

    async fn advance(&mut self, viewer: Option<Uuid>) -> Result<MatchSnapshot, GameError> {
        let durations = self.durations;
        self.apply(viewer, |m, _, now| {
            Ok(match m.advance(now, &durations) {
                AdvanceOutcome::Advanced(notices) => notices,
                // the phase already moved on; succeed without a commit
                AdvanceOutcome::Noop => Vec::new(),
            })
        })
        .await
    }

    /// Validate-apply-commit with bounded conflict retries. The transition
    /// runs on a scratch copy, so a rejected command leaves no partial
    /// mutation; a no-op (version unchanged) skips the store entirely.
    async fn apply<F>(&mut self, viewer: Option<Uuid>, mut f: F) -> Result<MatchSnapshot, GameError>
    where
        F: FnMut(&mut Match, &mut ChaCha8Rng, u64) -> Result<Vec<Notice>, GameError>,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let now = unix_millis();
            let mut next = self.state.clone();
            let notices = f(&mut next, &mut self.rng, now)?;

            if next.version == self.state.version {
                return Ok(snapshot::project(&self.state, viewer));
            }

            match self
                .store
                .commit_if_version(self.state.id, self.state.version, &next)
                .await
            {
                Ok(CommitOutcome::Committed) => {
                    self.state = next;
                    self.after_commit(notices);
                    return Ok(snapshot::project(&self.state, viewer));
                }
                Ok(CommitOutcome::Conflict) => {
                    // Should be impossible while this task is the only
                    // writer; reload and retry, loudly.
                    warn!(
                        match_id = %self.state.id,
                        attempt,
                        "commit conflict despite single-writer ownership, reloading"
                    );
                    match self.store.load(self.state.id).await {
                        Ok(Some(current)) => {
                            if let Err(reason) = current.check_invariants() {
                                return Err(GameError::Corrupt(reason));
                            }
                            self.state = current;
                        }
                        Ok(None) => {
                            return Err(GameError::Unavailable(
                                "match vanished from the store".to_string(),
                            ))
                        }
                        Err(e) => return Err(GameError::Unavailable(e.to_string())),
                    }
                }
                Err(e) => {
                    error!(match_id = %self.state.id, error = %e, "store commit failed");
                    return Err(GameError::Unavailable(e.to_string()));
                }
            }
        }
        Err(GameError::Unavailable("commit retries exhausted".to_string()))
    }

    fn after_commit(&mut self, notices: Vec<Notice>) {
        let members = self.state.players.iter().filter(|p| !p.departed).count();
        self.member_count.store(members, Ordering::Relaxed);

        let _ = self.events_tx.send(MatchEvent::Updated {
            version: self.state.version,
        });

        for notice in notices {
            if let Notice::System(text) = &notice {
                let _ = self.events_tx.send(MatchEvent::Notice { text: text.clone() });
            }
            // Fire and forget: a slow or failing sink must not stall the
            // match task.
            let sink = Arc::clone(&self.notifier);
            let match_id = self.state.id;
            tokio::spawn(async move { sink.publish(match_id, notice).await });
        }
    }

    /// Recompute both timers from the committed state. Deadlines are
    /// absolute, so re-arming after every command is idempotent.
    fn arm_clocks(&mut self) {
        match self.state.phase {
            Phase::Night | Phase::Day | Phase::Vote => {
                self.phase_clock.arm_unix_millis(self.state.phase_deadline)
            }
            _ => self.phase_clock.disarm(),
        }

        let members = self.state.players.iter().filter(|p| !p.departed).count();
        if self.state.phase == Phase::End {
            if !self.retire_clock.is_armed() {
                self.retire_clock.arm_in(self.retire_grace);
            }
        } else if members == 0 {
            if !self.retire_clock.is_armed() {
                // an abandoned lobby retires at once; a freshly created,
                // never-joined engine lingers for the grace period
                let delay = if self.state.version == 0 {
                    self.retire_grace
                } else {
                    Duration::ZERO
                };
                self.retire_clock.arm_in(delay);
            }
        } else {
            self.retire_clock.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::Phase;
    use crate::game::Role;
    use crate::notify::TracingSink;
    use crate::store::{MatchStore, MemoryMatchStore, StoreError};
    use async_trait::async_trait;

    fn test_durations() -> PhaseDurations {
        // a short first night so deadline tests stay fast; later phases
        // long enough to never fire on their own
        PhaseDurations {
            night_ms: 50,
            day_ms: 60_000,
            vote_ms: 60_000,
        }
    }

    fn spawn_engine_with(store: Arc<dyn MatchStore>, durations: PhaseDurations) -> MatchHandle {
        let state = Match::new(Uuid::new_v4(), rand::random(), unix_millis());
        let (engine, handle) = MatchEngine::new(
            state,
            store,
            Arc::new(TracingSink),
            durations,
            Duration::from_secs(60),
        );
        tokio::spawn(engine.run());
        handle
    }

    fn spawn_engine(store: Arc<dyn MatchStore>) -> MatchHandle {
        spawn_engine_with(store, test_durations())
    }

    fn pid(n: u128) -> Uuid {
        Uuid::from_u128(n + 1)
    }

    async fn join_four(handle: &MatchHandle) {
        for i in 0..4 {
            handle.join(pid(i), format!("p{}", i)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn commands_commit_with_strictly_increasing_versions() {
        let store = Arc::new(MemoryMatchStore::new());
        let handle = spawn_engine(store.clone());

        let mut last = 0;
        for i in 0..4 {
            let snap = handle.join(pid(i), format!("p{}", i)).await.unwrap();
            assert!(snap.version > last);
            last = snap.version;
        }
        let snap = handle.start(pid(0)).await.unwrap();
        assert_eq!(snap.version, last + 1);
        assert_eq!(snap.state, Phase::Night);

        // the store observed the same committed version
        let stored = store.load(handle.id).await.unwrap().unwrap();
        assert_eq!(stored.version, snap.version);
    }

    #[tokio::test]
    async fn rejected_commands_leave_no_trace() {
        let store = Arc::new(MemoryMatchStore::new());
        let handle = spawn_engine(store.clone());
        join_four(&handle).await;

        let err = handle.join(pid(0), "again".to_string()).await.unwrap_err();
        assert!(matches!(err, GameError::AlreadyJoined));

        let snap = handle.snapshot(None).await.unwrap();
        assert_eq!(snap.version, 4, "failed command must not bump the version");
        assert_eq!(store.load(handle.id).await.unwrap().unwrap().version, 4);
    }

    #[tokio::test]
    async fn command_replies_carry_only_the_callers_role() {
        let store = Arc::new(MemoryMatchStore::new());
        let handle = spawn_engine(store);
        join_four(&handle).await;

        let snap = handle.start(pid(0)).await.unwrap();
        for view in &snap.players {
            if view.id == pid(0) {
                assert!(view.role_self.is_some());
            } else {
                assert!(view.role_self.is_none());
            }
        }

        let public = handle.snapshot(None).await.unwrap();
        assert!(public.players.iter().all(|p| p.role_self.is_none()));
    }

    #[tokio::test]
    async fn the_phase_clock_advances_an_idle_night() {
        let store = Arc::new(MemoryMatchStore::new());
        let handle = spawn_engine(store);
        join_four(&handle).await;
        handle.start(pid(0)).await.unwrap();

        // nobody acts; the 50ms night deadline fires on its own
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = handle.snapshot(None).await.unwrap();
        assert_eq!(snap.state, Phase::Day);
    }

    #[tokio::test]
    async fn duplicate_advance_deliveries_are_idempotent() {
        let store = Arc::new(MemoryMatchStore::new());
        let handle = spawn_engine(store);
        join_four(&handle).await;
        handle.start(pid(0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let first = handle.advance_phase().await.unwrap();
        let second = handle.advance_phase().await.unwrap();
        assert_eq!(first.state, Phase::Day);
        assert_eq!(second.state, Phase::Day);
        assert_eq!(
            first.version, second.version,
            "duplicate delivery must not commit"
        );
    }

    #[tokio::test]
    async fn committed_transitions_are_broadcast() {
        let store = Arc::new(MemoryMatchStore::new());
        let handle = spawn_engine(store);
        let mut events = handle.subscribe();

        handle.join(pid(0), "p0".to_string()).await.unwrap();

        let mut saw_update = false;
        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            match event {
                MatchEvent::Updated { version } => {
                    assert_eq!(version, 1);
                    saw_update = true;
                }
                MatchEvent::Notice { text } => {
                    assert!(text.contains("joined the lobby"));
                    saw_notice = true;
                }
            }
        }
        assert!(saw_update && saw_notice);
    }

    /// Store that always reports a conflict, for the retry-exhaustion path
    struct ConflictingStore;

    #[async_trait]
    impl MatchStore for ConflictingStore {
        async fn load(&self, match_id: Uuid) -> Result<Option<Match>, StoreError> {
            // hand back a pristine lobby so every retry reapplies cleanly
            Ok(Some(Match::new(match_id, 1, 0)))
        }
        async fn commit_if_version(
            &self,
            _match_id: Uuid,
            _expected: u64,
            _next: &Match,
        ) -> Result<CommitOutcome, StoreError> {
            Ok(CommitOutcome::Conflict)
        }
    }

    #[tokio::test]
    async fn exhausted_commit_retries_surface_as_transient_failures() {
        let handle = spawn_engine(Arc::new(ConflictingStore));
        let err = handle.join(pid(0), "p0".to_string()).await.unwrap_err();
        assert!(matches!(err, GameError::Unavailable(_)));

        // the engine state is untouched and the next read still works
        let snap = handle.snapshot(None).await.unwrap();
        assert_eq!(snap.version, 0);
        assert!(snap.players.is_empty());
    }

    #[tokio::test]
    async fn full_game_reaches_an_end_state() {
        let store = Arc::new(MemoryMatchStore::new());
        // quick night and day; the vote stays open until everyone votes
        let handle = spawn_engine_with(
            store,
            PhaseDurations {
                night_ms: 50,
                day_ms: 50,
                vote_ms: 60_000,
            },
        );
        join_four(&handle).await;
        let snap = handle.start(pid(0)).await.unwrap();

        // find the wolf through per-viewer snapshots (the engine never
        // leaks it in one response)
        let mut wolf = None;
        for view in &snap.players {
            let mine = handle.snapshot(Some(view.id)).await.unwrap();
            let me = mine.players.iter().find(|p| p.id == view.id).unwrap();
            if me.role_self == Some(Role::Wolf) {
                wolf = Some(view.id);
            }
        }
        let wolf = wolf.expect("a four-player match has exactly one wolf");

        // the idle night and day deadlines fire on their own
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snap = handle.snapshot(None).await.unwrap();
        assert_eq!(snap.state, Phase::Vote);

        // everyone votes; the village piles on the wolf, the wolf votes
        // back, and the early-close resolves the round
        let someone_else = snap
            .players
            .iter()
            .map(|p| p.id)
            .find(|id| *id != wolf)
            .unwrap();
        for view in &snap.players {
            let target = if view.id == wolf { someone_else } else { wolf };
            handle.cast_vote(view.id, target, snap.round).await.unwrap();
        }

        let end = handle.snapshot(None).await.unwrap();
        assert_eq!(end.state, Phase::End);
        assert_eq!(end.winner, Some(crate::game::Faction::Villagers));
        assert!(
            !end.players.iter().find(|p| p.id == wolf).unwrap().alive,
            "the voted-out wolf is dead"
        );
    }
}
