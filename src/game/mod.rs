//! Match engine modules

pub mod clock;
pub mod engine;
pub mod r#match;
pub mod registry;
pub mod roles;
pub mod snapshot;
pub mod tally;

pub use engine::{MatchEngine, MatchHandle};
pub use r#match::{Faction, Match, Phase, Player, Role};
pub use registry::MatchRegistry;
pub use snapshot::MatchSnapshot;

use uuid::Uuid;

/// System output produced by a committed transition, delivered to the
/// notification sink (chat) and, for public lines, to subscribed clients.
#[derive(Debug, Clone)]
pub enum Notice {
    /// Public system line ("Night falls...", "X was eliminated")
    System(String),
    /// Private role reveal for one player, emitted once at game start
    RoleReveal { player_id: Uuid, role: Role },
}

/// Event broadcast to connected clients after a committed transition.
/// Carries the new version only; subscribers fetch their own viewer-scoped
/// snapshot, so role concealment never depends on the broadcast payload.
#[derive(Debug, Clone)]
pub enum MatchEvent {
    Updated { version: u64 },
    Notice { text: String },
}

/// Typed command rejections. Guard violations name the violated invariant
/// so clients can distinguish "you can't vote right now" from "server
/// unavailable".
#[derive(Debug, Clone, thiserror::Error)]
pub enum GameError {
    #[error("match has already started")]
    AlreadyStarted,

    #[error("match is full")]
    MatchFull,

    #[error("player already joined this match")]
    AlreadyJoined,

    #[error("not enough players to start")]
    NotEnoughPlayers,

    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    #[error("not a member of this match")]
    NotAMember,

    #[error("player is not alive")]
    NotAlive,

    #[error("target is not alive")]
    TargetNotAlive,

    #[error("players cannot target themselves")]
    SelfTarget,

    #[error("ballot is for a different round")]
    WrongRound,

    #[error("player is not a wolf")]
    NotAWolf,

    #[error("action is not allowed in this phase")]
    WrongPhase,

    #[error("match state failed invariant check: {0}")]
    Corrupt(String),

    #[error("match unavailable: {0}")]
    Unavailable(String),
}

impl GameError {
    /// Stable machine-readable error kind for the wire
    pub fn kind(&self) -> &'static str {
        match self {
            GameError::AlreadyStarted => "already_started",
            GameError::MatchFull => "match_full",
            GameError::AlreadyJoined => "already_joined",
            GameError::NotEnoughPlayers => "not_enough_players",
            GameError::InvalidTransition(_) => "invalid_transition",
            GameError::NotAMember => "not_a_member",
            GameError::NotAlive => "not_alive",
            GameError::TargetNotAlive => "target_not_alive",
            GameError::SelfTarget => "self_target",
            GameError::WrongRound => "wrong_round",
            GameError::NotAWolf => "not_a_wolf",
            GameError::WrongPhase => "wrong_phase",
            GameError::Corrupt(_) => "corrupt_state",
            GameError::Unavailable(_) => "unavailable",
        }
    }
}
