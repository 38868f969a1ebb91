//! Match aggregate and authoritative state machine
//!
//! All transition logic is synchronous computation over the in-memory
//! aggregate. The engine actor owns concurrency and persistence; nothing
//! in this module blocks or talks to the outside world.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PhaseDurations;

use super::{roles, tally, GameError, Notice};

/// Minimum players required to start a match
pub const MIN_PLAYERS: usize = 4;
/// Maximum players a match accepts
pub const MAX_PLAYERS: usize = 12;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Waiting for players
    Lobby,
    /// Wolves pick a victim in secret
    Night,
    /// Open discussion, no actions
    Day,
    /// The village votes for an elimination
    Vote,
    /// Transient: vote outcome being applied. Committed state never rests
    /// here; the resolution happens inside the closing transition.
    Resolution,
    /// Match over, winner set
    End,
}

/// The two role factions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Wolf,
    Villager,
}

/// Winning side of a finished match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Faction {
    Wolves,
    Villagers,
}

/// Player state inside a match (authoritative)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: Uuid,
    pub display_name: String,
    pub alive: bool,
    /// Left after the match started; kept on the roster for the role-count
    /// invariant and for audit, but no longer a member for commands
    pub departed: bool,
    /// Unset until the match starts, immutable afterwards
    pub role: Option<Role>,
    pub joined_at: u64,
}

impl Player {
    pub fn new(id: Uuid, display_name: String, now: u64) -> Self {
        Self {
            id,
            display_name,
            alive: true,
            departed: false,
            role: None,
            joined_at: now,
        }
    }
}

/// One player's elimination vote for a given round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub voter_id: Uuid,
    pub target_id: Uuid,
    pub round: u32,
}

/// Outcome of delivering a deadline-expired signal
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// The phase advanced; notices describe what happened
    Advanced(Vec<Notice>),
    /// The phase had already advanced (or the deadline is still in the
    /// future): nothing changed, nothing to commit
    Noop,
}

/// Match aggregate root (owned by its engine task)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub phase: Phase,
    /// Increments on each night->day cycle; 0 while in the lobby
    pub round: u32,
    /// Absolute Unix millis; set only while in a timed phase
    pub phase_deadline: Option<u64>,
    /// Insertion order is join order
    pub players: Vec<Player>,
    /// Ballots for the current round (one per voter, upsert on re-vote)
    pub ballots: Vec<Ballot>,
    /// Wolf designations for the current night (one per wolf, upsert)
    pub night_choices: HashMap<Uuid, Uuid>,
    /// Vote counts from the most recent vote resolution
    pub tally: Option<HashMap<Uuid, u32>>,
    /// Set exactly when `phase == End`
    pub winner: Option<Faction>,
    /// Monotonically increasing commit counter; 0 = never committed
    pub version: u64,
    /// Per-match RNG seed for role assignment, never reused across matches
    pub seed: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Match {
    pub fn new(id: Uuid, seed: u64, now: u64) -> Self {
        Self {
            id,
            phase: Phase::Lobby,
            round: 0,
            phase_deadline: None,
            players: Vec::new(),
            ballots: Vec::new(),
            night_choices: HashMap::new(),
            tally: None,
            winner: None,
            version: 0,
            seed,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current member lookup; departed players are not members
    fn member(&self, id: Uuid) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id && !p.departed)
    }

    pub fn alive_ids(&self) -> HashSet<Uuid> {
        self.players
            .iter()
            .filter(|p| p.alive)
            .map(|p| p.id)
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.players.iter().filter(|p| p.alive).count()
    }

    fn alive_with_role(&self, role: Role) -> usize {
        self.players
            .iter()
            .filter(|p| p.alive && p.role == Some(role))
            .count()
    }

    fn touch(&mut self, now: u64) {
        self.version += 1;
        self.updated_at = now;
    }

    /// LOBBY: append a player
    pub fn join(
        &mut self,
        player_id: Uuid,
        display_name: String,
        now: u64,
    ) -> Result<Vec<Notice>, GameError> {
        if self.phase != Phase::Lobby {
            return Err(GameError::AlreadyStarted);
        }
        if self.players.iter().any(|p| p.id == player_id) {
            return Err(GameError::AlreadyJoined);
        }
        if self.players.len() >= MAX_PLAYERS {
            return Err(GameError::MatchFull);
        }

        self.players
            .push(Player::new(player_id, display_name.clone(), now));
        self.touch(now);

        Ok(vec![Notice::System(format!(
            "{} joined the lobby ({}/{}).",
            display_name,
            self.players.len(),
            MAX_PLAYERS
        ))])
    }

    /// LOBBY -> NIGHT: assign roles and open the first night
    pub fn start<R: Rng>(
        &mut self,
        requester: Uuid,
        rng: &mut R,
        now: u64,
        durations: &PhaseDurations,
    ) -> Result<Vec<Notice>, GameError> {
        if self.phase != Phase::Lobby {
            return Err(GameError::InvalidTransition("match has already started"));
        }
        if self.member(requester).is_none() {
            return Err(GameError::NotAMember);
        }
        if self.players.len() < MIN_PLAYERS {
            return Err(GameError::NotEnoughPlayers);
        }

        let mut notices = vec![Notice::System(format!(
            "The game begins with {} players. Night falls.",
            self.players.len()
        ))];

        let assigned = roles::assign_roles(self.players.len(), rng);
        for (player, role) in self.players.iter_mut().zip(assigned.iter().copied()) {
            player.role = Some(role);
            notices.push(Notice::RoleReveal {
                player_id: player.id,
                role,
            });
        }

        self.round = 1;
        self.phase = Phase::Night;
        self.phase_deadline = Some(now + durations.night_ms);
        self.touch(now);

        Ok(notices)
    }

    /// VOTE: upsert a ballot; closes the vote early once every living
    /// player has cast one
    pub fn cast_vote(
        &mut self,
        voter: Uuid,
        target: Uuid,
        round: u32,
        now: u64,
        durations: &PhaseDurations,
    ) -> Result<Vec<Notice>, GameError> {
        if self.phase != Phase::Vote {
            return Err(GameError::InvalidTransition("voting is closed"));
        }
        if round != self.round {
            return Err(GameError::WrongRound);
        }
        let voter_alive = match self.member(voter) {
            Some(p) => p.alive,
            None => return Err(GameError::NotAMember),
        };
        if !voter_alive {
            return Err(GameError::NotAlive);
        }
        if voter == target {
            return Err(GameError::SelfTarget);
        }
        if !self.players.iter().any(|p| p.id == target && p.alive) {
            return Err(GameError::TargetNotAlive);
        }

        match self
            .ballots
            .iter_mut()
            .find(|b| b.voter_id == voter && b.round == round)
        {
            Some(ballot) => ballot.target_id = target,
            None => self.ballots.push(Ballot {
                voter_id: voter,
                target_id: target,
                round,
            }),
        }

        let mut notices = Vec::new();
        if self.all_alive_voted() {
            self.close_vote(now, durations, &mut notices);
        }
        self.touch(now);

        Ok(notices)
    }

    /// NIGHT: upsert a wolf's designation; resolves the night early once
    /// every living wolf has designated
    pub fn night_action(
        &mut self,
        wolf: Uuid,
        target: Uuid,
        now: u64,
        durations: &PhaseDurations,
    ) -> Result<Vec<Notice>, GameError> {
        if self.phase != Phase::Night {
            return Err(GameError::WrongPhase);
        }
        let actor = match self.member(wolf) {
            Some(p) => p,
            None => return Err(GameError::NotAMember),
        };
        if !actor.alive {
            return Err(GameError::NotAlive);
        }
        if actor.role != Some(Role::Wolf) {
            return Err(GameError::NotAWolf);
        }
        if wolf == target {
            return Err(GameError::SelfTarget);
        }
        if !self.players.iter().any(|p| p.id == target && p.alive) {
            return Err(GameError::TargetNotAlive);
        }

        self.night_choices.insert(wolf, target);

        let mut notices = Vec::new();
        if self.all_wolves_acted() {
            self.resolve_night(now, durations, &mut notices);
        }
        self.touch(now);

        Ok(notices)
    }

    /// Any phase: remove (lobby) or mark departed (in play). A departure
    /// after the start counts as an elimination so win-condition
    /// evaluation stays consistent.
    pub fn leave(
        &mut self,
        player_id: Uuid,
        now: u64,
        durations: &PhaseDurations,
    ) -> Result<Vec<Notice>, GameError> {
        if self.phase == Phase::Lobby {
            let idx = self
                .players
                .iter()
                .position(|p| p.id == player_id)
                .ok_or(GameError::NotAMember)?;
            let player = self.players.remove(idx);
            self.touch(now);
            return Ok(vec![Notice::System(format!(
                "{} left the lobby.",
                player.display_name
            ))]);
        }

        let mut notices = Vec::new();
        let was_alive;
        let name;
        {
            let player = self
                .players
                .iter_mut()
                .find(|p| p.id == player_id && !p.departed)
                .ok_or(GameError::NotAMember)?;
            player.departed = true;
            was_alive = player.alive;
            player.alive = false;
            name = player.display_name.clone();
        }

        if was_alive && self.phase != Phase::End {
            notices.push(Notice::System(format!(
                "{} left the village and is out of the game.",
                name
            )));
            if let Some(winner) = self.winner_if_decided() {
                self.finish(winner, &mut notices);
            } else {
                // The departure may have been the last missing ballot or
                // wolf designation.
                match self.phase {
                    Phase::Night if self.all_wolves_acted() => {
                        self.resolve_night(now, durations, &mut notices)
                    }
                    Phase::Vote if self.all_alive_voted() => {
                        self.close_vote(now, durations, &mut notices)
                    }
                    _ => {}
                }
            }
        } else {
            notices.push(Notice::System(format!("{} left.", name)));
        }

        self.touch(now);
        Ok(notices)
    }

    /// Deadline-expired signal from the phase clock. Idempotent: if the
    /// phase already advanced (or the deadline has not actually passed),
    /// this is a no-op and nothing is committed.
    pub fn advance(&mut self, now: u64, durations: &PhaseDurations) -> AdvanceOutcome {
        let deadline = match self.phase {
            Phase::Night | Phase::Day | Phase::Vote => self.phase_deadline,
            _ => None,
        };
        let Some(deadline) = deadline else {
            return AdvanceOutcome::Noop;
        };
        if now < deadline {
            return AdvanceOutcome::Noop;
        }

        let mut notices = Vec::new();
        match self.phase {
            Phase::Night => self.resolve_night(now, durations, &mut notices),
            Phase::Day => self.open_vote(now, durations, &mut notices),
            Phase::Vote => self.close_vote(now, durations, &mut notices),
            _ => return AdvanceOutcome::Noop,
        }
        self.touch(now);
        AdvanceOutcome::Advanced(notices)
    }

    fn all_wolves_acted(&self) -> bool {
        let wolves: Vec<Uuid> = self
            .players
            .iter()
            .filter(|p| p.alive && p.role == Some(Role::Wolf))
            .map(|p| p.id)
            .collect();
        !wolves.is_empty() && wolves.iter().all(|w| self.night_choices.contains_key(w))
    }

    fn all_alive_voted(&self) -> bool {
        let alive = self.alive_ids();
        !alive.is_empty()
            && alive.iter().all(|id| {
                self.ballots
                    .iter()
                    .any(|b| b.voter_id == *id && b.round == self.round)
            })
    }

    /// NIGHT -> DAY (or END): apply the wolves' plurality choice
    fn resolve_night(&mut self, now: u64, durations: &PhaseDurations, notices: &mut Vec<Notice>) {
        let alive = self.alive_ids();
        let choices: Vec<(Uuid, Uuid)> = self.night_choices.drain().collect();
        let outcome = tally::tally(choices, &alive);

        match outcome.eliminated {
            Some(victim) => {
                let name = self.eliminate(victim);
                notices.push(Notice::System(format!("{} was taken in the night.", name)));
            }
            None => notices.push(Notice::System("The night passes quietly.".to_string())),
        }

        if let Some(winner) = self.winner_if_decided() {
            self.finish(winner, notices);
        } else {
            self.phase = Phase::Day;
            self.phase_deadline = Some(now + durations.day_ms);
            notices.push(Notice::System("Day breaks over the village.".to_string()));
        }
    }

    /// DAY -> VOTE
    fn open_vote(&mut self, now: u64, durations: &PhaseDurations, notices: &mut Vec<Notice>) {
        self.phase = Phase::Vote;
        self.phase_deadline = Some(now + durations.vote_ms);
        self.tally = None;
        notices.push(Notice::System(
            "The village gathers to vote.".to_string(),
        ));
    }

    /// VOTE -> RESOLUTION -> NIGHT or END. Resolution is immediate: the
    /// committed state never rests in the Resolution phase.
    fn close_vote(&mut self, now: u64, durations: &PhaseDurations, notices: &mut Vec<Notice>) {
        let alive = self.alive_ids();
        let round = self.round;
        let ballots: Vec<(Uuid, Uuid)> = self
            .ballots
            .iter()
            .filter(|b| b.round == round)
            .map(|b| (b.voter_id, b.target_id))
            .collect();
        let outcome = tally::tally(ballots, &alive);
        self.tally = Some(outcome.counts.clone());
        self.phase = Phase::Resolution;

        match outcome.eliminated {
            Some(victim) => {
                let name = self.eliminate(victim);
                notices.push(Notice::System(format!(
                    "{} was eliminated by the village.",
                    name
                )));
            }
            None => notices.push(Notice::System(
                "The village could not decide; nobody was eliminated.".to_string(),
            )),
        }

        if let Some(winner) = self.winner_if_decided() {
            self.finish(winner, notices);
        } else {
            self.round += 1;
            self.ballots.clear();
            self.night_choices.clear();
            self.phase = Phase::Night;
            self.phase_deadline = Some(now + durations.night_ms);
            notices.push(Notice::System(format!(
                "Night falls on round {}.",
                self.round
            )));
        }
    }

    fn eliminate(&mut self, target: Uuid) -> String {
        match self.players.iter_mut().find(|p| p.id == target) {
            Some(player) => {
                player.alive = false;
                player.display_name.clone()
            }
            None => target.to_string(),
        }
    }

    /// Win-condition evaluation, run after every elimination: no wolves
    /// left means the villagers win; wolves reaching parity means the
    /// wolves win.
    fn winner_if_decided(&self) -> Option<Faction> {
        let wolves = self.alive_with_role(Role::Wolf);
        let villagers = self.alive_with_role(Role::Villager);
        if wolves == 0 {
            Some(Faction::Villagers)
        } else if wolves >= villagers {
            Some(Faction::Wolves)
        } else {
            None
        }
    }

    fn finish(&mut self, winner: Faction, notices: &mut Vec<Notice>) {
        self.phase = Phase::End;
        self.winner = Some(winner);
        self.phase_deadline = None;
        notices.push(Notice::System(match winner {
            Faction::Villagers => "The villagers win!".to_string(),
            Faction::Wolves => "The wolves win!".to_string(),
        }));
    }

    /// Structural invariant check, run when a snapshot is loaded from the
    /// store. A failure here is programmer error or data corruption, not
    /// a runtime condition to repair.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.players.len() > MAX_PLAYERS {
            return Err(format!("{} players exceeds the maximum", self.players.len()));
        }

        match self.phase {
            Phase::Lobby => {
                if self.players.iter().any(|p| p.role.is_some()) {
                    return Err("roles assigned before the match started".to_string());
                }
                if self.winner.is_some() {
                    return Err("winner set in the lobby".to_string());
                }
            }
            Phase::Resolution => {
                return Err("resolution is transient and must never be stored".to_string());
            }
            _ => {
                if self.players.len() < MIN_PLAYERS {
                    return Err(format!(
                        "{} players is below the minimum for a started match",
                        self.players.len()
                    ));
                }
                if self.players.iter().any(|p| p.role.is_none()) {
                    return Err("started match with unassigned roles".to_string());
                }
                let wolves = self
                    .players
                    .iter()
                    .filter(|p| p.role == Some(Role::Wolf))
                    .count();
                if wolves != roles::wolf_count(self.players.len()) {
                    return Err(format!("impossible wolf count {}", wolves));
                }
                if self.winner.is_some() != (self.phase == Phase::End) {
                    return Err("winner must be set exactly in the end state".to_string());
                }
                if matches!(self.phase, Phase::Night | Phase::Day | Phase::Vote)
                    && self.phase_deadline.is_none()
                {
                    return Err("timed phase without a deadline".to_string());
                }
            }
        }

        for ballot in &self.ballots {
            if !self.players.iter().any(|p| p.id == ballot.voter_id) {
                return Err("ballot from a player not on the roster".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const NOW: u64 = 1_000_000;

    fn durations() -> PhaseDurations {
        PhaseDurations::default()
    }

    fn pid(n: u128) -> Uuid {
        Uuid::from_u128(n + 1)
    }

    fn lobby_with(count: usize) -> Match {
        let mut m = Match::new(Uuid::from_u128(0xFACE), 42, NOW);
        for i in 0..count {
            m.join(pid(i as u128), format!("p{}", i), NOW).unwrap();
        }
        m
    }

    /// Build a started match with explicit roles, bypassing the shuffle so
    /// tests can pick who the wolves are.
    fn started_with(roles: &[Role]) -> Match {
        let mut m = Match::new(Uuid::from_u128(0xFACE), 42, NOW);
        for (i, role) in roles.iter().enumerate() {
            let mut p = Player::new(pid(i as u128), format!("p{}", i), NOW);
            p.role = Some(*role);
            m.players.push(p);
        }
        m.round = 1;
        m.phase = Phase::Night;
        m.phase_deadline = Some(NOW + 60_000);
        m.version = roles.len() as u64 + 1;
        m
    }

    fn to_vote_phase(m: &mut Match) {
        // run night (quiet) and day deadlines
        let night_deadline = m.phase_deadline.unwrap();
        assert!(matches!(
            m.advance(night_deadline, &durations()),
            AdvanceOutcome::Advanced(_)
        ));
        assert_eq!(m.phase, Phase::Day);
        let day_deadline = m.phase_deadline.unwrap();
        assert!(matches!(
            m.advance(day_deadline, &durations()),
            AdvanceOutcome::Advanced(_)
        ));
        assert_eq!(m.phase, Phase::Vote);
    }

    #[test]
    fn join_appends_in_order_and_rejects_duplicates() {
        let mut m = lobby_with(3);
        assert_eq!(m.players.len(), 3);
        assert_eq!(m.players[0].id, pid(0));

        let err = m.join(pid(1), "again".into(), NOW).unwrap_err();
        assert!(matches!(err, GameError::AlreadyJoined));
    }

    #[test]
    fn join_rejects_a_thirteenth_player() {
        let mut m = lobby_with(MAX_PLAYERS);
        let err = m.join(pid(99), "late".into(), NOW).unwrap_err();
        assert!(matches!(err, GameError::MatchFull));
        assert_eq!(m.players.len(), MAX_PLAYERS);
    }

    #[test]
    fn join_after_start_fails() {
        let mut m = lobby_with(4);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        m.start(pid(0), &mut rng, NOW, &durations()).unwrap();
        let err = m.join(pid(99), "late".into(), NOW).unwrap_err();
        assert!(matches!(err, GameError::AlreadyStarted));
    }

    #[test]
    fn start_requires_four_players() {
        let mut m = lobby_with(3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = m.start(pid(0), &mut rng, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotEnoughPlayers));
        assert_eq!(m.phase, Phase::Lobby);

        m.join(pid(3), "p3".into(), NOW).unwrap();
        m.start(pid(0), &mut rng, NOW, &durations()).unwrap();
        assert_eq!(m.phase, Phase::Night);
        assert_eq!(m.round, 1);
        assert_eq!(m.phase_deadline, Some(NOW + durations().night_ms));
    }

    #[test]
    fn start_assigns_every_player_exactly_one_role() {
        let mut m = lobby_with(6);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let notices = m.start(pid(0), &mut rng, NOW, &durations()).unwrap();

        assert!(m.players.iter().all(|p| p.role.is_some()));
        let wolves = m
            .players
            .iter()
            .filter(|p| p.role == Some(Role::Wolf))
            .count();
        assert_eq!(wolves, 2);

        let reveals = notices
            .iter()
            .filter(|n| matches!(n, Notice::RoleReveal { .. }))
            .count();
        assert_eq!(reveals, 6);
    }

    #[test]
    fn start_requires_membership_and_happens_once() {
        let mut m = lobby_with(4);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let err = m
            .start(pid(99), &mut rng, NOW, &durations())
            .unwrap_err();
        assert!(matches!(err, GameError::NotAMember));

        m.start(pid(0), &mut rng, NOW, &durations()).unwrap();
        let err = m.start(pid(0), &mut rng, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::InvalidTransition(_)));
    }

    #[test]
    fn night_plurality_kills_and_opens_the_day() {
        let mut m = started_with(&[Role::Wolf, Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);
        m.night_action(pid(0), pid(2), NOW, &durations()).unwrap();
        // second wolf acting resolves the night early
        let notices = m.night_action(pid(1), pid(2), NOW, &durations()).unwrap();

        assert_eq!(m.phase, Phase::Day);
        assert!(!m.players[2].alive);
        assert!(m.night_choices.is_empty());
        assert!(notices
            .iter()
            .any(|n| matches!(n, Notice::System(t) if t.contains("taken in the night"))));
    }

    #[test]
    fn night_tie_among_wolves_kills_nobody() {
        let mut m = started_with(&[Role::Wolf, Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);
        m.night_action(pid(0), pid(2), NOW, &durations()).unwrap();
        m.night_action(pid(1), pid(3), NOW, &durations()).unwrap();

        assert_eq!(m.phase, Phase::Day);
        assert_eq!(m.alive_count(), 6);
    }

    #[test]
    fn night_action_guards() {
        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager]);

        let err = m.night_action(pid(1), pid(2), NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotAWolf));

        let err = m.night_action(pid(0), pid(0), NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::SelfTarget));

        let err = m.night_action(pid(99), pid(2), NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotAMember));

        m.players[2].alive = false;
        let err = m.night_action(pid(0), pid(2), NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::TargetNotAlive));

        // wrong phase
        m.phase = Phase::Day;
        let err = m.night_action(pid(0), pid(3), NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::WrongPhase));
    }

    #[test]
    fn revote_replaces_the_earlier_ballot() {
        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);
        to_vote_phase(&mut m);

        m.cast_vote(pid(1), pid(2), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(1), pid(3), 1, NOW, &durations()).unwrap();

        let mine: Vec<&Ballot> = m.ballots.iter().filter(|b| b.voter_id == pid(1)).collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].target_id, pid(3));
    }

    #[test]
    fn vote_guards() {
        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager]);

        // voting before the vote phase opens
        let err = m.cast_vote(pid(1), pid(0), 1, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::InvalidTransition(_)));

        to_vote_phase(&mut m);

        let err = m.cast_vote(pid(1), pid(0), 2, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::WrongRound));

        let err = m.cast_vote(pid(1), pid(1), 1, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::SelfTarget));

        let err = m.cast_vote(pid(99), pid(0), 1, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotAMember));

        m.players[2].alive = false;
        let err = m.cast_vote(pid(1), pid(2), 1, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::TargetNotAlive));

        let err = m.cast_vote(pid(2), pid(0), 1, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotAlive));
    }

    #[test]
    fn tied_vote_eliminates_nobody_and_continues() {
        let mut m = started_with(&[Role::Wolf, Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);
        to_vote_phase(&mut m);

        // 3 votes on pid(0), 3 votes on pid(2); early close on the last
        m.cast_vote(pid(2), pid(0), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(3), pid(0), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(4), pid(0), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(0), pid(2), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(1), pid(2), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(5), pid(2), 1, NOW, &durations()).unwrap();

        // nobody died, next round opened
        assert_eq!(m.alive_count(), 6);
        assert_eq!(m.phase, Phase::Night);
        assert_eq!(m.round, 2);
        assert!(m.ballots.is_empty());
        let tally = m.tally.as_ref().unwrap();
        assert_eq!(tally[&pid(0)], 3);
        assert_eq!(tally[&pid(2)], 3);
    }

    #[test]
    fn villagers_win_immediately_when_the_last_wolf_is_voted_out() {
        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager]);
        to_vote_phase(&mut m);

        m.cast_vote(pid(1), pid(0), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(2), pid(0), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(3), pid(0), 1, NOW, &durations()).unwrap();
        // wolf abstains; vote closes on the deadline
        let deadline = m.phase_deadline.unwrap();
        assert!(matches!(
            m.advance(deadline, &durations()),
            AdvanceOutcome::Advanced(_)
        ));

        assert_eq!(m.phase, Phase::End);
        assert_eq!(m.winner, Some(Faction::Villagers));
        assert!(m.phase_deadline.is_none());
    }

    #[test]
    fn wolves_win_at_parity() {
        // 6 players: 2 wolves, 4 villagers. Night kill -> 2v3 continues;
        // next elimination of a villager -> 2v2 wolves win.
        let mut m = started_with(&[Role::Wolf, Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);

        m.night_action(pid(0), pid(2), NOW, &durations()).unwrap();
        m.night_action(pid(1), pid(2), NOW, &durations()).unwrap();
        assert_eq!(m.phase, Phase::Day, "2 wolves vs 3 villagers continues");

        let day_deadline = m.phase_deadline.unwrap();
        m.advance(day_deadline, &durations());
        assert_eq!(m.phase, Phase::Vote);

        // the village (and wolves) pile on a villager
        m.cast_vote(pid(0), pid(3), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(1), pid(3), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(4), pid(3), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(5), pid(3), 1, NOW, &durations()).unwrap();
        m.cast_vote(pid(3), pid(0), 1, NOW, &durations()).unwrap();

        assert_eq!(m.phase, Phase::End);
        assert_eq!(m.winner, Some(Faction::Wolves));
    }

    #[test]
    fn advance_is_idempotent() {
        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager]);
        let deadline = m.phase_deadline.unwrap();

        // before the deadline: no-op
        assert!(matches!(
            m.advance(deadline - 1, &durations()),
            AdvanceOutcome::Noop
        ));

        let version_before = m.version;
        assert!(matches!(
            m.advance(deadline, &durations()),
            AdvanceOutcome::Advanced(_)
        ));
        assert_eq!(m.phase, Phase::Day);
        assert_eq!(m.version, version_before + 1);

        // duplicate delivery of the old deadline: the day deadline is
        // still in the future, so nothing happens
        let version_after = m.version;
        assert!(matches!(
            m.advance(deadline, &durations()),
            AdvanceOutcome::Noop
        ));
        assert_eq!(m.version, version_after);
        assert_eq!(m.phase, Phase::Day);
    }

    #[test]
    fn leave_from_the_lobby_removes_the_player() {
        let mut m = lobby_with(3);
        m.leave(pid(1), NOW, &durations()).unwrap();
        assert_eq!(m.players.len(), 2);
        assert!(m.players.iter().all(|p| p.id != pid(1)));

        let err = m.leave(pid(1), NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotAMember));
    }

    #[test]
    fn leave_mid_match_counts_as_an_elimination() {
        let mut m = started_with(&[Role::Wolf, Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);

        m.leave(pid(2), NOW, &durations()).unwrap();
        let p = m.players.iter().find(|p| p.id == pid(2)).unwrap();
        assert!(p.departed);
        assert!(!p.alive);
        assert_eq!(m.players.len(), 6, "roster keeps departed players");

        // two villagers leaving brings wolves to parity: wolves win
        m.leave(pid(3), NOW, &durations()).unwrap();
        assert_eq!(m.phase, Phase::End);
        assert_eq!(m.winner, Some(Faction::Wolves));
    }

    #[test]
    fn ballot_survives_departure_but_no_new_ballot_after() {
        let mut m = started_with(&[Role::Wolf, Role::Wolf, Role::Villager, Role::Villager, Role::Villager, Role::Villager]);
        to_vote_phase(&mut m);

        m.cast_vote(pid(2), pid(0), 1, NOW, &durations()).unwrap();
        m.leave(pid(2), NOW, &durations()).unwrap();

        assert!(
            m.ballots.iter().any(|b| b.voter_id == pid(2)),
            "ballot cast before departure still stands"
        );
        let err = m.cast_vote(pid(2), pid(0), 1, NOW, &durations()).unwrap_err();
        assert!(matches!(err, GameError::NotAMember));

        // and the standing ballot still counts at the deadline
        m.cast_vote(pid(3), pid(0), 1, NOW, &durations()).unwrap();
        let deadline = m.phase_deadline.unwrap();
        m.advance(deadline, &durations());
        assert!(!m.players[0].alive, "two standing votes eliminated the wolf");
    }

    #[test]
    fn version_increases_by_one_per_committed_command() {
        let mut m = Match::new(Uuid::from_u128(0xFACE), 42, NOW);
        let mut last = m.version;
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        for i in 0..4 {
            m.join(pid(i), format!("p{}", i), NOW).unwrap();
            assert_eq!(m.version, last + 1);
            last = m.version;
        }
        m.start(pid(0), &mut rng, NOW, &durations()).unwrap();
        assert_eq!(m.version, last + 1);
    }

    #[test]
    fn invariant_check_rejects_corrupt_snapshots() {
        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager]);
        assert!(m.check_invariants().is_ok());

        // an all-wolf roster is impossible under the assignment formula
        for p in &mut m.players {
            p.role = Some(Role::Wolf);
        }
        assert!(m.check_invariants().is_err());

        let mut m = started_with(&[Role::Wolf, Role::Villager, Role::Villager, Role::Villager]);
        m.winner = Some(Faction::Wolves);
        assert!(m.check_invariants().is_err(), "winner outside END");

        let mut m = lobby_with(2);
        m.players[0].role = Some(Role::Wolf);
        assert!(m.check_invariants().is_err(), "role in the lobby");
    }
}
