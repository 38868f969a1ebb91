//! Viewer-scoped snapshot projection
//!
//! The engine stores every role; concealment is enforced here, in exactly
//! one place. A projection carries `role_self` only for the requesting
//! viewer and never any other player's role.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::r#match::{Faction, Match, Phase, Role};

/// Externally-visible match state at a given version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub id: Uuid,
    pub state: Phase,
    pub round: u32,
    /// Absolute Unix millis; present only in timed phases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_deadline: Option<u64>,
    pub players: Vec<PlayerView>,
    /// Vote counts; present only during and after a vote
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally: Option<Vec<TallyEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Faction>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: Uuid,
    pub name: String,
    pub alive: bool,
    pub departed: bool,
    /// Only ever the viewer's own role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_self: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyEntry {
    pub target_id: Uuid,
    pub count: u32,
}

/// Project the aggregate for one viewer (or none, for the public feed)
pub fn project(m: &Match, viewer: Option<Uuid>) -> MatchSnapshot {
    let players = m
        .players
        .iter()
        .map(|p| PlayerView {
            id: p.id,
            name: p.display_name.clone(),
            alive: p.alive,
            departed: p.departed,
            role_self: match viewer {
                Some(v) if v == p.id => p.role,
                _ => None,
            },
        })
        .collect();

    MatchSnapshot {
        id: m.id,
        state: m.phase,
        round: m.round,
        phase_deadline: m.phase_deadline,
        players,
        tally: visible_tally(m),
        winner: m.winner,
        version: m.version,
    }
}

/// During VOTE the tally is computed live from the standing ballots;
/// afterwards the resolution's stored counts are shown.
fn visible_tally(m: &Match) -> Option<Vec<TallyEntry>> {
    if m.phase == Phase::Vote {
        let mut counts: HashMap<Uuid, u32> = HashMap::new();
        for ballot in m.ballots.iter().filter(|b| b.round == m.round) {
            *counts.entry(ballot.target_id).or_insert(0) += 1;
        }
        return Some(to_entries(&counts));
    }
    m.tally.as_ref().map(to_entries)
}

fn to_entries(counts: &HashMap<Uuid, u32>) -> Vec<TallyEntry> {
    let mut entries: Vec<TallyEntry> = counts
        .iter()
        .map(|(target_id, count)| TallyEntry {
            target_id: *target_id,
            count: *count,
        })
        .collect();
    // stable output for clients and tests
    entries.sort_by(|a, b| b.count.cmp(&a.count).then(a.target_id.cmp(&b.target_id)));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::{Ballot, Player};

    fn fixture() -> Match {
        let mut m = Match::new(Uuid::from_u128(1), 7, 1000);
        for i in 0..4u128 {
            let mut p = Player::new(Uuid::from_u128(10 + i), format!("p{}", i), 1000);
            p.role = Some(if i == 0 { Role::Wolf } else { Role::Villager });
            m.players.push(p);
        }
        m.phase = Phase::Night;
        m.round = 1;
        m.phase_deadline = Some(2000);
        m.version = 5;
        m
    }

    #[test]
    fn roles_are_redacted_for_everyone_but_the_viewer() {
        let m = fixture();
        let wolf = Uuid::from_u128(10);

        let snap = project(&m, Some(wolf));
        for view in &snap.players {
            if view.id == wolf {
                assert_eq!(view.role_self, Some(Role::Wolf));
            } else {
                assert!(view.role_self.is_none());
            }
        }

        let public = project(&m, None);
        assert!(public.players.iter().all(|p| p.role_self.is_none()));
    }

    #[test]
    fn tally_is_live_during_the_vote() {
        let mut m = fixture();
        m.phase = Phase::Vote;
        let (a, b) = (Uuid::from_u128(10), Uuid::from_u128(11));
        m.ballots.push(Ballot {
            voter_id: b,
            target_id: a,
            round: 1,
        });
        m.ballots.push(Ballot {
            voter_id: Uuid::from_u128(12),
            target_id: a,
            round: 1,
        });

        let snap = project(&m, None);
        let tally = snap.tally.expect("tally visible during VOTE");
        assert_eq!(tally[0].target_id, a);
        assert_eq!(tally[0].count, 2);
    }

    #[test]
    fn tally_is_absent_before_any_vote() {
        let m = fixture();
        assert!(project(&m, None).tally.is_none());
    }
}
