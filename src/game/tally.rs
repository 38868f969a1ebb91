//! Ballot counting and elimination outcome

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Result of counting one round of ballots (or night designations)
#[derive(Debug, Clone, Default)]
pub struct TallyOutcome {
    /// Player to eliminate, if the count produced a unique leader.
    /// A tie for the highest count eliminates nobody: arbitrary
    /// tie-breaking was rejected as unfair, so ties stand as no kill.
    pub eliminated: Option<Uuid>,
    /// Votes per target
    pub counts: HashMap<Uuid, u32>,
}

/// Count votes per target over the currently-alive set.
///
/// Ballots whose target is not alive are ignored here even though the
/// engine validates targets at cast time; this function does not trust
/// caller validation. Voters are not filtered: a ballot cast by a player
/// who later departed in the same round still counts. Abstentions have no
/// effect on the outcome.
pub fn tally<I>(ballots: I, alive: &HashSet<Uuid>) -> TallyOutcome
where
    I: IntoIterator<Item = (Uuid, Uuid)>,
{
    let mut counts: HashMap<Uuid, u32> = HashMap::new();
    for (_voter, target) in ballots {
        if alive.contains(&target) {
            *counts.entry(target).or_insert(0) += 1;
        }
    }

    let top = counts.values().copied().max().unwrap_or(0);
    let leaders: Vec<Uuid> = counts
        .iter()
        .filter(|(_, c)| **c == top && top > 0)
        .map(|(id, _)| *id)
        .collect();

    let eliminated = match leaders.as_slice() {
        [single] => Some(*single),
        _ => None,
    };

    TallyOutcome { eliminated, counts }
}
