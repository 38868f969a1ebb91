//! Role distribution and random assignment

use rand::seq::SliceRandom;
use rand::Rng;

use super::Role;

/// Number of wolves for a given player count: one wolf per three players,
/// never zero, never the whole village.
pub fn wolf_count(player_count: usize) -> usize {
    (player_count / 3).clamp(1, player_count.saturating_sub(1).max(1))
}

/// Assign a role to each player position. The returned vector is aligned
/// with the input order; which positions become wolves is decided by a
/// uniform shuffle of the injected random source, so callers control
/// determinism by controlling the source.
pub fn assign_roles<R: Rng>(player_count: usize, rng: &mut R) -> Vec<Role> {
    let mut order: Vec<usize> = (0..player_count).collect();
    order.shuffle(rng);

    let wolves = wolf_count(player_count);
    let mut roles = vec![Role::Villager; player_count];
    for &idx in order.iter().take(wolves) {
        roles[idx] = Role::Wolf;
    }
    roles
}
