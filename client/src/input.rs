//! Bot input: random moves and bomb drops for the local player

use rand::Rng;
use shared::{ClientRequest, GameState, PlayerId};

const DIRECTIONS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Picks requests for an automated player
///
/// Only requests that the current mirror says are legal are produced, so a
/// bot never floods the leader with moves into walls.
pub struct Bot<R: Rng> {
    rng: R,
    /// Chance of dropping a bomb instead of moving
    bomb_chance: f64,
}

impl<R: Rng> Bot<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            bomb_chance: 0.2,
        }
    }

    pub fn with_bomb_chance(mut self, bomb_chance: f64) -> Self {
        self.bomb_chance = bomb_chance.clamp(0.0, 1.0);
        self
    }

    /// Next request for `player`, or `None` if it cannot act right now
    pub fn next_request(&mut self, state: &GameState, player: PlayerId) -> Option<ClientRequest> {
        let me = state.players.get(&player).filter(|p| p.alive && !p.moving)?;

        let open: Vec<(i32, i32)> = DIRECTIONS
            .iter()
            .copied()
            .filter(|&(dx, dy)| !state.is_blocked(me.x + dx, me.y + dy))
            .collect();
        if open.is_empty() {
            return None;
        }

        let (dx, dy) = open[self.rng.gen_range(0..open.len())];
        if self.rng.gen_bool(self.bomb_chance) {
            Some(ClientRequest::BombSpawn {
                x: me.x + dx,
                y: me.y + dy,
            })
        } else {
            Some(ClientRequest::Move { dx, dy })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::DEFAULT_LEVEL;

    fn arena() -> GameState {
        GameState::from_layout(DEFAULT_LEVEL).unwrap()
    }

    #[test]
    fn test_bot_only_targets_open_cells() {
        let state = arena();
        let mut bot = Bot::new(StdRng::seed_from_u64(7));

        for _ in 0..200 {
            match bot.next_request(&state, 2) {
                // player 2 sits at (4, 0): only left and down are open
                Some(ClientRequest::Move { dx, dy }) => {
                    assert!(matches!((dx, dy), (-1, 0) | (0, 1)))
                }
                Some(ClientRequest::BombSpawn { x, y }) => {
                    assert!(matches!((x, y), (3, 0) | (4, 1)))
                }
                None => panic!("Player 2 can always act"),
            }
        }
    }

    #[test]
    fn test_bot_respects_bomb_chance() {
        let state = arena();
        let mut always = Bot::new(StdRng::seed_from_u64(1)).with_bomb_chance(1.0);
        let mut never = Bot::new(StdRng::seed_from_u64(1)).with_bomb_chance(0.0);

        for _ in 0..50 {
            assert!(matches!(
                always.next_request(&state, 1),
                Some(ClientRequest::BombSpawn { .. })
            ));
            assert!(matches!(
                never.next_request(&state, 1),
                Some(ClientRequest::Move { .. })
            ));
        }
    }

    #[test]
    fn test_bot_idles_when_unable_to_act() {
        let mut state = arena();
        let mut bot = Bot::new(StdRng::seed_from_u64(3));

        state.players.get_mut(&1).unwrap().moving = true;
        assert_eq!(bot.next_request(&state, 1), None);

        state.players.get_mut(&3).unwrap().alive = false;
        assert_eq!(bot.next_request(&state, 3), None);

        assert_eq!(bot.next_request(&state, 9), None);
    }
}
