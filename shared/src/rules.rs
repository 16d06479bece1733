//! Deterministic transition function.
//!
//! The replication core only needs [`Transition`]; [`ArenaRules`] is the
//! bomb arena that ships with the server. Any implementation must be a
//! pure function of `(state, event, tick)`: no clocks, no randomness, no
//! iteration over unordered collections.

use crate::event::{ClientRequest, Event, ScheduledEvent};
use crate::game::{Bomb, Explosion, GameState};
use crate::{
    BombId, ExplosionId, PlayerId, Tick, BLAST_RANGE, BOMB_FUSE_TICKS, EXPLOSION_TICKS,
    MOVE_TICKS,
};
use thiserror::Error;

/// Why an event left the state untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("bomb {0} already exists")]
    DuplicateBomb(BombId),
    #[error("bomb {0} does not exist")]
    UnknownBomb(BombId),
    #[error("explosion {0} does not exist")]
    UnknownExplosion(ExplosionId),
    #[error("player {0} does not exist")]
    UnknownPlayer(PlayerId),
    #[error("player {0} is dead")]
    PlayerDead(PlayerId),
    #[error("player {0} is still moving")]
    PlayerBusy(PlayerId),
    #[error("step ({dx}, {dy}) is not a unit orthogonal move")]
    InvalidStep { dx: i32, dy: i32 },
    #[error("cell ({x}, {y}) is outside the arena")]
    OutOfBounds { x: i32, y: i32 },
    #[error("cell ({x}, {y}) is occupied")]
    CellOccupied { x: i32, y: i32 },
}

pub trait Transition: Send + Sync {
    /// Turns a client request into the event the leader will apply, if any.
    fn admit(
        &self,
        state: &GameState,
        player: PlayerId,
        request: &ClientRequest,
        tick: Tick,
    ) -> Option<Event>;

    /// Applies `event` at `tick`, returning follow-up events to schedule.
    /// On error the state is unchanged.
    fn apply(
        &self,
        state: &mut GameState,
        event: &Event,
        tick: Tick,
    ) -> Result<Vec<ScheduledEvent>, TransitionError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaRules {
    pub fuse_ticks: Tick,
    pub explosion_ticks: Tick,
    pub move_ticks: Tick,
    pub blast_range: i32,
}

impl Default for ArenaRules {
    fn default() -> Self {
        Self {
            fuse_ticks: BOMB_FUSE_TICKS,
            explosion_ticks: EXPLOSION_TICKS,
            move_ticks: MOVE_TICKS,
            blast_range: BLAST_RANGE,
        }
    }
}

const DIRECTIONS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Deltas come straight from clients, so no arithmetic on them here.
fn is_unit_step(dx: i32, dy: i32) -> bool {
    DIRECTIONS.contains(&(dx, dy))
}

impl ArenaRules {
    fn spawn_bomb(
        &self,
        state: &mut GameState,
        bomb: BombId,
        x: i32,
        y: i32,
        owner: PlayerId,
        explode_tick: Tick,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        if state.bombs.contains_key(&bomb) {
            return Err(TransitionError::DuplicateBomb(bomb));
        }
        if !state.walls.contains(x, y) {
            return Err(TransitionError::OutOfBounds { x, y });
        }
        if state.is_blocked(x, y) {
            return Err(TransitionError::CellOccupied { x, y });
        }

        state.bomb_grid.set(x, y, Some(bomb));
        state.bombs.insert(
            bomb,
            Bomb {
                id: bomb,
                x,
                y,
                owner,
                explode_tick,
            },
        );
        state.next_bomb_id = state.next_bomb_id.max(bomb + 1);

        Ok(vec![ScheduledEvent::new(
            explode_tick,
            Event::BombExplode { bomb },
        )])
    }

    fn explode_bomb(
        &self,
        state: &mut GameState,
        bomb: BombId,
        tick: Tick,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        let detonated = state
            .bombs
            .remove(&bomb)
            .ok_or(TransitionError::UnknownBomb(bomb))?;
        state.bomb_grid.set(detonated.x, detonated.y, None);

        let mut cells = vec![(detonated.x, detonated.y)];
        for (dx, dy) in DIRECTIONS {
            for step in 1..=self.blast_range {
                let (nx, ny) = (detonated.x + dx * step, detonated.y + dy * step);
                if !state.walls.contains(nx, ny) || state.is_wall(nx, ny) {
                    break;
                }
                cells.push((nx, ny));
            }
        }

        let mut derived = Vec::new();
        for (x, y) in cells {
            let id = state.next_explosion_id;
            state.next_explosion_id += 1;
            if let Some(count) = state.explosion_grid.get_mut(x, y) {
                *count += 1;
            }
            let expires_tick = tick + self.explosion_ticks;
            state.explosions.insert(
                id,
                Explosion {
                    id,
                    x,
                    y,
                    owner: detonated.owner,
                    expires_tick,
                },
            );
            derived.push(ScheduledEvent::new(
                expires_tick,
                Event::ExplosionRemove { explosion: id },
            ));

            if let Some(player) = state.player_at(x, y) {
                derived.push(ScheduledEvent::new(tick, Event::PlayerDies { player }));
            }
            if let Some(chained) = state.bomb_at(x, y) {
                derived.push(ScheduledEvent::new(
                    tick,
                    Event::BombExplode { bomb: chained },
                ));
            }
        }

        Ok(derived)
    }

    fn move_player(
        &self,
        state: &mut GameState,
        player: PlayerId,
        dx: i32,
        dy: i32,
        tick: Tick,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        if !is_unit_step(dx, dy) {
            return Err(TransitionError::InvalidStep { dx, dy });
        }
        let current = state
            .players
            .get(&player)
            .ok_or(TransitionError::UnknownPlayer(player))?;
        if !current.alive {
            return Err(TransitionError::PlayerDead(player));
        }
        if current.moving {
            return Err(TransitionError::PlayerBusy(player));
        }

        let (from_x, from_y) = (current.x, current.y);
        let (x, y) = (from_x + dx, from_y + dy);
        if !state.walls.contains(x, y) {
            return Err(TransitionError::OutOfBounds { x, y });
        }
        if state.is_blocked(x, y) {
            return Err(TransitionError::CellOccupied { x, y });
        }

        state.player_grid.set(from_x, from_y, None);
        state.player_grid.set(x, y, Some(player));
        if let Some(moved) = state.players.get_mut(&player) {
            moved.x = x;
            moved.y = y;
            moved.moving = true;
        }

        Ok(vec![ScheduledEvent::new(
            tick + self.move_ticks,
            Event::MovementFinished { player },
        )])
    }

    fn remove_explosion(
        &self,
        state: &mut GameState,
        explosion: ExplosionId,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        let removed = state
            .explosions
            .remove(&explosion)
            .ok_or(TransitionError::UnknownExplosion(explosion))?;
        if let Some(count) = state.explosion_grid.get_mut(removed.x, removed.y) {
            *count = count.saturating_sub(1);
        }
        Ok(Vec::new())
    }

    fn finish_moving(
        &self,
        state: &mut GameState,
        player: PlayerId,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        let finished = state
            .players
            .get_mut(&player)
            .ok_or(TransitionError::UnknownPlayer(player))?;
        finished.moving = false;
        Ok(Vec::new())
    }

    fn kill_player(
        &self,
        state: &mut GameState,
        player: PlayerId,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        let victim = state
            .players
            .get_mut(&player)
            .ok_or(TransitionError::UnknownPlayer(player))?;
        if !victim.alive {
            return Err(TransitionError::PlayerDead(player));
        }
        victim.alive = false;
        victim.moving = false;
        let (x, y) = (victim.x, victim.y);
        if state.player_at(x, y) == Some(player) {
            state.player_grid.set(x, y, None);
        }
        Ok(Vec::new())
    }
}

impl Transition for ArenaRules {
    fn admit(
        &self,
        state: &GameState,
        player: PlayerId,
        request: &ClientRequest,
        tick: Tick,
    ) -> Option<Event> {
        if !state.players.get(&player).is_some_and(|p| p.alive) {
            return None;
        }

        match *request {
            ClientRequest::Move { dx, dy } if is_unit_step(dx, dy) => {
                Some(Event::PlayerMove { player, dx, dy })
            }
            ClientRequest::Move { .. } => None,
            ClientRequest::BombSpawn { x, y } => Some(Event::BombSpawn {
                bomb: state.next_bomb_id,
                x,
                y,
                owner: player,
                explode_tick: tick + self.fuse_ticks,
            }),
        }
    }

    fn apply(
        &self,
        state: &mut GameState,
        event: &Event,
        tick: Tick,
    ) -> Result<Vec<ScheduledEvent>, TransitionError> {
        match *event {
            Event::BombSpawn {
                bomb,
                x,
                y,
                owner,
                explode_tick,
            } => self.spawn_bomb(state, bomb, x, y, owner, explode_tick),
            Event::BombExplode { bomb } => self.explode_bomb(state, bomb, tick),
            Event::PlayerMove { player, dx, dy } => self.move_player(state, player, dx, dy, tick),
            Event::ExplosionRemove { explosion } => self.remove_explosion(state, explosion),
            Event::MovementFinished { player } => self.finish_moving(state, player),
            Event::PlayerDies { player } => self.kill_player(state, player),
        }
    }
}
