use crate::{BombId, ExplosionId, PlayerId, Tick};
use serde::{Deserialize, Serialize};

/// The only legal mutators of [`crate::GameState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BombSpawn {
        bomb: BombId,
        x: i32,
        y: i32,
        owner: PlayerId,
        explode_tick: Tick,
    },
    BombExplode {
        bomb: BombId,
    },
    PlayerMove {
        player: PlayerId,
        dx: i32,
        dy: i32,
    },
    ExplosionRemove {
        explosion: ExplosionId,
    },
    MovementFinished {
        player: PlayerId,
    },
    PlayerDies {
        player: PlayerId,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BombSpawn { .. } => "bomb-spawn",
            Event::BombExplode { .. } => "bomb-explode",
            Event::PlayerMove { .. } => "player-move",
            Event::ExplosionRemove { .. } => "explosion-remove",
            Event::MovementFinished { .. } => "movement-finished",
            Event::PlayerDies { .. } => "player-dies",
        }
    }
}

/// An event deferred until `fire_tick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub fire_tick: Tick,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(fire_tick: Tick, event: Event) -> Self {
        Self { fire_tick, event }
    }
}

/// What a client may ask of the leader. The rules decide whether it
/// becomes an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    BombSpawn { x: i32, y: i32 },
    Move { dx: i32, dy: i32 },
}
