pub mod clock;
pub mod event;
pub mod game;
pub mod protocol;
pub mod queue;
pub mod replica;
pub mod rules;
pub mod wire;

pub use clock::TickClock;
pub use event::{ClientRequest, Event, ScheduledEvent};
pub use game::{Bomb, Explosion, GameState, Grid, LevelError, Player};
pub use protocol::{ClientMessage, FollowerMessage, Hello, PeerMessage, ReplicaMessage};
pub use queue::EventQueue;
pub use replica::{Replica, Snapshot};
pub use rules::{ArenaRules, Transition, TransitionError};
pub use wire::{read_frame, write_frame, WireError};

/// Cluster identity of a server node. Lower ids win elections.
pub type NodeId = u32;
/// Discrete simulation step.
pub type Tick = u64;
pub type PlayerId = u32;
pub type BombId = u32;
pub type ExplosionId = u32;

pub const DEFAULT_TICK_RATE: u32 = 60;
pub const BOMB_FUSE_TICKS: Tick = 120;
pub const EXPLOSION_TICKS: Tick = 90;
pub const MOVE_TICKS: Tick = 20;
pub const BLAST_RANGE: i32 = 1;
pub const CLOCK_SYNC_INTERVAL: Tick = 50;

/// Default 5x5 arena with a player in each corner.
pub const DEFAULT_LEVEL: &str = "\
1.#.2
..#..
.....
..#..
3.#.4";

/// Milliseconds since the unix epoch, saturating at zero for clocks set before 1970.
pub fn unix_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
