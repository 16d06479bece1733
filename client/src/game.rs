use log::{debug, warn};
use shared::{
    unix_millis, ArenaRules, Event, GameState, Player, PlayerId, Replica, Snapshot, Tick,
    Transition,
};
use std::sync::Arc;

/// Local mirror of the authoritative world.
///
/// The mirror replays committed batches through the same transition
/// function the servers run, so it never predicts and never diverges
/// unless the leader changes underneath it.
pub struct ClientGameState {
    rules: Arc<dyn Transition>,
    replica: Option<Replica>,
    local_player: Option<PlayerId>,
    tick: Tick,
    /// Tick of the snapshot or last batch the mirror holds.
    applied_tick: Tick,
    /// Server clock minus local clock, in milliseconds, from the last sync.
    clock_offset_ms: Option<i64>,
    updates_applied: u64,
}

impl ClientGameState {
    pub fn new() -> Self {
        Self::with_rules(Arc::new(ArenaRules::default()))
    }

    pub fn with_rules(rules: Arc<dyn Transition>) -> Self {
        Self {
            rules,
            replica: None,
            local_player: None,
            tick: 0,
            applied_tick: 0,
            clock_offset_ms: None,
            updates_applied: 0,
        }
    }

    /// Replaces the mirror with a fresh snapshot from the leader.
    pub fn apply_init(&mut self, snapshot: Snapshot, local_player: Option<PlayerId>) {
        self.tick = snapshot.tick;
        self.applied_tick = snapshot.tick;
        self.local_player = local_player;
        self.replica = Some(Replica::from_snapshot(snapshot, Arc::clone(&self.rules)));
    }

    /// Replays one published batch. Returns how many events were rejected.
    /// Batches the mirror already holds are skipped.
    pub fn apply_update(&mut self, tick: Tick, events: &[Event]) -> usize {
        let Some(replica) = self.replica.as_mut() else {
            debug!("Update for tick {} before init, ignoring", tick);
            return 0;
        };
        if tick <= self.applied_tick {
            warn!(
                "Skipping stale update for tick {} (mirror at {})",
                tick, self.applied_tick
            );
            return 0;
        }

        let rejected = replica.apply_committed(tick, events);
        self.applied_tick = tick;
        self.tick = self.tick.max(tick);
        self.updates_applied += 1;
        rejected
    }

    pub fn apply_clock(&mut self, server_tick: Tick, timestamp: u64) {
        self.apply_clock_at(server_tick, timestamp, unix_millis());
    }

    fn apply_clock_at(&mut self, server_tick: Tick, timestamp: u64, local_ms: u64) {
        self.clock_offset_ms = Some(timestamp as i64 - local_ms as i64);
        self.tick = self.tick.max(server_tick);
    }

    /// Forgets everything learned from the previous leader.
    pub fn reset(&mut self) {
        self.replica = None;
        self.local_player = None;
        self.clock_offset_ms = None;
    }

    pub fn is_ready(&self) -> bool {
        self.replica.is_some()
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn clock_offset_ms(&self) -> Option<i64> {
        self.clock_offset_ms
    }

    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }

    pub fn state(&self) -> Option<&GameState> {
        self.replica.as_ref().map(Replica::state)
    }

    pub fn local_player_id(&self) -> Option<PlayerId> {
        self.local_player
    }

    pub fn local_player(&self) -> Option<&Player> {
        let id = self.local_player?;
        self.state()?.players.get(&id)
    }
}

impl Default for ClientGameState {
    fn default() -> Self {
        Self::new()
    }
}
