//! Single owner of the world and its pending timers.
//!
//! The leader produces batches with [`Replica::simulate`]; followers and
//! clients replay them with [`Replica::apply_committed`]. Both paths run
//! the same transition function, so replaying a leader's batches from the
//! same snapshot yields an identical world and an identical queue.

use crate::event::{ClientRequest, Event};
use crate::game::GameState;
use crate::queue::EventQueue;
use crate::rules::Transition;
use crate::{PlayerId, Tick};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Full world plus pending timers, as handed to a joining node or client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: Tick,
    pub state: GameState,
    pub queue: EventQueue,
}

pub struct Replica {
    state: GameState,
    queue: EventQueue,
    rules: Arc<dyn Transition>,
}

impl Replica {
    pub fn new(state: GameState, rules: Arc<dyn Transition>) -> Self {
        Self {
            state,
            queue: EventQueue::new(),
            rules,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot, rules: Arc<dyn Transition>) -> Self {
        Self {
            state: snapshot.state,
            queue: snapshot.queue,
            rules,
        }
    }

    /// Replaces world and timers in place, keeping the rules.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.state = snapshot.state;
        self.queue = snapshot.queue;
    }

    pub fn snapshot(&self, tick: Tick) -> Snapshot {
        Snapshot {
            tick,
            state: self.state.clone(),
            queue: self.queue.clone(),
        }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Runs one leader tick: admits requests in order, then fires every
    /// timer due at or before `tick` until none remain. Returns the
    /// events that took effect, in application order.
    pub fn simulate<I>(&mut self, tick: Tick, requests: I) -> Vec<Event>
    where
        I: IntoIterator<Item = (PlayerId, ClientRequest)>,
    {
        let mut batch = Vec::new();

        for (player, request) in requests {
            match self.rules.admit(&self.state, player, &request, tick) {
                Some(event) => self.apply_into(tick, event, &mut batch),
                None => debug!("Request {:?} from player {} not admitted", request, player),
            }
        }

        loop {
            let ready = self.queue.pop_ready(tick);
            if ready.is_empty() {
                break;
            }
            for scheduled in ready {
                self.apply_into(tick, scheduled.event, &mut batch);
            }
        }

        batch
    }

    fn apply_into(&mut self, tick: Tick, event: Event, batch: &mut Vec<Event>) {
        match self.rules.apply(&mut self.state, &event, tick) {
            Ok(derived) => {
                for scheduled in derived {
                    self.queue.push(scheduled.fire_tick, scheduled.event);
                }
                batch.push(event);
            }
            Err(e) => debug!("Tick {}: {} dropped: {}", tick, event.kind(), e),
        }
    }

    /// Replays a committed batch for `tick`. Timers due at or before
    /// `tick` are discarded afterwards because the leader already carried
    /// them in this or an earlier batch. Returns how many events were
    /// rejected, which is zero unless this replica has diverged.
    pub fn apply_committed(&mut self, tick: Tick, batch: &[Event]) -> usize {
        let mut rejected = 0;
        for event in batch {
            match self.rules.apply(&mut self.state, event, tick) {
                Ok(derived) => {
                    for scheduled in derived {
                        self.queue.push(scheduled.fire_tick, scheduled.event);
                    }
                }
                Err(e) => {
                    rejected += 1;
                    warn!("Tick {}: committed {} rejected: {}", tick, event.kind(), e);
                }
            }
        }
        self.queue.pop_ready(tick);
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ArenaRules;
    use crate::DEFAULT_LEVEL;

    fn replica() -> Replica {
        Replica::new(
            GameState::from_layout(DEFAULT_LEVEL).unwrap(),
            Arc::new(ArenaRules::default()),
        )
    }

    #[test]
    fn test_simulate_emits_applied_events_only() {
        let mut leader = replica();
        let batch = leader.simulate(
            1,
            vec![
                (1, ClientRequest::Move { dx: -1, dy: 0 }),
                (1, ClientRequest::Move { dx: 0, dy: 1 }),
                (1, ClientRequest::Move { dx: 0, dy: 1 }),
            ],
        );

        assert_eq!(batch, vec![Event::PlayerMove { player: 1, dx: 0, dy: 1 }]);
        assert_eq!(leader.state().players[&1].y, 1);
        assert_eq!(leader.queue().len(), 1);
    }

    #[test]
    fn test_chain_reaction_resolves_within_tick() {
        let mut leader = replica();
        leader.simulate(
            10,
            vec![
                (1, ClientRequest::BombSpawn { x: 0, y: 2 }),
                (1, ClientRequest::BombSpawn { x: 1, y: 2 }),
            ],
        );
        assert_eq!(leader.state().bombs.len(), 2);

        let batch = leader.simulate(130, Vec::new());
        assert!(leader.state().bombs.is_empty());
        assert_eq!(
            batch,
            vec![
                Event::BombExplode { bomb: 1 },
                Event::BombExplode { bomb: 2 },
            ]
        );
        // the chained bomb's own fuse has nothing left to detonate
        assert!(leader.simulate(131, Vec::new()).is_empty());
    }

    #[test]
    fn test_follower_replay_matches_leader() {
        let mut leader = replica();
        let mut follower = replica();

        let script: Vec<(Tick, Vec<(PlayerId, ClientRequest)>)> = vec![
            (1, vec![(1, ClientRequest::BombSpawn { x: 1, y: 0 })]),
            (2, vec![(4, ClientRequest::Move { dx: 0, dy: -1 })]),
            (30, vec![(2, ClientRequest::Move { dx: 0, dy: 1 })]),
        ];

        let mut tick = 0;
        let mut scripted = script.into_iter().peekable();
        while tick < 250 {
            tick += 1;
            let requests = match scripted.peek() {
                Some((at, _)) if *at == tick => scripted.next().map(|(_, r)| r).unwrap_or_default(),
                _ => Vec::new(),
            };
            let batch = leader.simulate(tick, requests);
            if !batch.is_empty() {
                assert_eq!(follower.apply_committed(tick, &batch), 0);
            }
        }

        assert_eq!(leader.state(), follower.state());
        assert_eq!(leader.queue().pending(), follower.queue().pending());
        assert!(!leader.state().players[&1].alive);
    }

    #[test]
    fn test_snapshot_restores_world_and_timers() {
        let mut leader = replica();
        leader.simulate(5, vec![(1, ClientRequest::BombSpawn { x: 1, y: 0 })]);

        let snapshot = leader.snapshot(5);
        let mut joined = Replica::from_snapshot(snapshot, Arc::new(ArenaRules::default()));
        assert_eq!(joined.state(), leader.state());

        let batch = leader.simulate(125, Vec::new());
        assert!(batch.contains(&Event::BombExplode { bomb: 1 }));
        joined.apply_committed(125, &batch);
        assert_eq!(joined.state(), leader.state());
        assert_eq!(joined.queue().pending(), leader.queue().pending());
    }
}
