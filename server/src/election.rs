//! Bully election as a pure state machine.
//!
//! The machine never touches sockets or timers. Callers feed it inbound
//! peer messages and the current time, perform the returned [`Action`]s,
//! and sleep until [`Election::deadline`]. That keeps it testable against
//! an in-memory network.

use log::{debug, info};
use shared::{NodeId, PeerMessage};
use std::time::{Duration, Instant};

/// Multiple of the election timeout an outranked node waits for the
/// winner's announcement before starting over.
pub const OUTRANKED_WAIT_ROUNDS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Broadcast(PeerMessage),
    SendTo(NodeId, PeerMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Leader,
    Follower(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Electing { deadline: Instant, outranked: bool },
    Decided(Outcome),
}

#[derive(Debug)]
pub struct Election {
    id: NodeId,
    timeout: Duration,
    phase: Phase,
    rounds: u32,
}

impl Election {
    pub fn new(id: NodeId, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            phase: Phase::Idle,
            rounds: 0,
        }
    }

    /// Challenges every reachable peer and arms the election timer.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        self.rounds += 1;
        info!("Node {} starting election round {}", self.id, self.rounds);
        self.phase = Phase::Electing {
            deadline: now + self.timeout,
            outranked: false,
        };
        vec![Action::Broadcast(PeerMessage::Bully { from: self.id })]
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.phase {
            Phase::Decided(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Electing { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn handle(&mut self, from: NodeId, message: &PeerMessage, now: Instant) -> Vec<Action> {
        match *message {
            PeerMessage::Bully { from: challenger } => self.on_bully(challenger),
            PeerMessage::BullyOk { from: lower } => {
                if lower < self.id {
                    if let Phase::Electing { outranked: false, .. } = self.phase {
                        debug!("Node {} outranked by {}", self.id, lower);
                        self.phase = Phase::Electing {
                            deadline: now + self.timeout * OUTRANKED_WAIT_ROUNDS,
                            outranked: true,
                        };
                    }
                }
                Vec::new()
            }
            PeerMessage::LeaderAnnounce { from: leader } => self.on_announce(leader),
            _ => {
                debug!(
                    "Election on node {} ignoring {} from {}",
                    self.id,
                    message.kind(),
                    from
                );
                Vec::new()
            }
        }
    }

    fn on_bully(&mut self, challenger: NodeId) -> Vec<Action> {
        if challenger <= self.id {
            return Vec::new();
        }

        let mut actions = vec![Action::SendTo(
            challenger,
            PeerMessage::BullyOk { from: self.id },
        )];
        if self.outcome() == Some(Outcome::Leader) {
            actions.push(Action::SendTo(
                challenger,
                PeerMessage::LeaderAnnounce { from: self.id },
            ));
        }
        actions
    }

    fn on_announce(&mut self, leader: NodeId) -> Vec<Action> {
        if leader < self.id {
            info!("Node {} accepts {} as leader", self.id, leader);
            self.phase = Phase::Decided(Outcome::Follower(leader));
            Vec::new()
        } else if leader > self.id && self.outcome() == Some(Outcome::Leader) {
            vec![Action::SendTo(
                leader,
                PeerMessage::LeaderAnnounce { from: self.id },
            )]
        } else {
            Vec::new()
        }
    }

    /// Fires the election timer if it has expired.
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        match self.phase {
            Phase::Electing { deadline, outranked } if now >= deadline => {
                if outranked {
                    info!(
                        "Node {} heard no announcement after being outranked, restarting",
                        self.id
                    );
                    self.start(now)
                } else {
                    info!("Node {} won the election", self.id);
                    self.phase = Phase::Decided(Outcome::Leader);
                    vec![Action::Broadcast(PeerMessage::LeaderAnnounce {
                        from: self.id,
                    })]
                }
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};

    /// Delivers messages instantly among the nodes in `alive`.
    struct Network {
        nodes: BTreeMap<NodeId, Election>,
        queue: VecDeque<(NodeId, NodeId, PeerMessage)>,
    }

    impl Network {
        fn new(ids: &[NodeId]) -> Self {
            let timeout = Duration::from_millis(200);
            Self {
                nodes: ids.iter().map(|&id| (id, Election::new(id, timeout))).collect(),
                queue: VecDeque::new(),
            }
        }

        fn enqueue(&mut self, from: NodeId, actions: Vec<Action>) {
            let peers: BTreeSet<NodeId> = self.nodes.keys().copied().collect();
            for action in actions {
                match action {
                    Action::Broadcast(message) => {
                        for &to in peers.iter().filter(|&&to| to != from) {
                            self.queue.push_back((from, to, message.clone()));
                        }
                    }
                    Action::SendTo(to, message) => self.queue.push_back((from, to, message)),
                }
            }
        }

        fn deliver(&mut self, now: Instant) {
            while let Some((from, to, message)) = self.queue.pop_front() {
                if let Some(node) = self.nodes.get_mut(&to) {
                    let actions = node.handle(from, &message, now);
                    self.enqueue(to, actions);
                }
            }
        }

        fn start_all(&mut self, now: Instant) {
            let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
            for id in ids {
                let actions = self.nodes.get_mut(&id).map(|n| n.start(now)).unwrap_or_default();
                self.enqueue(id, actions);
            }
            self.deliver(now);
        }

        fn advance(&mut self, now: Instant) {
            let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
            for id in ids {
                let actions = self.nodes.get_mut(&id).map(|n| n.poll(now)).unwrap_or_default();
                self.enqueue(id, actions);
            }
            self.deliver(now);
        }

        fn outcomes(&self) -> BTreeMap<NodeId, Option<Outcome>> {
            self.nodes.iter().map(|(id, n)| (*id, n.outcome())).collect()
        }
    }

    #[test]
    fn test_lowest_reachable_id_wins() {
        let start = Instant::now();
        let mut network = Network::new(&[3, 1, 4, 2]);
        network.start_all(start);

        // nobody decides before the timer
        assert!(network.outcomes().values().all(Option::is_none));

        network.advance(start + Duration::from_millis(200));
        let outcomes = network.outcomes();
        assert_eq!(outcomes[&1], Some(Outcome::Leader));
        for id in [2, 3, 4] {
            assert_eq!(outcomes[&id], Some(Outcome::Follower(1)));
        }
    }

    #[test]
    fn test_survivors_elect_lowest_survivor() {
        let start = Instant::now();
        let mut network = Network::new(&[2, 3]);
        network.start_all(start);
        network.advance(start + Duration::from_millis(250));

        assert_eq!(network.outcomes()[&2], Some(Outcome::Leader));
        assert_eq!(network.outcomes()[&3], Some(Outcome::Follower(2)));
    }

    #[test]
    fn test_lone_node_elects_itself() {
        let start = Instant::now();
        let mut election = Election::new(5, Duration::from_millis(200));
        assert_eq!(
            election.start(start),
            vec![Action::Broadcast(PeerMessage::Bully { from: 5 })]
        );
        assert!(election.poll(start + Duration::from_millis(199)).is_empty());
        assert_eq!(
            election.poll(start + Duration::from_millis(200)),
            vec![Action::Broadcast(PeerMessage::LeaderAnnounce { from: 5 })]
        );
        assert_eq!(election.outcome(), Some(Outcome::Leader));
    }

    #[test]
    fn test_only_lower_ids_answer_bully() {
        let mut election = Election::new(2, Duration::from_millis(200));
        let now = Instant::now();
        election.start(now);

        assert!(election
            .handle(1, &PeerMessage::Bully { from: 1 }, now)
            .is_empty());
        assert_eq!(
            election.handle(3, &PeerMessage::Bully { from: 3 }, now),
            vec![Action::SendTo(3, PeerMessage::BullyOk { from: 2 })]
        );
    }

    #[test]
    fn test_outranked_node_restarts_after_silence() {
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let mut election = Election::new(3, timeout);
        election.start(start);
        election.handle(1, &PeerMessage::BullyOk { from: 1 }, start);

        // the plain timeout no longer promotes
        assert!(election.poll(start + timeout).is_empty());
        assert_eq!(election.outcome(), None);

        let restarted = election.poll(start + timeout * OUTRANKED_WAIT_ROUNDS);
        assert_eq!(
            restarted,
            vec![Action::Broadcast(PeerMessage::Bully { from: 3 })]
        );
        assert_eq!(election.rounds(), 2);
    }

    #[test]
    fn test_higher_announce_is_answered_by_winner() {
        let start = Instant::now();
        let mut election = Election::new(1, Duration::from_millis(200));
        election.start(start);
        election.poll(start + Duration::from_millis(200));

        assert_eq!(
            election.handle(2, &PeerMessage::LeaderAnnounce { from: 2 }, start),
            vec![Action::SendTo(2, PeerMessage::LeaderAnnounce { from: 1 })]
        );
        assert_eq!(election.outcome(), Some(Outcome::Leader));

        // a late challenger is told who leads
        let actions = election.handle(4, &PeerMessage::Bully { from: 4 }, start);
        let told = Action::SendTo(4, PeerMessage::LeaderAnnounce { from: 1 });
        assert!(actions.contains(&told));
    }

    #[test]
    fn test_lower_announce_demotes_winner() {
        let start = Instant::now();
        let mut election = Election::new(2, Duration::from_millis(200));
        election.start(start);
        election.poll(start + Duration::from_millis(200));
        assert_eq!(election.outcome(), Some(Outcome::Leader));

        election.handle(1, &PeerMessage::LeaderAnnounce { from: 1 }, start);
        assert_eq!(election.outcome(), Some(Outcome::Follower(1)));
    }
}
