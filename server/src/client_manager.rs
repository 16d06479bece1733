//! Client connection registry and request queuing for the leader
//!
//! This module tracks the game clients attached to the current leader:
//! - Client connection lifecycle (join, leave, dead outbound channel)
//! - Player assignment, so each live player is driven by at most one client
//! - Request buffering in arrival order for the next tick's collect step
//! - Fan-out of updates and clock sync messages
//!
//! The registry lives inside the leader role and is rebuilt from scratch
//! whenever a node becomes leader; clients simply reconnect.

use crate::network::ConnId;
use log::{debug, info, warn};
use shared::{ClientMessage, ClientRequest, GameState, PlayerId};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Represents a connected client and the player it controls
#[derive(Debug)]
pub struct Client {
    /// Connection identifier assigned by the service listener
    pub id: ConnId,
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// Controlled player, or `None` for a spectator
    pub player: Option<PlayerId>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl Client {
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        player: Option<PlayerId>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self {
            id,
            addr,
            player,
            outbound,
        }
    }

    /// Queues a message for the connection task. Returns false once the
    /// connection has gone away.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Manages all connected clients and their pending requests
///
/// Requests are kept in one arrival-ordered buffer across all clients, so
/// the leader admits them in exactly the order the network delivered them.
pub struct ClientManager {
    /// Connected clients indexed by connection id
    clients: HashMap<ConnId, Client>,
    /// Requests collected since the last tick, tagged with the sender's player
    pending: Vec<(PlayerId, ClientRequest)>,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            pending: Vec::new(),
            max_clients,
        }
    }

    /// Attempts to register a new client connection
    ///
    /// Returns `None` if the server is at capacity. Otherwise the client is
    /// given the lowest-id live player that no other client controls, or no
    /// player at all when every live player is taken.
    pub fn add_client(
        &mut self,
        id: ConnId,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        state: &GameState,
    ) -> Option<&Client> {
        if self.clients.len() >= self.max_clients {
            warn!("Rejecting client {} from {}: server full", id, addr);
            return None;
        }

        let taken: BTreeSet<PlayerId> = self.clients.values().filter_map(|c| c.player).collect();
        let player = state
            .alive_players()
            .map(|p| p.id)
            .find(|p| !taken.contains(p));

        match player {
            Some(player) => info!("Client {} connected from {} as player {}", id, addr, player),
            None => info!("Client {} connected from {} as spectator", id, addr),
        }

        self.clients
            .insert(id, Client::new(id, addr, player, outbound));
        self.clients.get(&id)
    }

    /// Removes a client. Returns false if it was already gone.
    pub fn remove_client(&mut self, id: ConnId) -> bool {
        if let Some(client) = self.clients.remove(&id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Buffers a request for the next tick
    ///
    /// Requests from spectators and unknown connections are dropped.
    /// Returns true if the request was queued.
    pub fn queue_request(&mut self, id: ConnId, request: ClientRequest) -> bool {
        match self.clients.get(&id).and_then(|c| c.player) {
            Some(player) => {
                self.pending.push((player, request));
                true
            }
            None => {
                debug!("Ignoring {:?} from client {} without a player", request, id);
                false
            }
        }
    }

    /// Drains every buffered request in arrival order
    pub fn take_requests(&mut self) -> Vec<(PlayerId, ClientRequest)> {
        std::mem::take(&mut self.pending)
    }

    pub fn send_to(&mut self, id: ConnId, message: ClientMessage) -> bool {
        let delivered = self.clients.get(&id).is_some_and(|c| c.send(message));
        if !delivered {
            self.remove_client(id);
        }
        delivered
    }

    /// Sends `message` to every client, dropping those whose connection
    /// task has already exited. Returns how many clients were reached.
    pub fn broadcast(&mut self, message: &ClientMessage) -> usize {
        let dead: Vec<ConnId> = self
            .clients
            .values()
            .filter(|c| !c.send(message.clone()))
            .map(|c| c.id)
            .collect();

        for id in &dead {
            self.remove_client(*id);
        }
        self.clients.len()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::DEFAULT_LEVEL;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn arena() -> GameState {
        GameState::from_layout(DEFAULT_LEVEL).unwrap()
    }

    fn channel() -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(5);
        assert_eq!(manager.max_clients, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_players_assigned_lowest_first() {
        let mut manager = ClientManager::new(8);
        let state = arena();
        let mut receivers = Vec::new();

        let mut assigned = Vec::new();
        for id in 1..=5 {
            let (tx, rx) = channel();
            receivers.push(rx);
            let client = manager.add_client(id, test_addr(), tx, &state).unwrap();
            assigned.push(client.player);
        }

        assert_eq!(assigned, vec![Some(1), Some(2), Some(3), Some(4), None]);

        // a freed player goes to the next client
        manager.remove_client(2);
        let (tx, _rx) = channel();
        assert_eq!(manager.add_client(6, test_addr(), tx, &state).unwrap().player, Some(2));
    }

    #[test]
    fn test_dead_players_are_not_assigned() {
        let mut manager = ClientManager::new(8);
        let mut state = arena();
        state.players.get_mut(&1).unwrap().alive = false;

        let (tx, _rx) = channel();
        assert_eq!(manager.add_client(1, test_addr(), tx, &state).unwrap().player, Some(2));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1);
        let state = arena();

        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        assert!(manager.add_client(1, test_addr(), tx1, &state).is_some());
        assert!(manager.add_client(2, test_addr(), tx2, &state).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_nonexistent_client() {
        let mut manager = ClientManager::new(2);
        assert!(!manager.remove_client(999));
    }

    #[test]
    fn test_requests_keep_arrival_order() {
        let mut manager = ClientManager::new(8);
        let state = arena();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        manager.add_client(10, test_addr(), tx1, &state);
        manager.add_client(11, test_addr(), tx2, &state);

        assert!(manager.queue_request(11, ClientRequest::Move { dx: -1, dy: 0 }));
        assert!(manager.queue_request(10, ClientRequest::BombSpawn { x: 1, y: 0 }));
        assert!(!manager.queue_request(99, ClientRequest::Move { dx: 1, dy: 0 }));

        assert_eq!(
            manager.take_requests(),
            vec![
                (2, ClientRequest::Move { dx: -1, dy: 0 }),
                (1, ClientRequest::BombSpawn { x: 1, y: 0 }),
            ]
        );
        assert!(manager.take_requests().is_empty());
    }

    #[test]
    fn test_spectator_requests_are_ignored() {
        let mut manager = ClientManager::new(8);
        let mut state = arena();
        state.players.clear();

        let (tx, _rx) = channel();
        assert_eq!(manager.add_client(1, test_addr(), tx, &state).unwrap().player, None);
        assert!(!manager.queue_request(1, ClientRequest::Move { dx: 1, dy: 0 }));
    }

    #[test]
    fn test_broadcast_drops_dead_clients() {
        let mut manager = ClientManager::new(8);
        let state = arena();
        let (tx1, mut rx1) = channel();
        let (tx2, rx2) = channel();
        manager.add_client(1, test_addr(), tx1, &state);
        manager.add_client(2, test_addr(), tx2, &state);
        drop(rx2);

        let reached = manager.broadcast(&ClientMessage::Clock {
            server_tick: 50,
            timestamp: 1,
        });

        assert_eq!(reached, 1);
        assert!(manager.get(2).is_none());
        assert!(matches!(
            rx1.try_recv(),
            Ok(ClientMessage::Clock { server_tick: 50, .. })
        ));
    }
}
