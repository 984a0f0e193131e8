//! Live connection registry: the single owner of the user-to-connection
//! map and therefore of the presence set.
//!
//! The lock is a plain `std::sync::RwLock` and is never held across an
//! await: every operation is a short map touch, and pushes go through
//! unbounded senders that cannot block.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::protocol::ServerEvent;

struct Connection {
    /// Distinguishes this binding from its successor, so a displaced
    /// connection's teardown cannot unregister the new one.
    connection_id: Uuid,
    sender: UnboundedSender<ServerEvent>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a user to a fresh connection. An existing binding for the
    /// same user is displaced: dropping its sender ends the old writer
    /// task, which tears the old socket down.
    pub fn register(&self, user_id: Uuid) -> (Uuid, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        let mut connections = self.connections.write().unwrap();
        connections.insert(
            user_id,
            Connection {
                connection_id,
                sender: tx,
            },
        );
        (connection_id, rx)
    }

    /// Remove a binding, but only while it still belongs to the caller.
    /// Returns whether the presence set changed.
    pub fn unregister(&self, user_id: Uuid, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().unwrap();
        match connections.get(&user_id) {
            Some(existing) if existing.connection_id == connection_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Non-blocking push. False means the user has no live connection
    /// (or its writer just went away); the event is simply dropped, and
    /// durable state is pulled over HTTP on reconnect.
    pub fn send_to(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let connections = self.connections.read().unwrap();
        match connections.get(&user_id) {
            Some(connection) => connection.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Push to every live connection; returns how many accepted.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let connections = self.connections.read().unwrap();
        connections
            .values()
            .filter(|connection| connection.sender.send(event.clone()).is_ok())
            .count()
    }

    /// Sorted for deterministic snapshots.
    pub fn online_users(&self) -> Vec<Uuid> {
        let connections = self.connections.read().unwrap();
        let mut users: Vec<Uuid> = connections.keys().copied().collect();
        users.sort();
        users
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.read().unwrap().contains_key(&user_id)
    }
}
