use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc;

/// Outbound queue of one live connection. Events pushed here are drained by
/// the connection's writer task in submission order.
pub type ConnectionSender = mpsc::UnboundedSender<ServerEvent>;

/// Maps each reachable user to its live connections. The one piece of state
/// shared by every component; all operations are synchronous and never hold
/// the lock across an await point.
///
/// Invariant: a user id is present if and only if it has at least one live
/// connection. Removing the last connection removes the entry.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<UserId, HashMap<ConnectionId, ConnectionSender>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: UserId, connection_id: ConnectionId, sender: ConnectionSender) {
        let mut map = self.inner.write();
        map.entry(user_id).or_default().insert(connection_id, sender);
    }

    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        let mut map = self.inner.write();
        if let Some(connections) = map.get_mut(&user_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                map.remove(&user_id);
            }
        }
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .get(&user_id)
            .map(|connections| connections.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.inner.read().contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.inner.read().keys().copied().collect()
    }

    /// Queues the event on every live connection of the user. Best-effort: a
    /// connection whose reader has already gone away is skipped. Returns how
    /// many connections accepted the event.
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let map = self.inner.read();
        let Some(connections) = map.get(&user_id) else {
            return 0;
        };
        connections
            .values()
            .filter(|sender| sender.send(event.clone()).is_ok())
            .count()
    }

    pub fn broadcast_all(&self, event: &ServerEvent) {
        let map = self.inner.read();
        for connections in map.values() {
            for sender in connections.values() {
                let _ = sender.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn last_unregister_removes_the_user_entry() {
        let registry = ConnectionRegistry::new();
        let user = UserId(1);
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        let (tx_a, _rx_a) = handle();
        let (tx_b, _rx_b) = handle();

        registry.register(user, first, tx_a);
        registry.register(user, second, tx_b);
        assert_eq!(registry.connections_of(user).len(), 2);

        registry.unregister(user, first);
        assert!(registry.is_online(user));

        registry.unregister(user, second);
        assert!(!registry.is_online(user));
        assert!(registry.connections_of(user).is_empty());
        assert!(registry.online_users().is_empty());
    }

    #[test]
    fn unregister_of_unknown_connection_is_harmless() {
        let registry = ConnectionRegistry::new();
        registry.unregister(UserId(9), ConnectionId::new());
        assert!(!registry.is_online(UserId(9)));
    }

    #[test]
    fn send_to_user_reaches_every_connection_once() {
        let registry = ConnectionRegistry::new();
        let user = UserId(4);
        let (tx_a, mut rx_a) = handle();
        let (tx_b, mut rx_b) = handle();
        registry.register(user, ConnectionId::new(), tx_a);
        registry.register(user, ConnectionId::new(), tx_b);

        let delivered = registry.send_to_user(
            user,
            &ServerEvent::OnlineUsers {
                user_ids: vec![user],
            },
        );
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_skipped() {
        let registry = ConnectionRegistry::new();
        let user = UserId(5);
        let (tx_a, rx_a) = handle();
        let (tx_b, mut rx_b) = handle();
        registry.register(user, ConnectionId::new(), tx_a);
        registry.register(user, ConnectionId::new(), tx_b);
        drop(rx_a);

        let delivered = registry.send_to_user(
            user,
            &ServerEvent::OnlineUsers {
                user_ids: vec![user],
            },
        );
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
    }
}
