//! Signaling Relay - zustandsloser Router
//!
//! Ordnet authentifizierte Benutzer ihren Live-Verbindungen zu und leitet
//! Envelopes an alle Verbindungen des Empfängers weiter. Keine Queue,
//! keine Zustellbestätigung, keine Persistenz: ist der Empfänger offline,
//! wird die Nachricht verworfen.

use super::messages::{Envelope, UserId};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifiziert eine einzelne Relay-Verbindung (ein Gerät)
pub type ConnectionId = Uuid;

/// Ausgehende Queue einer Verbindung
pub type ConnectionSender = mpsc::UnboundedSender<Envelope>;

/// Alle Live-Verbindungen eines Benutzers (Multi-Device)
#[derive(Debug, Default)]
pub struct UserSessionEndpoint {
    connections: Vec<(ConnectionId, ConnectionSender)>,
}

impl UserSessionEndpoint {
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[derive(Debug, Default)]
struct RelayTable {
    endpoints: HashMap<UserId, UserSessionEndpoint>,
    owners: HashMap<ConnectionId, UserId>,
}

/// Router zwischen Benutzer-Identitäten und ihren Verbindungen
#[derive(Debug, Default)]
pub struct SignalingRelay {
    table: RwLock<RelayTable>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert eine neue Verbindung für `user_id`
    pub fn register(&self, user_id: UserId, connection: ConnectionSender) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut table = self.table.write();
        table
            .endpoints
            .entry(user_id.clone())
            .or_default()
            .connections
            .push((id, connection));
        tracing::info!("Registered connection {} for {}", id, user_id);
        table.owners.insert(id, user_id);
        id
    }

    /// Entfernt eine Verbindung. Gibt `false` zurück wenn sie unbekannt war.
    pub fn unregister(&self, connection: ConnectionId) -> bool {
        let mut table = self.table.write();
        let Some(user_id) = table.owners.remove(&connection) else {
            return false;
        };

        let now_empty = match table.endpoints.get_mut(&user_id) {
            Some(endpoint) => {
                endpoint.connections.retain(|(id, _)| *id != connection);
                endpoint.connections.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.endpoints.remove(&user_id);
        }

        tracing::info!("Unregistered connection {} of {}", connection, user_id);
        true
    }

    /// Leitet einen Envelope an alle Verbindungen des Empfängers weiter
    ///
    /// `senderId` wird immer aus `sender` gesetzt, ein vom Client
    /// mitgeschickter Wert wird überschrieben. Gibt die Anzahl der
    /// Verbindungen zurück, an die zugestellt wurde (0 = verworfen).
    pub fn relay(&self, sender: &UserId, mut envelope: Envelope) -> usize {
        envelope.sender_id = Some(sender.clone());

        let table = self.table.read();
        let Some(endpoint) = table.endpoints.get(&envelope.target_user_id) else {
            tracing::debug!(
                "Dropping {} from {}: {} is offline",
                envelope.message.kind(),
                sender,
                envelope.target_user_id
            );
            return 0;
        };

        let mut delivered = 0;
        for (id, tx) in &endpoint.connections {
            if tx.send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                // Writer-Task schon beendet, unregister folgt
                tracing::debug!("Connection {} is closing, skipping", id);
            }
        }

        tracing::debug!(
            "Relayed {} {} -> {} ({} connection(s))",
            envelope.message.kind(),
            sender,
            envelope.target_user_id,
            delivered
        );
        delivered
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.table
            .read()
            .endpoints
            .get(user_id)
            .map(UserSessionEndpoint::connection_count)
            .unwrap_or(0)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn online_users(&self) -> usize {
        self.table.read().endpoints.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::SignalMessage;

    fn connection() -> (ConnectionSender, mpsc::UnboundedReceiver<Envelope>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_relay_stamps_sender_and_ignores_client_value() {
        let relay = SignalingRelay::new();
        let (tx, mut rx) = connection();
        relay.register(UserId::new("bob"), tx);

        let mut envelope = Envelope::new(UserId::new("bob"), SignalMessage::Accept);
        envelope.sender_id = Some(UserId::new("mallory"));

        assert_eq!(relay.relay(&UserId::new("alice"), envelope), 1);
        let received = rx.try_recv().expect("delivered");
        assert_eq!(received.sender_id, Some(UserId::new("alice")));
        assert_eq!(received.message, SignalMessage::Accept);
    }

    #[test]
    fn test_relay_fans_out_to_all_devices() {
        let relay = SignalingRelay::new();
        let (phone, mut phone_rx) = connection();
        let (laptop, mut laptop_rx) = connection();
        relay.register(UserId::new("bob"), phone);
        relay.register(UserId::new("bob"), laptop);

        let delivered = relay.relay(
            &UserId::new("alice"),
            Envelope::new(UserId::new("bob"), SignalMessage::End),
        );

        assert_eq!(delivered, 2);
        assert!(phone_rx.try_recv().is_ok());
        assert!(laptop_rx.try_recv().is_ok());
    }

    #[test]
    fn test_offline_target_is_silently_dropped() {
        let relay = SignalingRelay::new();
        let delivered = relay.relay(
            &UserId::new("alice"),
            Envelope::new(UserId::new("nobody"), SignalMessage::End),
        );
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_delivery_is_scoped_to_target() {
        let relay = SignalingRelay::new();
        let (bob, mut bob_rx) = connection();
        let (carol, mut carol_rx) = connection();
        relay.register(UserId::new("bob"), bob);
        relay.register(UserId::new("carol"), carol);

        relay.relay(
            &UserId::new("alice"),
            Envelope::new(UserId::new("bob"), SignalMessage::Reject),
        );

        assert!(bob_rx.try_recv().is_ok());
        assert!(carol_rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_removes_only_that_connection() {
        let relay = SignalingRelay::new();
        let (a, _a_rx) = connection();
        let (b, mut b_rx) = connection();
        let first = relay.register(UserId::new("bob"), a);
        relay.register(UserId::new("bob"), b);

        assert!(relay.unregister(first));
        assert!(!relay.unregister(first));
        assert_eq!(relay.connection_count(&UserId::new("bob")), 1);

        relay.relay(
            &UserId::new("alice"),
            Envelope::new(UserId::new("bob"), SignalMessage::Accept),
        );
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn test_last_unregister_takes_user_offline() {
        let relay = SignalingRelay::new();
        let (tx, _rx) = connection();
        let id = relay.register(UserId::new("bob"), tx);
        assert!(relay.is_online(&UserId::new("bob")));

        relay.unregister(id);
        assert!(!relay.is_online(&UserId::new("bob")));
        assert_eq!(relay.online_users(), 0);
    }

    #[test]
    fn test_closed_connection_does_not_count_as_delivered() {
        let relay = SignalingRelay::new();
        let (tx, rx) = connection();
        relay.register(UserId::new("bob"), tx);
        drop(rx);

        let delivered = relay.relay(
            &UserId::new("alice"),
            Envelope::new(UserId::new("bob"), SignalMessage::End),
        );
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_per_connection_order_is_preserved() {
        let relay = SignalingRelay::new();
        let (tx, mut rx) = connection();
        relay.register(UserId::new("bob"), tx);
        let alice = UserId::new("alice");

        relay.relay(&alice, Envelope::new(UserId::new("bob"), SignalMessage::Accept));
        relay.relay(&alice, Envelope::new(UserId::new("bob"), SignalMessage::End));

        assert_eq!(rx.try_recv().unwrap().message, SignalMessage::Accept);
        assert_eq!(rx.try_recv().unwrap().message, SignalMessage::End);
    }
}
