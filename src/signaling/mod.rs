//! Signaling Module - Relay und Client
//!
//! Dieses Modul verwaltet den Signaling-Kanal für Anrufe:
//! - Relay: Benutzer-Identität → Live-Verbindungen, Weiterleitung
//! - Server: WebSocket-Frontend mit Anmeldung per Ed25519
//! - Client: Verbindung halten, Envelopes senden und empfangen
//!

mod client;
mod messages;
mod relay;
mod server;

pub use client::{SignalSender, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use relay::{ConnectionId, ConnectionSender, SignalingRelay, UserSessionEndpoint};
pub use server::{verify_auth, RelayError, RelayServer};
