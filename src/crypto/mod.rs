//! Crypto Module - Ed25519 Identität
//!
//! Dieses Modul verwaltet die kryptographische Identität eines Teilnehmers:
//! - Generierung eines Ed25519 Schlüsselpaars beim ersten Start
//! - Persistente Speicherung des Private Keys
//! - Signierung und Prüfung der Anmeldung am Signaling-Relay
//!

mod keypair;

pub use keypair::{KeyPair, KeyPairError};
