//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt der Form
//! `{ type, targetUserId, senderId, payload }`. `senderId` wird
//! ausschließlich vom Relay gesetzt.

use crate::crypto::KeyPair;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTITÄT
// ============================================================================

/// Authentifizierte Benutzer-Identität (vom Relay vergeben)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Leitet die Identität aus dem Ed25519 Public Key ab
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(public_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// SESSION DESCRIPTION / ICE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer oder Answer eines Peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Ein möglicher Netzwerkpfad (trickle, einzeln übertragen)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// CALL-CONTROL / NEGOTIATION ENVELOPES
// ============================================================================

/// Inhalt eines Envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SignalMessage {
    #[serde(rename = "call:initiate")]
    Initiate {
        #[serde(rename = "isVideo")]
        is_video: bool,
        #[serde(rename = "callerDisplayName")]
        caller_display_name: String,
        #[serde(rename = "callerAvatarRef", default, skip_serializing_if = "Option::is_none")]
        caller_avatar_ref: Option<String>,
    },

    #[serde(rename = "call:accept")]
    Accept,

    #[serde(rename = "call:reject")]
    Reject,

    #[serde(rename = "call:end")]
    End,

    #[serde(rename = "webrtc:offer")]
    Offer {
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },

    #[serde(rename = "webrtc:answer")]
    Answer {
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },

    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate { candidate: IceCandidate },
}

impl SignalMessage {
    /// Wire-Name (`type`-Feld) für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "call:initiate",
            Self::Accept => "call:accept",
            Self::Reject => "call:reject",
            Self::End => "call:end",
            Self::Offer { .. } => "webrtc:offer",
            Self::Answer { .. } => "webrtc:answer",
            Self::IceCandidate { .. } => "webrtc:ice-candidate",
        }
    }
}

/// Adressierte Nachricht zwischen zwei Benutzern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "targetUserId")]
    pub target_user_id: UserId,
    #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(flatten)]
    pub message: SignalMessage,
}

impl Envelope {
    pub fn new(target_user_id: UserId, message: SignalMessage) -> Self {
        Self {
            target_user_id,
            sender_id: None,
            message,
        }
    }
}

// ============================================================================
// VERBINDUNGSAUFBAU (Authentifizierung)
// ============================================================================

/// Erstes Frame jeder Verbindung, Client → Relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename = "auth")]
pub struct AuthRequest {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub timestamp: i64,
    pub signature: String,
}

impl AuthRequest {
    /// Erstellt eine signierte Anmeldung
    pub fn signed(keypair: &KeyPair, display_name: String, timestamp: i64) -> Self {
        let mut request = Self {
            public_key: keypair.public_key_base64(),
            display_name,
            timestamp,
            signature: String::new(),
        };
        // Das `signature`-Feld ist nicht Teil der signierten Daten
        let signable = serde_json::to_value(&request).unwrap_or_default();
        request.signature = keypair.sign_message(&signable);
        request
    }
}

/// Antwort des Relays auf [`AuthRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthResponse {
    AuthOk {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    AuthError {
        reason: String,
    },
}

// ============================================================================
// TESTS
// ============================================================================
