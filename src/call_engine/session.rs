//! Call Session - Zustand eines einzelnen Anrufs
//!
//! Phasen laufen nur vorwärts:
//!
//! ```text
//! Dialing ─┐
//!          ├─> Negotiating ─> Active ─> Ended
//! Ringing ─┘
//! ```
//!
//! `Ended` ist aus jeder nicht-terminalen Phase erreichbar.

use super::engine::CallError;
use crate::signaling::UserId;
use chrono::{DateTime, Utc};

/// Generationsmarke einer Session
///
/// Asynchrone Fortsetzungen prüfen nach jedem `await`, ob ihre Session
/// noch die aktuelle ist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(generation: u64) -> Self {
        Self(generation)
    }

    pub fn generation(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    /// Kein Anruf
    Idle,
    /// Ausgehender Anruf, Gegenseite klingelt
    Dialing,
    /// Eingehender Anruf wartet auf Annahme
    Ringing,
    /// Angenommen, SDP/ICE Austausch läuft
    Negotiating,
    /// Erster Remote-Track ist da
    Active,
    Ended,
}

impl CallPhase {
    fn rank(self) -> u8 {
        match self {
            CallPhase::Idle => 0,
            CallPhase::Dialing | CallPhase::Ringing => 1,
            CallPhase::Negotiating => 2,
            CallPhase::Active => 3,
            CallPhase::Ended => 4,
        }
    }

    /// Ob aus `self` nach `next` gewechselt werden darf
    pub fn can_advance_to(self, next: CallPhase) -> bool {
        match (self, next) {
            (CallPhase::Idle | CallPhase::Ended, _) => false,
            (_, CallPhase::Ended) => true,
            (CallPhase::Dialing | CallPhase::Ringing, CallPhase::Negotiating) => true,
            (CallPhase::Negotiating, CallPhase::Active) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Idle | CallPhase::Ended)
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallPhase::Idle => "idle",
            CallPhase::Dialing => "dialing",
            CallPhase::Ringing => "ringing",
            CallPhase::Negotiating => "negotiating",
            CallPhase::Active => "active",
            CallPhase::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Warum eine Session beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Lokal aufgelegt
    LocalHangup,
    /// `call:end` vom Peer
    RemoteHangup,
    /// Eingehenden Anruf lokal abgelehnt
    Declined,
    /// `call:reject` vom Peer
    RejectedByPeer,
    MediaUnavailable,
    NegotiationFailed,
    SignalingFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub phase: CallPhase,
    pub at: DateTime<Utc>,
}

/// Ein Anruf mit genau einem Peer
#[derive(Debug, Clone)]
pub struct CallSession {
    id: SessionId,
    peer: UserId,
    peer_display_name: Option<String>,
    peer_avatar_ref: Option<String>,
    is_video: bool,
    role: CallRole,
    history: Vec<PhaseChange>,
    end_reason: Option<EndReason>,
}

impl CallSession {
    pub(crate) fn new(id: SessionId, peer: UserId, is_video: bool, role: CallRole) -> Self {
        let phase = match role {
            CallRole::Caller => CallPhase::Dialing,
            CallRole::Callee => CallPhase::Ringing,
        };
        Self {
            id,
            peer,
            peer_display_name: None,
            peer_avatar_ref: None,
            is_video,
            role,
            history: vec![PhaseChange {
                phase,
                at: Utc::now(),
            }],
            end_reason: None,
        }
    }

    pub(crate) fn with_peer_profile(
        mut self,
        display_name: String,
        avatar_ref: Option<String>,
    ) -> Self {
        self.peer_display_name = Some(display_name);
        self.peer_avatar_ref = avatar_ref;
        self
    }

    pub(crate) fn advance(&mut self, next: CallPhase) -> Result<(), CallError> {
        let from = self.phase();
        if !from.can_advance_to(next) {
            return Err(CallError::InvalidTransition { from, to: next });
        }
        self.history.push(PhaseChange {
            phase: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Beendet die Session. Eine beendete Session bleibt unverändert.
    pub(crate) fn end(&mut self, reason: EndReason) {
        if self.advance(CallPhase::Ended).is_ok() {
            self.end_reason = Some(reason);
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn peer_display_name(&self) -> Option<&str> {
        self.peer_display_name.as_deref()
    }

    pub fn peer_avatar_ref(&self) -> Option<&str> {
        self.peer_avatar_ref.as_deref()
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn phase(&self) -> CallPhase {
        self.history
            .last()
            .map(|change| change.phase)
            .unwrap_or(CallPhase::Idle)
    }

    pub fn history(&self) -> &[PhaseChange] {
        &self.history
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.history
            .first()
            .map(|change| change.at)
            .unwrap_or_else(Utc::now)
    }

    /// Gesprächsdauer ab `Active`, `None` wenn nie verbunden
    pub fn talk_time(&self) -> Option<chrono::Duration> {
        let connected = self
            .history
            .iter()
            .find(|c| c.phase == CallPhase::Active)?
            .at;
        let until = self
            .history
            .iter()
            .find(|c| c.phase == CallPhase::Ended)
            .map(|c| c.at)
            .unwrap_or_else(Utc::now);
        Some(until - connected)
    }

    /// Prüft, dass die Phasen streng monoton gelaufen sind
    pub fn is_monotonic(&self) -> bool {
        self.history
            .windows(2)
            .all(|pair| pair[0].phase.rank() < pair[1].phase.rank())
    }
}

// ============================================================================
// TESTS
// ============================================================================
