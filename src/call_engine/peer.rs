//! Peer Connection Manager
//!
//! Kapselt genau eine Transport-Verbindung zum Peer. ICE Candidates, die
//! vor der Remote Description eintreffen, werden gepuffert und danach in
//! Empfangsreihenfolge angewendet.

use super::media::MediaTrack;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("Expected {expected:?} description, got {actual:?}")]
    UnexpectedDescription { expected: SdpKind, actual: SdpKind },
}

// ============================================================================
// TRANSPORT SEAM
// ============================================================================

/// Events, die eine Transport-Verbindung von sich aus meldet
#[derive(Debug)]
pub enum TransportEvent {
    /// Lokal gesammelter Candidate, muss zum Peer
    LocalCandidate(IceCandidate),
    RemoteTrack(Arc<MediaTrack>),
    /// Verbindung ist unwiderruflich gescheitert
    Failed(String),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

// ============================================================================
// PEER CONNECTION MANAGER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Remote Description fehlt noch
    Queued,
}

#[derive(Default)]
struct CandidateBuffer {
    remote_description_applied: bool,
    pending: Vec<IceCandidate>,
}

pub struct PeerConnectionManager {
    transport: Arc<dyn PeerTransport>,
    candidates: tokio::sync::Mutex<CandidateBuffer>,
    closed: AtomicBool,
    local_tracks: Mutex<Vec<Arc<MediaTrack>>>,
}

impl PeerConnectionManager {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            candidates: tokio::sync::Mutex::new(CandidateBuffer::default()),
            closed: AtomicBool::new(false),
            local_tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Hängt die lokalen Tracks an, vor Offer bzw. Answer
    pub async fn attach_local_tracks(
        &self,
        tracks: &[Arc<MediaTrack>],
    ) -> Result<(), TransportError> {
        for track in tracks {
            self.ensure_open()?;
            self.transport.add_track(Arc::clone(track)).await?;
            self.local_tracks.lock().push(Arc::clone(track));
        }
        Ok(())
    }

    pub fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.local_tracks.lock().clone()
    }

    /// Caller: Offer erzeugen und lokal setzen
    pub async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        tracing::debug!("Created local offer");
        Ok(offer)
    }

    /// Callee: Offer übernehmen, Answer erzeugen und lokal setzen
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        expect_kind(&offer, SdpKind::Offer)?;
        self.apply_remote_description(offer).await?;

        self.ensure_open()?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        tracing::debug!("Created local answer");
        Ok(answer)
    }

    /// Caller: Answer übernehmen
    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        expect_kind(&answer, SdpKind::Answer)?;
        self.apply_remote_description(answer).await
    }

    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, TransportError> {
        self.ensure_open()?;
        let mut buffer = self.candidates.lock().await;
        if !buffer.remote_description_applied {
            buffer.pending.push(candidate);
            tracing::debug!("Queued early ICE candidate ({} pending)", buffer.pending.len());
            return Ok(CandidateDisposition::Queued);
        }
        self.transport.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    pub async fn pending_candidates(&self) -> usize {
        self.candidates.lock().await.pending.len()
    }

    /// Mehrfacher Aufruf ist ein No-op
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.candidates.lock().await.pending.clear();
        self.local_tracks.lock().clear();
        self.transport.close().await;
        tracing::debug!("Peer connection closed");
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        // Lock über das Setzen halten, damit kein Candidate dazwischen landet
        let mut buffer = self.candidates.lock().await;
        self.transport.set_remote_description(description).await?;
        buffer.remote_description_applied = true;

        let pending = std::mem::take(&mut buffer.pending);
        if !pending.is_empty() {
            tracing::debug!("Flushing {} queued ICE candidates", pending.len());
        }
        for candidate in pending {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn expect_kind(description: &SessionDescription, expected: SdpKind) -> Result<(), TransportError> {
    if description.kind == expected {
        Ok(())
    } else {
        Err(TransportError::UnexpectedDescription {
            expected,
            actual: description.kind,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
