//! Call Engine
//!
//! Zustandsmaschine für genau einen Anruf gleichzeitig. Verarbeitet lokale
//! Aktionen (anrufen, annehmen, ablehnen, auflegen) und eingehende
//! Signaling-Nachrichten, steuert Medien und Peer Connection.
//!
//! Jede asynchrone Fortsetzung trägt die [`SessionId`] ihrer Session und
//! prüft nach jedem `await`, ob diese noch aktuell ist. Was eine veraltete
//! Fortsetzung erzeugt hat (Tracks, Transporte), wird sofort freigegeben.

use super::media::{LocalMedia, MediaConstraints, MediaDevices, MediaError, MediaTrack, TrackKind};
use super::peer::{PeerConnectionManager, TransportEvent, TransportFactory};
use super::session::{CallPhase, CallRole, CallSession, EndReason, SessionId};
use crate::signaling::{
    Envelope, IceCandidate, SessionDescription, SignalMessage, SignalSender, SignalingError, UserId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Already in a call ({0})")]
    CallAlreadyInProgress(CallPhase),

    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),

    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("Not possible while {0}")]
    InvalidState(CallPhase),

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: CallPhase, to: CallPhase },

    #[error("No local {0} track")]
    TrackUnavailable(TrackKind),

    #[error("Call ended before the operation completed")]
    Cancelled,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Eigene Angaben, die mit `call:initiate` verschickt werden
#[derive(Debug, Clone)]
pub struct CallProfile {
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl CallProfile {
    pub fn new(display_name: String, avatar_ref: Option<String>) -> Self {
        Self {
            display_name,
            avatar_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingCall {
    pub peer: UserId,
    pub is_video: bool,
}

impl OutgoingCall {
    pub fn audio(peer: UserId) -> Self {
        Self {
            peer,
            is_video: false,
        }
    }

    pub fn video(peer: UserId) -> Self {
        Self {
            peer,
            is_video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDirection {
    /// Freizeichen beim Anrufer
    Outbound,
    /// Klingelton beim Angerufenen
    Inbound,
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallPhase),
    IncomingCall {
        from: UserId,
        display_name: String,
        avatar_ref: Option<String>,
        is_video: bool,
    },
    RingStarted(RingDirection),
    RingStopped,
    RemoteTrack {
        kind: TrackKind,
    },
    /// Hinweis an den Anrufer, danach folgt `CallEnded`
    CallRejected {
        by: UserId,
    },
    CallEnded {
        peer: UserId,
        reason: EndReason,
    },
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

struct ActiveCall {
    session: CallSession,
    cancel: CancellationToken,
    local_media: Option<LocalMedia>,
    remote_tracks: Vec<Arc<MediaTrack>>,
    connection: Option<Arc<PeerConnectionManager>>,
    /// Peer weiß von diesem Anruf (Initiate gesendet bzw. empfangen)
    peer_signaled: bool,
    ringing: Option<RingDirection>,
    /// accept_call läuft bereits
    accepting: bool,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            cancel: CancellationToken::new(),
            local_media: None,
            remote_tracks: Vec::new(),
            connection: None,
            peer_signaled: false,
            ringing: None,
            accepting: false,
        }
    }
}

#[derive(Default)]
struct EngineState {
    current: Option<ActiveCall>,
    generation: u64,
    last_session: Option<CallSession>,
}

impl EngineState {
    /// Höchstens eine nicht-terminale Session
    fn open(
        &mut self,
        build: impl FnOnce(SessionId) -> CallSession,
    ) -> Result<&mut ActiveCall, CallError> {
        if let Some(call) = &self.current {
            return Err(CallError::CallAlreadyInProgress(call.session.phase()));
        }
        self.generation += 1;
        let session = build(SessionId::new(self.generation));
        Ok(self.current.insert(ActiveCall::new(session)))
    }

    fn call_mut(&mut self, id: SessionId) -> Option<&mut ActiveCall> {
        self.current
            .as_mut()
            .filter(|call| call.session.id() == id)
    }

    fn call_with_peer(&mut self, peer: &UserId) -> Option<&mut ActiveCall> {
        self.current
            .as_mut()
            .filter(|call| call.session.peer() == peer)
    }
}

struct Shared {
    profile: CallProfile,
    signaling: Arc<dyn SignalSender>,
    media: Arc<dyn MediaDevices>,
    transports: Arc<dyn TransportFactory>,
    state: Mutex<EngineState>,
    event_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

#[derive(Clone)]
pub struct CallEngine {
    shared: Arc<Shared>,
}

impl CallEngine {
    pub fn new(
        profile: CallProfile,
        signaling: Arc<dyn SignalSender>,
        media: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(Shared {
                profile,
                signaling,
                media,
                transports,
                state: Mutex::new(EngineState::default()),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|call| call.session.phase())
            .unwrap_or(CallPhase::Idle)
    }

    /// Snapshot der laufenden Session
    pub fn session(&self) -> Option<CallSession> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|call| call.session.clone())
    }

    /// Zuletzt beendete Session
    pub fn last_session(&self) -> Option<CallSession> {
        self.shared.state.lock().last_session.clone()
    }

    pub fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .and_then(|call| call.local_media.as_ref())
            .map(|media| media.tracks().to_vec())
            .unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|call| call.remote_tracks.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Kehrt nach dem Versand von `call:initiate` zurück (Phase `Dialing`).
    pub async fn start_call(&self, call: OutgoingCall) -> Result<CallSession, CallError> {
        let OutgoingCall { peer, is_video } = call;

        let (id, cancel) = {
            let mut state = self.shared.state.lock();
            let call = state.open(|id| CallSession::new(id, peer.clone(), is_video, CallRole::Caller))?;
            (call.session.id(), call.cancel.clone())
        };
        tracing::info!("Calling {} (video: {}), session {}", peer, is_video, id);
        self.emit(CallEvent::StateChanged(CallPhase::Dialing));

        let media = match self.acquire_media(&cancel, is_video).await {
            Ok(media) => media,
            Err(e) => {
                if !matches!(e, CallError::Cancelled) {
                    tracing::warn!("Cannot start call, local media unavailable: {}", e);
                    self.terminate(Some(id), EndReason::MediaUnavailable, false)
                        .await;
                }
                return Err(e);
            }
        };
        if !self.store_local_media(id, media) {
            return Err(CallError::Cancelled);
        }

        let initiate = SignalMessage::Initiate {
            is_video,
            caller_display_name: self.shared.profile.display_name.clone(),
            caller_avatar_ref: self.shared.profile.avatar_ref.clone(),
        };

        let sent = {
            let mut state = self.shared.state.lock();
            let Some(call) = state.call_mut(id) else {
                return Err(CallError::Cancelled);
            };
            let result = self.shared.signaling.send_signal(&peer, initiate);
            if result.is_ok() {
                call.peer_signaled = true;
                call.ringing = Some(RingDirection::Outbound);
            }
            result.map(|_| call.session.clone())
        };

        match sent {
            Ok(snapshot) => {
                self.emit(CallEvent::RingStarted(RingDirection::Outbound));
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!("Failed to send call:initiate to {}: {}", peer, e);
                self.terminate(Some(id), EndReason::SignalingFailed, false)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Nimmt den klingelnden Anruf an
    ///
    /// Reihenfolge: Medien holen, Transport aufbauen, Tracks anhängen, erst
    /// dann `call:accept`. Das Offer des Anrufers trifft so immer auf einen
    /// fertigen Transport.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (id, cancel, peer, is_video) = {
            let mut state = self.shared.state.lock();
            let call = state.current.as_mut().ok_or(CallError::NoActiveCall)?;
            let phase = call.session.phase();
            if phase != CallPhase::Ringing || call.accepting {
                return Err(CallError::InvalidState(phase));
            }
            call.accepting = true;
            (
                call.session.id(),
                call.cancel.clone(),
                call.session.peer().clone(),
                call.session.is_video(),
            )
        };
        tracing::info!("Accepting call from {}", peer);

        let media = match self.acquire_media(&cancel, is_video).await {
            Ok(media) => media,
            Err(e) => {
                if !matches!(e, CallError::Cancelled) {
                    tracing::warn!("Rejecting call, local media unavailable: {}", e);
                    self.terminate(Some(id), EndReason::MediaUnavailable, true)
                        .await;
                }
                return Err(e);
            }
        };
        if !self.store_local_media(id, media) {
            return Err(CallError::Cancelled);
        }

        let (_, transport_events) = self.open_connection(id, &cancel).await?;

        let advanced = {
            let mut state = self.shared.state.lock();
            match state.call_mut(id) {
                Some(call) => call.session.advance(CallPhase::Negotiating).map(|_| {
                    call.accepting = false;
                    call.ringing = None;
                    self.shared.signaling.send_signal(&peer, SignalMessage::Accept)
                }),
                None => Err(CallError::Cancelled),
            }
        };
        // Remote-Tracks erst ab Negotiating annehmen, bis dahin puffert der Kanal
        self.spawn_transport_events(id, cancel.clone(), transport_events);
        let sent = advanced?;

        self.emit(CallEvent::RingStopped);
        self.emit(CallEvent::StateChanged(CallPhase::Negotiating));

        if let Err(e) = sent {
            tracing::warn!("Failed to send call:accept to {}: {}", peer, e);
            self.terminate(Some(id), EndReason::SignalingFailed, false)
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let id = {
            let state = self.shared.state.lock();
            let call = state.current.as_ref().ok_or(CallError::NoActiveCall)?;
            let phase = call.session.phase();
            if phase != CallPhase::Ringing {
                return Err(CallError::InvalidState(phase));
            }
            call.session.id()
        };
        tracing::info!("Rejecting incoming call");
        self.terminate(Some(id), EndReason::Declined, true).await;
        Ok(())
    }

    /// Beendet den aktuellen Anruf
    ///
    /// Beim Klingeln gleichbedeutend mit Ablehnen. Ohne Anruf ein No-op.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let reason = match self.phase() {
            CallPhase::Ringing => EndReason::Declined,
            _ => EndReason::LocalHangup,
        };
        self.terminate(None, reason, true).await;
        Ok(())
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.set_track_enabled(TrackKind::Audio, enabled)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.set_track_enabled(TrackKind::Video, enabled)
    }

    /// Gibt Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        !self.is_track_enabled(TrackKind::Audio)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.is_track_enabled(TrackKind::Video)
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), CallError> {
        let state = self.shared.state.lock();
        let call = state.current.as_ref().ok_or(CallError::NoActiveCall)?;
        let media = call
            .local_media
            .as_ref()
            .ok_or(CallError::InvalidState(call.session.phase()))?;
        media
            .set_enabled(kind, enabled)
            .map_err(|_| CallError::TrackUnavailable(kind))?;
        tracing::info!("Local {} enabled: {}", kind, enabled);
        Ok(())
    }

    fn is_track_enabled(&self, kind: TrackKind) -> bool {
        self.local_tracks()
            .iter()
            .find(|track| track.kind() == kind)
            .map(|track| track.is_enabled())
            .unwrap_or(false)
    }

    // ========================================================================
    // INCOMING SIGNALS
    // ========================================================================

    /// Verarbeitet einen Envelope vom Relay
    pub async fn handle_signal(&self, envelope: Envelope) {
        let Some(from) = envelope.sender_id else {
            tracing::debug!("Dropping {} without sender", envelope.message.kind());
            return;
        };
        tracing::debug!("Received {} from {}", envelope.message.kind(), from);

        match envelope.message {
            SignalMessage::Initiate {
                is_video,
                caller_display_name,
                caller_avatar_ref,
            } => self.on_initiate(from, is_video, caller_display_name, caller_avatar_ref),
            SignalMessage::Accept => self.on_accept(from).await,
            SignalMessage::Reject => self.on_reject(from).await,
            SignalMessage::End => self.on_end(from).await,
            SignalMessage::Offer {
                session_description,
            } => self.on_offer(from, session_description).await,
            SignalMessage::Answer {
                session_description,
            } => self.on_answer(from, session_description).await,
            SignalMessage::IceCandidate { candidate } => {
                self.on_remote_candidate(from, candidate).await
            }
        }
    }

    fn on_initiate(
        &self,
        from: UserId,
        is_video: bool,
        display_name: String,
        avatar_ref: Option<String>,
    ) {
        let opened = {
            let mut state = self.shared.state.lock();
            state
                .open(|id| {
                    CallSession::new(id, from.clone(), is_video, CallRole::Callee)
                        .with_peer_profile(display_name.clone(), avatar_ref.clone())
                })
                .map(|call| {
                    call.peer_signaled = true;
                    call.ringing = Some(RingDirection::Inbound);
                    call.session.id()
                })
        };

        let id = match opened {
            Ok(id) => id,
            Err(e) => {
                // Kein Busy-Signal: der Anrufer bleibt im Dialing
                tracing::info!("Ignoring call from {}: {}", from, e);
                return;
            }
        };

        tracing::info!("Incoming call from {} ({}), session {}", display_name, from, id);
        self.emit(CallEvent::StateChanged(CallPhase::Ringing));
        self.emit(CallEvent::IncomingCall {
            from,
            display_name,
            avatar_ref,
            is_video,
        });
        self.emit(CallEvent::RingStarted(RingDirection::Inbound));
    }

    /// Anrufer: Gegenseite hat angenommen, Offer erzeugen
    async fn on_accept(&self, from: UserId) {
        let opened = {
            let mut state = self.shared.state.lock();
            match state.call_with_peer(&from) {
                Some(call)
                    if call.session.role() == CallRole::Caller
                        && call.session.phase() == CallPhase::Dialing
                        && call.peer_signaled =>
                {
                    call.session
                        .advance(CallPhase::Negotiating)
                        .ok()
                        .map(|_| {
                            call.ringing = None;
                            (call.session.id(), call.cancel.clone())
                        })
                }
                _ => None,
            }
        };
        let Some((id, cancel)) = opened else {
            tracing::debug!("Ignoring call:accept from {}", from);
            return;
        };

        tracing::info!("{} accepted the call", from);
        self.emit(CallEvent::RingStopped);
        self.emit(CallEvent::StateChanged(CallPhase::Negotiating));

        let connection = match self.open_connection(id, &cancel).await {
            Ok((connection, transport_events)) => {
                self.spawn_transport_events(id, cancel.clone(), transport_events);
                connection
            }
            Err(_) => return,
        };
        match connection.create_offer().await {
            Ok(offer) => self.send_to_peer(
                id,
                SignalMessage::Offer {
                    session_description: offer,
                },
            ),
            Err(e) => {
                self.fail_negotiation(id, e.to_string()).await;
            }
        }
    }

    /// Nur im Dialing gültig
    async fn on_reject(&self, from: UserId) {
        let id = {
            let mut state = self.shared.state.lock();
            state
                .call_with_peer(&from)
                .filter(|call| call.session.phase() == CallPhase::Dialing)
                .map(|call| call.session.id())
        };
        let Some(id) = id else {
            tracing::debug!("Ignoring call:reject from {}", from);
            return;
        };

        tracing::info!("{} rejected the call", from);
        self.emit(CallEvent::CallRejected { by: from });
        self.terminate(Some(id), EndReason::RejectedByPeer, false)
            .await;
    }

    async fn on_end(&self, from: UserId) {
        let id = {
            let mut state = self.shared.state.lock();
            state.call_with_peer(&from).map(|call| call.session.id())
        };
        let Some(id) = id else {
            tracing::debug!("Ignoring call:end from {}", from);
            return;
        };

        tracing::info!("{} ended the call", from);
        self.terminate(Some(id), EndReason::RemoteHangup, false)
            .await;
    }

    /// Angerufener: Offer übernehmen und Answer senden
    async fn on_offer(&self, from: UserId, offer: SessionDescription) {
        let target = self.connection_for(&from, CallRole::Callee);
        let Some((id, connection)) = target else {
            tracing::debug!("Ignoring webrtc:offer from {}", from);
            return;
        };

        match connection.accept_offer(offer).await {
            Ok(answer) => self.send_to_peer(
                id,
                SignalMessage::Answer {
                    session_description: answer,
                },
            ),
            Err(e) => {
                self.fail_negotiation(id, e.to_string()).await;
            }
        }
    }

    /// Anrufer: Answer übernehmen
    async fn on_answer(&self, from: UserId, answer: SessionDescription) {
        let target = self.connection_for(&from, CallRole::Caller);
        let Some((id, connection)) = target else {
            tracing::debug!("Ignoring webrtc:answer from {}", from);
            return;
        };

        if let Err(e) = connection.apply_answer(answer).await {
            self.fail_negotiation(id, e.to_string()).await;
        }
    }

    async fn on_remote_candidate(&self, from: UserId, candidate: IceCandidate) {
        let target = {
            let mut state = self.shared.state.lock();
            state.call_with_peer(&from).and_then(|call| {
                call.connection
                    .clone()
                    .map(|connection| (call.session.id(), connection))
            })
        };
        let Some((id, connection)) = target else {
            tracing::debug!("Dropping ICE candidate from {}, no transport", from);
            return;
        };

        if let Err(e) = connection.add_remote_candidate(candidate).await {
            self.fail_negotiation(id, e.to_string()).await;
        }
    }

    fn connection_for(
        &self,
        from: &UserId,
        role: CallRole,
    ) -> Option<(SessionId, Arc<PeerConnectionManager>)> {
        let mut state = self.shared.state.lock();
        let call = state.call_with_peer(from)?;
        let negotiating = matches!(
            call.session.phase(),
            CallPhase::Negotiating | CallPhase::Active
        );
        if call.session.role() != role || !negotiating {
            return None;
        }
        call.connection
            .clone()
            .map(|connection| (call.session.id(), connection))
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    /// Erzeugt den Transport und hängt die lokalen Tracks an
    ///
    /// Die Transport-Events bleiben im zurückgegebenen Kanal, bis der Aufrufer
    /// [`Self::spawn_transport_events`] startet.
    async fn open_connection(
        &self,
        id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<(Arc<PeerConnectionManager>, mpsc::UnboundedReceiver<TransportEvent>), CallError>
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            created = self.shared.transports.create(events_tx) => created,
        };
        let transport = match created {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail_negotiation(id, e.to_string()).await),
        };
        let connection = Arc::new(PeerConnectionManager::new(transport));

        let tracks = {
            let mut state = self.shared.state.lock();
            state.call_mut(id).map(|call| {
                call.connection = Some(Arc::clone(&connection));
                call.local_media
                    .as_ref()
                    .map(|media| media.tracks().to_vec())
                    .unwrap_or_default()
            })
        };
        let Some(tracks) = tracks else {
            tracing::debug!("Session {} ended while creating transport", id);
            connection.close().await;
            return Err(CallError::Cancelled);
        };

        if let Err(e) = connection.attach_local_tracks(&tracks).await {
            release_remote_tracks(events_rx);
            return Err(self.fail_negotiation(id, e.to_string()).await);
        }
        Ok((connection, events_rx))
    }

    /// Leitet Transport-Events an die Engine weiter, bis die Session endet
    fn spawn_transport_events(
        &self,
        id: SessionId,
        cancel: CancellationToken,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => engine.on_transport_event(id, event).await,
                        None => break,
                    },
                }
            }

            // Verspätete Remote-Tracks freigeben
            release_remote_tracks(events);
            tracing::debug!("Transport events for session {} finished", id);
        });
    }

    async fn on_transport_event(&self, id: SessionId, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send_to_peer(id, SignalMessage::IceCandidate { candidate });
            }
            TransportEvent::RemoteTrack(track) => self.on_remote_track(id, track),
            TransportEvent::Failed(reason) => {
                self.fail_negotiation(id, reason).await;
            }
        }
    }

    fn on_remote_track(&self, id: SessionId, track: Arc<MediaTrack>) {
        let accepted = {
            let mut state = self.shared.state.lock();
            match state.call_mut(id) {
                Some(call)
                    if matches!(
                        call.session.phase(),
                        CallPhase::Negotiating | CallPhase::Active
                    ) =>
                {
                    call.remote_tracks.push(Arc::clone(&track));
                    let became_active = call.session.phase() == CallPhase::Negotiating
                        && call.session.advance(CallPhase::Active).is_ok();
                    Some(became_active)
                }
                _ => None,
            }
        };

        match accepted {
            None => {
                tracing::debug!("Releasing remote {} track of stale session {}", track.kind(), id);
                track.stop();
            }
            Some(became_active) => {
                self.emit(CallEvent::RemoteTrack { kind: track.kind() });
                if became_active {
                    tracing::info!("Call session {} is active", id);
                    self.emit(CallEvent::StateChanged(CallPhase::Active));
                }
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn acquire_media(
        &self,
        cancel: &CancellationToken,
        is_video: bool,
    ) -> Result<LocalMedia, CallError> {
        let constraints = MediaConstraints::for_call(is_video);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            result = self.shared.media.acquire(constraints) => {
                result.map_err(CallError::MediaAcquisitionFailed)
            }
        }
    }

    /// Legt die Medien in die Session. Ist sie veraltet, werden sie gestoppt.
    fn store_local_media(&self, id: SessionId, media: LocalMedia) -> bool {
        let stale = {
            let mut state = self.shared.state.lock();
            match state.call_mut(id) {
                Some(call) => {
                    call.local_media = Some(media);
                    None
                }
                None => Some(media),
            }
        };
        match stale {
            Some(media) => {
                tracing::debug!("Releasing media of stale session {}", id);
                media.stop_all();
                false
            }
            None => true,
        }
    }

    fn send_to_peer(&self, id: SessionId, message: SignalMessage) {
        let state = self.shared.state.lock();
        let Some(call) = state.current.as_ref().filter(|c| c.session.id() == id) else {
            tracing::debug!("Not sending {} for stale session {}", message.kind(), id);
            return;
        };
        if let Err(e) = self
            .shared
            .signaling
            .send_signal(call.session.peer(), message)
        {
            tracing::warn!("Failed to send signal: {}", e);
        }
    }

    async fn fail_negotiation(&self, id: SessionId, error: String) -> CallError {
        if self
            .terminate(Some(id), EndReason::NegotiationFailed, true)
            .await
        {
            tracing::error!("Negotiation failed: {}", error);
            CallError::NegotiationFailure(error)
        } else {
            tracing::debug!("Ignoring failure of stale session {}: {}", id, error);
            CallError::Cancelled
        }
    }

    /// Beendet die Session `id` (bzw. die aktuelle bei `None`)
    ///
    /// Idempotent: gibt `false` zurück, wenn es nichts zu beenden gab.
    async fn terminate(&self, id: Option<SessionId>, reason: EndReason, notify: bool) -> bool {
        let taken = {
            let mut state = self.shared.state.lock();
            let current_id = state.current.as_ref().map(|call| call.session.id());
            match (id, current_id) {
                (Some(id), Some(current)) if id != current => None,
                _ => state.current.take(),
            }
        };
        let Some(mut call) = taken else {
            return false;
        };

        call.cancel.cancel();
        let prior = call.session.phase();
        let peer = call.session.peer().clone();

        if notify && call.peer_signaled {
            let message = if prior == CallPhase::Ringing {
                SignalMessage::Reject
            } else {
                SignalMessage::End
            };
            if let Err(e) = self.shared.signaling.send_signal(&peer, message) {
                tracing::warn!("Failed to notify {}: {}", peer, e);
            }
        }

        if call.ringing.take().is_some() {
            self.emit(CallEvent::RingStopped);
        }
        if let Some(media) = call.local_media.take() {
            media.stop_all();
        }
        for track in call.remote_tracks.drain(..) {
            track.stop();
        }
        if let Some(connection) = call.connection.take() {
            connection.close().await;
        }

        call.session.end(reason);
        tracing::info!(
            "Call with {} ended ({:?}), session {}",
            peer,
            reason,
            call.session.id()
        );
        self.shared.state.lock().last_session = Some(call.session);

        self.emit(CallEvent::StateChanged(CallPhase::Ended));
        self.emit(CallEvent::CallEnded { peer, reason });
        self.emit(CallEvent::StateChanged(CallPhase::Idle));
        true
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.shared.event_tx.send(event);
    }
}

fn release_remote_tracks(mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    events.close();
    while let Ok(event) = events.try_recv() {
        if let TransportEvent::RemoteTrack(track) = event {
            track.stop();
        }
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("phase", &self.phase())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
