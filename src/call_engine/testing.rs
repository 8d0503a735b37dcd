//! Test-Doubles für Engine-Tests
//!
//! Skriptbare Geräte und Transporte sowie ein In-Process-Netz über den
//! echten [`SignalingRelay`].

use super::engine::{CallEngine, CallProfile};
use super::media::{
    DeviceHandle, LocalMedia, MediaConstraints, MediaDevices, MediaError, MediaTrack, TrackKind,
};
use super::peer::{PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory};
use crate::signaling::{
    Envelope, IceCandidate, SdpKind, SessionDescription, SignalMessage, SignalSender,
    SignalingError, SignalingRelay, UserId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// ============================================================================
// MEDIA DEVICES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireMode {
    Grant,
    Deny,
    /// Wartet auf [`FakeMediaDevices::release`]
    Hold,
}

struct FakeDevice(Arc<AtomicUsize>);

impl DeviceHandle for FakeDevice {
    fn release(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeMediaDevices {
    mode: Mutex<AcquireMode>,
    gate: Notify,
    acquired: Mutex<Vec<Arc<MediaTrack>>>,
    releases: Arc<AtomicUsize>,
}

impl FakeMediaDevices {
    pub(crate) fn new(mode: AcquireMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            gate: Notify::new(),
            acquired: Mutex::new(Vec::new()),
            releases: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn set_mode(&self, mode: AcquireMode) {
        *self.mode.lock() = mode;
    }

    /// Gibt eine wartende Anfrage frei
    pub(crate) fn release(&self) {
        self.gate.notify_one();
    }

    pub(crate) fn acquired(&self) -> Vec<Arc<MediaTrack>> {
        self.acquired.lock().clone()
    }

    pub(crate) fn live_tracks(&self) -> usize {
        self.acquired.lock().iter().filter(|t| t.is_live()).count()
    }

    pub(crate) fn device_releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let mode = *self.mode.lock();
        match mode {
            AcquireMode::Deny => return Err(MediaError::PermissionDenied),
            AcquireMode::Hold => self.gate.notified().await,
            AcquireMode::Grant => {}
        }

        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }

        let tracks: Vec<Arc<MediaTrack>> = kinds
            .into_iter()
            .map(|kind| {
                let track = Arc::new(MediaTrack::local(kind));
                track.attach_device(Box::new(FakeDevice(Arc::clone(&self.releases))));
                track
            })
            .collect();
        self.acquired.lock().extend(tracks.iter().cloned());
        Ok(LocalMedia::new(tracks))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportCall {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate,
}

pub(crate) struct FakeTransport {
    events: TransportEvents,
    calls: Mutex<Vec<TransportCall>>,
    candidates: Mutex<Vec<IceCandidate>>,
    remote_tracks: Mutex<Vec<Arc<MediaTrack>>>,
    remote_set: AtomicBool,
    fail_remote: AtomicBool,
    track_on_attach: AtomicBool,
    closes: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new(events: TransportEvents) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            fail_remote: AtomicBool::new(false),
            track_on_attach: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Simuliert einen eingehenden Track
    pub(crate) fn emit_remote_track(&self, kind: TrackKind) -> Arc<MediaTrack> {
        let track = Arc::new(MediaTrack::remote(kind));
        self.remote_tracks.lock().push(Arc::clone(&track));
        let _ = self.events.send(TransportEvent::RemoteTrack(Arc::clone(&track)));
        track
    }

    pub(crate) fn emit_local_candidate(&self, candidate: IceCandidate) {
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
    }

    pub(crate) fn emit_failure(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Failed(reason.to_string()));
    }

    pub(crate) fn remote_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.remote_tracks.lock().clone()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        self.record(TransportCall::AddTrack(track.kind()));
        if self.track_on_attach.swap(false, Ordering::SeqCst) {
            self.emit_remote_track(TrackKind::Audio);
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateAnswer);
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(TransportError::WebRtc("no remote description".to_string()));
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetLocal(description.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetRemote(description.kind));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(TransportError::WebRtc("malformed sdp".to_string()));
        }
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(TransportCall::AddCandidate);
        // Wie beim echten Stack: ohne Remote Description kein Candidate
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(TransportError::WebRtc("remote description not set".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    fail_remote: AtomicBool,
    track_on_attach: AtomicBool,
}

impl FakeTransportFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Alle künftigen Transporte scheitern an der Remote Description
    pub(crate) fn fail_remote_descriptions(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Künftige Transporte liefern schon beim Anhängen der lokalen Tracks
    /// einen Remote-Track
    pub(crate) fn remote_track_while_attaching(&self) {
        self.track_on_attach.store(true, Ordering::SeqCst);
    }

    pub(crate) fn created(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().clone()
    }

    pub(crate) fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(FakeTransport::new(events));
        if self.fail_remote.load(Ordering::SeqCst) {
            transport.fail_remote_description();
        }
        if self.track_on_attach.load(Ordering::SeqCst) {
            transport.track_on_attach.store(true, Ordering::SeqCst);
        }
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// IN-PROCESS NETWORK
// ============================================================================

/// [`SignalSender`] direkt auf einen [`SignalingRelay`]
pub(crate) struct RelayLink {
    user: UserId,
    relay: Arc<SignalingRelay>,
    sent: Mutex<Vec<(UserId, SignalMessage)>>,
}

impl RelayLink {
    pub(crate) fn sent(&self) -> Vec<(UserId, SignalMessage)> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|(_, m)| m.kind()).collect()
    }
}

impl SignalSender for RelayLink {
    fn send_signal(&self, target: &UserId, message: SignalMessage) -> Result<(), SignalingError> {
        self.sent.lock().push((target.clone(), message.clone()));
        self.relay
            .relay(&self.user, Envelope::new(target.clone(), message));
        Ok(())
    }
}

/// Ein Teilnehmer im Testnetz
pub(crate) struct Peer {
    pub(crate) id: UserId,
    pub(crate) engine: CallEngine,
    pub(crate) link: Arc<RelayLink>,
    pub(crate) media: Arc<FakeMediaDevices>,
    pub(crate) transports: Arc<FakeTransportFactory>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl Peer {
    pub(crate) fn live_tracks(&self) -> usize {
        let remote = self
            .transports
            .created()
            .iter()
            .flat_map(|t| t.remote_tracks())
            .filter(|t| t.is_live())
            .count();
        self.media.live_tracks() + remote
    }
}

/// Mehrere Engines an einem echten Relay, Zustellung manuell
pub(crate) struct TestNetwork {
    relay: Arc<SignalingRelay>,
    peers: HashMap<String, Peer>,
}

impl TestNetwork {
    pub(crate) fn new() -> Self {
        Self {
            relay: Arc::new(SignalingRelay::new()),
            peers: HashMap::new(),
        }
    }

    pub(crate) fn join(&mut self, name: &str) -> UserId {
        let id = UserId::new(format!("user-{name}"));
        let (tx, inbox) = mpsc::unbounded_channel();
        self.relay.register(id.clone(), tx);

        let link = Arc::new(RelayLink {
            user: id.clone(),
            relay: Arc::clone(&self.relay),
            sent: Mutex::new(Vec::new()),
        });
        let media = FakeMediaDevices::new(AcquireMode::Grant);
        let transports = FakeTransportFactory::new();
        let engine = CallEngine::new(
            CallProfile::new(name.to_string(), None),
            Arc::clone(&link) as Arc<dyn SignalSender>,
            Arc::clone(&media) as Arc<dyn MediaDevices>,
            Arc::clone(&transports) as Arc<dyn TransportFactory>,
        );

        self.peers.insert(
            name.to_string(),
            Peer {
                id: id.clone(),
                engine,
                link,
                media,
                transports,
                inbox,
            },
        );
        id
    }

    pub(crate) fn peer(&self, name: &str) -> &Peer {
        &self.peers[name]
    }

    /// Stellt zu, bis keine Nachrichten mehr unterwegs sind
    pub(crate) async fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        let mut idle_rounds = 0;
        loop {
            let mut progressed = false;
            let mut names: Vec<String> = self.peers.keys().cloned().collect();
            names.sort();
            for name in names {
                let Some(peer) = self.peers.get_mut(&name) else {
                    continue;
                };
                while let Ok(envelope) = peer.inbox.try_recv() {
                    peer.engine.handle_signal(envelope).await;
                    delivered += 1;
                    progressed = true;
                }
            }
            if progressed {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds > 3 {
                    return delivered;
                }
                // Hintergrund-Tasks (Transport-Events) eine Chance geben
                tokio::task::yield_now().await;
            }
        }
    }

    /// Nächste ausstehende Nachricht für `name`, ohne sie zuzustellen
    pub(crate) fn take_pending(&mut self, name: &str) -> Vec<Envelope> {
        let mut pending = Vec::new();
        if let Some(peer) = self.peers.get_mut(name) {
            while let Ok(envelope) = peer.inbox.try_recv() {
                pending.push(envelope);
            }
        }
        pending
    }
}

/// Wartet, bis `condition` erfüllt ist (max. 2s)
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
