//! Call Engine Module - Anrufe, WebRTC und Audio
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Anrufs (genau ein Anruf gleichzeitig)
//! - Peer Connections samt ICE Candidate Puffer
//! - Lokale und entfernte Media Tracks
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher)
//! - PCMU (G.711 µ-law) Encoding/Decoding

mod audio;
mod codec;
mod engine;
mod media;
mod peer;
mod session;
mod webrtc_transport;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::{AudioCapture, AudioError, AudioPlayback, PcmBuffer, FRAME_SIZE, SAMPLE_RATE};
pub use codec::{decode_pcmu, encode_pcmu, PCMU_CLOCK_RATE};
pub use engine::{CallEngine, CallError, CallEvent, CallProfile, OutgoingCall, RingDirection};
pub use media::{
    DeviceHandle, LocalMedia, MediaConstraints, MediaDevices, MediaError, MediaTrack,
    SystemMediaDevices, TrackKind, TrackOrigin,
};
pub use peer::{
    CandidateDisposition, PeerConnectionManager, PeerTransport, TransportError, TransportEvent,
    TransportEvents, TransportFactory,
};
pub use session::{CallPhase, CallRole, CallSession, EndReason, PhaseChange, SessionId};
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
