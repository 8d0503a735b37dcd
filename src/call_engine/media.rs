//! Media Tracks und Geräte
//!
//! Ein [`MediaTrack`] ist eine Audio- oder Videoquelle, lokal aufgenommen
//! oder vom Peer empfangen. Stummschalten setzt nur das `enabled`-Flag,
//! der Track selbst und die Verbindung bleiben bestehen. [`MediaTrack::stop`]
//! gibt das Gerät frei und ist idempotent.

use super::audio::{AudioCapture, AudioError, PcmBuffer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to use the device was denied")]
    PermissionDenied,

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No video capture device available")]
    NoVideoDevice,

    #[error("No local {0} track")]
    NoSuchTrack(TrackKind),

    #[error("Device error: {0}")]
    Device(String),
}

impl From<AudioError> for MediaError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::NoInputDevice => MediaError::NoInputDevice,
            other => MediaError::Device(other.to_string()),
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOrigin {
    Local,
    Remote,
}

/// Belegte Hardware hinter einem Track (Mikrofon, Lautsprecher, Kamera)
pub trait DeviceHandle: Send {
    /// Gibt das Gerät frei. Mehrfacher Aufruf ist erlaubt.
    fn release(&mut self);
}

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    origin: TrackOrigin,
    enabled: Arc<AtomicBool>,
    live: AtomicBool,
    device: Mutex<Option<Box<dyn DeviceHandle>>>,
    pcm: Option<PcmBuffer>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, origin: TrackOrigin) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            origin,
            enabled: Arc::new(AtomicBool::new(true)),
            live: AtomicBool::new(true),
            device: Mutex::new(None),
            pcm: None,
        }
    }

    pub fn local(kind: TrackKind) -> Self {
        Self::new(kind, TrackOrigin::Local)
    }

    pub fn remote(kind: TrackKind) -> Self {
        Self::new(kind, TrackOrigin::Remote)
    }

    /// PCM-Quelle (lokal) bzw. -Senke (remote) für Audio-Tracks
    pub fn with_pcm(mut self, pcm: PcmBuffer) -> Self {
        self.pcm = Some(pcm);
        self
    }

    /// Hängt ein Gerät an. Ist der Track schon gestoppt, wird es sofort freigegeben.
    pub fn attach_device(&self, mut device: Box<dyn DeviceHandle>) {
        let mut slot = self.device.lock();
        if self.is_live() {
            *slot = Some(device);
        } else {
            device.release();
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn origin(&self) -> TrackOrigin {
        self.origin
    }

    pub fn pcm(&self) -> Option<&PcmBuffer> {
        self.pcm.as_ref()
    }

    /// Flag, das Capture-Callbacks direkt lesen
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    /// Gestoppte Tracks bleiben deaktiviert
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_live() {
            return;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!("{} track {} enabled: {}", self.kind, self.id, enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }
        self.enabled.store(false, Ordering::SeqCst);

        // Lock nicht über release() halten
        let device = self.device.lock().take();
        if let Some(mut device) = device {
            device.release();
        }
        tracing::debug!("Stopped {:?} {} track {}", self.origin, self.kind, self.id);
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Die lokal aufgenommenen Tracks eines Anrufs
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        let track = self.track(kind).ok_or(MediaError::NoSuchTrack(kind))?;
        track.set_enabled(enabled);
        Ok(())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Audio ist immer dabei, Video nur bei Videoanrufen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn for_call(is_video: bool) -> Self {
        Self {
            audio: true,
            video: is_video,
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Quelle für lokale Tracks
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Mikrofon über cpal. Kameras werden nicht unterstützt.
#[derive(Debug, Default)]
pub struct SystemMediaDevices;

impl SystemMediaDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.video {
            return Err(MediaError::NoVideoDevice);
        }
        if !constraints.audio {
            return Ok(LocalMedia::default());
        }

        let pcm = PcmBuffer::new();
        let track = Arc::new(MediaTrack::local(TrackKind::Audio).with_pcm(pcm.clone()));
        let enabled = track.enabled_flag();

        // cpal blockiert beim Öffnen des Geräts
        let capture = tokio::task::spawn_blocking(move || AudioCapture::start(enabled, pcm))
            .await
            .map_err(|e| MediaError::Device(e.to_string()))??;

        track.attach_device(Box::new(capture));
        tracing::info!("Acquired local audio track {}", track.id());
        Ok(LocalMedia::new(vec![track]))
    }
}

// ============================================================================
// TESTS
// ============================================================================
