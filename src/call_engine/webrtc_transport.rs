//! WebRTC Transport
//!
//! [`PeerTransport`] auf Basis von `RTCPeerConnection`. Audio läuft als
//! PCMU: lokale Frames werden alle 20ms kodiert und als Sample geschrieben,
//! eingehendes RTP wird dekodiert und in den Playback-Buffer gelegt.

use super::audio::{AudioPlayback, PcmBuffer, SAMPLE_RATE};
use super::codec::{decode_pcmu, encode_pcmu, PCMU_CLOCK_RATE};
use super::media::{MediaTrack, TrackKind};
use super::peer::{PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Dauer eines Audio-Frames
const FRAME_DURATION: Duration = Duration::from_millis(20);

const STREAM_ID: &str = "pulse-call";

fn webrtc_error(err: webrtc::Error) -> TransportError {
    TransportError::WebRtc(err.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt pro Anruf eine neue Peer Connection
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(stun_servers: &[String]) -> Self {
        let ice_servers = if stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        // Media Engine mit Standard-Codecs (enthält PCMU)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_error)?);
        let transport = Arc::new(WebRtcTransport {
            pc,
            tasks: Arc::new(Mutex::new(Vec::new())),
        });
        transport.register_handlers(events);

        Ok(transport)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Sample-Pumpen und RTP-Reader, werden bei close() abgebrochen
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WebRtcTransport {
    fn register_handlers(&self, events: TransportEvents) {
        // Connection State Handler
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                if s == RTCPeerConnectionState::Failed {
                    let _ = state_events.send(TransportEvent::Failed(
                        "peer connection failed".to_string(),
                    ));
                }
                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let candidate_events = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = candidate_events
                            .send(TransportEvent::LocalCandidate(from_candidate_init(init)));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Medien)
        let tasks = Arc::clone(&self.tasks);
        self.pc.on_track(Box::new(move |track, _, _| {
            let events = events.clone();
            let tasks = Arc::clone(&tasks);
            Box::pin(async move {
                tracing::info!("Received track: {:?}", track.codec());
                let handle = match track.kind() {
                    RTPCodecType::Audio => spawn_remote_audio(track, events).await,
                    _ => spawn_remote_video(track, events),
                };
                tasks.lock().push(handle);
            })
        }));
    }

    fn spawn_audio_pump(&self, track: Arc<MediaTrack>, local: Arc<TrackLocalStaticSample>) {
        let Some(pcm) = track.pcm().cloned() else {
            tracing::debug!("Audio track {} has no PCM source", track.id());
            return;
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            loop {
                ticker.tick().await;
                if !track.is_live() {
                    break;
                }
                while let Some(frame) = pcm.read_frame() {
                    let sample = Sample {
                        data: Bytes::from(encode_pcmu(&frame)),
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = local.write_sample(&sample).await {
                        tracing::debug!("Audio pump stopped: {}", e);
                        return;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), TransportError> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: PCMU_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_error)?;

        // RTCP lesen, damit die Interceptors arbeiten
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        self.tasks.lock().push(rtcp);

        if track.kind() == TrackKind::Audio {
            self.spawn_audio_pump(track, local);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(webrtc_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(webrtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(webrtc_error)
    }

    async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// REMOTE TRACKS
// ============================================================================

async fn spawn_remote_audio(track: Arc<TrackRemote>, events: TransportEvents) -> JoinHandle<()> {
    let pcm = PcmBuffer::new();
    let media = Arc::new(MediaTrack::remote(TrackKind::Audio).with_pcm(pcm.clone()));

    let playback_buffer = pcm.clone();
    match tokio::task::spawn_blocking(move || AudioPlayback::start(playback_buffer)).await {
        Ok(Ok(playback)) => media.attach_device(Box::new(playback)),
        Ok(Err(e)) => tracing::warn!("Remote audio will not be played: {}", e),
        Err(e) => tracing::warn!("Playback startup task failed: {}", e),
    }

    let _ = events.send(TransportEvent::RemoteTrack(Arc::clone(&media)));

    let is_pcmu = track
        .codec()
        .capability
        .mime_type
        .eq_ignore_ascii_case(MIME_TYPE_PCMU);
    if !is_pcmu {
        tracing::warn!(
            "Remote audio codec {} is not supported, expected {} @ {} Hz",
            track.codec().capability.mime_type,
            MIME_TYPE_PCMU,
            SAMPLE_RATE
        );
    }

    tokio::spawn(async move {
        while let Ok((packet, _)) = track.read_rtp().await {
            if !media.is_live() {
                break;
            }
            if is_pcmu && media.is_enabled() {
                pcm.push(&decode_pcmu(&packet.payload));
            }
        }
        tracing::debug!("Remote audio track {} finished", media.id());
    })
}

fn spawn_remote_video(track: Arc<TrackRemote>, events: TransportEvents) -> JoinHandle<()> {
    let media = Arc::new(MediaTrack::remote(TrackKind::Video));
    let _ = events.send(TransportEvent::RemoteTrack(Arc::clone(&media)));

    // Kein Renderer: Pakete nur abnehmen
    tokio::spawn(async move {
        while track.read_rtp().await.is_ok() {
            if !media.is_live() {
                break;
            }
        }
    })
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(webrtc_error)
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
            ..IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host")
        };
        let restored = from_candidate_init(to_candidate_init(candidate.clone()));
        assert_eq!(restored, candidate);
    }

    #[test]
    fn test_factory_without_stun_servers() {
        let factory = WebRtcTransportFactory::new(&[]);
        assert!(factory.ice_servers.is_empty());

        let factory = WebRtcTransportFactory::new(&["stun:stun.l.google.com:19302".to_string()]);
        assert_eq!(factory.ice_servers.len(), 1);
        assert_eq!(factory.ice_servers[0].urls.len(), 1);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_transports() {
        let factory = WebRtcTransportFactory::new(&[]);
        let (caller_tx, _caller_rx) = tokio::sync::mpsc::unbounded_channel();
        let (callee_tx, _callee_rx) = tokio::sync::mpsc::unbounded_channel();
        let caller = factory.create(caller_tx).await.unwrap();
        let callee = factory.create(callee_tx).await.unwrap();

        caller
            .add_track(Arc::new(MediaTrack::local(TrackKind::Audio)))
            .await
            .unwrap();
        callee
            .add_track(Arc::new(MediaTrack::local(TrackKind::Audio)))
            .await
            .unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("PCMU"));
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await;
        callee.close().await;
    }
}
