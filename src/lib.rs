//! Pulse Calls - Signaling Relay und P2P Call Engine
//!
//! Eine P2P Voice/Video-Call-Bibliothek mit:
//! - WebSocket Signaling-Relay mit Ed25519 Anmeldung
//! - Call Engine als Zustandsmaschine (genau ein Anruf gleichzeitig)
//! - WebRTC für P2P Medien, cpal für Audio

pub mod call_engine;
pub mod config;
pub mod crypto;
pub mod signaling;

use call_engine::{
    CallEngine, CallEvent, CallProfile, MediaDevices, SystemMediaDevices, TransportFactory,
    WebRtcTransportFactory,
};
use config::ClientConfig;
use crypto::KeyPair;
use signaling::{Envelope, SignalSender, SignalingClient, SignalingError, UserId};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const DEFAULT_LOG_FILTER: &str = "pulse_calls=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang. Mehrfacher Aufruf ist erlaubt.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CALL CLIENT
// ============================================================================

/// Signaling-Verbindung plus Call Engine eines Teilnehmers
pub struct CallClient {
    signaling: Arc<SignalingClient>,
    engine: CallEngine,
    user_id: UserId,
    pump: JoinHandle<()>,
}

impl CallClient {
    /// Verbindet mit Systemgeräten und WebRTC
    pub async fn connect(config: ClientConfig, keypair: KeyPair) -> Result<Self, SignalingError> {
        let transports = WebRtcTransportFactory::new(&config.stun_servers);
        Self::connect_with(
            config,
            keypair,
            Arc::new(SystemMediaDevices::new()),
            Arc::new(transports),
        )
        .await
    }

    pub async fn connect_with(
        config: ClientConfig,
        keypair: KeyPair,
        media: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<Self, SignalingError> {
        let signaling = Arc::new(SignalingClient::new(
            config.signaling_url.clone(),
            config.display_name.clone(),
            Arc::new(keypair),
        ));
        let engine = CallEngine::new(
            CallProfile::new(config.display_name, config.avatar_ref),
            Arc::clone(&signaling) as Arc<dyn SignalSender>,
            media,
            transports,
        );

        // Vor connect übernehmen, damit kein Envelope verloren geht
        let signals = signaling.take_signals().ok_or_else(|| {
            SignalingError::ConnectionFailed("signal stream already taken".to_string())
        })?;
        let user_id = signaling.connect().await?;
        signaling.start_heartbeat(config.heartbeat_interval);

        let pump = tokio::spawn(pump_signals(signals, engine.clone()));
        tracing::info!("Call client ready as {}", user_id);

        Ok(Self {
            signaling,
            engine,
            user_id,
            pump,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn engine(&self) -> &CallEngine {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.engine.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Legt auf und trennt die Verbindung zum Relay
    pub async fn disconnect(self) {
        let _ = self.engine.hang_up().await;
        self.signaling.disconnect();
        self.pump.abort();
        tracing::info!("Call client {} disconnected", self.user_id);
    }
}

impl std::fmt::Debug for CallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallClient")
            .field("user_id", &self.user_id)
            .field("engine", &self.engine)
            .finish()
    }
}

/// Leitet eingehende Envelopes an die Engine weiter
///
/// Der Kanal ist unbegrenzt, ein langsamer `handle_signal` verliert nichts.
async fn pump_signals(mut signals: mpsc::UnboundedReceiver<Envelope>, engine: CallEngine) {
    while let Some(envelope) = signals.recv().await {
        engine.handle_signal(envelope).await;
    }
    tracing::debug!("Signal pump stopped");
}

// ============================================================================
// TESTS
// ============================================================================
