//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die Verbindung eines Teilnehmers zum Relay:
//! - Verbindungsaufbau mit signierter Anmeldung
//! - Heartbeat (WebSocket Ping)
//! - Fire-and-forget Versand von Envelopes
//! - Event-basierte Weitergabe eingehender Envelopes

use super::messages::*;
use crate::crypto::KeyPair;
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// WebSocket steht
    Connected,

    /// Relay hat die Anmeldung bestätigt
    Authenticated { user_id: UserId },

    /// Eingehender Envelope (senderId vom Relay gesetzt)
    Signal(Envelope),

    /// Verbindung getrennt
    Disconnected,
}

/// Versandweg für Call-Control- und Negotiation-Nachrichten
///
/// Nicht-blockierend, ohne Zustellbestätigung.
pub trait SignalSender: Send + Sync {
    fn send_signal(&self, target: &UserId, message: SignalMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    user_id: Option<UserId>,
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Ping,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Relay
pub struct SignalingClient {
    server_url: Url,
    display_name: String,
    keypair: Arc<KeyPair>,
    state: Arc<RwLock<ClientState>>,
    outbound: RwLock<Option<mpsc::Sender<Outbound>>>,
    /// Beendet Hintergrund-Tasks der aktuellen Verbindung
    shutdown: RwLock<CancellationToken>,
    event_tx: broadcast::Sender<SignalingEvent>,
    /// Verlustfreier Weg für eingehende Envelopes (ein Konsument)
    signal_tx: mpsc::UnboundedSender<Envelope>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl SignalingClient {
    pub fn new(server_url: Url, display_name: String, keypair: Arc<KeyPair>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Self {
            server_url,
            display_name,
            keypair,
            state: Arc::new(RwLock::new(ClientState::default())),
            outbound: RwLock::new(None),
            shutdown: RwLock::new(CancellationToken::new()),
            event_tx,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Übernimmt den Envelope-Stream
    ///
    /// Anders als `subscribe` geht hier nichts durch Überlauf verloren.
    /// Nur der erste Aufruf liefert den Receiver.
    pub fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.signal_rx.lock().take()
    }

    /// Vom Relay vergebene Identität (nach erfolgreicher Anmeldung)
    pub fn user_id(&self) -> Option<UserId> {
        self.state.read().user_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und meldet sich an
    pub async fn connect(&self) -> Result<UserId, SignalingError> {
        tracing::info!("Connecting to signaling relay: {}", self.server_url);

        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Anmeldung direkt, bevor der Writer-Task übernimmt
        let request = AuthRequest::signed(
            &self.keypair,
            self.display_name.clone(),
            Utc::now().timestamp_millis(),
        );
        let text = serde_json::to_string(&request)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let user_id = match tokio::time::timeout(AUTH_TIMEOUT, read_auth_response(&mut read)).await
        {
            Ok(Ok(AuthResponse::AuthOk { user_id })) => user_id,
            Ok(Ok(AuthResponse::AuthError { reason })) => {
                return Err(SignalingError::AuthenticationFailed(reason))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SignalingError::AuthenticationFailed("Timeout".to_string())),
        };

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.user_id = Some(user_id.clone());
        }
        tracing::info!("Authenticated as {}", user_id);
        let _ = self.event_tx.send(SignalingEvent::Authenticated {
            user_id: user_id.clone(),
        });

        let (tx, mut rx) = mpsc::channel::<Outbound>(100);
        *self.outbound.write() = Some(tx);
        *self.shutdown.write() = CancellationToken::new();

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            let _ = signal_tx.send(envelope.clone());
                            let _ = event_tx.send(SignalingEvent::Signal(envelope));
                        }
                        Err(e) => tracing::warn!("Ignoring unparsable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let frame = match outbound {
                    Outbound::Text(text) => Message::Text(text),
                    Outbound::Ping => Message::Ping(Vec::new()),
                };
                if let Err(e) = write.send(frame).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(user_id)
    }

    /// Trennt die Verbindung (Writer schließt den Socket)
    pub fn disconnect(&self) {
        // Alle Sender-Klone müssen weg, sonst schließt der Writer nie
        self.shutdown.read().cancel();
        self.outbound.write().take();
    }

    /// Sendet einen Envelope ohne zu blockieren
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = serde_json::to_string(envelope)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.try_send(Outbound::Text(text))
    }

    /// Startet einen Heartbeat-Task (WebSocket Ping)
    pub fn start_heartbeat(&self, interval: Duration) {
        let Some(tx) = self.outbound.read().clone() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.read().clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Heartbeat: disconnect requested, stopping heartbeat task");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                if !state.read().is_connected {
                    tracing::info!("Heartbeat: client disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = tx.try_send(Outbound::Ping) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    fn try_send(&self, outbound: Outbound) -> Result<(), SignalingError> {
        let guard = self.outbound.read();
        let tx = guard.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.try_send(outbound)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl SignalSender for SignalingClient {
    fn send_signal(&self, target: &UserId, message: SignalMessage) -> Result<(), SignalingError> {
        self.send_envelope(&Envelope::new(target.clone(), message))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

async fn read_auth_response<S>(read: &mut S) -> Result<AuthResponse, SignalingError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return serde_json::from_str::<AuthResponse>(&text)
                    .map_err(|e| SignalingError::AuthenticationFailed(e.to_string()));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(SignalingError::ConnectionFailed(e.to_string())),
        }
    }
    Err(SignalingError::AuthenticationFailed(
        "connection closed during authentication".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
