//! WebSocket-Frontend des Signaling Relays
//!
//! Pro Verbindung:
//! 1. WebSocket-Upgrade
//! 2. Auth-Frame innerhalb von `auth_timeout` (Ed25519-Signatur)
//! 3. Registrierung beim [`SignalingRelay`], Reader-Loop + Writer-Task
//! 4. Beim Schließen: unregister

use super::messages::{AuthRequest, AuthResponse, Envelope, UserId};
use super::relay::SignalingRelay;
use crate::config::RelayConfig;
use crate::crypto::KeyPair;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::accept_async;

/// Pause nach einem fehlgeschlagenen accept (z.B. EMFILE)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind relay socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

// ============================================================================
// RELAY SERVER
// ============================================================================

/// Nimmt Verbindungen an und verbindet sie mit dem Relay
pub struct RelayServer {
    relay: Arc<SignalingRelay>,
    config: RelayConfig,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            relay: Arc::new(SignalingRelay::new()),
            config,
        }
    }

    pub fn relay(&self) -> Arc<SignalingRelay> {
        Arc::clone(&self.relay)
    }

    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(RelayError::Bind)
    }

    /// Accept-Loop
    ///
    /// Fehler beim Annehmen betreffen nur die eine Verbindung; der Loop läuft weiter.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        tracing::info!("Signaling relay listening on {}", listener.local_addr()?);

        let incoming = futures::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await;
            Some((accepted, listener))
        });
        self.serve_incoming(incoming).await;
        Ok(())
    }

    async fn serve_incoming<S>(self, incoming: S)
    where
        S: Stream<Item = std::io::Result<(TcpStream, SocketAddr)>>,
    {
        futures::pin_mut!(incoming);

        while let Some(accepted) = incoming.next().await {
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let relay = Arc::clone(&self.relay);
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(relay, config, stream, addr).await {
                    tracing::warn!("Connection {} closed with error: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    relay: Arc<SignalingRelay>,
    config: RelayConfig,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), RelayError> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let verdict = match tokio::time::timeout(config.auth_timeout, read_auth_request(&mut read)).await
    {
        Ok(Ok(request)) => verify_auth(&request, Utc::now().timestamp_millis(), config.auth_max_skew)
            .map(|user_id| (user_id, request.display_name)),
        Ok(Err(reason)) => Err(reason),
        Err(_) => Err("authentication timed out".to_string()),
    };

    let (user_id, display_name) = match verdict {
        Ok(identity) => identity,
        Err(reason) => {
            tracing::warn!("Rejecting connection from {}: {}", addr, reason);
            let response = AuthResponse::AuthError {
                reason: reason.clone(),
            };
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = write.send(Message::Text(text)).await;
            }
            let _ = write.close().await;
            return Err(RelayError::Auth(reason));
        }
    };

    // Registrierung vor auth_ok: wer auth_ok sieht, ist erreichbar
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let connection = relay.register(user_id.clone(), tx);

    let ok = AuthResponse::AuthOk {
        user_id: user_id.clone(),
    };
    let sent = match serde_json::to_string(&ok) {
        Ok(text) => write.send(Message::Text(text)).await.map_err(RelayError::from),
        Err(e) => Err(RelayError::Auth(e.to_string())),
    };
    if let Err(e) = sent {
        relay.unregister(connection);
        return Err(e);
    }

    tracing::info!("{} authenticated as {} ({})", addr, user_id, display_name);

    // Writer-Task: Queue → WebSocket, Reihenfolge bleibt erhalten
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode envelope: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!("Write to {} failed: {}", connection, e);
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    relay.relay(&user_id, envelope);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed envelope from {}: {}", user_id, e);
                }
            },
            Ok(Message::Close(_)) => break,
            // Ping wird von tungstenite beantwortet
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", user_id, e);
                break;
            }
        }
    }

    relay.unregister(connection);
    writer.abort();
    Ok(())
}

async fn read_auth_request<S>(read: &mut S) -> Result<AuthRequest, String>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return serde_json::from_str::<AuthRequest>(&text)
                    .map_err(|e| format!("expected auth frame: {e}"));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Ok(_) => return Err("expected text auth frame".to_string()),
            Err(e) => return Err(e.to_string()),
        }
    }
    Err("connection closed before authentication".to_string())
}

/// Prüft Signatur und Zeitfenster einer Anmeldung
pub fn verify_auth(
    request: &AuthRequest,
    now_millis: i64,
    max_skew: Duration,
) -> Result<UserId, String> {
    let skew = now_millis.abs_diff(request.timestamp);
    if u128::from(skew) > max_skew.as_millis() {
        return Err(format!("timestamp outside allowed window ({skew} ms)"));
    }

    let signed = serde_json::to_value(request).map_err(|e| e.to_string())?;
    KeyPair::verify_message(&request.public_key, &signed, &request.signature)
        .map_err(|e| e.to_string())?;

    let key: [u8; 32] = BASE64
        .decode(&request.public_key)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| "invalid public key".to_string())?;
    Ok(UserId::from_public_key(&key))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::SignalMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const SKEW: Duration = Duration::from_secs(60);

    #[test]
    fn test_verify_auth_accepts_fresh_signed_request() {
        let keypair = KeyPair::generate();
        let now = Utc::now().timestamp_millis();
        let request = AuthRequest::signed(&keypair, "alice".into(), now);

        let user_id = verify_auth(&request, now + 500, SKEW).unwrap();
        assert_eq!(user_id, UserId::from_public_key(&keypair.public_key_bytes()));
    }

    #[test]
    fn test_verify_auth_rejects_stale_timestamp() {
        let keypair = KeyPair::generate();
        let request = AuthRequest::signed(&keypair, "alice".into(), 0);
        assert!(verify_auth(&request, 120_000, SKEW).is_err());
    }

    #[test]
    fn test_verify_auth_rejects_swapped_display_name() {
        let keypair = KeyPair::generate();
        let mut request = AuthRequest::signed(&keypair, "alice".into(), 1_000);
        request.display_name = "admin".into();
        assert!(verify_auth(&request, 1_000, SKEW).is_err());
    }

    async fn start_relay() -> (SocketAddr, Arc<SignalingRelay>) {
        let config = RelayConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth_timeout: Duration::from_secs(2),
            ..RelayConfig::default()
        };
        let server = RelayServer::new(config);
        let relay = server.relay();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        (addr, relay)
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    async fn authenticated(addr: SocketAddr, keypair: &KeyPair) -> (Client, UserId) {
        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let request = AuthRequest::signed(keypair, "test".into(), Utc::now().timestamp_millis());
        client
            .send(Message::Text(serde_json::to_string(&request).unwrap()))
            .await
            .unwrap();

        match serde_json::from_str::<AuthResponse>(&next_text(&mut client).await).unwrap() {
            AuthResponse::AuthOk { user_id } => (client, user_id),
            other => panic!("auth failed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relays_between_authenticated_clients() {
        let (addr, relay) = start_relay().await;
        let (mut alice, alice_id) = authenticated(addr, &KeyPair::generate()).await;
        let (mut bob, bob_id) = authenticated(addr, &KeyPair::generate()).await;
        assert!(relay.is_online(&bob_id));

        let mut envelope = Envelope::new(bob_id.clone(), SignalMessage::Accept);
        envelope.sender_id = Some(UserId::new("forged"));
        alice
            .send(Message::Text(serde_json::to_string(&envelope).unwrap()))
            .await
            .unwrap();

        let received: Envelope = serde_json::from_str(&next_text(&mut bob).await).unwrap();
        assert_eq!(received.sender_id, Some(alice_id));
        assert_eq!(received.message, SignalMessage::Accept);
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let (addr, relay) = start_relay().await;
        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let mut request =
            AuthRequest::signed(&KeyPair::generate(), "x".into(), Utc::now().timestamp_millis());
        request.public_key = KeyPair::generate().public_key_base64();
        client
            .send(Message::Text(serde_json::to_string(&request).unwrap()))
            .await
            .unwrap();

        let response: AuthResponse = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert!(matches!(response, AuthResponse::AuthError { .. }));
        assert_eq!(relay.online_users(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (addr, relay) = start_relay().await;
        let (client, user_id) = authenticated(addr, &KeyPair::generate()).await;
        drop(client);

        for _ in 0..100 {
            if !relay.is_online(&user_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was not unregistered");
    }

    #[tokio::test]
    async fn test_accept_error_keeps_serving() {
        let server = RelayServer::new(RelayConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..RelayConfig::default()
        });
        let relay = server.relay();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let failures: Vec<std::io::Result<(TcpStream, SocketAddr)>> = vec![
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "aborted")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "too many open files")),
        ];
        let failures = futures::stream::iter(failures);
        let accepted = futures::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await;
            Some((accepted, listener))
        });
        tokio::spawn(server.serve_incoming(failures.chain(accepted)));

        let (_client, user_id) = authenticated(addr, &KeyPair::generate()).await;
        assert!(relay.is_online(&user_id));
    }
}
