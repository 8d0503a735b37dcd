//! Ed25519 Key Pair Management
//!
//! Generiert, speichert und lädt Ed25519 Schlüsselpaare und prüft
//! Signaturen auf der Relay-Seite.
//!
//! ## Verwendung
//! ```no_run
//! use pulse_calls::crypto::KeyPair;
//!
//! let keypair = KeyPair::load_or_create(None)?;
//! let signature = keypair.sign_base64(b"Hello, World!");
//! let public_key_base64 = keypair.public_key_base64();
//! # Ok::<(), pulse_calls::crypto::KeyPairError>(())
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Failed to access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode key material: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid signature length: expected 64, got {0}")]
    InvalidSignatureLength(usize),

    #[error("Invalid public key")]
    InvalidKey,

    #[error("Signature verification failed")]
    BadSignature,
}

// ============================================================================
// KEYPAIR STRUCT
// ============================================================================

/// Ed25519 Schlüsselpaar für die Anmeldung am Signaling-Relay
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt ein existierendes Schlüsselpaar oder erstellt ein neues
    ///
    /// Ohne expliziten Pfad liegt der Key im App-Datenverzeichnis:
    /// - Windows: `%APPDATA%/pulse/calls/data/keys/private.key`
    /// - macOS: `~/Library/Application Support/com.pulse.calls/keys/private.key`
    /// - Linux: `~/.local/share/calls/keys/private.key`
    pub fn load_or_create(path: Option<&Path>) -> Result<Self, KeyPairError> {
        let key_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_key_path()?,
        };

        if key_path.exists() {
            tracing::info!("Loading existing keypair from {:?}", key_path);
            Self::load_from_file(&key_path)
        } else {
            tracing::info!("Creating new keypair at {:?}", key_path);
            let keypair = Self::generate();
            keypair.save_to_file(&key_path)?;
            Ok(keypair)
        }
    }

    /// Generiert ein neues zufälliges Schlüsselpaar
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self { signing_key }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let key_bytes = decode_fixed::<32>(encoded.trim(), KeyPairError::InvalidKeyLength)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let encoded = BASE64.encode(self.signing_key.to_bytes());
        fs::write(path, encoded)?;

        // Nur Owner darf lesen/schreiben
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    fn default_key_path() -> Result<PathBuf, KeyPairError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "calls").ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine app data directory",
            )
        })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("keys");
        path.push("private.key");
        Ok(path)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Signiert Daten und gibt die Signatur als Base64 zurück
    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message).to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signiert ein JSON-Objekt für den Signaling-Relay
    ///
    /// Die Signatur wird über den JSON-String aller Felder (außer `signature`)
    /// in alphabetischer Sortierung berechnet.
    pub fn sign_message(&self, payload: &serde_json::Value) -> String {
        self.sign_base64(canonical_json(payload).as_bytes())
    }

    /// Prüft eine mit [`KeyPair::sign_message`] erzeugte Signatur
    pub fn verify_message(
        public_key_base64: &str,
        payload: &serde_json::Value,
        signature_base64: &str,
    ) -> Result<(), KeyPairError> {
        let key_bytes = decode_fixed::<32>(public_key_base64, KeyPairError::InvalidKeyLength)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| KeyPairError::InvalidKey)?;

        let sig_bytes =
            decode_fixed::<64>(signature_base64, KeyPairError::InvalidSignatureLength)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(canonical_json(payload).as_bytes(), &signature)
            .map_err(|_| KeyPairError::BadSignature)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

fn decode_fixed<const N: usize>(
    encoded: &str,
    wrong_len: fn(usize) -> KeyPairError,
) -> Result<[u8; N], KeyPairError> {
    let bytes = BASE64.decode(encoded)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| wrong_len(len))
}

/// Alphabetisch sortiertes JSON ohne `signature`-Feld
fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(&sort_json_object(value)).unwrap_or_default()
}

fn sort_json_object(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted_map = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for key in keys {
                if key != "signature" {
                    if let Some(v) = map.get(key) {
                        sorted_map.insert(key.clone(), sort_json_object(v));
                    }
                }
            }
            serde_json::Value::Object(sorted_map)
        }
        other => other.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let keypair = KeyPair::generate();
        // 32 bytes = 44 Zeichen Base64
        assert_eq!(keypair.public_key_base64().len(), 44);
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"Hello, World!";

        let signature = keypair.sign(message);
        assert!(keypair.verifying_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn test_sign_base64() {
        let keypair = KeyPair::generate();
        // 64 bytes = 88 Zeichen Base64
        assert_eq!(keypair.sign_base64(b"Test message").len(), 88);
    }

    #[test]
    fn test_verify_json_message_ignores_key_order_and_signature_field() {
        let keypair = KeyPair::generate();

        let payload = serde_json::json!({
            "type": "auth",
            "displayName": "alice",
            "publicKey": keypair.public_key_base64(),
            "timestamp": 1234567890
        });
        let signature = keypair.sign_message(&payload);

        let mut received = serde_json::json!({
            "timestamp": 1234567890,
            "publicKey": keypair.public_key_base64(),
            "displayName": "alice",
            "type": "auth"
        });
        received["signature"] = serde_json::Value::String(signature.clone());

        KeyPair::verify_message(&keypair.public_key_base64(), &received, &signature)
            .expect("signature should verify");
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let keypair = KeyPair::generate();
        let payload = serde_json::json!({ "displayName": "alice", "timestamp": 1 });
        let signature = keypair.sign_message(&payload);

        let tampered = serde_json::json!({ "displayName": "mallory", "timestamp": 1 });
        let result = KeyPair::verify_message(&keypair.public_key_base64(), &tampered, &signature);
        assert!(matches!(result, Err(KeyPairError::BadSignature)));
    }

    #[test]
    fn test_verify_rejects_foreign_key() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let payload = serde_json::json!({ "displayName": "alice" });
        let signature = mallory.sign_message(&payload);

        assert!(KeyPair::verify_message(&alice.public_key_base64(), &payload, &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_short_key() {
        let payload = serde_json::json!({});
        let result = KeyPair::verify_message(&BASE64.encode([1u8; 16]), &payload, "");
        assert!(matches!(result, Err(KeyPairError::InvalidKeyLength(16))));
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("private.key");

        let first = KeyPair::load_or_create(Some(&path)).expect("create");
        assert!(path.exists());
        let second = KeyPair::load_or_create(Some(&path)).expect("load");

        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("private.key");
        KeyPair::load_or_create(Some(&path)).expect("create");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_key_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("private.key");
        fs::write(&path, BASE64.encode([7u8; 10])).expect("write");

        let result = KeyPair::load_or_create(Some(&path));
        assert!(matches!(result, Err(KeyPairError::InvalidKeyLength(10))));
    }
}
