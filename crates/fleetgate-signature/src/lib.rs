//! Digital signature service
//!
//! The control plane proves its identity to agents with an Ed25519 keypair
//! instead of a shared PKI: every forwarded request carries a signature over
//! a fixed message plus the encoded public key, and agents verify the pair
//! against the key they received at enrollment before trusting the embedded
//! target header.
//!
//! The keypair is created or loaded once at process start and is immutable
//! afterwards.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Signature service errors.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key file does not contain a valid Ed25519 seed")]
    InvalidKey,

    #[error("invalid base64 encoding")]
    InvalidEncoding,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// Process-wide signing identity of the control plane.
pub struct SignatureService {
    signing_key: SigningKey,
    encoded_public_key: String,
}

impl SignatureService {
    /// Create a service with a freshly generated keypair (not persisted).
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Create a service from a raw 32-byte seed.
    pub fn from_seed(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Load the seed from `path`, generating and persisting a new one if the
    /// file does not exist. The advertised public key is therefore stable
    /// across restarts.
    pub fn load_or_generate(path: &Path) -> Result<Self, SignatureError> {
        if path.exists() {
            let raw = fs::read(path)?;
            let seed: [u8; SECRET_KEY_LENGTH] =
                raw.as_slice().try_into().map_err(|_| SignatureError::InvalidKey)?;
            tracing::debug!(path = %path.display(), "loaded signing key");
            return Ok(Self::from_seed(seed));
        }

        let service = Self::generate();
        fs::write(path, service.signing_key.to_bytes())?;
        tracing::info!(path = %path.display(), "generated new signing key");
        Ok(service)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let encoded_public_key = BASE64.encode(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            encoded_public_key,
        }
    }

    /// Sign `message` and return the base64 signature.
    pub fn create_signature(&self, message: &str) -> String {
        let signature = self.signing_key.sign(message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    /// The base64 public key advertised to agents at enrollment.
    pub fn encoded_public_key(&self) -> &str {
        &self.encoded_public_key
    }
}

/// Verify a base64 signature against a base64 public key.
///
/// This is the check agents run on every forwarded request; it lives here so
/// tests and enrollment tooling share one implementation.
pub fn verify_signature(
    encoded_public_key: &str,
    message: &str,
    encoded_signature: &str,
) -> Result<(), SignatureError> {
    let key_bytes = BASE64
        .decode(encoded_public_key)
        .map_err(|_| SignatureError::InvalidEncoding)?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::InvalidKey)?;

    let sig_bytes = BASE64
        .decode(encoded_signature)
        .map_err(|_| SignatureError::InvalidEncoding)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| SignatureError::InvalidEncoding)?;

    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_round_trip() {
        let service = SignatureService::generate();
        let signature = service.create_signature("fleetgate-control-plane");

        verify_signature(
            service.encoded_public_key(),
            "fleetgate-control-plane",
            &signature,
        )
        .unwrap();
    }

    #[test]
    fn test_tampered_message_is_rejected() {
        let service = SignatureService::generate();
        let signature = service.create_signature("fleetgate-control-plane");

        let result = verify_signature(service.encoded_public_key(), "something-else", &signature);
        assert!(matches!(result, Err(SignatureError::VerificationFailed)));
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let service = SignatureService::generate();
        let impostor = SignatureService::generate();
        let signature = impostor.create_signature("fleetgate-control-plane");

        let result = verify_signature(
            service.encoded_public_key(),
            "fleetgate-control-plane",
            &signature,
        );
        assert!(matches!(result, Err(SignatureError::VerificationFailed)));
    }

    #[test]
    fn test_signature_is_fresh_per_call_but_stable_key() {
        let service = SignatureService::from_seed([7u8; 32]);
        let first = service.create_signature("msg");
        let second = service.create_signature("msg");

        // Ed25519 is deterministic, so the same message signs identically;
        // what matters is both validate against the same key.
        assert_eq!(first, second);
        verify_signature(service.encoded_public_key(), "msg", &first).unwrap();
    }

    #[test]
    fn test_load_or_generate_persists_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.key");

        let first = SignatureService::load_or_generate(&path).unwrap();
        let second = SignatureService::load_or_generate(&path).unwrap();

        assert_eq!(first.encoded_public_key(), second.encoded_public_key());
    }

    #[test]
    fn test_load_rejects_short_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgate.key");
        std::fs::write(&path, b"short").unwrap();

        let result = SignatureService::load_or_generate(&path);
        assert!(matches!(result, Err(SignatureError::InvalidKey)));
    }
}
