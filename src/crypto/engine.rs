use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Invalid or tampered state parameter")]
    InvalidState,

    #[error("OAuth state expired")]
    StateExpired,
}

/// Payload carried through the marketplace authorization redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthState {
    pub tenant_id: String,
    pub issued_at: i64,
}

/// AES-256-GCM for tokens at rest, HMAC-SHA256 for the OAuth `state` parameter.
pub struct CryptoEngine {
    cipher: Aes256Gcm,
    hmac_key: Vec<u8>,
}

impl CryptoEngine {
    /// Create a new CryptoEngine from base64-encoded keys.
    pub fn new(master_key_b64: &str, hmac_secret_b64: &str) -> Result<Self, CryptoError> {
        let b64 = base64::engine::general_purpose::STANDARD;

        let master_key = b64
            .decode(master_key_b64)
            .map_err(|e| CryptoError::Key(format!("MASTER_KEY is not base64: {e}")))?;
        if master_key.len() != 32 {
            return Err(CryptoError::Key(format!(
                "MASTER_KEY must be 32 bytes, got {}",
                master_key.len()
            )));
        }

        let hmac_key = b64
            .decode(hmac_secret_b64)
            .map_err(|e| CryptoError::Key(format!("HMAC_SECRET is not base64: {e}")))?;
        if hmac_key.is_empty() {
            return Err(CryptoError::Key("HMAC_SECRET is empty".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&master_key)
            .map_err(|e| CryptoError::Key(format!("AES init failed: {e}")))?;

        Ok(Self { cipher, hmac_key })
    }

    /// Encrypt a token. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn decrypt(&self, encrypted_b64: &str) -> Result<String, CryptoError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .map_err(|e| CryptoError::Decrypt(format!("invalid base64: {e}")))?;

        if combined.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt("authentication tag mismatch".into()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    /// Sign an OAuth state. Returns url-safe base64(hmac || json).
    pub fn sign_state(&self, state: &OAuthState) -> Result<String, CryptoError> {
        let payload = serde_json::to_vec(state).map_err(|_| CryptoError::InvalidState)?;
        let mut mac = self.mac()?;
        mac.update(&payload);

        let mut combined = mac.finalize().into_bytes().to_vec();
        combined.extend_from_slice(&payload);
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&combined))
    }

    /// Verify signature and age of a state produced by [`sign_state`](Self::sign_state).
    pub fn verify_state(
        &self,
        signed: &str,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Result<OAuthState, CryptoError> {
        let combined = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(signed)
            .map_err(|_| CryptoError::InvalidState)?;
        if combined.len() <= MAC_LEN {
            return Err(CryptoError::InvalidState);
        }

        let (signature, payload) = combined.split_at(MAC_LEN);
        let mut mac = self.mac()?;
        mac.update(payload);
        mac.verify_slice(signature)
            .map_err(|_| CryptoError::InvalidState)?;

        let state: OAuthState =
            serde_json::from_slice(payload).map_err(|_| CryptoError::InvalidState)?;
        let age = now.timestamp() - state.issued_at;
        if age < 0 || age > max_age.num_seconds() {
            return Err(CryptoError::StateExpired);
        }
        Ok(state)
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .map_err(|e| CryptoError::Key(format!("HMAC init failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> CryptoEngine {
        let key = base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]);
        let hmac = base64::engine::general_purpose::STANDARD.encode([0x43u8; 32]);
        CryptoEngine::new(&key, &hmac).unwrap()
    }

    #[test]
    fn token_encrypt_decrypt_roundtrip() {
        let engine = test_engine();
        let token = "APP_USR-1234567890-101112-abcdef";
        let encrypted = engine.encrypt(token).unwrap();
        assert_ne!(encrypted, token);
        assert_eq!(engine.decrypt(&encrypted).unwrap(), token);
        // fresh nonce per call
        assert_ne!(engine.encrypt(token).unwrap(), encrypted);
    }

    #[test]
    fn rejects_short_master_key() {
        let key = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        let hmac = base64::engine::general_purpose::STANDARD.encode([2u8; 32]);
        assert!(matches!(
            CryptoEngine::new(&key, &hmac),
            Err(CryptoError::Key(_))
        ));
    }

    #[test]
    fn state_roundtrip_and_tamper_detection() {
        let engine = test_engine();
        let now = Utc::now();
        let state = OAuthState {
            tenant_id: "company-42".into(),
            issued_at: now.timestamp(),
        };
        let signed = engine.sign_state(&state).unwrap();
        let verified = engine
            .verify_state(&signed, now, chrono::Duration::minutes(10))
            .unwrap();
        assert_eq!(verified, state);

        let tampered = format!("{signed}A");
        assert!(engine
            .verify_state(&tampered, now, chrono::Duration::minutes(10))
            .is_err());
    }

    #[test]
    fn stale_state_is_rejected() {
        let engine = test_engine();
        let now = Utc::now();
        let state = OAuthState {
            tenant_id: "company-42".into(),
            issued_at: (now - chrono::Duration::minutes(11)).timestamp(),
        };
        let signed = engine.sign_state(&state).unwrap();
        assert!(matches!(
            engine.verify_state(&signed, now, chrono::Duration::minutes(10)),
            Err(CryptoError::StateExpired)
        ));
    }
}
