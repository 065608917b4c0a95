//! AES-256-GCM encryption for secret values at rest.
//!
//! Stored form: `enc:v1:<nonce_b64>:<ciphertext_b64>`. Each encryption uses
//! a fresh random 96-bit nonce, so the same plaintext never encrypts to the
//! same stored value. Values without the `enc:` prefix pass through
//! `decrypt` unchanged; rows predating encryption keep working.
//!
//! SECURITY: error values never contain key or plaintext material.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use runloom_types::error::SecretError;
use secrecy::{ExposeSecret, SecretString};

use runloom_core::repository::secret::SecretCipher;

/// Prefix marking any encrypted value.
const ENC_PREFIX: &str = "enc:";
/// Prefix for the current wire version.
const ENC_V1_PREFIX: &str = "enc:v1:";
/// Nonce size for AES-256-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// AES-256-GCM cipher over the worker's configured secret key.
pub struct AesGcmSecretCipher {
    cipher: Aes256Gcm,
}

impl AesGcmSecretCipher {
    /// Build a cipher from the configured key: 64-char hex or base64, either
    /// way decoding to exactly 32 bytes.
    pub fn new(key: &SecretString) -> Result<Self, SecretError> {
        let key_bytes = decode_key(key.expose_secret())?;
        Ok(Self {
            cipher: Aes256Gcm::new((&key_bytes).into()),
        })
    }

    /// Build a cipher from an optional configured key, failing only when a
    /// key is present but malformed.
    pub fn from_key(key: Option<&SecretString>) -> Result<Option<Self>, SecretError> {
        key.map(AesGcmSecretCipher::new).transpose()
    }
}

impl SecretCipher for AesGcmSecretCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;
        Ok(format!(
            "{ENC_V1_PREFIX}{}:{}",
            B64.encode(nonce),
            B64.encode(&ciphertext)
        ))
    }

    fn decrypt(&self, value: &str) -> Result<String, SecretError> {
        // Plaintext rows predate encryption; pass them through.
        if !value.starts_with(ENC_PREFIX) {
            return Ok(value.to_string());
        }
        let Some(rest) = value.strip_prefix(ENC_V1_PREFIX) else {
            return Err(SecretError::Decrypt);
        };
        let Some((nonce_b64, ciphertext_b64)) = rest.split_once(':') else {
            return Err(SecretError::Decrypt);
        };

        let nonce_bytes = B64.decode(nonce_b64).map_err(|_| SecretError::Decrypt)?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(SecretError::Decrypt);
        }
        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|_| SecretError::Decrypt)?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Decrypt)
    }
}

/// Decode a configured key: 64-char hex first, base64 otherwise. Anything
/// that is not exactly 32 bytes is rejected.
fn decode_key(key: &str) -> Result<[u8; 32], SecretError> {
    let bytes = if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        hex_decode(key).ok_or(SecretError::InvalidKey)?
    } else {
        B64.decode(key).map_err(|_| SecretError::InvalidKey)?
    };

    let mut out = [0u8; 32];
    if bytes.len() != out.len() {
        return Err(SecretError::InvalidKey);
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_key() -> SecretString {
        SecretString::from(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string(),
        )
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = AesGcmSecretCipher::new(&hex_key()).unwrap();
        let stored = cipher.encrypt("whsec_abc123").unwrap();
        assert!(stored.starts_with("enc:v1:"));
        assert_eq!(cipher.decrypt(&stored).unwrap(), "whsec_abc123");
    }

    #[test]
    fn test_random_nonce_produces_different_stored_values() {
        let cipher = AesGcmSecretCipher::new(&hex_key()).unwrap();
        let a = cipher.encrypt("same secret").unwrap();
        let b = cipher.encrypt("same secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn test_plaintext_passthrough() {
        let cipher = AesGcmSecretCipher::new(&hex_key()).unwrap();
        assert_eq!(
            cipher.decrypt("https://hooks.test/legacy").unwrap(),
            "https://hooks.test/legacy"
        );
    }

    #[test]
    fn test_base64_key_accepted() {
        // 32 bytes of zeros, base64-encoded.
        let key = SecretString::from(B64.encode([0u8; 32]));
        let cipher = AesGcmSecretCipher::new(&key).unwrap();
        let stored = cipher.encrypt("x").unwrap();
        assert_eq!(cipher.decrypt(&stored).unwrap(), "x");
    }

    #[test]
    fn test_invalid_key_rejected() {
        let short = SecretString::from("deadbeef".to_string());
        assert!(matches!(
            AesGcmSecretCipher::new(&short),
            Err(SecretError::InvalidKey)
        ));

        let not_decodable = SecretString::from("!!!not-a-key!!!".to_string());
        assert!(matches!(
            AesGcmSecretCipher::new(&not_decodable),
            Err(SecretError::InvalidKey)
        ));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let cipher = AesGcmSecretCipher::new(&hex_key()).unwrap();
        let other = AesGcmSecretCipher::new(&SecretString::from(B64.encode([7u8; 32]))).unwrap();

        let stored = cipher.encrypt("secret data").unwrap();
        assert!(matches!(other.decrypt(&stored), Err(SecretError::Decrypt)));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = AesGcmSecretCipher::new(&hex_key()).unwrap();
        let stored = cipher.encrypt("secret data").unwrap();

        let mut tampered = stored.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert!(cipher.decrypt(&tampered).is_err());

        assert!(matches!(
            cipher.decrypt("enc:v2:unknown:format"),
            Err(SecretError::Decrypt)
        ));
        assert!(matches!(
            cipher.decrypt("enc:v1:missing-parts"),
            Err(SecretError::Decrypt)
        ));
    }
}
