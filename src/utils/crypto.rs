// Token encryption utilities
// AES-256-GCM with a PBKDF2-derived process-wide key

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::OnceCell;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;

// Fixed derivation salt: the key must be reproducible across process
// restarts so existing sessions stay decryptable. Uniqueness comes from the
// configured master key.
const DERIVATION_SALT: &[u8] = b"ntx-auth-core/token-cipher/v1";

static PROCESS_CIPHER: OnceCell<Arc<TokenCipher>> = OnceCell::new();

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Invalid ciphertext format")]
    InvalidCiphertext,
}

/// AES-256-GCM cipher over a PBKDF2-HMAC-SHA256 derived key.
///
/// The key lives in memory only and is never logged or serialized.
pub struct TokenCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").field("key", &"<redacted>").finish()
    }
}

impl TokenCipher {
    /// Derive a cipher from the configured master key.
    pub fn derive(master_key: &str, iterations: u32) -> Result<Self, CryptoError> {
        if master_key.len() < 32 {
            return Err(CryptoError::KeyDerivation(
                "master key must be at least 32 bytes".into(),
            ));
        }
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| CryptoError::KeyDerivation("iterations must be non-zero".into()))?;

        let mut key_bytes = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            DERIVATION_SALT,
            master_key.as_bytes(),
            &mut key_bytes,
        );

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| CryptoError::KeyDerivation("invalid key material".into()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Process-wide cipher, derived exactly once.
    ///
    /// Subsequent calls return the existing instance regardless of arguments,
    /// matching the once-init contract for the session encryption key.
    pub fn process(master_key: &str, iterations: u32) -> Result<Arc<Self>, CryptoError> {
        if let Some(cipher) = PROCESS_CIPHER.get() {
            return Ok(cipher.clone());
        }
        let cipher = Arc::new(Self::derive(master_key, iterations)?);
        Ok(PROCESS_CIPHER.get_or_init(|| cipher).clone())
    }

    /// Encrypt a token string. Output is base64(nonce || ciphertext+tag).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + in_out.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&in_out);

        Ok(BASE64.encode(payload))
    }

    /// Decrypt a value produced by `encrypt`.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let payload = BASE64
            .decode(ciphertext)
            .map_err(|_| CryptoError::InvalidCiphertext)?;

        if payload.len() <= NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }

        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::InvalidCiphertext)?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Decrypt)
    }
}

/// Hex-encoded SHA-256 digest of a string.
///
/// Used for token mirror keys, cache key hashing, and API-key decision keys.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
