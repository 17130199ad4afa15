//! The encryption capability consumed by the storage layer.
//!
//! The store never picks an algorithm; it only sequences calls to a
//! [`Crypto`] implementation. [`XChaChaCrypto`] is the bundled one: the value
//! key is derived from a caller secret with Argon2id and held in memory only
//! while the capability is initialised.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::ZeroizeOnDrop;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf::{derive_key, KdfParams, KEY_LEN};

#[async_trait]
pub trait Crypto: Send + Sync {
    /// Prepare the capability for use. Must be called before any
    /// encrypt/decrypt.
    async fn init(&self, secret: &[u8]) -> Result<(), CryptoError>;

    async fn encrypt_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    async fn decrypt_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    async fn is_initialised(&self) -> bool;
}

/// Associated data bound into every value ciphertext.
const VALUE_AAD: &[u8] = b"lb-store-v1";

#[derive(ZeroizeOnDrop)]
struct KeySlot {
    key: [u8; KEY_LEN],
}

/// XChaCha20-Poly1305 over an Argon2id-derived key. Clone to share; clones
/// see the same key slot.
#[derive(Clone)]
pub struct XChaChaCrypto {
    salt: Vec<u8>,
    params: KdfParams,
    slot: Arc<RwLock<Option<KeySlot>>>,
}

impl XChaChaCrypto {
    /// `salt` is not secret and must be the same every time the same data is
    /// opened.
    pub fn new(salt: impl Into<Vec<u8>>, params: KdfParams) -> Self {
        Self {
            salt: salt.into(),
            params,
            slot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Initialise with an existing key (e.g. from a platform keystore),
    /// skipping key derivation.
    pub async fn init_with_key(&self, key: [u8; KEY_LEN]) {
        *self.slot.write().await = Some(KeySlot { key });
    }

    /// Like [`init_with_key`](Self::init_with_key) for key bytes of
    /// unchecked length, as returned by most keystores.
    pub async fn init_with_key_bytes(&self, key: &[u8]) -> Result<(), CryptoError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", key.len()))
        })?;
        self.init_with_key(key).await;
        Ok(())
    }

    /// Drop the key; further encrypt/decrypt calls fail until re-initialised.
    pub async fn lock(&self) {
        *self.slot.write().await = None;
    }

    async fn with_key<F, R>(&self, f: F) -> Result<R, CryptoError>
    where
        F: FnOnce(&[u8; KEY_LEN]) -> Result<R, CryptoError>,
    {
        let guard = self.slot.read().await;
        match guard.as_ref() {
            Some(slot) => f(&slot.key),
            None => Err(CryptoError::NotInitialised),
        }
    }
}

#[async_trait]
impl Crypto for XChaChaCrypto {
    async fn init(&self, secret: &[u8]) -> Result<(), CryptoError> {
        let secret = zeroize::Zeroizing::new(secret.to_vec());
        let salt = self.salt.clone();
        let params = self.params;
        let derived = tokio::task::spawn_blocking(move || derive_key(&secret, &salt, &params))
            .await
            .map_err(|e| CryptoError::KeyDerivation(format!("kdf task failed: {e}")))??;
        *self.slot.write().await = Some(KeySlot { key: derived.0 });
        debug!("value key initialised");
        Ok(())
    }

    async fn encrypt_data(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.with_key(|key| aead::seal(key, plaintext, VALUE_AAD))
            .await
    }

    async fn decrypt_data(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.with_key(|key| aead::open(key, ciphertext, VALUE_AAD).map(|pt| pt.to_vec()))
            .await
    }

    async fn is_initialised(&self) -> bool {
        self.slot.read().await.is_some()
    }
}
