use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("crypto used before init: call init with a secret first")]
    NotInitialised,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed: authentication tag mismatch")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}
