//! lb_crypto: value encryption for the Lockbox store
//!
//! # Module layout
//! - `cipher`: the `Crypto` capability trait and the XChaCha20 implementation
//! - `aead`  : XChaCha20-Poly1305 seal/open of value bytes
//! - `kdf`   : Argon2id key derivation
//! - `error` : unified error type

pub mod aead;
pub mod cipher;
pub mod error;
pub mod kdf;

pub use cipher::{Crypto, XChaChaCrypto};
pub use error::CryptoError;
pub use kdf::{generate_salt, KdfParams};
