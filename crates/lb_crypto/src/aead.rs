//! XChaCha20-Poly1305 sealing of value bytes.
//!
//! Sealed layout: `nonce (24) | ciphertext | tag (16)`. The nonce is random
//! per call, so sealing the same plaintext twice never repeats output.

use chacha20poly1305::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::KEY_LEN;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Bytes added to every plaintext by [`seal`].
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

fn cipher(key: &[u8; KEY_LEN]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key))
}

/// Encrypt `plaintext` in place behind a fresh nonce. `aad` is bound to the
/// result but not stored in it.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut sealed = Vec::with_capacity(plaintext.len() + OVERHEAD);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(plaintext);

    let tag = cipher(key)
        .encrypt_in_place_detached(&nonce, aad, &mut sealed[NONCE_LEN..])
        .map_err(|_| CryptoError::AeadEncrypt)?;
    sealed.extend_from_slice(&tag);
    Ok(sealed)
}

/// Reverse of [`seal`]. Fails on truncation, tampering, the wrong key or
/// different `aad`.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < OVERHEAD {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce, rest) = sealed.split_at(NONCE_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

    let mut plain = Zeroizing::new(body.to_vec());
    cipher(key)
        .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut plain[..], Tag::from_slice(tag))
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(plain)
}
