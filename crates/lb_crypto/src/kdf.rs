//! Key derivation
//!
//! `derive_key`: Argon2id, turns the caller's secret into the 32-byte key
//! used to encrypt stored values.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// 32-byte value key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct ValueKey(pub [u8; KEY_LEN]);

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// Tuned for interactive (desktop) use.
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    fn to_argon2(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))
    }
}

/// Derive a value key from a secret + salt.
/// The salt is stored alongside the data (not secret).
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<ValueKey, CryptoError> {
    if salt.len() < 8 {
        return Err(CryptoError::KeyDerivation("salt too short".into()));
    }
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut output = [0u8; KEY_LEN];
    argon2
        .hash_password_into(secret, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(ValueKey(output))
}

/// Generate a fresh random salt (call once when the store is created; persist it).
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEAP: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn same_inputs_same_key() {
        let salt = [3u8; SALT_LEN];
        let a = derive_key(b"hunter2", &salt, &CHEAP).unwrap();
        let b = derive_key(b"hunter2", &salt, &CHEAP).unwrap();
        assert_eq!(a.0, b.0);
        let c = derive_key(b"hunter3", &salt, &CHEAP).unwrap();
        assert_ne!(a.0, c.0);
    }

    #[test]
    fn short_salt_rejected() {
        assert!(matches!(
            derive_key(b"pw", b"abc", &CHEAP),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let p: KdfParams = serde_json::from_str(r#"{"iterations": 5}"#).unwrap();
        assert_eq!(p.iterations, 5);
        assert_eq!(p.memory_kib, KdfParams::default().memory_kib);
    }

    #[test]
    fn salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
