//! Value encodings.
//!
//! [`ValueCodec`] maps a domain value to the structured JSON form the store
//! holds. [`ByteCodec`] maps it to raw bytes, which is what the encryption
//! layer seals.

use std::fmt;
use std::marker::PhantomData;

use base64::Engine as _;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::StoreError;

pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Value, StoreError>;

    fn decode(&self, raw: Value) -> Result<V, StoreError>;
}

/// Generic structured encoding through serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeCodec;

impl<V> ValueCodec<V> for SerdeCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(value)?)
    }

    fn decode(&self, raw: Value) -> Result<V, StoreError> {
        Ok(serde_json::from_value(raw)?)
    }
}

pub trait ByteCodec<V>: Send + Sync {
    fn to_bytes(&self, value: &V) -> Result<Vec<u8>, StoreError>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<V, StoreError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V> ByteCodec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned,
{
    fn to_bytes(&self, value: &V) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<V, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

const FLAG_RAW: u8 = 0;
const FLAG_ZSTD: u8 = 1;
const DEFAULT_THRESHOLD: usize = 4 * 1024; // 4 KiB
const DEFAULT_LEVEL: i32 = 3;

/// Compresses the output of another byte codec with zstd once it grows past
/// a threshold. The first byte records which form follows.
#[derive(Debug, Clone)]
pub struct ZstdCodec<C = JsonCodec> {
    inner: C,
    threshold: usize,
    level: i32,
}

impl<C> ZstdCodec<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            threshold: DEFAULT_THRESHOLD,
            level: DEFAULT_LEVEL,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }
}

impl Default for ZstdCodec<JsonCodec> {
    fn default() -> Self {
        Self::new(JsonCodec)
    }
}

impl<V, C> ByteCodec<V> for ZstdCodec<C>
where
    C: ByteCodec<V>,
{
    fn to_bytes(&self, value: &V) -> Result<Vec<u8>, StoreError> {
        let plain = self.inner.to_bytes(value)?;
        let mut out = Vec::with_capacity(plain.len() + 1);
        if plain.len() > self.threshold {
            let packed = zstd::encode_all(&plain[..], self.level)
                .map_err(|e| StoreError::Codec(format!("zstd compress: {e}")))?;
            out.push(FLAG_ZSTD);
            out.extend_from_slice(&packed);
        } else {
            out.push(FLAG_RAW);
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<V, StoreError> {
        match bytes.split_first() {
            Some((&FLAG_RAW, rest)) => self.inner.from_bytes(rest),
            Some((&FLAG_ZSTD, rest)) => {
                let plain = zstd::decode_all(rest)
                    .map_err(|e| StoreError::Codec(format!("zstd decompress: {e}")))?;
                self.inner.from_bytes(&plain)
            }
            Some((flag, _)) => Err(StoreError::Codec(format!("unknown payload flag {flag:#04x}"))),
            None => Err(StoreError::Codec("empty payload".into())),
        }
    }
}

// ── Ciphertext ───────────────────────────────────────────────────────────────

/// Sealed value bytes. Stored as a base64 string so containers stay plain
/// JSON.
#[derive(Clone, PartialEq, Eq)]
pub struct Ciphertext(pub Vec<u8>);

impl Ciphertext {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ciphertext({} bytes)", self.0.len())
    }
}

impl Serialize for Ciphertext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Ciphertext {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct B64Visitor(PhantomData<Ciphertext>);

        impl<'de> Visitor<'de> for B64Visitor {
            type Value = Ciphertext;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a base64 string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Ciphertext, E> {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(Ciphertext)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_str(B64Visitor(PhantomData))
    }
}
