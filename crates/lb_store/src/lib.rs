//! lb_store: versioned, transactional, encrypted local storage
//!
//! # Module layout
//! - `engine`     : containers, backends (memory / file) and the live registry
//! - `db`         : the `Store` handle: open, close and per-collection CRUD
//! - `transaction`: staged transactions, rows and counters
//! - `migration`  : schemas, collection diffing and upgrade transactions
//! - `kv`         : typed key/value facade over one collection
//! - `encrypted`  : encryption at rest over a facade or a collection
//! - `traced`     : tracing decorator for any `KvStore`
//! - `codec`      : value and byte encodings
//! - `config`     : JSON configuration
//! - `error`      : `StoreError` and `EngineError`
//!
//! Every operation takes a [`lb_core::Context`] and checks it before doing
//! any work.

pub mod codec;
pub mod config;
pub mod db;
pub mod encrypted;
pub mod engine;
pub mod error;
pub mod kv;
pub mod migration;
pub mod traced;
pub mod transaction;

pub use codec::{ByteCodec, Ciphertext, JsonCodec, SerdeCodec, ValueCodec, ZstdCodec};
pub use config::{BackendKind, StoreConfig};
pub use db::Store;
pub use encrypted::{EncryptedCollection, EncryptedKv};
pub use engine::{Backend, Engine, FileBackend, MemoryBackend, Snapshot};
pub use error::{EngineError, StoreError};
pub use kv::{CollectionKv, InMemoryKv, KvStore, SingleItemKv};
pub use migration::{diff_collections, CollectionDiff, Migration, Schema, UpgradeTransaction};
pub use traced::{TracedKv, TRACE_ID_KEY};
pub use transaction::{Row, Transaction, TxMode, TxState, TxStats};
