//! On-disk backend: one checksummed file per container.
//!
//! Layout of `<root>/<name>.lbdb`:
//!
//! ```text
//! [0..8)    magic "LBDB0001"
//! [8..40)   BLAKE3 digest of the body
//! [40..)    JSON body { written_at, snapshot }
//! ```
//!
//! Writes are staged under a random `.staging` name in the same directory and
//! renamed over the live file, so a crash leaves either the old or the new
//! container, never a torn one.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::{validate_name, Backend, Snapshot};
use crate::error::EngineError;

pub const CONTAINER_MAGIC: &[u8; 8] = b"LBDB0001";
const CHECKSUM_LEN: usize = 32;
const HEADER_LEN: usize = CONTAINER_MAGIC.len() + CHECKSUM_LEN;
const EXTENSION: &str = "lbdb";
const STAGING_SUFFIX: &str = ".staging";

#[derive(Serialize)]
struct BodyRef<'a> {
    written_at: DateTime<Utc>,
    snapshot: &'a Snapshot,
}

#[derive(Deserialize)]
struct Body {
    #[allow(dead_code)]
    written_at: DateTime<Utc>,
    snapshot: Snapshot,
}

pub struct FileBackend {
    root: PathBuf,
    fsync: bool,
    max_container_bytes: Option<u64>,
}

impl FileBackend {
    /// Create the root directory if needed and sweep staging files left by
    /// an interrupted write.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(EngineError::io(&root))?;
        restrict_dir_permissions(&root);
        cleanup_staging(&root);
        Ok(Self {
            root,
            fsync: true,
            max_container_bytes: None,
        })
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_quota(mut self, max_container_bytes: Option<u64>) -> Self {
        self.max_container_bytes = max_container_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{EXTENSION}"))
    }

    fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, EngineError> {
        let body = serde_json::to_vec(&BodyRef {
            written_at: Utc::now(),
            snapshot,
        })
        .map_err(|e| EngineError::Format(e.to_string()))?;
        let digest = blake3::hash(&body);

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(CONTAINER_MAGIC);
        buf.extend_from_slice(digest.as_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn decode(name: &str, buf: &[u8]) -> Result<Snapshot, EngineError> {
        let corrupt = |reason: String| EngineError::Corrupt {
            name: name.to_string(),
            reason,
        };
        if buf.len() < HEADER_LEN {
            return Err(corrupt(format!("file is only {} bytes", buf.len())));
        }
        let (magic, rest) = buf.split_at(CONTAINER_MAGIC.len());
        if magic != CONTAINER_MAGIC {
            return Err(corrupt("invalid magic".into()));
        }
        let (stored, body) = rest.split_at(CHECKSUM_LEN);
        let actual = blake3::hash(body);
        if actual.as_bytes().as_slice() != stored {
            return Err(corrupt(format!(
                "checksum mismatch: stored {} actual {}",
                hex::encode(&stored[..8]),
                hex::encode(&actual.as_bytes()[..8])
            )));
        }
        let body: Body =
            serde_json::from_slice(body).map_err(|e| corrupt(format!("bad body: {e}")))?;
        Ok(body.snapshot)
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), EngineError> {
        let staging = self
            .root
            .join(format!("{}{STAGING_SUFFIX}", Uuid::new_v4()));
        let written = (|| {
            let mut file = File::create(&staging)?;
            file.write_all(bytes)?;
            if self.fsync {
                file.sync_all()?;
            }
            Ok::<_, std::io::Error>(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(EngineError::io(&staging)(e));
        }
        if let Err(e) = fs::rename(&staging, dest) {
            let _ = fs::remove_file(&staging);
            return Err(EngineError::io(dest)(e));
        }
        if self.fsync {
            fsync_dir(&self.root).map_err(EngineError::io(&self.root))?;
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn load(&self, name: &str) -> Result<Option<Snapshot>, EngineError> {
        validate_name(name)?;
        let path = self.container_path(name);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::io(&path)(e)),
        };
        Self::decode(name, &buf).map(Some)
    }

    fn persist(&self, name: &str, snapshot: &Snapshot) -> Result<(), EngineError> {
        validate_name(name)?;
        let buf = Self::encode(snapshot)?;
        if let Some(limit) = self.max_container_bytes {
            let size = buf.len() as u64;
            if size > limit {
                return Err(EngineError::QuotaExceeded {
                    name: name.to_string(),
                    size,
                    limit,
                });
            }
        }
        let path = self.container_path(name);
        self.write_atomic(&path, &buf)?;
        debug!(container = name, bytes = buf.len(), "container persisted");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), EngineError> {
        validate_name(name)?;
        let path = self.container_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(&path)(e)),
        }
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
}

fn cleanup_staging(root: &Path) {
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned container staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let dir = fs::OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::CollectionData;
    use serde_json::json;
    use std::sync::Arc;

    fn sample() -> Snapshot {
        let mut items = CollectionData::new();
        items.insert("a".into(), json!({"title": "X"}));
        items.insert("b".into(), json!({"title": "Y"}));
        let mut snapshot = Snapshot {
            version: 3,
            ..Default::default()
        };
        snapshot.collections.insert("items".into(), Arc::new(items));
        snapshot
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        assert!(backend.load("notes").unwrap().is_none());

        backend.persist("notes", &sample()).unwrap();
        assert_eq!(backend.load("notes").unwrap(), Some(sample()));

        let raw = fs::read(backend.container_path("notes")).unwrap();
        assert_eq!(&raw[..8], CONTAINER_MAGIC);
    }

    #[test]
    fn flipped_byte_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap().with_fsync(false);
        backend.persist("notes", &sample()).unwrap();

        let path = backend.container_path("notes");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 2;
        raw[last] ^= 0x01;
        fs::write(&path, raw).unwrap();

        let err = backend.load("notes").unwrap_err();
        assert!(matches!(err, EngineError::Corrupt { ref reason, .. } if reason.starts_with("checksum mismatch")));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        fs::write(backend.container_path("notes"), b"LBDB").unwrap();
        assert!(matches!(
            backend.load("notes"),
            Err(EngineError::Corrupt { .. })
        ));
    }

    #[test]
    fn quota_rejects_write_and_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap().with_quota(Some(512));
        let small = Snapshot {
            version: 1,
            ..Default::default()
        };
        backend.persist("notes", &small).unwrap();

        let mut big = sample();
        let mut blob = CollectionData::new();
        blob.insert("huge".into(), json!("x".repeat(2048)));
        big.collections.insert("blobs".into(), Arc::new(blob));

        let err = backend.persist("notes", &big).unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded { limit: 512, .. }));
        assert_eq!(backend.load("notes").unwrap(), Some(small));
    }

    #[test]
    fn orphaned_staging_files_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join(format!("{}{STAGING_SUFFIX}", Uuid::new_v4()));
        fs::write(&orphan, b"partial").unwrap();
        let _backend = FileBackend::new(dir.path()).unwrap();
        assert!(!orphan.exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        backend.persist("notes", &sample()).unwrap();
        backend.remove("notes").unwrap();
        backend.remove("notes").unwrap();
        assert!(backend.load("notes").unwrap().is_none());
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).unwrap();
        assert!(matches!(
            backend.persist("../outside", &sample()),
            Err(EngineError::InvalidName(_))
        ));
    }
}
