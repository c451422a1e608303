//! JSON metadata sidecars.
//!
//! A sidecar holds a flat string-to-string mapping. Updates to containers are
//! partial: an incoming empty value acts as a tombstone and removes the key.
//! A sidecar that cannot be read back is copied to `<file>.bak` before it is
//! overwritten, so a corrupted file is never lost.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::is_storage_full;

/// Key/value metadata of a container or object. Keys are kept sorted so that
/// sidecar files are written deterministically.
pub type Metadata = BTreeMap<String, String>;

pub const BACKUP_SUFFIX: &str = ".bak";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata file {0} not found")]
    NotFound(PathBuf),

    #[error("failed to parse metadata file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no space left on device while writing {path}: {source}")]
    StorageFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MetadataError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            MetadataError::NotFound(path.to_path_buf())
        } else if is_storage_full(&source) {
            MetadataError::StorageFull {
                path: path.to_path_buf(),
                source,
            }
        } else {
            MetadataError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }

    pub fn is_storage_full(&self) -> bool {
        matches!(self, MetadataError::StorageFull { .. })
    }
}

/// Reads and parses a sidecar file.
pub fn load(path: &Path) -> Result<Metadata, MetadataError> {
    let bytes = fs::read(path).map_err(|err| MetadataError::from_io(path, err))?;
    serde_json::from_slice(&bytes).map_err(|source| MetadataError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Serializes `metadata` as indented JSON and overwrites `path`.
pub fn store(path: &Path, metadata: &Metadata) -> Result<(), MetadataError> {
    let json = serde_json::to_vec_pretty(metadata)?;
    fs::write(path, json).map_err(|err| MetadataError::from_io(path, err))
}

/// Copies the current sidecar to `<path>.bak`, replacing an older backup.
pub fn backup(path: &Path) -> Result<PathBuf, MetadataError> {
    let mut backup_path = OsString::from(path.as_os_str());
    backup_path.push(BACKUP_SUFFIX);
    let backup_path = PathBuf::from(backup_path);

    fs::copy(path, &backup_path).map_err(|err| MetadataError::from_io(&backup_path, err))?;
    debug!("Backed up {} to {}", path.display(), backup_path.display());
    Ok(backup_path)
}

/// Applies `incoming` on top of `existing`. Non-empty values set their key,
/// empty values delete it, and keys missing from `incoming` are left alone.
pub fn merge(existing: &mut Metadata, incoming: &Metadata) {
    for (key, value) in incoming {
        if value.is_empty() {
            existing.remove(key);
        } else {
            existing.insert(key.clone(), value.clone());
        }
    }
}

/// Partial update used for containers. Returns the mapping that was written.
///
/// A missing sidecar is created from `incoming`. A sidecar that exists but
/// cannot be read or parsed is backed up and then replaced by `incoming`;
/// a failing backup is logged and does not stop the write.
pub fn upsert(path: &Path, incoming: &Metadata) -> Result<Metadata, MetadataError> {
    let updated = match load(path) {
        Ok(mut existing) => {
            merge(&mut existing, incoming);
            existing
        }
        Err(MetadataError::NotFound(_)) => {
            let mut fresh = Metadata::new();
            merge(&mut fresh, incoming);
            fresh
        }
        Err(err) => {
            warn!("Replacing unreadable metadata: {}", err);
            if let Err(backup_err) = backup(path) {
                warn!("Failed to backup old metadata: {}", backup_err);
            }
            incoming.clone()
        }
    };

    store(path, &updated)?;
    Ok(updated)
}

/// Wholesale replacement used for objects.
pub fn replace(path: &Path, incoming: &Metadata) -> Result<(), MetadataError> {
    store(path, incoming)
}
