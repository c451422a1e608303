//! Media storage service filesystem backend
//!
//! Containers are directories directly below the storage root and objects are
//! files directly below their container. Every container or object may own a
//! JSON metadata sidecar that lives next to it inside the container directory.

pub mod layout;
pub mod metadata;

pub use layout::{sanitize, LayoutError, Resource, StorageLayout, CAPABILITIES_TARGET};
pub use metadata::{
    backup, load, merge, replace, store, upsert, Metadata, MetadataError, BACKUP_SUFFIX,
};

use std::io;

/// Returns true when an I/O error was caused by the disk running out of space.
pub fn is_storage_full(err: &io::Error) -> bool {
    match err.raw_os_error() {
        #[cfg(unix)]
        Some(code) => code == libc::ENOSPC,
        // ERROR_HANDLE_DISK_FULL and ERROR_DISK_FULL
        #[cfg(windows)]
        Some(code) => code == 39 || code == 112,
        #[cfg(not(any(unix, windows)))]
        Some(_) => false,
        None => false,
    }
}
