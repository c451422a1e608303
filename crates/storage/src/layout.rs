//! Mapping between request targets and paths below the storage root.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// The only target clients are allowed to read back.
pub const CAPABILITIES_TARGET: &str = "System/Capabilities.json";

const METADATA_SUFFIX: &str = ".metadata.json";
const COMPLETE_MARKER: &str = "complete";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("empty target")]
    Empty,

    #[error("subdirectories aren't supported: {0}")]
    TooDeep(String),

    #[error("invalid path segment in {0}")]
    InvalidSegment(String),
}

/// A container or an object addressed by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Container { name: String },
    Object { container: String, name: String },
}

impl Resource {
    pub fn container(&self) -> &str {
        match self {
            Resource::Container { name } => name,
            Resource::Object { container, .. } => container,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Resource::Container { .. })
    }

    /// Path relative to the storage root.
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Resource::Container { name } => PathBuf::from(name),
            Resource::Object { container, name } => Path::new(container).join(name),
        }
    }
}

/// Windows doesn't accept ":" in file names, so it is replaced everywhere.
pub fn sanitize(target: &str) -> String {
    target.replace(':', "_")
}

/// Filesystem layout rooted at the configured storage location.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an already percent-decoded target such as `rec/clip.mkv`.
    pub fn resolve(&self, target: &str) -> Result<Resource, LayoutError> {
        let target = sanitize(target);
        if target.is_empty() {
            return Err(LayoutError::Empty);
        }

        let segments: Vec<&str> = target.split('/').collect();
        if segments.len() > 2 {
            return Err(LayoutError::TooDeep(target));
        }
        if segments
            .iter()
            .any(|segment| segment.is_empty() || *segment == "." || *segment == ".." || segment.contains('\\'))
        {
            return Err(LayoutError::InvalidSegment(target));
        }

        let resource = match segments.as_slice() {
            [container] => Resource::Container {
                name: (*container).to_string(),
            },
            [container, object] => Resource::Object {
                container: (*container).to_string(),
                name: (*object).to_string(),
            },
            _ => return Err(LayoutError::Empty),
        };
        Ok(resource)
    }

    pub fn path_of(&self, resource: &Resource) -> PathBuf {
        self.root.join(resource.relative_path())
    }

    pub fn container_dir(&self, resource: &Resource) -> PathBuf {
        self.root.join(resource.container())
    }

    /// `<container>/<container>.metadata.json` or
    /// `<container>/<container>.<object>.metadata.json`.
    pub fn metadata_path(&self, resource: &Resource) -> PathBuf {
        let file_name = match resource {
            Resource::Container { name } => format!("{name}{METADATA_SUFFIX}"),
            Resource::Object { container, name } => {
                format!("{container}.{name}{METADATA_SUFFIX}")
            }
        };
        self.container_dir(resource).join(file_name)
    }

    pub fn complete_marker_path(&self, resource: &Resource) -> PathBuf {
        self.container_dir(resource).join(COMPLETE_MARKER)
    }

    pub fn capabilities_path(&self) -> PathBuf {
        self.root.join(CAPABILITIES_TARGET)
    }
}
