// Error Types
//
// Every public operation returns ExtensionResult. Filesystem plumbing uses
// anyhow internally and surfaces here as `Other`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while installing, resolving or running extensions.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Invalid extension name '{0}'")]
    InvalidName(String),

    #[error("Invalid version '{version}' requested for '{name}'")]
    InvalidVersion { name: String, version: String },

    #[error("Invalid extension at {}: manifest (package.json) is missing", .0.display())]
    ManifestMissing(PathBuf),

    #[error("Invalid manifest {}: {reason}", .path.display())]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("{0} not installed")]
    NotInstalled(String),

    #[error("Failed to get package '{name}': {message}")]
    Registry { name: String, message: String },

    #[error("Version '{version}' not found for package '{name}'")]
    VersionNotFound { name: String, version: String },

    #[error("Invalid dist.tarball property for package '{0}'")]
    MissingArchiveUrl(String),

    #[error("Failed to download package '{name}': {message}")]
    Download { name: String, message: String },

    #[error("Failed to extract package '{name}': {message}")]
    Extract { name: String, message: String },

    #[error("Integrity check failed for package '{name}': expected {expected}")]
    Integrity { name: String, expected: String },

    #[error("Access denied: extension '{extension}' cannot require '{request}' outside its own directory")]
    AccessDenied { extension: String, request: String },

    #[error("Cannot find '{request}' in extension '{extension}'")]
    FileNotFound { extension: String, request: String },

    #[error("Module not found, extension '{extension}' cannot load '{request}'")]
    ModuleNotFound { extension: String, request: String },

    #[error("Unsupported module type: {}", .0.display())]
    UnsupportedModule(PathBuf),

    #[error("Failed to read module {}: {source}", .path.display())]
    ModuleRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error in extension '{extension}': {message}")]
    Execution { extension: String, message: String },

    #[error("Timed out after {waited:?} waiting for install lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias used across the crate.
pub type ExtensionResult<T> = Result<T, ExtensionError>;
