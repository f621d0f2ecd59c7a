use std::path::PathBuf;

use thiserror::Error;

use crate::http::TransportError;

/// Coarse failure category, used for reporting and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    ConfigIoFailure,
    NetworkFailure,
    RemoteMalformed,
    AssetNotFound,
    IntegrityMismatch,
    StoreIoFailure,
    PartialInstall,
    NotInstalled,
    NotImplemented,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::ConfigIoFailure => "config_io_failure",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::RemoteMalformed => "remote_malformed",
            ErrorKind::AssetNotFound => "asset_not_found",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::StoreIoFailure => "store_io_failure",
            ErrorKind::PartialInstall => "partial_install",
            ErrorKind::NotInstalled => "not_installed",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum GdpmError {
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration I/O failed for {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Request to {url} failed: {cause}")]
    Network { url: String, cause: TransportError },

    #[error("Malformed response from {url}: {reason}")]
    RemoteMalformed { url: String, reason: String },

    #[error("No remote source provides an asset titled '{title}'")]
    AssetNotFound { title: String },

    #[error("Checksum mismatch for '{title}': expected {expected}, got {actual}")]
    IntegrityMismatch {
        title: String,
        expected: String,
        actual: String,
    },

    #[error("Package database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Package store I/O failed for {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Installing '{title}' failed: {reason}")]
    PartialInstall { title: String, reason: String },

    #[error("Package '{title}' is not installed")]
    NotInstalled { title: String },

    #[error("{0} is not implemented by the asset library client")]
    NotImplemented(&'static str),

    #[error("Cancelled before '{title}' was processed")]
    Cancelled { title: String },
}

impl GdpmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GdpmError::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            GdpmError::ConfigIo { .. } => ErrorKind::ConfigIoFailure,
            GdpmError::Network { .. } => ErrorKind::NetworkFailure,
            GdpmError::RemoteMalformed { .. } => ErrorKind::RemoteMalformed,
            GdpmError::AssetNotFound { .. } => ErrorKind::AssetNotFound,
            GdpmError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            GdpmError::Store(_) | GdpmError::StoreIo { .. } => ErrorKind::StoreIoFailure,
            GdpmError::PartialInstall { .. } => ErrorKind::PartialInstall,
            GdpmError::NotInstalled { .. } => ErrorKind::NotInstalled,
            GdpmError::NotImplemented(_) => ErrorKind::NotImplemented,
            GdpmError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn config_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GdpmError::ConfigIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GdpmError::StoreIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, GdpmError>;
