use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop the server from starting or accepting.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of a single persistence operation. Logged by the connection
/// loop, never fatal.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to create storage directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Structural problems found while walking a multipart body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    #[error("multipart content type without a boundary parameter")]
    MissingBoundary,

    #[error("opening boundary delimiter not found")]
    StartBoundaryNotFound,

    #[error("part {index} is not terminated by a boundary delimiter")]
    TruncatedPart { index: usize },
}

/// The raw request has no blank line between headers and body.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no header/body separator in request")]
pub struct NoSeparator;
