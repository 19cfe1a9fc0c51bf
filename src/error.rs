//! Crate-wide error type.

use std::path::PathBuf;

use crate::capture::DeviceError;

/// Errors raised by the capture and processing stages.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no {kind} artifact found for {camera}")]
    MissingArtifact { kind: &'static str, camera: String },

    #[error("ambiguous {kind} artifact for {camera}: {candidates:?}")]
    AmbiguousArtifact {
        kind: &'static str,
        camera: String,
        candidates: Vec<PathBuf>,
    },

    #[error("{what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("matrix is singular: {0}")]
    Singular(&'static str),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl DatasetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        DatasetError::Image {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        DatasetError::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DatasetError>;
