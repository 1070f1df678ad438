use std::path::PathBuf;

use thiserror::Error;

use crate::types::{DevicePosition, PixelFormat};

/// Camera failures. Open/permission failures are fatal to the capture
/// session and surfaced to the caller; read failures are per-frame.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no capture device available at position {0:?}")]
    NotFound(DevicePosition),

    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed to open capture device: {0}")]
    Open(String),

    #[error("failed to read frame: {0}")]
    Read(String),
}

/// Pixel buffer conversion failures. Always frame-local: the affected
/// frame is dropped and the pipeline continues.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("image dimensions must be non-zero")]
    ZeroDimensions,

    #[error("{format:?} buffer too small: got {got}, expected {expected}")]
    BufferTooSmall {
        format: PixelFormat,
        got: usize,
        expected: usize,
    },

    #[error("failed to decode {0:?} data: {1}")]
    Decode(PixelFormat, String),

    #[error("unsupported conversion target {0:?}")]
    Unsupported(PixelFormat),
}

/// Estimator failures. Treated as "no detection" for the frame; never
/// fatal to the pipeline.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model execution failed: {0}")]
    Model(String),

    #[error("unexpected model output: {0}")]
    BadOutput(String),
}

/// Encoder failures, split by the phase they invalidate.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder setup failed: {0}")]
    Setup(String),

    #[error("encoder write failed: {0}")]
    Write(String),

    #[error("encoder finalize failed: {0}")]
    Finalize(String),
}

/// Post-recording persistence failures. Non-fatal; the temporary file is
/// retained for manual recovery.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage not authorized: {0}")]
    Unauthorized(String),

    #[error("failed to persist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
