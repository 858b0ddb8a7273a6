//! Seam to the face-landmark provider.
//!
//! The pipeline only needs the number of faces in a frame and, for each,
//! the left- and right-eye point clusters. Anything that can produce those
//! implements [`LandmarkDetector`]; [`crate::scrfd::ScrfdDetector`] is the
//! bundled ONNX implementation.

use crate::types::FaceLandmarks;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable face-landmark backend.
///
/// Called concurrently from the detection worker pool, so implementations
/// must be `Send + Sync` and must not assume exclusive access.
pub trait LandmarkDetector: Send + Sync {
    /// Locate every face in a row-major 8-bit grayscale buffer of
    /// `width` × `height` bytes.
    fn detect(&self, gray: &[u8], width: u32, height: u32)
        -> Result<Vec<FaceLandmarks>, DetectorError>;
}
