//! eyelign-core: batch eye detection and face alignment.
//!
//! Detects eye positions in a directory of photos with SCRFD (via ONNX
//! Runtime), checkpoints them in a per-directory JSON cache, and renders
//! each photo rotated, scaled and cropped so the eyes land in the same place.

pub mod batch;
pub mod cache;
pub mod detector;
pub mod geometry;
pub mod record;
pub mod scrfd;
pub mod types;

use std::path::PathBuf;

pub use batch::{
    AlignOptions, AlignReport, Batch, BatchError, BatchSummary, DetectOptions, DetectionReport,
    PersistPolicy,
};
pub use cache::AlignmentCache;
pub use detector::{DetectorError, LandmarkDetector};
pub use record::{AlignMode, AlignSettings, Detection, ImageRecord, RecordError, RecordState};
pub use scrfd::{ScrfdDetector, SCRFD_MODEL_FILE};
pub use types::{EyePair, FaceLandmarks, Point, TargetSize};

/// `$XDG_DATA_HOME/eyelign/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("eyelign/models")
}
