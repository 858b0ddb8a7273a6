//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over strides 8/16/32 followed by NMS. Of the five
//! keypoints SCRFD predicts per face, only the two eyes are surfaced, each
//! as a single-point cluster.

use crate::detector::{DetectorError, LandmarkDetector};
use crate::types::FaceLandmarks;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const KEYPOINTS: usize = 5;

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: usize,
    height: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let fitted_w = ((width as f32 * scale).round() as usize).clamp(1, INPUT_SIZE);
        let fitted_h = ((height as f32 * scale).round() as usize).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: ((INPUT_SIZE - fitted_w) / 2) as f32,
            pad_y: ((INPUT_SIZE - fitted_h) / 2) as f32,
            width: fitted_w,
            height: fitted_h,
        }
    }

    /// Map a point in model-input space back to the original frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// A decoded face in original-frame coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    keypoints: Option<[(f32, f32); KEYPOINTS]>,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let inter_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let inter_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Keypoints 0 and 1 are the image-left and image-right eye.
    fn into_landmarks(self) -> FaceLandmarks {
        match self.keypoints {
            Some(kps) => FaceLandmarks {
                left_eye: vec![kps[0]],
                right_eye: vec![kps[1]],
            },
            None => FaceLandmarks::default(),
        }
    }
}

/// SCRFD-based landmark detector.
///
/// Inference sessions are pooled: a worker checks one out per call and
/// returns it afterwards, opening another when all are busy. Concurrent
/// callers therefore never share a session.
pub struct ScrfdDetector {
    model_path: PathBuf,
    idle: Mutex<Vec<Session>>,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD model, failing fast if it is missing or malformed.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let model_path = model_path.as_ref().to_path_buf();
        let session = open_session(&model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output tensor mapping");

        Ok(Self {
            model_path,
            idle: Mutex::new(vec![session]),
            outputs,
        })
    }

    fn checkout(&self) -> Result<Session, DetectorError> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match pooled {
            Some(session) => Ok(session),
            None => {
                tracing::debug!("all SCRFD sessions busy, opening another");
                open_session(&self.model_path)
            }
        }
    }

    fn checkin(&self, session: Session) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }

    fn infer(
        &self,
        session: &mut Session,
        input: &Array4<f32>,
        letterbox: &Letterbox,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;
            candidates.extend(decode_stride(scores, bboxes, kps, stride, letterbox));
        }
        Ok(candidates)
    }
}

impl LandmarkDetector for ScrfdDetector {
    fn detect(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceLandmarks>, DetectorError> {
        let (input, letterbox) = preprocess(gray, width, height)?;

        let mut session = self.checkout()?;
        let decoded = self.infer(&mut session, &input, &letterbox);
        self.checkin(session);

        let faces = suppress(decoded?, NMS_IOU_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection finished");
        Ok(faces.into_iter().map(Candidate::into_landmarks).collect())
    }
}

fn open_session(model_path: &Path) -> Result<Session, DetectorError> {
    if !model_path.exists() {
        return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(1)?
        .commit_from_file(model_path)?;
    tracing::info!(path = %model_path.display(), "loaded SCRFD model");
    Ok(session)
}

/// Fit a grayscale frame into the NCHW model input, replicating luma into
/// all three channels. Padding normalises to zero.
fn preprocess(
    gray: &[u8],
    width: u32,
    height: u32,
) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let expected = width as usize * height as usize;
    if expected == 0 || gray.len() != expected {
        return Err(DetectorError::InvalidFrame {
            expected,
            actual: gray.len(),
        });
    }
    let frame = GrayImage::from_raw(width, height, gray.to_vec()).ok_or(
        DetectorError::InvalidFrame {
            expected,
            actual: gray.len(),
        },
    )?;

    let letterbox = Letterbox::fit(width as usize, height as usize);
    let fitted = imageops::resize(
        &frame,
        letterbox.width as u32,
        letterbox.height as u32,
        FilterType::Triangle,
    );

    let mut input = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in fitted.enumerate_pixels() {
        let value = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let (ix, iy) = (x as usize + off_x, y as usize + off_y);
        for channel in 0..3 {
            input[[0, channel, iy, ix]] = value;
        }
    }
    Ok((input, letterbox))
}

/// Resolve which output tensor holds which stride's scores, boxes and keypoints.
///
/// Named exports ("score_8", "bbox_16", "kps_32", ...) are matched by name;
/// anything else falls back to the conventional positional order
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut mapped = [(0, 0, 0); 3];
    for (slot, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => mapped[slot] = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    mapped
}

/// Decode every anchor above the score threshold for one stride.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<Candidate> {
    let grid_w = INPUT_SIZE / stride;
    let grid_h = INPUT_SIZE / stride;
    let step = stride as f32;

    let mut found = Vec::new();
    for idx in 0..grid_w * grid_h * ANCHORS_PER_CELL {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCORE_THRESHOLD {
            continue;
        }
        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * step;
        let ay = (cell / grid_w) as f32 * step;

        let (x1, y1) = letterbox.unmap(ax - offsets[0] * step, ay - offsets[1] * step);
        let (x2, y2) = letterbox.unmap(ax + offsets[2] * step, ay + offsets[3] * step);

        let keypoints = kps
            .get(idx * KEYPOINTS * 2..(idx + 1) * KEYPOINTS * 2)
            .map(|raw| {
                std::array::from_fn(|k| {
                    letterbox.unmap(ax + raw[k * 2] * step, ay + raw[k * 2 + 1] * step)
                })
            });

        found.push(Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            keypoints,
        });
    }
    found
}

/// Greedy non-maximum suppression, highest score first.
fn suppress(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
            score,
            keypoints: None,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_iou() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!(a.iou(&candidate(20.0, 20.0, 10.0, 10.0, 1.0)).abs() < 1e-6);
        // 5x10 overlap over a 150 union.
        let b = candidate(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_keeps_best_of_overlapping() {
        let kept = suppress(
            vec![
                candidate(5.0, 5.0, 100.0, 100.0, 0.8),
                candidate(0.0, 0.0, 100.0, 100.0, 0.9),
                candidate(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            NMS_IOU_THRESHOLD,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_map_outputs_by_name() {
        let mapped = map_outputs(&names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]));
        assert_eq!(mapped, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let numeric: Vec<String> = (0..9).map(|i: usize| (448 + i).to_string()).collect();
        assert_eq!(map_outputs(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_letterbox_unmap() {
        let lb = Letterbox::fit(320, 240);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));
        let (x, y) = lb.unmap(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_single_anchor() {
        let stride = 32;
        let cells = (INPUT_SIZE / stride) * (INPUT_SIZE / stride) * ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut bboxes = vec![0.0f32; cells * 4];
        let mut kps = vec![0.0f32; cells * KEYPOINTS * 2];

        // Second anchor of cell (x=3, y=2) on the 20-wide grid.
        let idx = (2 * 20 + 3) * ANCHORS_PER_CELL + 1;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        kps[idx * 10..idx * 10 + 4].copy_from_slice(&[-0.5, 0.0, 0.5, 0.0]);

        let lb = Letterbox::fit(640, 640);
        let found = decode_stride(&scores, &bboxes, &kps, stride, &lb);
        assert_eq!(found.len(), 1);
        let face = &found[0];
        assert_eq!((face.x1, face.y1, face.x2, face.y2), (64.0, 32.0, 128.0, 96.0));

        let landmarks = face.clone().into_landmarks();
        assert_eq!(landmarks.left_eye, vec![(80.0, 64.0)]);
        assert_eq!(landmarks.right_eye, vec![(112.0, 64.0)]);
    }

    #[test]
    fn test_preprocess_rejects_short_buffer() {
        let err = preprocess(&[0u8; 10], 4, 4).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidFrame { expected: 16, actual: 10 }));
    }

    #[test]
    fn test_preprocess_pads_to_zero() {
        let gray = vec![255u8; 64 * 32];
        let (input, lb) = preprocess(&gray, 64, 32).unwrap();
        assert_eq!(input.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        // Letterbox band above the content normalises to zero.
        assert_eq!(input[[0, 0, 0, 0]], 0.0);
        let inside = input[[0, 1, lb.pad_y as usize + 1, 1]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-3);
    }
}
