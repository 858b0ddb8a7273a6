//! One input photo: its detection state, eye positions, and the `detect` and
//! `align` operations.
//!
//! A record starts undetected. One detection pass moves it to found or not
//! found, and further passes leave it alone until [`ImageRecord::invalidate`]
//! is called.

use crate::detector::{DetectorError, LandmarkDetector};
use crate::geometry::{self, AlignmentPlan, GeometryError};
use crate::types::{EyePair, FaceLandmarks, TargetSize};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Input extensions, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: [&str; 2] = ["jpg", "jpeg"];

const MARKER_COLOR: Rgb<u8> = Rgb([200, 0, 0]);
const MARKER_RADIUS_FRACTION: f64 = 0.08;
const FILL: Rgb<u8> = Rgb([0, 0, 0]);

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("{0}: no eye positions to align with")]
    MissingEyes(String),
    #[error("geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to overwrite existing file {}", .0.display())]
    OutputExists(PathBuf),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("worker panicked while processing {0}")]
    WorkerPanic(String),
}

/// What one detection pass concluded about an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Found(EyePair),
    /// Zero faces, or more than one.
    Ambiguous { faces: usize },
    /// Exactly one face whose eye clusters did not resolve to points.
    Unresolved,
}

impl Detection {
    pub fn classify(faces: &[FaceLandmarks]) -> Self {
        match faces {
            [face] => face
                .eye_centers()
                .map(Detection::Found)
                .unwrap_or(Detection::Unresolved),
            _ => Detection::Ambiguous { faces: faces.len() },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Undetected,
    Found(EyePair),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignMode {
    /// Border, rotate, scale and crop.
    #[default]
    Normal,
    /// Copy the source with both eyes marked; no geometry.
    Debug,
}

/// Validated output parameters for [`ImageRecord::align`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignSettings {
    pub target: TargetSize,
    pub eye_width_pct: f64,
    pub mode: AlignMode,
}

impl AlignSettings {
    pub fn new(target: TargetSize, eye_width_pct: f64, mode: AlignMode) -> Result<Self, GeometryError> {
        geometry::validate_target(target)?;
        geometry::validate_eye_width(eye_width_pct)?;
        Ok(Self {
            target,
            eye_width_pct,
            mode,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    identity: String,
    source: PathBuf,
    eyes: Option<EyePair>,
    detection_attempted: bool,
}

impl ImageRecord {
    pub fn new(input_dir: &Path, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            source: input_dir.join(&identity),
            identity,
            eyes: None,
            detection_attempted: false,
        }
    }

    /// File name; unique within the input directory.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn eyes(&self) -> Option<EyePair> {
        self.eyes
    }

    pub fn detection_attempted(&self) -> bool {
        self.detection_attempted
    }

    pub fn state(&self) -> RecordState {
        match (self.detection_attempted, self.eyes) {
            (_, Some(eyes)) => RecordState::Found(eyes),
            (true, None) => RecordState::NotFound,
            (false, None) => RecordState::Undetected,
        }
    }

    /// Restore state from a cache entry. Eyes imply an attempt, whatever the
    /// entry's flag says.
    pub fn hydrate(&mut self, detection_attempted: bool, eyes: Option<EyePair>) {
        self.eyes = eyes;
        self.detection_attempted = detection_attempted || eyes.is_some();
    }

    /// Forget detection results so the next pass runs again.
    pub fn invalidate(&mut self) {
        self.eyes = None;
        self.detection_attempted = false;
    }

    /// Run the detector once, unless a pass has already been made.
    pub fn detect<D>(&mut self, detector: &D) -> Result<RecordState, RecordError>
    where
        D: LandmarkDetector + ?Sized,
    {
        if self.detection_attempted {
            tracing::debug!(file = %self.identity, "detection already attempted");
            return Ok(self.state());
        }
        match locate_eyes(&self.source, detector) {
            Ok(detection) => {
                self.record_detection(detection);
                Ok(self.state())
            }
            Err(e) => {
                self.record_failed_detection();
                Err(e)
            }
        }
    }

    /// Apply a detection outcome. The attempt flag is set last.
    pub fn record_detection(&mut self, detection: Detection) {
        match detection {
            Detection::Found(eyes) => {
                tracing::info!(
                    file = %self.identity,
                    left = ?(eyes.left.x, eyes.left.y),
                    right = ?(eyes.right.x, eyes.right.y),
                    "eyes found"
                );
                self.eyes = Some(eyes);
            }
            Detection::Ambiguous { faces: 0 } => {
                tracing::warn!(file = %self.identity, "no face found");
            }
            Detection::Ambiguous { faces } => {
                tracing::warn!(file = %self.identity, faces, "multiple faces found");
            }
            Detection::Unresolved => {
                tracing::warn!(file = %self.identity, "eye landmarks unresolved");
            }
        }
        self.detection_attempted = true;
    }

    /// A pass that errored still counts as attempted, so reruns skip it.
    pub fn record_failed_detection(&mut self) {
        self.detection_attempted = true;
    }

    /// Write the aligned (or, in debug mode, annotated) image to
    /// `output_dir/<identity>`. The source is never modified and existing
    /// files are never overwritten.
    pub fn align(&self, settings: &AlignSettings, output_dir: &Path) -> Result<PathBuf, RecordError> {
        let eyes = self
            .eyes
            .ok_or_else(|| RecordError::MissingEyes(self.identity.clone()))?;
        let source = open_oriented(&self.source)?.to_rgb8();

        let output = match settings.mode {
            AlignMode::Debug => mark_eyes(source, eyes),
            AlignMode::Normal => {
                let plan = geometry::plan_alignment(
                    eyes,
                    source.width(),
                    source.height(),
                    settings.target,
                    settings.eye_width_pct,
                )?;
                tracing::debug!(
                    file = %self.identity,
                    rotation = plan.rotation_degrees,
                    scale = plan.scale,
                    "alignment plan"
                );
                render(&source, &plan, settings.target)
            }
        };

        let destination = output_dir.join(&self.identity);
        write_new(&output, &destination)?;
        tracing::info!(file = %self.identity, "processed image");
        Ok(destination)
    }
}

/// Detection worker: load the image, run the detector, classify the result.
///
/// Pure with respect to records; the caller applies the outcome.
pub fn locate_eyes<D>(path: &Path, detector: &D) -> Result<Detection, RecordError>
where
    D: LandmarkDetector + ?Sized,
{
    let gray = open_oriented(path)?.to_luma8();
    let faces = detector.detect(gray.as_raw(), gray.width(), gray.height())?;
    Ok(Detection::classify(&faces))
}

/// Decode an image with its EXIF orientation applied.
pub fn open_oriented(path: &Path) -> Result<DynamicImage, RecordError> {
    let io_err = |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut decoder = ImageReader::open(path)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn mark_eyes(mut image: RgbImage, eyes: EyePair) -> RgbImage {
    let radius = ((eyes.x_distance().abs() as f64 * MARKER_RADIUS_FRACTION) as i32).max(1);
    for eye in [eyes.left, eyes.right] {
        draw_filled_circle_mut(&mut image, (eye.x, eye.y), radius, MARKER_COLOR);
    }
    image
}

/// Realise an alignment plan into a `target`-sized canvas.
///
/// The border, rotation, scale and crop collapse into one projective warp, so
/// the padded intermediate is never materialised; anything outside the
/// source is black, as a padded canvas would be. Downscales are pre-filtered
/// to avoid aliasing.
fn render(source: &RgbImage, plan: &AlignmentPlan, target: TargetSize) -> RgbImage {
    let scale = plan.scale;
    let (base, sx, sy) = if scale < 1.0 {
        let w = ((source.width() as f64 * scale) as u32).max(1);
        let h = ((source.height() as f64 * scale) as u32).max(1);
        let resized = imageops::resize(source, w, h, FilterType::CatmullRom);
        (
            Cow::Owned(resized),
            w as f64 / source.width() as f64,
            h as f64 / source.height() as f64,
        )
    } else {
        (Cow::Borrowed(source), 1.0, 1.0)
    };

    let border = plan.border as f64;
    let (px, py) = (plan.pivot.x as f64, plan.pivot.y as f64);
    let projection = Projection::translate(
        (scale * px - plan.crop.x0 as f64) as f32,
        (scale * py - plan.crop.y0 as f64) as f32,
    ) * Projection::rotate(-plan.rotation_degrees.to_radians() as f32)
        * Projection::translate((scale * (border - px)) as f32, (scale * (border - py)) as f32)
        * Projection::scale((scale / sx) as f32, (scale / sy) as f32);

    let mut canvas = RgbImage::from_pixel(target.width, target.height, FILL);
    warp_into(&*base, &projection, Interpolation::Bicubic, FILL, &mut canvas);
    canvas
}

/// Encode `image` into a file that must not exist yet.
fn write_new(image: &RgbImage, path: &Path) -> Result<(), RecordError> {
    let format = ImageFormat::from_path(path)?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| match source.kind() {
            io::ErrorKind::AlreadyExists => RecordError::OutputExists(path.to_path_buf()),
            _ => RecordError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;

    let mut writer = BufWriter::new(file);
    let written = image
        .write_to(&mut writer, format)
        .map_err(RecordError::from)
        .and_then(|()| {
            writer.flush().map_err(|source| RecordError::Io {
                path: path.to_path_buf(),
                source,
            })
        });
    drop(writer);
    if written.is_err() {
        let _ = fs::remove_file(path);
    }
    written
}
