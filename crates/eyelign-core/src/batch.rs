//! Batch orchestration over one input directory.
//!
//! Scans the directory, merges the cache, then runs two independent parallel
//! phases: detection over records never attempted, and alignment over records
//! with eyes. Workers only compute and return results; this module's
//! coordinating thread applies them and is the sole writer of the cache.

use crate::cache::{AlignmentCache, CacheEntry, CacheError, CacheMap};
use crate::detector::LandmarkDetector;
use crate::record::{
    locate_eyes, AlignSettings, Detection, ImageRecord, RecordError, SUPPORTED_EXTENSIONS,
};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ffi::OsStr;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("io error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("output directory {} must be empty, found {entries} entries", path.display())]
    OutputNotEmpty { path: PathBuf, entries: usize },
    #[error("{count} images have missing eye positions; edit the cache file manually or ignore missing images")]
    MissingDetections { count: usize },
    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// When detection results are written to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    /// After every completed image. An interrupted run loses at most one result.
    #[default]
    PerRecord,
    /// Once, after the whole pass.
    PerBatch,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOptions {
    /// Worker count; `None` uses the available parallelism.
    pub concurrency: Option<usize>,
    pub persist: PersistPolicy,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlignOptions {
    /// Worker count; `None` uses the available parallelism.
    pub concurrency: Option<usize>,
    /// Align what has eyes instead of refusing when some images lack them.
    pub ignore_missing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionReport {
    /// Images sent to the detector in this pass.
    pub dispatched: usize,
    pub found: usize,
    /// No face, several faces, or unresolved landmarks.
    pub ambiguous: usize,
    /// Unreadable image, detector error or worker panic.
    pub failed: usize,
    /// Already attempted in an earlier pass.
    pub skipped: usize,
    pub cache_writes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignReport {
    pub aligned: usize,
    pub failed: usize,
    pub skipped_missing: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub found: usize,
    pub missing: usize,
    /// Records whose detection had been attempted before this run.
    pub previously_attempted: usize,
}

impl BatchSummary {
    /// `processed` is the number of files the phase handled.
    pub fn log(&self, phase: &str, processed: usize) {
        tracing::info!(
            phase,
            processed,
            total = self.total,
            found = self.found,
            missing = self.missing,
            previously_attempted = self.previously_attempted,
            "summary"
        );
    }
}

/// One input directory with its records and cache.
pub struct Batch {
    input_dir: PathBuf,
    cache: AlignmentCache,
    stored: CacheMap,
    records: Vec<ImageRecord>,
    previously_attempted: usize,
}

impl Batch {
    /// Scan `input_dir` and hydrate every record that has a cache entry.
    pub fn open(input_dir: &Path) -> Result<Self, BatchError> {
        let records = scan(input_dir)?;
        let cache = AlignmentCache::for_dir(input_dir);
        let stored = cache.load()?;

        let mut batch = Self {
            input_dir: input_dir.to_path_buf(),
            cache,
            stored,
            records,
            previously_attempted: 0,
        };
        batch.hydrate();
        tracing::info!(
            dir = %batch.input_dir.display(),
            images = batch.records.len(),
            cached = batch.previously_attempted,
            "batch opened"
        );
        Ok(batch)
    }

    /// Copy cached state onto records. Files without an entry stay undetected.
    fn hydrate(&mut self) {
        for record in &mut self.records {
            let Some(entry) = self.stored.get(record.identity()) else {
                continue;
            };
            if entry.is_partial() {
                tracing::warn!(
                    file = %record.identity(),
                    "cache entry has partial eye coordinates, detecting again"
                );
                record.hydrate(false, None);
                continue;
            }
            record.hydrate(entry.find_eyes_attempted, entry.eyes());
            tracing::debug!(file = %record.identity(), "loaded from cache");
        }
        self.previously_attempted = self
            .records
            .iter()
            .filter(|r| r.detection_attempted())
            .count();
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    /// Records sorted by file name.
    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [ImageRecord] {
        &mut self.records
    }

    /// Records without eye positions, attempted or not.
    pub fn missing(&self) -> Vec<&ImageRecord> {
        self.records.iter().filter(|r| r.eyes().is_none()).collect()
    }

    pub fn summary(&self) -> BatchSummary {
        let found = self.records.iter().filter(|r| r.eyes().is_some()).count();
        BatchSummary {
            total: self.records.len(),
            found,
            missing: self.records.len() - found,
            previously_attempted: self.previously_attempted,
        }
    }

    /// Cache content for the current records. Unknown keys of existing
    /// entries are carried over; entries for vanished files are dropped.
    pub fn snapshot(&self) -> CacheMap {
        self.records
            .iter()
            .map(|record| {
                let mut entry = CacheEntry::new(record.detection_attempted(), record.eyes());
                if let Some(previous) = self.stored.get(record.identity()) {
                    entry.extra = previous.extra.clone();
                }
                (record.identity().to_string(), entry)
            })
            .collect()
    }

    pub fn persist(&self) -> Result<(), BatchError> {
        self.cache.save(&self.snapshot())?;
        Ok(())
    }

    /// Run detection on every record not yet attempted.
    pub fn detect_all<D>(
        &mut self,
        detector: &D,
        options: &DetectOptions,
    ) -> Result<DetectionReport, BatchError>
    where
        D: LandmarkDetector + ?Sized,
    {
        let pending: Vec<(usize, String, PathBuf)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.detection_attempted())
            .map(|(i, r)| (i, r.identity().to_string(), r.source().to_path_buf()))
            .collect();

        let mut report = DetectionReport {
            dispatched: pending.len(),
            skipped: self.records.len() - pending.len(),
            ..DetectionReport::default()
        };
        for record in self.records.iter().filter(|r| r.detection_attempted()) {
            tracing::debug!(file = %record.identity(), "skipping, previously attempted");
        }

        if pending.is_empty() {
            tracing::info!(skipped = report.skipped, "no new images to detect");
            self.summary().log("detection", 0);
            return Ok(report);
        }

        let pool = worker_pool(options.concurrency)?;
        tracing::info!(
            pending = pending.len(),
            workers = pool.current_num_threads(),
            "detecting eyes"
        );

        let (tx, rx) = mpsc::channel::<(usize, Result<Detection, RecordError>)>();
        let applied = std::thread::scope(|scope| -> Result<(), BatchError> {
            let pending = &pending;
            let pool = &pool;
            scope.spawn(move || {
                pool.install(|| {
                    pending
                        .par_iter()
                        .try_for_each_with(tx, |tx, (index, identity, path)| {
                            let outcome = isolate(identity, || locate_eyes(path, detector));
                            // A closed channel means the coordinator gave up; stop dispatching.
                            tx.send((*index, outcome))
                        })
                        .ok();
                });
            });

            for (index, outcome) in rx {
                let record = &mut self.records[index];
                match outcome {
                    Ok(detection) => {
                        if matches!(detection, Detection::Found(_)) {
                            report.found += 1;
                        } else {
                            report.ambiguous += 1;
                        }
                        record.record_detection(detection);
                    }
                    Err(e) => {
                        tracing::warn!(file = %record.identity(), error = %e, "detection failed");
                        report.failed += 1;
                        record.record_failed_detection();
                    }
                }
                if options.persist == PersistPolicy::PerRecord {
                    self.persist()?;
                    report.cache_writes += 1;
                }
            }
            Ok(())
        });
        applied?;

        if options.persist == PersistPolicy::PerBatch {
            self.persist()?;
            report.cache_writes += 1;
        }

        tracing::info!(
            found = report.found,
            ambiguous = report.ambiguous,
            failed = report.failed,
            skipped = report.skipped,
            "detection finished"
        );
        self.summary().log("detection", report.dispatched);
        Ok(report)
    }

    /// Align every record with eyes into `output_dir`.
    ///
    /// Fails before writing anything if `output_dir` has entries, or if any
    /// record lacks eyes and `ignore_missing` is off. Per-image failures are
    /// logged and counted without stopping the other images.
    pub fn align_all(
        &self,
        output_dir: &Path,
        settings: &AlignSettings,
        options: &AlignOptions,
    ) -> Result<AlignReport, BatchError> {
        ensure_empty(output_dir)?;

        let missing = self.records.iter().filter(|r| r.eyes().is_none()).count();
        if missing > 0 {
            if !options.ignore_missing {
                return Err(BatchError::MissingDetections { count: missing });
            }
            tracing::info!(count = missing, "skipping images with missing eye positions");
        }

        let ready: Vec<&ImageRecord> = self.records.iter().filter(|r| r.eyes().is_some()).collect();
        let mut report = AlignReport {
            skipped_missing: missing,
            ..AlignReport::default()
        };
        if ready.is_empty() {
            tracing::info!("nothing to align");
            self.summary().log("alignment", 0);
            return Ok(report);
        }

        std::fs::create_dir_all(output_dir).map_err(|source| BatchError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let pool = worker_pool(options.concurrency)?;
        tracing::info!(
            images = ready.len(),
            workers = pool.current_num_threads(),
            mode = ?settings.mode,
            "aligning images"
        );
        let outcomes: Vec<(&str, Result<PathBuf, RecordError>)> = pool.install(|| {
            ready
                .par_iter()
                .map(|record| {
                    let identity = record.identity();
                    (identity, isolate(identity, || record.align(settings, output_dir)))
                })
                .collect()
        });

        for (identity, outcome) in outcomes {
            match outcome {
                Ok(_) => report.aligned += 1,
                Err(e) => {
                    tracing::warn!(file = %identity, error = %e, "alignment failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            aligned = report.aligned,
            failed = report.failed,
            skipped = report.skipped_missing,
            "alignment finished"
        );
        self.summary().log("alignment", report.aligned);
        Ok(report)
    }
}

/// List supported images directly inside `input_dir`, sorted by file name.
pub fn scan(input_dir: &Path) -> Result<Vec<ImageRecord>, BatchError> {
    let io_err = |source| BatchError::Io {
        path: input_dir.to_path_buf(),
        source,
    };

    let mut records = Vec::new();
    for entry in std::fs::read_dir(input_dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() || !is_supported(&path) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => records.push(ImageRecord::new(input_dir, name)),
            Err(name) => {
                tracing::warn!(file = ?name, "skipping file with a non UTF-8 name");
            }
        }
    }
    records.sort_by(|a, b| a.identity().cmp(b.identity()));
    Ok(records)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
}

/// A directory that does not exist yet counts as empty.
fn ensure_empty(dir: &Path) -> Result<(), BatchError> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let entries = entries.count();
            if entries > 0 {
                return Err(BatchError::OutputNotEmpty {
                    path: dir.to_path_buf(),
                    entries,
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BatchError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Number of workers used when no concurrency is configured.
///
/// This is the logical CPU count; std exposes no physical-core count.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn worker_pool(concurrency: Option<usize>) -> Result<ThreadPool, BatchError> {
    let workers = concurrency
        .filter(|&n| n > 0)
        .unwrap_or_else(default_concurrency);
    Ok(ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("eyelign-worker-{i}"))
        .build()?)
}

/// Run one unit of work, turning a panic into an error for that file alone.
fn isolate<T>(
    identity: &str,
    work: impl FnOnce() -> Result<T, RecordError>,
) -> Result<T, RecordError> {
    panic::catch_unwind(AssertUnwindSafe(work))
        .unwrap_or_else(|_| Err(RecordError::WorkerPanic(identity.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_filters_and_sorts() {
        let dir = tempdir().unwrap();
        for name in ["b.JPG", "a.jpeg", "c.png", "notes.txt", ".eyelign", "d.Jpg"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let names: Vec<String> = scan(dir.path())
            .unwrap()
            .iter()
            .map(|r| r.identity().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpeg", "b.JPG", "d.Jpg"]);
    }

    #[test]
    fn test_ensure_empty() {
        let dir = tempdir().unwrap();
        assert!(ensure_empty(dir.path()).is_ok());
        assert!(ensure_empty(&dir.path().join("absent")).is_ok());
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();
        assert!(matches!(
            ensure_empty(dir.path()),
            Err(BatchError::OutputNotEmpty { entries: 1, .. })
        ));
    }

    #[test]
    fn test_isolate_catches_panics() {
        let outcome: Result<(), RecordError> = isolate("x.jpg", || panic!("boom"));
        assert!(matches!(outcome, Err(RecordError::WorkerPanic(ref id)) if id == "x.jpg"));
    }

    #[test]
    fn test_worker_pool_size() {
        assert_eq!(worker_pool(Some(3)).unwrap().current_num_threads(), 3);
        assert_eq!(
            worker_pool(Some(0)).unwrap().current_num_threads(),
            default_concurrency()
        );
    }
}
