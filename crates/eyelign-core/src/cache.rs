//! Durable per-directory checkpoint of detection results.
//!
//! A single pretty-printed JSON object stored as `.eyelign` inside the input
//! directory, keyed by file name:
//!
//! ```json
//! { "a.jpg": { "find_eyes_attempted": true, "lx": 100, "ly": 120, "rx": 180, "ry": 121 } }
//! ```
//!
//! The manual correction tool edits this file directly, so loading is
//! lenient: missing fields default, malformed entries are skipped, and an
//! unparseable file reads as empty. Saving replaces the file atomically.

use crate::types::{EyePair, Point};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CACHE_FILENAME: &str = ".eyelign";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cached detection state for one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub find_eyes_attempted: bool,
    #[serde(default, deserialize_with = "coordinate")]
    pub lx: Option<i32>,
    #[serde(default, deserialize_with = "coordinate")]
    pub ly: Option<i32>,
    #[serde(default, deserialize_with = "coordinate")]
    pub rx: Option<i32>,
    #[serde(default, deserialize_with = "coordinate")]
    pub ry: Option<i32>,
    /// Keys this crate does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accept integer or fractional pixel values; fractions truncate.
fn coordinate<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.map(|v| v as i32))
}

impl CacheEntry {
    pub fn new(find_eyes_attempted: bool, eyes: Option<EyePair>) -> Self {
        let mut entry = Self {
            find_eyes_attempted,
            ..Self::default()
        };
        if let Some(eyes) = eyes {
            entry.lx = Some(eyes.left.x);
            entry.ly = Some(eyes.left.y);
            entry.rx = Some(eyes.right.x);
            entry.ry = Some(eyes.right.y);
        }
        entry
    }

    /// Both eyes, if all four coordinates are present.
    pub fn eyes(&self) -> Option<EyePair> {
        match (self.lx, self.ly, self.rx, self.ry) {
            (Some(lx), Some(ly), Some(rx), Some(ry)) => {
                Some(EyePair::new(Point::new(lx, ly), Point::new(rx, ry)))
            }
            _ => None,
        }
    }

    /// Some but not all coordinates are set.
    pub fn is_partial(&self) -> bool {
        let present = [self.lx, self.ly, self.rx, self.ry]
            .iter()
            .filter(|c| c.is_some())
            .count();
        present != 0 && present != 4
    }
}

/// Entries sorted by file name, so serialization order is stable.
pub type CacheMap = BTreeMap<String, CacheEntry>;

/// Location of the cache file for one input directory.
#[derive(Debug, Clone)]
pub struct AlignmentCache {
    path: PathBuf,
}

impl AlignmentCache {
    pub fn for_dir(input_dir: &Path) -> Self {
        Self {
            path: input_dir.join(CACHE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cache. A missing file is an empty cache; so is a corrupt one,
    /// with a warning. Only other I/O failures are errors.
    pub fn load(&self) -> Result<CacheMap, CacheError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheMap::new()),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let object: Map<String, Value> = match serde_json::from_str(&raw) {
            Ok(object) => object,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "cache file is corrupt, treating it as empty"
                );
                return Ok(CacheMap::new());
            }
        };

        let mut map = CacheMap::new();
        for (file, value) in object {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => {
                    map.insert(file, entry);
                }
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "skipping malformed cache entry");
                }
            }
        }
        Ok(map)
    }

    /// Write the cache via a sibling temporary file and an atomic rename.
    pub fn save(&self, map: &CacheMap) -> Result<(), CacheError> {
        let mut json = serde_json::to_string_pretty(map)?;
        json.push('\n');

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".eyelign-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        tracing::debug!(path = %self.path.display(), entries = map.len(), "cache saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let cache = AlignmentCache::for_dir(dir.path());
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILENAME), "{ not json").unwrap();
        let cache = AlignmentCache::for_dir(dir.path());
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn test_lenient_entries() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CACHE_FILENAME),
            r#"{
                "a.jpg": {"find_eyes_attempted": true, "lx": 10, "ly": 20.7, "rx": 50, "ry": 21},
                "b.jpg": {"lx": null},
                "c.jpg": 42,
                "d.jpg": {"find_eyes_attempted": true, "lx": 1, "ly": 2, "rx": null, "ry": null}
            }"#,
        )
        .unwrap();
        let map = AlignmentCache::for_dir(dir.path()).load().unwrap();

        assert_eq!(map.len(), 3, "non-object entry is skipped");
        let a = &map["a.jpg"];
        assert_eq!(
            a.eyes(),
            Some(EyePair::new(Point::new(10, 20), Point::new(50, 21)))
        );
        assert!(!map["b.jpg"].find_eyes_attempted);
        assert!(map["b.jpg"].eyes().is_none());
        assert!(map["d.jpg"].is_partial());
        assert!(map["d.jpg"].eyes().is_none());
    }

    #[test]
    fn test_save_sorts_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CACHE_FILENAME);
        std::fs::write(
            &path,
            r#"{"z.jpg":{"ry":5,"rx":4,"ly":3,"lx":2,"find_eyes_attempted":true,"note":"manual"},
                "a.jpg":{"find_eyes_attempted":false,"lx":null,"ly":null,"rx":null,"ry":null}}"#,
        )
        .unwrap();
        let cache = AlignmentCache::for_dir(dir.path());

        cache.save(&cache.load().unwrap()).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        cache.save(&cache.load().unwrap()).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert!(first.find("a.jpg").unwrap() < first.find("z.jpg").unwrap());
        assert!(first.contains(r#""note": "manual""#));
    }

    #[test]
    fn test_save_leaves_no_temporaries() {
        let dir = tempdir().unwrap();
        let cache = AlignmentCache::for_dir(dir.path());
        let mut map = CacheMap::new();
        map.insert("x.jpg".into(), CacheEntry::new(true, None));
        cache.save(&map).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![CACHE_FILENAME.to_string()]);
        assert_eq!(cache.load().unwrap(), map);
    }

    #[test]
    fn test_entry_serializes_null_coordinates() {
        let json = serde_json::to_value(CacheEntry::new(true, None)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"find_eyes_attempted": true, "lx": null, "ly": null, "rx": null, "ry": null})
        );
    }
}
