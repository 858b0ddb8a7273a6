use eyelign_core::PersistPolicy;
use std::path::PathBuf;

/// CLI defaults, loaded from environment variables. Flags override them.
pub struct Config {
    /// Directory containing the SCRFD model file.
    pub model_dir: PathBuf,
    /// Worker count; `None` uses the available parallelism.
    pub jobs: Option<usize>,
    /// Eye distance as a percentage of the output width.
    pub eye_width_pct: f64,
    /// When detection results are written to the cache.
    pub persist: PersistPolicy,
}

impl Config {
    /// Load configuration from `EYELIGN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("EYELIGN_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| eyelign_core::default_model_dir());

        let persist = match std::env::var("EYELIGN_PERSIST") {
            Ok(v) => parse_persist(&v).unwrap_or_else(|| {
                tracing::warn!(value = %v, "unknown EYELIGN_PERSIST value, using record");
                PersistPolicy::PerRecord
            }),
            Err(_) => PersistPolicy::PerRecord,
        };

        Self {
            model_dir,
            jobs: env_usize("EYELIGN_JOBS").filter(|&n| n > 0),
            eye_width_pct: env_f64("EYELIGN_EYE_WIDTH_PCT", 20.0),
            persist,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(eyelign_core::SCRFD_MODEL_FILE)
    }
}

pub fn parse_persist(value: &str) -> Option<PersistPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "record" => Some(PersistPolicy::PerRecord),
        "batch" => Some(PersistPolicy::PerBatch),
        _ => None,
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
