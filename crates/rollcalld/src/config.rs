use std::path::PathBuf;

use rollcall_core::EngineSettings;

/// Which face locator the daemon runs submissions through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorKind {
    /// SCRFD ONNX detector.
    Scrfd,
    /// Each submitted image is already a single cropped face.
    WholeFrame,
}

impl LocatorKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Some(Self::Scrfd),
            "whole-frame" | "whole_frame" | "none" => Some(Self::WholeFrame),
            _ => None,
        }
    }
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub locator: LocatorKind,
    /// Minimum recognizer confidence (percent) for an automatic credit.
    pub confidence_threshold: f32,
    /// Minutes after class start before an arrival is recorded as late.
    pub late_after_mins: i64,
    /// Refuse enrollments that match another student at this confidence.
    pub duplicate_face_threshold: Option<f32>,
    /// Serve on the session bus (default) rather than the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any variable source. Invalid values are
    /// logged and replaced by their defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(rollcall_core::default_model_dir);

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("rollcall.db"));

        let locator = match var("ROLLCALL_LOCATOR") {
            Some(v) => LocatorKind::parse(&v).unwrap_or_else(|| {
                tracing::warn!(value = %v, "unknown ROLLCALL_LOCATOR, using scrfd");
                LocatorKind::Scrfd
            }),
            None => LocatorKind::Scrfd,
        };

        let duplicate_face_threshold = setting(&var, "ROLLCALL_DUPLICATE_FACE_THRESHOLD", parse_percent);
        if duplicate_face_threshold.is_none() && var("ROLLCALL_DUPLICATE_FACE_THRESHOLD").is_some() {
            tracing::warn!("duplicate-face refusal disabled");
        }

        Self {
            model_dir,
            db_path,
            locator,
            confidence_threshold: setting(&var, "ROLLCALL_CONFIDENCE_THRESHOLD", parse_percent)
                .unwrap_or(rollcall_core::recognizer::DEFAULT_CONFIDENCE_THRESHOLD),
            late_after_mins: setting(&var, "ROLLCALL_LATE_AFTER_MINS", parse_minutes)
                .unwrap_or(rollcall_core::attendance::DEFAULT_LATE_AFTER_MINS),
            duplicate_face_threshold,
            session_bus: var("ROLLCALL_SYSTEM_BUS").is_none(),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::SCRFD_MODEL_FILE)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            confidence_threshold: self.confidence_threshold,
            late_after: chrono::Duration::minutes(self.late_after_mins),
            duplicate_face_threshold: self.duplicate_face_threshold,
        }
    }
}

/// Read and validate one variable. `None` when unset or rejected.
fn setting<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: fn(&str) -> Result<T, &'static str>,
) -> Option<T> {
    let raw = var(key)?;
    match parse(raw.trim()) {
        Ok(value) => Some(value),
        Err(reason) => {
            tracing::warn!(key, value = %raw, reason, "ignoring invalid setting");
            None
        }
    }
}

/// A confidence percentage. Fractions such as `0.8` are refused rather than
/// read as 0.8%, which would credit every face.
fn parse_percent(raw: &str) -> Result<f32, &'static str> {
    let value: f32 = raw.parse().map_err(|_| "not a number")?;
    if !value.is_finite() {
        Err("not a finite number")
    } else if value < 1.0 {
        Err("below 1; thresholds are percentages such as 80, not fractions")
    } else if value > 100.0 {
        Err("above 100")
    } else {
        Ok(value)
    }
}

/// Bounded by one day.
fn parse_minutes(raw: &str) -> Result<i64, &'static str> {
    let value: i64 = raw.parse().map_err(|_| "not a whole number of minutes")?;
    if (0..=24 * 60).contains(&value) {
        Ok(value)
    } else {
        Err("outside 0..=1440 minutes")
    }
}
