//! Download progress reporting

use std::fmt;

use serde::{Deserialize, Serialize};

/// Download progress as seen by observers
///
/// `Unknown` means the total size was not advertised; it is never a stand-in
/// for 0%.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// Fraction in `[0, 1]`
    Fraction(f32),
    #[default]
    Unknown,
}

impl Progress {
    /// Progress for `written` bytes out of an optional total
    pub fn from_bytes(written: u64, total: Option<u64>) -> Self {
        match total {
            Some(total) if total > 0 => {
                let fraction = written as f64 / total as f64;
                Progress::Fraction(fraction.clamp(0.0, 1.0) as f32)
            }
            _ => Progress::Unknown,
        }
    }

    pub fn fraction(&self) -> Option<f32> {
        match self {
            Progress::Fraction(value) => Some(*value),
            Progress::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Progress::Fraction(_))
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Fraction(value) => write!(f, "{:.1}%", value * 100.0),
            Progress::Unknown => f.write_str("unknown"),
        }
    }
}

/// Keeps reported progress monotonically non-decreasing
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<f32>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new byte count and return the progress to publish
    pub fn update(&mut self, written: u64, total: Option<u64>) -> Progress {
        match Progress::from_bytes(written, total) {
            Progress::Fraction(value) => {
                let value = self.last.map_or(value, |last| value.max(last));
                self.last = Some(value);
                Progress::Fraction(value)
            }
            Progress::Unknown => Progress::Unknown,
        }
    }

    /// Last published progress
    pub fn current(&self) -> Progress {
        self.last.map_or(Progress::Unknown, Progress::Fraction)
    }
}
