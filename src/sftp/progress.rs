//! Transfer progress math and human-readable formatting

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::queue::TransferItem;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Completion percentage (0-100); 0 when the size is unknown
pub fn progress_percent(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (transferred as f64 / total as f64) * 100.0
}

/// Average bytes per second over `elapsed`
pub fn transfer_speed(transferred: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || transferred == 0 {
        return 0;
    }
    (transferred as f64 / secs) as u64
}

/// Estimated time remaining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    /// No measurable progress yet
    Unbounded,
    Remaining(Duration),
}

pub fn estimate_eta(remaining_bytes: u64, speed: u64) -> Eta {
    if speed == 0 {
        return Eta::Unbounded;
    }
    Eta::Remaining(Duration::from_secs(remaining_bytes / speed))
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = match self {
            Eta::Unbounded => return f.write_str("∞"),
            Eta::Remaining(d) => d.as_secs(),
        };
        if secs < 60 {
            write!(f, "{}s", secs)
        } else if secs < 3600 {
            write!(f, "{}m {}s", secs / 60, secs % 60)
        } else {
            write!(f, "{}h {}m", secs / 3600, (secs % 3600) / 60)
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

impl TransferItem {
    pub fn progress_percent(&self) -> f64 {
        progress_percent(self.transferred_bytes, self.total_bytes)
    }

    /// Elapsed time as of `now`, or up to `end_time` once finished
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        let Some(start) = self.start_time else {
            return Duration::ZERO;
        };
        let end = self.end_time.unwrap_or(now);
        (end - start).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn speed_at(&self, now: DateTime<Utc>) -> u64 {
        transfer_speed(self.transferred_bytes, self.elapsed_at(now))
    }

    pub fn eta_at(&self, now: DateTime<Utc>) -> Eta {
        let remaining = self.total_bytes.saturating_sub(self.transferred_bytes);
        estimate_eta(remaining, self.speed_at(now))
    }
}
