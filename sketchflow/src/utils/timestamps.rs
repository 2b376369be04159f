//! Timestamp helpers.

use chrono::{DateTime, Local, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Format used for run log names and archive snapshot directories.
pub const RUN_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// # Examples
///
/// ```
/// use sketchflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current local wall-clock time formatted for file and
/// directory names (`2024-05-01_13-45-10`).
#[must_use]
pub fn run_stamp() -> String {
    Local::now().format(RUN_STAMP_FORMAT).to_string()
}
