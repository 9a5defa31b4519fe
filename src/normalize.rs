//! Unit conversion and status bands for raw telemetry.
//!
//! The backend reports `ping` in seconds and `loadTime` in milliseconds.
//! Everything in this module is the single place where those units are
//! bridged to display units (ping in ms, load time in s). Thresholds are
//! fixed constants.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Rendered for any value that has not been measured yet
pub const PLACEHOLDER: &str = "—";

const PING_SUCCESS_BELOW_MS: f64 = 100.0;
const PING_WARNING_BELOW_MS: f64 = 300.0;
const LOAD_SUCCESS_BELOW_S: f64 = 2.0;
const LOAD_WARNING_BELOW_S: f64 = 5.0;

/// Qualitative status band for a metric
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Success => write!(f, "success"),
            Level::Warning => write!(f, "warning"),
            Level::Error => write!(f, "error"),
        }
    }
}

/// Seconds to display milliseconds. `None` plots as 0; track null-ness separately.
pub fn ping_to_display_ms(seconds: Option<f64>) -> f64 {
    seconds.map_or(0.0, |s| s * 1000.0)
}

/// Milliseconds to display seconds. `None` plots as 0.
pub fn load_time_to_display_seconds(millis: Option<f64>) -> f64 {
    millis.map_or(0.0, |ms| ms / 1000.0)
}

pub fn status_for_ping(ms: f64) -> Level {
    if ms < PING_SUCCESS_BELOW_MS {
        Level::Success
    } else if ms < PING_WARNING_BELOW_MS {
        Level::Warning
    } else {
        Level::Error
    }
}

pub fn status_for_load_time(seconds: f64) -> Level {
    if seconds < LOAD_SUCCESS_BELOW_S {
        Level::Success
    } else if seconds < LOAD_WARNING_BELOW_S {
        Level::Warning
    } else {
        Level::Error
    }
}

pub fn status_for_http_code(code: Option<u16>) -> Level {
    match code {
        Some(200) => Level::Success,
        Some(c) if c > 200 && c < 400 => Level::Warning,
        _ => Level::Error,
    }
}

/// A display-ready metric that remembers whether it was ever measured.
///
/// `value` is only meaningful when `measured` is true; `text` already
/// carries the placeholder otherwise, so a real zero and a missing sample
/// never render the same way.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub measured: bool,
    pub text: String,
    pub level: Level,
}

impl Measurement {
    pub fn ping(seconds: Option<f64>) -> Self {
        let ms = ping_to_display_ms(seconds);
        Self {
            value: ms,
            measured: seconds.is_some(),
            text: seconds.map_or_else(|| PLACEHOLDER.to_string(), |_| format!("{:.0} ms", ms)),
            level: status_for_ping(ms),
        }
    }

    pub fn load_time(millis: Option<f64>) -> Self {
        let s = load_time_to_display_seconds(millis);
        Self {
            value: s,
            measured: millis.is_some(),
            text: millis.map_or_else(|| PLACEHOLDER.to_string(), |_| format!("{:.2} s", s)),
            level: status_for_load_time(s),
        }
    }

    pub fn http_code(code: Option<u16>) -> Self {
        Self {
            value: code.map_or(0.0, f64::from),
            measured: code.is_some(),
            text: code.map_or_else(|| PLACEHOLDER.to_string(), |c| c.to_string()),
            level: status_for_http_code(code),
        }
    }
}

/// Content size as KiB with one decimal
pub fn format_content_size(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) => format!("{:.1} KB", b as f64 / 1024.0),
        None => PLACEHOLDER.to_string(),
    }
}

pub fn format_ssl_validity(valid: Option<bool>) -> &'static str {
    match valid {
        Some(true) => "Valid",
        Some(false) => "Invalid",
        None => PLACEHOLDER,
    }
}

pub fn format_uptime(fraction: Option<f64>) -> String {
    match fraction {
        Some(f) => format!("{:.1}%", f * 100.0),
        None => PLACEHOLDER.to_string(),
    }
}

/// Parse a backend timestamp. Accepts RFC 3339 and offset-less ISO-8601.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Chart axis label (`HH:MM`), empty when the sample has no usable timestamp
pub fn time_label(raw: Option<&str>) -> String {
    raw.and_then(parse_timestamp)
        .map(|ts| ts.format("%H:%M").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_bands() {
        assert_eq!(status_for_ping(50.0), Level::Success);
        assert_eq!(status_for_ping(150.0), Level::Warning);
        assert_eq!(status_for_ping(400.0), Level::Error);
        assert_eq!(status_for_ping(100.0), Level::Warning);
        assert_eq!(status_for_ping(300.0), Level::Error);
    }

    #[test]
    fn test_load_time_bands() {
        assert_eq!(status_for_load_time(1.99), Level::Success);
        assert_eq!(status_for_load_time(2.0), Level::Warning);
        assert_eq!(status_for_load_time(4.5), Level::Warning);
        assert_eq!(status_for_load_time(5.0), Level::Error);
    }

    #[test]
    fn test_http_code_bands() {
        assert_eq!(status_for_http_code(Some(200)), Level::Success);
        assert_eq!(status_for_http_code(Some(204)), Level::Warning);
        assert_eq!(status_for_http_code(Some(301)), Level::Warning);
        assert_eq!(status_for_http_code(Some(404)), Level::Error);
        assert_eq!(status_for_http_code(Some(199)), Level::Error);
        assert_eq!(status_for_http_code(None), Level::Error);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(ping_to_display_ms(Some(0.25)), 250.0);
        assert_eq!(load_time_to_display_seconds(Some(1500.0)), 1.5);
        assert_eq!(ping_to_display_ms(None), 0.0);
        assert_eq!(load_time_to_display_seconds(None), 0.0);
    }

    #[test]
    fn test_null_is_not_zero() {
        let missing = Measurement::ping(None);
        let zero = Measurement::ping(Some(0.0));

        assert_eq!(missing.value, zero.value);
        assert!(!missing.measured);
        assert!(zero.measured);
        assert_eq!(missing.text, PLACEHOLDER);
        assert_eq!(zero.text, "0 ms");

        assert_eq!(Measurement::load_time(None).text, PLACEHOLDER);
        assert_eq!(Measurement::load_time(Some(0.0)).text, "0.00 s");
        assert_eq!(Measurement::http_code(None).text, PLACEHOLDER);
    }

    #[test]
    fn test_display_helpers() {
        assert_eq!(format_content_size(Some(2048)), "2.0 KB");
        assert_eq!(format_content_size(None), PLACEHOLDER);
        assert_eq!(format_ssl_validity(Some(false)), "Invalid");
        assert_eq!(format_ssl_validity(None), PLACEHOLDER);
        assert_eq!(format_uptime(Some(0.995)), "99.5%");
    }

    #[test]
    fn test_time_labels() {
        assert_eq!(time_label(Some("2024-05-01T10:15:42.123456")), "10:15");
        assert_eq!(time_label(Some("2024-05-01T23:05:00+00:00")), "23:05");
        assert_eq!(time_label(Some("garbage")), "");
        assert_eq!(time_label(None), "");
    }
}
