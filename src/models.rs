//! Wire data structures exchanged with the monitoring API

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// One monitored site as reported by the backend.
///
/// Every `Option` means "not yet measured". `ping` is in seconds and
/// `load_time` in milliseconds; see [`crate::normalize`] for display units.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SiteRecord {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub status: SiteStatus,
    #[serde(default)]
    pub ping: Option<f64>,
    #[serde(default, rename = "loadTime")]
    pub load_time: Option<f64>,
    #[serde(default)]
    pub uptime: Option<f64>,
    #[serde(default, rename = "lastChecked")]
    pub last_checked: Option<String>,
    #[serde(default, deserialize_with = "lenient_status_code")]
    pub status_code: Option<u16>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub content_size: Option<u64>,
    #[serde(default)]
    pub ssl_valid: Option<bool>,
    #[serde(default)]
    pub ssl_issuer: Option<String>,
    #[serde(default)]
    pub ssl_subject: Option<String>,
    #[serde(default)]
    pub frontend_title: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub html_size: Option<u64>,
    #[serde(default)]
    pub console_logs: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Online,
    Offline,
    Warning,
    #[serde(other)]
    Unknown,
}

impl SiteStatus {
    /// Operator-facing label
    pub fn label(&self) -> &'static str {
        match self {
            SiteStatus::Online => "Online",
            SiteStatus::Warning => "Issues",
            SiteStatus::Offline => "Offline",
            SiteStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteStatus::Online => write!(f, "online"),
            SiteStatus::Offline => write!(f, "offline"),
            SiteStatus::Warning => write!(f, "warning"),
            SiteStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl SiteRecord {
    pub fn new(id: i64, name: &str, url: &str, status: SiteStatus) -> Self {
        Self {
            id,
            name: name.to_string(),
            url: url.to_string(),
            status,
            ping: None,
            load_time: None,
            uptime: None,
            last_checked: None,
            status_code: None,
            content_size: None,
            ssl_valid: None,
            ssl_issuer: None,
            ssl_subject: None,
            frontend_title: None,
            html_size: None,
            console_logs: None,
        }
    }

    pub fn with_ping(mut self, seconds: f64) -> Self {
        self.ping = Some(seconds);
        self
    }

    pub fn with_load_time(mut self, millis: f64) -> Self {
        self.load_time = Some(millis);
        self
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// One time-series sample for a site
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Seconds
    #[serde(default)]
    pub ping: Option<f64>,
    /// Milliseconds
    #[serde(default, rename = "loadTime")]
    pub load_time: Option<f64>,
    #[serde(default, deserialize_with = "lenient_status_code")]
    pub status_code: Option<u16>,
}

/// Time window of a metrics query
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Period {
    #[default]
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Day, Period::Week, Period::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Day => "24h",
            Period::Week => "7d",
            Period::Month => "30d",
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "24h" => Ok(Period::Day),
            "7d" => Ok(Period::Week),
            "30d" => Ok(Period::Month),
            other => Err(format!("unsupported period '{}', expected 24h, 7d or 30d", other)),
        }
    }
}

/// Result of an anomaly-analysis job. Every section is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomalies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AnalysisReport {
    /// Text sections that are present and non-empty, in display order
    pub fn sections(&self) -> Vec<(&'static str, &str)> {
        [
            ("Performance", self.performance_analysis.as_deref()),
            ("Security", self.security_analysis.as_deref()),
            ("Anomalies", self.anomalies.as_deref()),
        ]
        .into_iter()
        .filter_map(|(title, text)| text.filter(|t| !t.trim().is_empty()).map(|t| (title, t)))
        .collect()
    }

    pub fn recommendations(&self) -> &[String] {
        self.recommendations.as_deref().unwrap_or(&[])
    }

    /// A report without any section renders as "no findings"
    pub fn has_findings(&self) -> bool {
        !self.sections().is_empty() || !self.recommendations().is_empty()
    }
}

/// Body of a successful analyze call
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisEnvelope {
    #[serde(default)]
    pub report: AnalysisReport,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AddSiteRequest {
    pub name: String,
    pub url: String,
}

/// Acknowledgement returned by the add endpoint
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AddedSite {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub site_key: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// The backend serializes integer columns through a dataframe, so `200.0`
// shows up as often as `200`.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("expected a non-negative integer, got {}", n))),
        Some(other) => Err(de::Error::custom(format!("expected a number, got {}", other))),
    }
}

fn lenient_status_code<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_count(deserializer)?
        .map(|code| u16::try_from(code).map_err(|_| de::Error::custom(format!("status code {} out of range", code))))
        .transpose()
}
