//! Error types for the dashboard core

use std::fmt;

pub type Result<T> = std::result::Result<T, DashboardError>;

#[derive(Debug)]
pub enum DashboardError {
    /// HTTP request failed before a response arrived
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Backend answered with a non-2xx status
    Status { status: u16, message: String },

    /// Transport error (timeouts and similar)
    Transport(String),

    /// Configuration error
    Config(String),

    /// Operation is not allowed from the current workflow state
    InvalidState(String),

    /// Generic error with message
    Other(String),
}

impl DashboardError {
    /// HTTP status carried by the error, if the backend produced one
    pub fn status(&self) -> Option<u16> {
        match self {
            DashboardError::Status { status, .. } => Some(*status),
            DashboardError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Message suitable for an operator-facing panel
    pub fn user_message(&self) -> String {
        match self {
            DashboardError::Status { status, message } => format!("API error: {} - {}", status, message),
            DashboardError::Http(err) => format!("Request failed: {}", err),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for DashboardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DashboardError::Http(err) => write!(f, "HTTP error: {}", err),
            DashboardError::Json(err) => write!(f, "JSON error: {}", err),
            DashboardError::Status { status, message } => {
                write!(f, "Unexpected response {}: {}", status, message)
            }
            DashboardError::Transport(msg) => write!(f, "Transport error: {}", msg),
            DashboardError::Config(msg) => write!(f, "Configuration error: {}", msg),
            DashboardError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            DashboardError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DashboardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DashboardError::Http(err) => Some(err),
            DashboardError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(err: reqwest::Error) -> Self {
        DashboardError::Http(err)
    }
}

impl From<serde_json::Error> for DashboardError {
    fn from(err: serde_json::Error) -> Self {
        DashboardError::Json(err)
    }
}
