//! Anomaly-analysis jobs, one state machine per site

use crate::errors::{DashboardError, Result};
use crate::models::{AnalysisEnvelope, AnalysisReport};
use crate::transport::{RawResponse, SiteApi};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Raw bodies quoted in error messages are cut to this many characters
pub const EXCERPT_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisState {
    Idle,
    Analyzing,
    Done(AnalysisReport),
    Failed(String),
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

/// Turn an analyze response into a terminal state.
///
/// 2xx with a JSON content type yields the report; any other 2xx body is a
/// contract drift and fails with an excerpt of the text. Non-2xx bodies are
/// read as JSON `detail` first, then as raw text.
pub fn interpret_analysis_response(response: &RawResponse) -> AnalysisState {
    if response.is_success() {
        if !response.is_json() {
            return AnalysisState::Failed(format!(
                "Analysis failed: server returned an unexpected response format: {}",
                excerpt(&response.body)
            ));
        }

        return match serde_json::from_str::<AnalysisEnvelope>(&response.body) {
            Ok(envelope) => AnalysisState::Done(envelope.report),
            Err(e) => AnalysisState::Failed(format!("Analysis failed: malformed report: {}", e)),
        };
    }

    let detail = match serde_json::from_str::<Value>(&response.body) {
        Ok(json) => json["detail"]
            .as_str()
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| response.status_text.clone()),
        Err(_) if response.body.trim().is_empty() => response.status_text.clone(),
        Err(_) => excerpt(&response.body),
    };

    AnalysisState::Failed(format!("Analysis failed: {} - {}", response.status, detail))
}

/// Analysis jobs started from one surface (dashboard card or search panel)
pub struct AnalysisWorkflow {
    api: Arc<dyn SiteApi>,
    states: Mutex<HashMap<i64, AnalysisState>>,
}

impl AnalysisWorkflow {
    pub fn new(api: Arc<dyn SiteApi>) -> Self {
        Self {
            api,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, AnalysisState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, site_id: i64) -> AnalysisState {
        self.lock().get(&site_id).cloned().unwrap_or(AnalysisState::Idle)
    }

    /// The trigger control is disabled while a job runs for the site
    pub fn can_trigger(&self, site_id: i64) -> bool {
        !matches!(self.lock().get(&site_id), Some(AnalysisState::Analyzing))
    }

    /// Run an analysis for `site_id` and return its terminal state.
    /// Errors only when a job for the site is already running.
    #[instrument(skip(self))]
    pub async fn analyze(&self, site_id: i64) -> Result<AnalysisState> {
        {
            let mut states = self.lock();
            if matches!(states.get(&site_id), Some(AnalysisState::Analyzing)) {
                return Err(DashboardError::InvalidState(format!(
                    "analysis already running for site {}",
                    site_id
                )));
            }
            states.insert(site_id, AnalysisState::Analyzing);
        }

        let next = match self.api.analyze(site_id).await {
            Ok(response) => {
                debug!(
                    "Analysis response for site {}: {} ({:?})",
                    site_id, response.status, response.content_type
                );
                interpret_analysis_response(&response)
            }
            Err(e) => AnalysisState::Failed(format!("Analysis failed: {}", e)),
        };

        match &next {
            AnalysisState::Done(report) if report.has_findings() => {
                info!("Analysis for site {} finished with findings", site_id)
            }
            AnalysisState::Done(_) => info!("Analysis for site {} finished with no findings", site_id),
            AnalysisState::Failed(msg) => warn!("Analysis for site {} failed: {}", site_id, msg),
            _ => {}
        }

        self.lock().insert(site_id, next.clone());
        Ok(next)
    }

    /// Dismiss every finished result, leaving running jobs alone
    pub fn reset_finished(&self) {
        self.lock()
            .retain(|_, state| matches!(state, AnalysisState::Analyzing));
    }

    /// Dismiss a finished result
    pub fn reset(&self, site_id: i64) {
        let mut states = self.lock();
        if !matches!(states.get(&site_id), Some(AnalysisState::Analyzing)) {
            states.remove(&site_id);
        }
    }
}
