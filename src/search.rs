//! Search/resolve workflow: look a site up by URL, offer to add it when the
//! backend does not monitor it yet.

use crate::analysis::AnalysisWorkflow;
use crate::errors::{DashboardError, Result};
use crate::models::{AddSiteRequest, SiteRecord};
use crate::transport::{SearchOutcome, SiteApi};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SearchState {
    Idle,
    Searching { query: String },
    Found(SiteRecord),
    NotFound { query: String },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddSiteResult {
    pub success: bool,
    pub message: String,
}

/// Add-site sub-state, scoped apart from the top-level search error
#[derive(Debug, Clone, PartialEq)]
pub enum AddSiteState {
    Idle,
    Adding,
    Finished(AddSiteResult),
}

/// Lower-case lookup key: no scheme, no leading `www.`, no single trailing slash
pub fn normalize_url(input: &str) -> String {
    let rest = strip_scheme_and_www(input.trim());
    rest.strip_suffix('/').unwrap_or(rest).to_lowercase()
}

/// Display name proposed when registering a site
pub fn default_site_name(input: &str) -> String {
    strip_scheme_and_www(input.trim()).to_lowercase()
}

fn strip_scheme_and_www(input: &str) -> &str {
    let rest = strip_prefix_ignore_case(input, "https://")
        .or_else(|| strip_prefix_ignore_case(input, "http://"))
        .unwrap_or(input);
    strip_prefix_ignore_case(rest, "www.").unwrap_or(rest)
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &input[prefix.len()..])
}

#[derive(Debug)]
struct SearchInner {
    state: SearchState,
    add: AddSiteState,
    generation: u64,
    last_query: Option<String>,
}

/// State machine behind the search page. The page owns its own analysis
/// surface; a fresh search clears whatever that surface last showed.
pub struct SearchWorkflow {
    api: Arc<dyn SiteApi>,
    analysis: AnalysisWorkflow,
    inner: Mutex<SearchInner>,
}

impl SearchWorkflow {
    pub fn new(api: Arc<dyn SiteApi>) -> Self {
        Self {
            analysis: AnalysisWorkflow::new(Arc::clone(&api)),
            api,
            inner: Mutex::new(SearchInner {
                state: SearchState::Idle,
                add: AddSiteState::Idle,
                generation: 0,
                last_query: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SearchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SearchState {
        self.lock().state.clone()
    }

    /// Analysis jobs started from the search panel
    pub fn analysis(&self) -> &AnalysisWorkflow {
        &self.analysis
    }

    pub fn add_state(&self) -> AddSiteState {
        self.lock().add.clone()
    }

    pub fn is_searching(&self) -> bool {
        matches!(self.lock().state, SearchState::Searching { .. })
    }

    /// Look up `raw_input`. Blank input is ignored. A newer call supersedes
    /// any search still in flight.
    #[instrument(skip(self))]
    pub async fn search(&self, raw_input: &str) -> SearchState {
        if raw_input.trim().is_empty() {
            return self.state();
        }

        {
            let mut inner = self.lock();
            if inner.add != AddSiteState::Adding {
                inner.add = AddSiteState::Idle;
            }
        }
        self.analysis.reset_finished();

        self.resolve(raw_input).await
    }

    async fn resolve(&self, raw_input: &str) -> SearchState {
        let normalized = normalize_url(raw_input);
        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.state = SearchState::Searching {
                query: raw_input.to_string(),
            };
            inner.last_query = Some(raw_input.to_string());
            inner.generation
        };

        let next = match self.api.search(&normalized).await {
            Ok(SearchOutcome::Found(site)) => {
                debug!("{} resolved to site {}", normalized, site.id);
                SearchState::Found(site)
            }
            Ok(SearchOutcome::NotFound) => {
                debug!("{} is not monitored", normalized);
                SearchState::NotFound {
                    query: raw_input.to_string(),
                }
            }
            Err(e) => {
                warn!("Search for {} failed: {}", normalized, e);
                SearchState::Error(e.user_message())
            }
        };

        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Discarding superseded search for {} (generation {})", normalized, generation);
            return inner.state.clone();
        }
        inner.state = next.clone();
        next
    }

    /// Register `raw_input` for monitoring, then re-resolve it unless a newer
    /// search took over meanwhile. Only valid from `NotFound` for the same
    /// URL; failures stay in the add-site sub-state.
    #[instrument(skip(self))]
    pub async fn add_site(&self, raw_input: &str) -> Result<AddSiteResult> {
        if raw_input.trim().is_empty() {
            return Err(DashboardError::InvalidState("cannot add a blank URL".to_string()));
        }

        let started_at = {
            let mut inner = self.lock();
            let SearchState::NotFound { query } = &inner.state else {
                return Err(DashboardError::InvalidState(
                    "a site can only be added after a search found nothing".to_string(),
                ));
            };
            if normalize_url(query) != normalize_url(raw_input) {
                return Err(DashboardError::InvalidState(format!(
                    "'{}' does not match the last search '{}'",
                    raw_input, query
                )));
            }
            if inner.add == AddSiteState::Adding {
                return Err(DashboardError::InvalidState("an add request is already running".to_string()));
            }
            inner.add = AddSiteState::Adding;
            inner.generation
        };

        let request = AddSiteRequest {
            name: default_site_name(raw_input),
            url: raw_input.to_string(),
        };

        let result = match self.api.add_site(&request).await {
            Ok(added) => {
                info!("Added {} to monitoring (id {:?})", added.url, added.id);
                AddSiteResult {
                    success: true,
                    message: format!("Site added: {}", request.name),
                }
            }
            Err(e) => {
                warn!("Failed to add {}: {}", request.url, e);
                let detail = match &e {
                    DashboardError::Status { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                AddSiteResult {
                    success: false,
                    message: format!("Failed to add site: {}", detail),
                }
            }
        };

        let superseded = {
            let mut inner = self.lock();
            inner.add = AddSiteState::Finished(result.clone());
            inner.generation != started_at
        };

        if superseded {
            debug!("Skipping re-resolve of {}: a newer search is current", raw_input);
        } else if result.success {
            self.resolve(raw_input).await;
        }

        Ok(result)
    }

    /// Re-run the last search, e.g. from an error panel
    pub async fn retry(&self) -> SearchState {
        let last = self.lock().last_query.clone();
        match last {
            Some(query) => self.search(&query).await,
            None => self.state(),
        }
    }

    pub fn dismiss_error(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, SearchState::Error(_)) {
            inner.state = SearchState::Idle;
        }
    }

    pub fn dismiss_add_result(&self) {
        let mut inner = self.lock();
        if matches!(inner.add, AddSiteState::Finished(_)) {
            inner.add = AddSiteState::Idle;
        }
    }
}
