//! Site roster query and the dashboard's aggregate statistics

use crate::cache::{QueryCache, QueryKey};
use crate::config::Config;
use crate::models::{SiteRecord, SiteStatus};
use crate::normalize::ping_to_display_ms;
use crate::scheduler::{RefreshScheduler, Subscription, TaskKey};
use crate::transport::SiteApi;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RosterState {
    pub sites: Vec<SiteRecord>,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_error: bool,
    pub error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Aggregates recomputed from every roster snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardStats {
    pub total: usize,
    pub online: usize,
    /// Mean ping in display ms over measured sites, 0 when none are measured
    pub avg_ping_ms: i64,
    pub measured: usize,
}

impl DashboardStats {
    pub fn from_sites(sites: &[SiteRecord]) -> Self {
        let pings: Vec<f64> = sites
            .iter()
            .filter(|site| site.ping.is_some())
            .map(|site| ping_to_display_ms(site.ping))
            .collect();

        let avg_ping_ms = if pings.is_empty() {
            0
        } else {
            (pings.iter().sum::<f64>() / pings.len() as f64).round() as i64
        };

        Self {
            total: sites.len(),
            online: sites.iter().filter(|site| site.status == SiteStatus::Online).count(),
            avg_ping_ms,
            measured: pings.len(),
        }
    }
}

/// What the stats panel shows. An error never collapses into zero counts.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsPanel {
    Loading,
    Error(String),
    Ready(DashboardStats),
}

impl RosterState {
    pub fn stats(&self) -> StatsPanel {
        if self.is_error {
            return StatsPanel::Error(
                self.error
                    .clone()
                    .unwrap_or_else(|| "Failed to load sites".to_string()),
            );
        }

        if self.is_loading {
            return StatsPanel::Loading;
        }

        StatsPanel::Ready(DashboardStats::from_sites(&self.sites))
    }
}

struct RosterInner {
    api: Arc<dyn SiteApi>,
    cache: QueryCache<Vec<SiteRecord>>,
    config: Config,
}

impl RosterInner {
    async fn fetch(&self) -> bool {
        let Some(ticket) = self.cache.begin(QueryKey::Roster) else {
            return false;
        };

        let mut attempt = 0;
        loop {
            match self.api.fetch_roster().await {
                Ok(sites) => {
                    if attempt > 0 {
                        info!("Roster fetched after {} retries", attempt);
                    }
                    debug!("Roster snapshot with {} sites", sites.len());
                    return self.cache.resolve(ticket, sites);
                }
                Err(e) if attempt < self.config.roster_retries => {
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        "Failed to fetch roster (attempt {}), retrying in {}ms: {}",
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!("Failed to fetch roster after {} attempts: {}", attempt + 1, e);
                    return self.cache.reject(ticket, e.user_message());
                }
            }
        }
    }
}

/// The dashboard's roster, refreshed on a fixed interval while mounted
pub struct RosterQuery {
    inner: Arc<RosterInner>,
    subscription: Option<Subscription>,
}

impl RosterQuery {
    pub fn new(api: Arc<dyn SiteApi>, cache: QueryCache<Vec<SiteRecord>>, config: &Config) -> Self {
        cache.retain(QueryKey::Roster);
        Self {
            inner: Arc::new(RosterInner {
                api,
                cache,
                config: config.clone(),
            }),
            subscription: None,
        }
    }

    /// Issue the first fetch and refresh every `interval` while mounted
    pub fn mount(mut self, scheduler: &RefreshScheduler, interval: Duration) -> Self {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.fetch().await;
        });

        let inner = Arc::clone(&self.inner);
        self.subscription = Some(scheduler.subscribe(TaskKey::new("roster"), interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.fetch().await;
            }
        }));
        self
    }

    /// Fetch now, retrying per configuration. True if the result was applied.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> bool {
        self.inner.fetch().await
    }

    pub fn state(&self) -> RosterState {
        match self.inner.cache.get(QueryKey::Roster) {
            Some(entry) => RosterState {
                is_loading: entry.is_loading(),
                is_fetching: entry.is_fetching,
                is_error: entry.is_error,
                error: entry.error,
                fetched_at: entry.fetched_at,
                sites: entry.data.unwrap_or_default(),
            },
            None => RosterState {
                sites: Vec::new(),
                is_loading: true,
                is_fetching: false,
                is_error: false,
                error: None,
                fetched_at: None,
            },
        }
    }

    pub fn stats(&self) -> StatsPanel {
        self.state().stats()
    }
}

impl Drop for RosterQuery {
    fn drop(&mut self) {
        self.subscription.take();
        self.inner.cache.release(QueryKey::Roster);
    }
}
