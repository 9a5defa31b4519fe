//! One dashboard session: the API client, its caches and refresh tasks

use crate::analysis::AnalysisWorkflow;
use crate::cache::QueryCache;
use crate::config::Config;
use crate::errors::{DashboardError, Result};
use crate::metrics::SiteMetricsQuery;
use crate::models::{MetricPoint, Period, SiteRecord};
use crate::roster::RosterQuery;
use crate::scheduler::RefreshScheduler;
use crate::search::SearchWorkflow;
use crate::transport::{HttpTransport, SiteApi};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Explicit cache context handed to every query of the session.
///
/// Queries built here share the session's caches; dropping a query
/// unsubscribes its refresh task. [`DashboardSession::shutdown`] stops
/// whatever is still running.
pub struct DashboardSession {
    id: Uuid,
    config: Config,
    api: Arc<dyn SiteApi>,
    roster_cache: QueryCache<Vec<SiteRecord>>,
    metrics_cache: QueryCache<Vec<MetricPoint>>,
    scheduler: RefreshScheduler,
}

impl DashboardSession {
    /// Session against the HTTP backend named in `config`
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(DashboardError::Config)?;
        let transport = HttpTransport::new(&config.api_base_url, config.http_timeout)?;
        Ok(Self::with_api(config, Arc::new(transport)))
    }

    /// Session over any [`SiteApi`], e.g. a fake in tests
    pub fn with_api(config: Config, api: Arc<dyn SiteApi>) -> Self {
        let id = Uuid::new_v4();
        info!("Starting dashboard session {} against {}", id, config.api_base_url);

        Self {
            id,
            config,
            api,
            roster_cache: QueryCache::new(),
            metrics_cache: QueryCache::new(),
            scheduler: RefreshScheduler::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> Arc<dyn SiteApi> {
        Arc::clone(&self.api)
    }

    /// Mounted roster query: fetches now and every refresh interval
    pub fn roster(&self) -> RosterQuery {
        RosterQuery::new(self.api(), self.roster_cache.clone(), &self.config)
            .mount(&self.scheduler, self.config.refresh_interval)
    }

    /// Mounted metrics query for one card
    pub fn site_metrics(&self, site_id: Option<i64>, period: Period) -> SiteMetricsQuery {
        SiteMetricsQuery::new(
            self.api(),
            self.metrics_cache.clone(),
            site_id,
            period,
            self.config.metrics_error_policy,
        )
        .mount(&self.scheduler, self.config.refresh_interval)
    }

    /// Bring one card per site in line with the roster. Cards of sites that
    /// are still listed, at the same period, stay mounted.
    pub fn sync_site_cards(&self, cards: &mut BTreeMap<i64, SiteMetricsQuery>, sites: &[SiteRecord], period: Period) {
        cards.retain(|id, card| sites.iter().any(|site| site.id == *id) && card.period() == period);

        for site in sites {
            if !cards.contains_key(&site.id) {
                debug!("Mounting metrics card for site {}", site.id);
                cards.insert(site.id, self.site_metrics(Some(site.id), period));
            }
        }
    }

    pub fn search(&self) -> SearchWorkflow {
        SearchWorkflow::new(self.api())
    }

    pub fn analysis(&self) -> AnalysisWorkflow {
        AnalysisWorkflow::new(self.api())
    }

    pub fn active_refresh_tasks(&self) -> usize {
        self.scheduler.active_tasks()
    }

    /// Stop every refresh task and forget cached data
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        self.roster_cache.clear();
        self.metrics_cache.clear();
        info!("Dashboard session {} closed", self.id);
    }
}

impl Drop for DashboardSession {
    fn drop(&mut self) {
        self.scheduler.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SiteStatus;
    use std::time::Duration;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Config {
            api_base_url: String::new(),
            ..Config::default()
        };
        assert!(matches!(DashboardSession::new(config), Err(DashboardError::Config(_))));
    }

    #[tokio::test]
    async fn test_queries_register_refresh_tasks() {
        let session = DashboardSession::new(Config {
            api_base_url: "http://127.0.0.1:9".to_string(),
            http_timeout: Duration::from_millis(50),
            ..Config::default()
        })
        .unwrap();

        let roster = session.roster();
        let card = session.site_metrics(Some(1), Period::Day);
        let disabled = session.site_metrics(None, Period::Day);

        assert_eq!(session.active_refresh_tasks(), 2);
        assert!(!disabled.is_enabled());

        drop(card);
        assert_eq!(session.active_refresh_tasks(), 1);

        session.shutdown();
        assert_eq!(session.active_refresh_tasks(), 0);
        drop(roster);
    }

    #[tokio::test]
    async fn test_site_cards_stay_mounted_across_syncs() {
        let session = DashboardSession::new(Config {
            api_base_url: "http://127.0.0.1:9".to_string(),
            http_timeout: Duration::from_millis(50),
            ..Config::default()
        })
        .unwrap();

        let sites = vec![
            SiteRecord::new(1, "a", "a.example", SiteStatus::Online),
            SiteRecord::new(2, "b", "b.example", SiteStatus::Online),
        ];
        let mut cards = BTreeMap::new();

        session.sync_site_cards(&mut cards, &sites, Period::Day);
        let first_task = cards[&1].task_key().cloned();
        assert_eq!(session.active_refresh_tasks(), 2);

        session.sync_site_cards(&mut cards, &sites, Period::Day);
        assert_eq!(cards[&1].task_key().cloned(), first_task);
        assert_eq!(session.active_refresh_tasks(), 2);

        session.sync_site_cards(&mut cards, &sites[1..], Period::Day);
        assert_eq!(cards.len(), 1);
        assert_eq!(session.active_refresh_tasks(), 1);
    }
}
