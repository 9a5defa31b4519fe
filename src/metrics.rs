//! Per-site metrics query: one dashboard card's time series

use crate::cache::{QueryCache, QueryKey};
use crate::config::MetricsErrorPolicy;
use crate::models::{MetricPoint, Period};
use crate::normalize::{load_time_to_display_seconds, ping_to_display_ms, time_label};
use crate::scheduler::{RefreshScheduler, Subscription, TaskKey};
use crate::transport::SiteApi;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// What a card renders for its chart
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsState {
    pub period: Period,
    pub points: Vec<MetricPoint>,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_error: bool,
    pub error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl MetricsState {
    fn idle(period: Period) -> Self {
        Self {
            period,
            points: Vec::new(),
            is_loading: false,
            is_fetching: false,
            is_error: false,
            error: None,
            fetched_at: None,
        }
    }

    /// Points converted for plotting. Nulls become 0 here and only here.
    pub fn chart_series(&self) -> Vec<ChartPoint> {
        self.points.iter().map(ChartPoint::from).collect()
    }

    /// An empty window is a valid state, distinct from an error
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartPoint {
    pub label: String,
    pub ping_ms: f64,
    pub load_time_s: f64,
}

impl From<&MetricPoint> for ChartPoint {
    fn from(point: &MetricPoint) -> Self {
        Self {
            label: time_label(point.timestamp.as_deref()),
            ping_ms: ping_to_display_ms(point.ping),
            load_time_s: load_time_to_display_seconds(point.load_time),
        }
    }
}

struct MetricsInner {
    site_id: Option<i64>,
    period: RwLock<Period>,
    cache: QueryCache<Vec<MetricPoint>>,
    api: Arc<dyn SiteApi>,
    policy: MetricsErrorPolicy,
}

impl MetricsInner {
    fn period(&self) -> Period {
        *self.period.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch `period` for this site. Returns true if the result was applied.
    async fn fetch(&self, period: Period) -> bool {
        let Some(site_id) = self.site_id else {
            return false;
        };

        let key = QueryKey::metrics(site_id, period);
        let Some(ticket) = self.cache.begin(key) else {
            return false;
        };

        match self.api.fetch_metrics(site_id, period).await {
            Ok(points) => {
                debug!("Site {} ({}): {} points", site_id, period, points.len());
                self.cache.resolve(ticket, points)
            }
            Err(e) => match self.policy {
                MetricsErrorPolicy::Degrade => {
                    warn!("Metrics for site {} ({}) unavailable, showing empty series: {}", site_id, period, e);
                    self.cache.resolve(ticket, Vec::new())
                }
                MetricsErrorPolicy::Surface => {
                    warn!("Metrics for site {} ({}) failed: {}", site_id, period, e);
                    self.cache.reject(ticket, e.user_message())
                }
            },
        }
    }
}

/// A mounted metrics query for one `(site, period)` pair.
///
/// Dropping the query stops its polling task and releases its cache entry;
/// the last consumer of a key invalidates it, so a late response cannot land
/// in discarded state.
pub struct SiteMetricsQuery {
    inner: Arc<MetricsInner>,
    subscription: Option<Subscription>,
}

impl SiteMetricsQuery {
    /// A query with no polling. Ids that are missing or not positive
    /// disable it: no fetch, empty non-error state.
    pub fn new(
        api: Arc<dyn SiteApi>,
        cache: QueryCache<Vec<MetricPoint>>,
        site_id: Option<i64>,
        period: Period,
        policy: MetricsErrorPolicy,
    ) -> Self {
        let site_id = site_id.filter(|id| *id > 0);
        match site_id {
            Some(id) => cache.retain(QueryKey::metrics(id, period)),
            None => debug!("Metrics query disabled: no valid site id"),
        }

        Self {
            inner: Arc::new(MetricsInner {
                site_id,
                period: RwLock::new(period),
                cache,
                api,
                policy,
            }),
            subscription: None,
        }
    }

    /// Issue the first fetch and refresh every `interval` while mounted
    pub fn mount(mut self, scheduler: &RefreshScheduler, interval: Duration) -> Self {
        if self.is_enabled() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let period = inner.period();
                inner.fetch(period).await;
            });

            let inner = Arc::clone(&self.inner);
            self.subscription = Some(scheduler.subscribe(TaskKey::new("site-metrics"), interval, move || {
                let inner = Arc::clone(&inner);
                async move {
                    let period = inner.period();
                    inner.fetch(period).await;
                }
            }));
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.site_id.is_some()
    }

    /// Refresh task of a mounted query
    pub fn task_key(&self) -> Option<&TaskKey> {
        self.subscription.as_ref().map(Subscription::key)
    }

    pub fn site_id(&self) -> Option<i64> {
        self.inner.site_id
    }

    pub fn period(&self) -> Period {
        self.inner.period()
    }

    /// Fetch the current period now. Returns true if the result was applied.
    #[instrument(skip(self), fields(site_id = ?self.inner.site_id))]
    pub async fn refresh(&self) -> bool {
        let period = self.inner.period();
        self.inner.fetch(period).await
    }

    /// Switch the time window. The previous key is released at once (and
    /// invalidated if no other card shows it) and a fetch for the new one is
    /// started in the background.
    pub fn set_period(&self, period: Period) -> JoinHandle<bool> {
        let previous = {
            let mut current = self.inner.period.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, period)
        };

        if let Some(site_id) = self.inner.site_id {
            if previous != period {
                debug!("Site {}: period {} -> {}", site_id, previous, period);
                self.inner.cache.retain(QueryKey::metrics(site_id, period));
                self.inner.cache.release(QueryKey::metrics(site_id, previous));
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.fetch(period).await })
    }

    /// Current best-known state for the active key
    pub fn state(&self) -> MetricsState {
        let period = self.inner.period();
        let Some(site_id) = self.inner.site_id else {
            return MetricsState::idle(period);
        };

        match self.inner.cache.get(QueryKey::metrics(site_id, period)) {
            Some(entry) => MetricsState {
                period,
                is_loading: entry.is_loading(),
                is_fetching: entry.is_fetching,
                is_error: entry.is_error,
                error: entry.error,
                fetched_at: entry.fetched_at,
                points: entry.data.unwrap_or_default(),
            },
            None => MetricsState {
                is_loading: true,
                ..MetricsState::idle(period)
            },
        }
    }
}

impl Drop for SiteMetricsQuery {
    fn drop(&mut self) {
        self.subscription.take();
        if let Some(site_id) = self.inner.site_id {
            self.inner.cache.release(QueryKey::metrics(site_id, self.inner.period()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{DashboardError, Result};
    use crate::models::{AddSiteRequest, AddedSite, SiteRecord};
    use crate::transport::{RawResponse, SearchOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    fn point(ts: &str, ping: Option<f64>, load_time: Option<f64>) -> MetricPoint {
        MetricPoint {
            timestamp: Some(ts.to_string()),
            ping,
            load_time,
            status_code: Some(200),
        }
    }

    /// Answers immediately, or fails with 500 when `fail` is set
    struct StaticApi {
        points: Vec<MetricPoint>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StaticApi {
        fn ok(points: Vec<MetricPoint>) -> Arc<Self> {
            Arc::new(Self { points, fail: false, calls: AtomicUsize::new(0) })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { points: Vec::new(), fail: true, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl SiteApi for StaticApi {
        async fn fetch_roster(&self) -> Result<Vec<SiteRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_metrics(&self, _site_id: i64, _period: Period) -> Result<Vec<MetricPoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DashboardError::Status {
                    status: 500,
                    message: "Internal Server Error".to_string(),
                });
            }
            Ok(self.points.clone())
        }

        async fn search(&self, _normalized_url: &str) -> Result<SearchOutcome> {
            Ok(SearchOutcome::NotFound)
        }

        async fn add_site(&self, _request: &AddSiteRequest) -> Result<AddedSite> {
            Err(DashboardError::Other("unused".to_string()))
        }

        async fn analyze(&self, _site_id: i64) -> Result<RawResponse> {
            Err(DashboardError::Other("unused".to_string()))
        }
    }

    /// Holds every metrics request until the test releases it
    #[derive(Default)]
    struct GatedApi {
        pending: Mutex<HashMap<Period, oneshot::Sender<()>>>,
    }

    impl GatedApi {
        fn release(&self, period: Period) {
            if let Some(tx) = self.pending.lock().unwrap().remove(&period) {
                tx.send(()).unwrap();
            }
        }

        fn waiting(&self) -> usize {
            self.pending.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SiteApi for GatedApi {
        async fn fetch_roster(&self) -> Result<Vec<SiteRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_metrics(&self, _site_id: i64, period: Period) -> Result<Vec<MetricPoint>> {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().insert(period, tx);
            rx.await.map_err(|_| DashboardError::Other("dropped".to_string()))?;
            Ok(vec![point("2024-05-01T10:00:00", Some(0.1), Some(1000.0)); period_len(period)])
        }

        async fn search(&self, _normalized_url: &str) -> Result<SearchOutcome> {
            Ok(SearchOutcome::NotFound)
        }

        async fn add_site(&self, _request: &AddSiteRequest) -> Result<AddedSite> {
            Err(DashboardError::Other("unused".to_string()))
        }

        async fn analyze(&self, _site_id: i64) -> Result<RawResponse> {
            Err(DashboardError::Other("unused".to_string()))
        }
    }

    fn period_len(period: Period) -> usize {
        match period {
            Period::Day => 1,
            Period::Week => 7,
            Period::Month => 30,
        }
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_refresh_populates_state() {
        let api = StaticApi::ok(vec![
            point("2024-05-01T10:00:00", Some(0.05), Some(1500.0)),
            point("2024-05-01T10:05:00", None, None),
        ]);
        let query = SiteMetricsQuery::new(api, QueryCache::new(), Some(7), Period::Day, MetricsErrorPolicy::Degrade);

        assert!(query.state().is_loading);
        assert!(query.refresh().await);

        let state = query.state();
        assert_eq!(state.points.len(), 2);
        assert!(!state.is_loading);
        assert!(!state.is_error);

        let series = state.chart_series();
        assert_eq!(series[0].label, "10:00");
        assert_eq!(series[0].ping_ms, 50.0);
        assert_eq!(series[0].load_time_s, 1.5);
        assert_eq!(series[1].ping_ms, 0.0);
        assert_eq!(series[1].load_time_s, 0.0);
        assert!(state.points[1].ping.is_none());
    }

    #[tokio::test]
    async fn test_failure_degrades_to_empty() {
        let query = SiteMetricsQuery::new(
            StaticApi::failing(),
            QueryCache::new(),
            Some(7),
            Period::Day,
            MetricsErrorPolicy::Degrade,
        );

        query.refresh().await;

        let state = query.state();
        assert!(state.points.is_empty());
        assert!(!state.is_error);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_surfaces_when_configured() {
        let query = SiteMetricsQuery::new(
            StaticApi::failing(),
            QueryCache::new(),
            Some(7),
            Period::Day,
            MetricsErrorPolicy::Surface,
        );

        query.refresh().await;

        let state = query.state();
        assert!(state.is_error);
        assert_eq!(state.error.as_deref(), Some("API error: 500 - Internal Server Error"));
    }

    #[tokio::test]
    async fn test_invalid_site_id_disables_query() {
        let api = StaticApi::ok(vec![point("2024-05-01T10:00:00", Some(0.1), None)]);

        for site_id in [None, Some(0), Some(-3)] {
            let query = SiteMetricsQuery::new(
                api.clone(),
                QueryCache::new(),
                site_id,
                Period::Day,
                MetricsErrorPolicy::Degrade,
            );

            assert!(!query.is_enabled());
            assert!(!query.refresh().await);

            let state = query.state();
            assert!(state.points.is_empty());
            assert!(!state.is_loading);
            assert!(!state.is_error);
        }

        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_last_period_wins_regardless_of_arrival_order() {
        let api = Arc::new(GatedApi::default());
        let query = SiteMetricsQuery::new(
            api.clone(),
            QueryCache::new(),
            Some(7),
            Period::Day,
            MetricsErrorPolicy::Degrade,
        );

        let first = tokio::spawn({
            let inner = Arc::clone(&query.inner);
            async move { inner.fetch(Period::Day).await }
        });
        settle(|| api.waiting() == 1).await;

        let week = query.set_period(Period::Week);
        settle(|| api.waiting() == 2).await;
        let month = query.set_period(Period::Month);
        settle(|| api.waiting() == 3).await;

        api.release(Period::Month);
        assert!(month.await.unwrap());
        api.release(Period::Week);
        assert!(!week.await.unwrap());
        api.release(Period::Day);
        assert!(!first.await.unwrap());

        let state = query.state();
        assert_eq!(state.period, Period::Month);
        assert_eq!(state.points.len(), 30);
    }

    #[tokio::test]
    async fn test_tick_during_flight_is_coalesced() {
        let api = Arc::new(GatedApi::default());
        let query = SiteMetricsQuery::new(
            api.clone(),
            QueryCache::new(),
            Some(7),
            Period::Week,
            MetricsErrorPolicy::Degrade,
        );

        let in_flight = tokio::spawn({
            let inner = Arc::clone(&query.inner);
            async move { inner.fetch(Period::Week).await }
        });
        settle(|| api.waiting() == 1).await;

        assert!(!query.refresh().await);

        api.release(Period::Week);
        assert!(in_flight.await.unwrap());
        assert_eq!(query.state().points.len(), 7);
    }

    #[tokio::test]
    async fn test_drop_discards_late_response() {
        let api = Arc::new(GatedApi::default());
        let cache = QueryCache::new();
        let query = SiteMetricsQuery::new(api.clone(), cache.clone(), Some(7), Period::Day, MetricsErrorPolicy::Degrade);

        let in_flight = tokio::spawn({
            let inner = Arc::clone(&query.inner);
            async move { inner.fetch(Period::Day).await }
        });
        settle(|| api.waiting() == 1).await;

        drop(query);
        api.release(Period::Day);

        assert!(!in_flight.await.unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_polls_until_dropped() {
        let api = StaticApi::ok(vec![point("2024-05-01T10:00:00", Some(0.1), None)]);
        let scheduler = RefreshScheduler::new();

        let query = SiteMetricsQuery::new(api.clone(), QueryCache::new(), Some(7), Period::Day, MetricsErrorPolicy::Degrade)
            .mount(&scheduler, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().points.len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);

        drop(query);
        assert_eq!(scheduler.active_tasks(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shared_key_survives_one_unmount() {
        let api = StaticApi::ok(vec![point("2024-05-01T10:00:00", Some(0.1), None)]);
        let cache = QueryCache::new();
        let dashboard_card =
            SiteMetricsQuery::new(api.clone(), cache.clone(), Some(7), Period::Day, MetricsErrorPolicy::Degrade);
        let search_card =
            SiteMetricsQuery::new(api.clone(), cache.clone(), Some(7), Period::Day, MetricsErrorPolicy::Degrade);

        assert!(dashboard_card.refresh().await);
        drop(search_card);

        let state = dashboard_card.state();
        assert!(!state.is_loading);
        assert_eq!(state.points.len(), 1);

        drop(dashboard_card);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_period_change_keeps_key_shown_elsewhere() {
        let api = StaticApi::ok(vec![point("2024-05-01T10:00:00", Some(0.1), None)]);
        let cache = QueryCache::new();
        let first = SiteMetricsQuery::new(api.clone(), cache.clone(), Some(7), Period::Day, MetricsErrorPolicy::Degrade);
        let second = SiteMetricsQuery::new(api.clone(), cache.clone(), Some(7), Period::Day, MetricsErrorPolicy::Degrade);

        assert!(first.refresh().await);
        assert!(second.set_period(Period::Week).await.unwrap());

        assert_eq!(first.state().points.len(), 1);
        assert_eq!(cache.consumers(QueryKey::metrics(7, Period::Day)), 1);
        assert_eq!(cache.consumers(QueryKey::metrics(7, Period::Week)), 1);
    }
}
