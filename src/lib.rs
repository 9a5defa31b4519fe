//! Site monitoring dashboard core
//!
//! Client-side data freshness and request orchestration over the monitoring
//! service's HTTP API: cached, auto-refreshing roster and per-site metrics
//! queries, the search/add-site workflow and anomaly-analysis jobs, plus the
//! unit normalization applied to raw telemetry.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod roster;
pub mod scheduler;
pub mod search;
pub mod session;
pub mod transport;

pub use analysis::{AnalysisState, AnalysisWorkflow};
pub use config::{Config, MetricsErrorPolicy};
pub use errors::{DashboardError, Result};
pub use metrics::{MetricsState, SiteMetricsQuery};
pub use models::{AnalysisReport, MetricPoint, Period, SiteRecord, SiteStatus};
pub use roster::{DashboardStats, RosterQuery, RosterState, StatsPanel};
pub use search::{AddSiteState, SearchState, SearchWorkflow};
pub use session::DashboardSession;
pub use transport::{HttpTransport, SiteApi};
