//! Site monitoring dashboard, terminal edition

use clap::{Parser, Subcommand};
use futures::future::join_all;
use sitewatch::analysis::AnalysisState;
use sitewatch::normalize::{format_content_size, format_ssl_validity, format_uptime, Measurement};
use sitewatch::search::{AddSiteState, SearchState};
use sitewatch::{Config, DashboardSession, Period, Result, SiteMetricsQuery, SiteRecord, StatsPanel};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sitewatch", version, about = "Liveness and performance dashboard for monitored sites")]
struct Cli {
    /// Base URL of the monitoring API
    #[arg(long, env = "SITEWATCH_API_URL", global = true)]
    api_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Aggregate stats and one line per monitored site
    Dashboard {
        /// Keep refreshing until interrupted
        #[arg(long)]
        watch: bool,
        #[arg(long, default_value = "24h")]
        period: Period,
    },
    /// Time series for one site
    Metrics {
        site_id: i64,
        #[arg(long, default_value = "24h")]
        period: Period,
    },
    /// Look a site up by URL
    Search { url: String },
    /// Register a site that is not monitored yet
    Add { url: String },
    /// Run a log-anomaly analysis for one site
    Analyze { site_id: i64 },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize_tracing(cli.json_logs);

    let mut config = Config::from_env();
    if let Some(url) = cli.api_url.as_deref() {
        config.api_base_url = url.trim_end_matches('/').to_string();
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!("sitewatch v{} against {}", env!("CARGO_PKG_VERSION"), config.api_base_url);

    if let Err(e) = run(cli.command, config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> Result<()> {
    let session = DashboardSession::new(config)?;

    match command {
        Command::Dashboard { watch, period } => dashboard(&session, watch, period).await?,
        Command::Metrics { site_id, period } => {
            let query = session.site_metrics(Some(site_id), period);
            wait_until(|| !query.state().is_loading).await;
            let state = query.state();

            if let Some(error) = &state.error {
                println!("Metrics unavailable: {}", error);
            } else if state.is_empty() {
                println!("No data for site {} in the last {}", site_id, period);
            }
            for point in state.chart_series() {
                println!("{:>5}  ping {:>6.0} ms  load {:>6.2} s", point.label, point.ping_ms, point.load_time_s);
            }
        }
        Command::Search { url } => {
            let search = session.search();
            print_search(&search.search(&url).await);
        }
        Command::Add { url } => {
            let search = session.search();
            match search.search(&url).await {
                SearchState::NotFound { .. } => {
                    let result = search.add_site(&url).await?;
                    println!("{}", result.message);
                    print_search(&search.state());
                }
                other => print_search(&other),
            }
            if let AddSiteState::Finished(result) = search.add_state() {
                if !result.success {
                    std::process::exit(2);
                }
            }
        }
        Command::Analyze { site_id } => {
            let analysis = session.analysis();
            match analysis.analyze(site_id).await? {
                AnalysisState::Done(report) if !report.has_findings() => println!("No findings"),
                AnalysisState::Done(report) => {
                    for (title, text) in report.sections() {
                        println!("## {}\n{}\n", title, text);
                    }
                    for (i, rec) in report.recommendations().iter().enumerate() {
                        println!("{}. {}", i + 1, rec);
                    }
                }
                AnalysisState::Failed(msg) => println!("{}", msg),
                AnalysisState::Idle | AnalysisState::Analyzing => {}
            }
        }
    }

    session.shutdown();
    Ok(())
}

async fn dashboard(session: &DashboardSession, watch: bool, period: Period) -> Result<()> {
    let roster = session.roster();
    let mut cards = BTreeMap::new();
    wait_until(|| !roster.state().is_loading).await;

    if !watch {
        render_dashboard(session, &mut cards, &roster.state().sites, roster.stats(), period).await;
        return Ok(());
    }

    let mut ticker = interval(session.config().refresh_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                render_dashboard(session, &mut cards, &roster.state().sites, roster.stats(), period).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing dashboard");
                break;
            }
        }
    }

    Ok(())
}

async fn render_dashboard(
    session: &DashboardSession,
    cards: &mut BTreeMap<i64, SiteMetricsQuery>,
    sites: &[SiteRecord],
    stats: StatsPanel,
    period: Period,
) {
    match stats {
        StatsPanel::Loading => println!("Loading sites..."),
        StatsPanel::Error(msg) => {
            println!("Failed to load sites: {}", msg);
            return;
        }
        StatsPanel::Ready(stats) => println!(
            "Sites: {}   Online: {}   Avg ping: {} ms",
            stats.total, stats.online, stats.avg_ping_ms
        ),
    }

    session.sync_site_cards(cards, sites, period);
    join_all(cards.values().map(|card| wait_until(move || !card.state().is_loading))).await;

    for site in sites {
        let points = cards.get(&site.id).map_or(0, |card| card.state().points.len());
        let ping = Measurement::ping(site.ping);
        let load = Measurement::load_time(site.load_time);
        let code = Measurement::http_code(site.status_code);
        println!(
            "[{:<7}] {:<24} ping {:>8} ({})  load {:>8} ({})  http {:>3} ({})  size {:>9}  ssl {:<7}  uptime {}  points {}",
            site.status.label(),
            site.name,
            ping.text,
            ping.level,
            load.text,
            load.level,
            code.text,
            code.level,
            format_content_size(site.content_size),
            format_ssl_validity(site.ssl_valid),
            format_uptime(site.uptime),
            points,
        );
    }
}

fn print_search(state: &SearchState) {
    match state {
        SearchState::Found(site) => println!(
            "{} ({}) is monitored as #{}: {}",
            site.name,
            site.url,
            site.id,
            site.status.label()
        ),
        SearchState::NotFound { query } => println!("{} is not monitored yet", query),
        SearchState::Error(msg) => println!("{}", msg),
        SearchState::Idle | SearchState::Searching { .. } => {}
    }
}

/// Poll `done` until it holds or a minute passes
async fn wait_until<F: Fn() -> bool>(done: F) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !done() && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
}

/// Initialize structured logging
fn initialize_tracing(json: bool) {
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    }
}
