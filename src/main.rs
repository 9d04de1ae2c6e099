//! Airstream console
//!
//! Connects to the telemetry backend, keeps the registry and both aggregated
//! history streams live, forwards throttled air-quality alerts, and answers
//! simple queries from stdin.

use anyhow::Result;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use airstream::alert::{AlertMonitor, TracingNotifier};
use airstream::rest::{BackendClient, NominatimGeocoder};
use airstream::subscription::{HistoryScope, HistorySubscription, RegistrySubscription};
use airstream::timeseries::{combine_history, stats, AlignOptions, ScopeSelection, TimeSeriesAligner};
use airstream::{Config, SearchOptions, SourceKind, SubscriptionBroker, SuggestionSearch, Topics};

struct Console {
    broker: SubscriptionBroker,
    registry: RegistrySubscription,
    weather: HistorySubscription,
    air_quality: HistorySubscription,
    aligner: TimeSeriesAligner,
    search: SuggestionSearch,
}

impl Console {
    async fn platforms(&self) {
        let entities = self.registry.entities().await;
        if entities.is_empty() {
            println!("No platforms known yet ({:?})", self.registry.state());
            return;
        }
        for entity in entities {
            println!(
                "  {}  {}  [{}]",
                entity.id,
                entity.name.as_deref().unwrap_or("-"),
                entity.status.as_deref().unwrap_or("unknown")
            );
        }
    }

    async fn aligned(&self, metric: &str, scope: &str) -> Vec<airstream::AlignedPoint> {
        let weather = self.weather.snapshot().await;
        let air_quality = self.air_quality.snapshot().await;
        let input = combine_history(&[(SourceKind::Weather, &weather), (SourceKind::AirQuality, &air_quality)]);
        self.aligner.align_metric(&input, &ScopeSelection::parse(scope), metric)
    }

    async fn stats(&self, metric: &str, scope: &str) {
        let points = self.aligned(metric, scope).await;
        let s = stats(&points, metric);
        println!(
            "{} over {} bucket(s): avg {} | min {} | max {} | latest {}",
            metric,
            points.len(),
            s.avg,
            s.min,
            s.max,
            s.latest
        );
    }

    async fn series(&self, metric: &str, scope: &str) {
        let points = self.aligned(metric, scope).await;
        if points.is_empty() {
            println!("No data for {}", metric);
        }
        for point in points {
            if let Some(value) = point.value(metric) {
                println!("  {}  {}", point.display_label, value);
            }
        }
    }

    async fn search(&self, text: &str) {
        if !self.search.submit(text).await {
            if text.chars().count() < self.search.min_chars() {
                println!("Type at least {} characters", self.search.min_chars());
            }
            return;
        }
        if let Some(e) = self.search.last_error() {
            println!("❌ Search failed: {}", e);
            return;
        }
        let found = self.search.suggestions();
        if found.is_empty() {
            println!("No matches");
        }
        for s in found {
            println!("  {} ({:.4}, {:.4})", s.display_name, s.lat, s.lon);
        }
    }

    fn status(&self) {
        println!("  registry:            {:?}", self.registry.state());
        println!("  weather history:     {:?}", self.weather.state());
        println!("  air quality history: {:?}", self.air_quality.state());
        for topic in self.broker.active_topics() {
            println!("  ⇄ {} ({} subscriber(s))", topic, self.broker.subscriber_count(&topic));
        }
    }

    fn close(&self) {
        self.registry.close();
        self.weather.close();
        self.air_quality.close();
    }
}

/// `<metric> [scope...]`, scope defaulting to every district.
fn metric_and_scope(args: &str) -> Option<(&str, &str)> {
    let args = args.trim();
    if args.is_empty() {
        return None;
    }
    Some(match args.split_once(char::is_whitespace) {
        Some((metric, scope)) => (metric, scope.trim()),
        None => (args, ""),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let _otel = airstream::telemetry::init_logging(&config)?;

    println!("\n{}", "═".repeat(60));
    println!("🌫  Airstream v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", "═".repeat(60));
    println!("Backend: {}", config.api_base_url);
    println!("{}\n", "═".repeat(60));

    let client = reqwest::Client::builder().user_agent(config.user_agent.as_str()).build()?;
    let topics = Topics::new(config.api_base_url.clone());
    let broker = SubscriptionBroker::new(client.clone(), config.reconnect.clone(), config.close_grace);

    let registry = RegistrySubscription::start(
        &broker,
        &topics,
        Some(BackendClient::new(client, topics.clone())),
        config.registry_ready_fallback,
    );
    let weather = HistorySubscription::start(
        &broker,
        &topics,
        SourceKind::Weather,
        HistoryScope::Aggregated,
        config.history_timeout,
    );
    let air_quality = HistorySubscription::start(
        &broker,
        &topics,
        SourceKind::AirQuality,
        HistoryScope::Aggregated,
        config.history_timeout,
    );
    let alerts = AlertMonitor::start(
        &broker,
        &topics,
        SourceKind::AirQuality,
        config.alert_cooldown,
        Arc::new(TracingNotifier),
    );
    info!("Subscriptions started");

    let console = Console {
        broker,
        registry,
        weather,
        air_quality,
        aligner: TimeSeriesAligner::new(AlignOptions::new(config.grain.as_millis() as i64)),
        search: SuggestionSearch::new(
            Arc::new(NominatimGeocoder::from_config(&config)),
            SearchOptions::from(&config),
        ),
    };

    println!("💡 Commands: platforms | stats <metric> [scope] | series <metric> [scope] | search <text> | status | quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("airstream> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match command.to_lowercase().as_str() {
            "quit" | "exit" | "q" => break,
            "platforms" => console.platforms().await,
            "status" => console.status(),
            "stats" => match metric_and_scope(args) {
                Some((metric, scope)) => console.stats(metric, scope).await,
                None => println!("Usage: stats <metric> [scope]"),
            },
            "series" => match metric_and_scope(args) {
                Some((metric, scope)) => console.series(metric, scope).await,
                None => println!("Usage: series <metric> [scope]"),
            },
            "search" if !args.trim().is_empty() => console.search(args.trim()).await,
            "search" => println!("Usage: search <text>"),
            other => println!("Unknown command '{}'", other),
        }
    }

    alerts.close();
    console.close();
    // Let the deferred channel closes run before the runtime goes away.
    tokio::time::sleep(config.close_grace).await;
    println!("\n👋 Goodbye!\n");
    Ok(())
}
