//! `switchyard`: loads route definitions, sends bodies through one route,
//! and prints what comes out.
//!
//! ```text
//! switchyard --routes routes.json --route orders --body '{"id": 1}' --body '{"id": 2}'
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use switchyard_core::{Exchange, TypeConverterRegistry};
use switchyard_engine::{EngineConfig, EngineError, RoutingEngine};
use tower::ServiceExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about = "Route message bodies through a Switchyard route")]
struct Args {
    /// JSON file with route definitions.
    #[arg(long, env = "SWITCHYARD_ROUTES")]
    routes: PathBuf,

    /// Route to send bodies to.
    #[arg(long, env = "SWITCHYARD_ROUTE")]
    route: String,

    /// Message body; repeat to send several in order.
    #[arg(long = "body", required = true)]
    bodies: Vec<String>,

    /// Engine option as `name=value`, e.g. `exchangeTimeoutMs=500`.
    #[arg(long = "set", value_parser = parse_option)]
    options: Vec<(String, String)>,

    #[arg(long, env = "SWITCHYARD_MAX_CONCURRENT_EXCHANGES")]
    max_concurrent_exchanges: Option<u32>,

    #[arg(long, env = "SWITCHYARD_SHUTDOWN_TIMEOUT_MS")]
    shutdown_timeout_ms: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SWITCHYARD_JSON_LOGS")]
    json_logs: bool,
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn engine_config(args: &Args, converters: Arc<TypeConverterRegistry>) -> anyhow::Result<EngineConfig> {
    let mut options: BTreeMap<String, String> = args.options.iter().cloned().collect();
    if let Some(n) = args.max_concurrent_exchanges {
        options.insert("maxConcurrentExchanges".to_string(), n.to_string());
    }
    if let Some(ms) = args.shutdown_timeout_ms {
        options.insert("shutdownTimeoutMs".to_string(), ms.to_string());
    }
    EngineConfig::from_options(&options, converters).context("invalid engine option")
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let converters = Arc::new(TypeConverterRegistry::default());
    let config = engine_config(&args, Arc::clone(&converters))?;
    let engine = RoutingEngine::builder()
        .config(config)
        .converters(converters)
        .build();

    let ids = engine
        .load_routes_file(&args.routes)
        .with_context(|| format!("cannot load {}", args.routes.display()))?;
    info!(routes = ?ids, "routes loaded");
    engine.start().await?;

    let service = engine.route_service(&args.route)?;
    let mut all_ok = true;
    for body in args.bodies {
        let exchange = engine.create_exchange_with_body(body);
        match service.clone().oneshot(exchange).await {
            Ok(done) => println!("{}", render(&done)),
            Err(e) => {
                all_ok = false;
                report(&e);
            }
        }
    }

    engine.stop().await?;
    Ok(all_ok)
}

fn render(exchange: &Exchange) -> String {
    match exchange.body() {
        None => String::new(),
        Some(body) => exchange
            .body_as::<String>()
            .unwrap_or_else(|_| format!("<{}>", body.type_key())),
    }
}

fn report(error: &EngineError) {
    match error.route_error() {
        Some(cause) => eprintln!("failed ({}): {cause}", cause.kind().as_str()),
        None => eprintln!("failed: {error}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.json_logs);
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = %format!("{e:#}"), "switchyard failed");
            ExitCode::from(2)
        }
    }
}
