//! Plan a single route from the command line.
//!
//! Usage:
//!   cargo run -p skylane-server --bin plan_route -- --request request.json
//!   cargo run -p skylane-server --bin plan_route -- --start 0,0 --end 2,0 \
//!       --circle 1,0,500 --width 50
//!   cargo run -p skylane-server --bin plan_route -- --demo --offline

use anyhow::{bail, Context, Result};
use clap::Parser;
use skylane_core::{plan_route, Coordinate, RouteEngineConfig, RouteRequest, Zone};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skylane_server::config::Config;
use skylane_server::route_planner::RouteEngine;
use skylane_server::terrain::{ElevationConfig, ElevationService};
use skylane_server::tiles::HttpTileSource;

#[derive(Parser, Debug)]
#[command(author, version, about = "Plan a corridor route around no-fly zones")]
struct Args {
    /// JSON request body, as accepted by POST /v1/routes/plan
    #[arg(long, conflicts_with_all = ["start", "demo"])]
    request: Option<PathBuf>,

    /// Start as lon,lat
    #[arg(long, value_delimiter = ',', num_args = 2, allow_hyphen_values = true)]
    start: Option<Vec<f64>>,

    /// End as lon,lat
    #[arg(long, value_delimiter = ',', num_args = 2, allow_hyphen_values = true)]
    end: Option<Vec<f64>>,

    /// Circular no-fly zone as lon,lat,radius_m (repeatable)
    #[arg(long, value_delimiter = ',', num_args = 3, allow_hyphen_values = true, action = clap::ArgAction::Append)]
    circle: Vec<f64>,

    /// Corridor width in meters
    #[arg(long, default_value_t = 0.0)]
    width: f64,

    /// Absolute altitude ceiling in meters
    #[arg(long)]
    max_altitude: Option<f64>,

    /// Route [0,0] -> [2,0] around a 0.5 m circle at [1,0]
    #[arg(long)]
    demo: bool,

    /// Skip terrain and plan geometry-only
    #[arg(long)]
    offline: bool,

    /// Pretty-print the result
    #[arg(long)]
    pretty: bool,
}

fn coordinate(values: &[f64], what: &str) -> Result<Coordinate> {
    match values {
        [lon, lat] => Ok(Coordinate::new(*lon, *lat)),
        _ => bail!("{what} needs exactly lon,lat"),
    }
}

fn build_request(args: &Args) -> Result<RouteRequest> {
    if let Some(path) = &args.request {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&body).with_context(|| format!("parsing {}", path.display()));
    }
    if args.demo {
        let zone = Zone::circle(Coordinate::new(1.0, 0.0), 0.5, 16);
        return Ok(RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(2.0, 0.0),
            vec![zone],
            0.0,
        ));
    }

    let (Some(start), Some(end)) = (&args.start, &args.end) else {
        bail!("pass --request, --demo, or both --start and --end");
    };
    if args.circle.len() % 3 != 0 {
        bail!("--circle takes lon,lat,radius_m");
    }
    let zones = args
        .circle
        .chunks_exact(3)
        .map(|c| Zone::circle(Coordinate::new(c[0], c[1]), c[2], 32))
        .collect();
    let mut request = RouteRequest::new(
        coordinate(start, "--start")?,
        coordinate(end, "--end")?,
        zones,
        args.width,
    );
    request.max_altitude = args.max_altitude;
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("skylane_server=info".parse()?))
        .init();

    let args = Args::parse();
    let request = build_request(&args)?;
    let started = Instant::now();

    let outcome = if args.offline {
        let no_terrain = |_: Coordinate| -> Option<f64> { None };
        let deadline = request
            .deadline_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        plan_route(&request, &RouteEngineConfig::default(), &no_terrain, false, deadline)?
    } else {
        let config = Config::from_env();
        let source = HttpTileSource::new(
            config.terrain_url.clone(),
            Some(config.terrain_key.clone()),
            Duration::from_secs(config.terrain_timeout_s),
        )?;
        let elevation = ElevationService::new(Arc::new(source), ElevationConfig::from(&config));
        let engine = RouteEngine::from_config(elevation.clone(), &config);
        let outcome = engine.plan(&request).await?;
        let stats = elevation.stats();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            fetches = stats.fetches,
            failures = stats.failures,
            "Terrain cache"
        );
        outcome
    };

    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Done");
    let output = if args.pretty {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string(&outcome)?
    };
    println!("{output}");
    Ok(())
}
