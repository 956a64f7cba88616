//! `bustrack` - CLI for real-time bus tracking
//!
//! This binary runs in-process tracking simulations, follows a bus through an
//! external relay, and inspects routes and configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use bustrack::channel::{ConnectionManager, WebSocketTransport};
use bustrack::cli::{Cli, Command, ConfigCommand, RouteCommand, SimulateCommand, WatchCommand};
use bustrack::consumer::{LocationConsumer, PositionSource, TrackView};
use bustrack::routes::{RouteStopResolver, StaticDirectory};
use bustrack::simulation::{run_simulation, SimulationOptions, SimulationReport};
use bustrack::{init_logging, Config, TrackingSession};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Execute the command
    match cli.command {
        Command::Simulate(cmd) => handle_simulate(&load_config(cli.config)?, &cmd).await,
        Command::Watch(cmd) => handle_watch(&load_config(cli.config)?, &cmd).await,
        Command::Route(cmd) => handle_route(&load_config(cli.config)?, cmd).await,
        Command::Config(cmd) => handle_config(cli.config, cmd),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    Config::load_from(path).context("failed to load configuration")
}

fn directory(config: &Config) -> Result<Arc<StaticDirectory>> {
    let directory = StaticDirectory::from_config(&config.directory)
        .context("failed to load route directory")?;
    Ok(Arc::new(directory))
}

async fn handle_simulate(config: &Config, cmd: &SimulateCommand) -> Result<()> {
    let options = SimulationOptions {
        school_id: cmd.school.clone(),
        viewer_id: cmd.user.clone(),
        driver_id: cmd.driver.clone(),
        track_type: cmd.track_type.into(),
        steps: cmd.steps,
        step_interval: cmd.step_ms.map(Duration::from_millis),
        drop_pushes: cmd.drop_pushes,
    };

    let report = run_simulation(config, directory(config)?, &options)
        .await
        .context("simulation failed")?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!(
        "Route {} ({}), {} leg",
        report.route.route_id, report.route.route_name, report.track_type
    );
    println!("------------------------------------------------------------");
    println!("{:>4}  {:<24}  {:<24}  source", "step", "published", "displayed");
    for step in &report.steps {
        let displayed = step
            .displayed
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "{:>4}  {:<24}  {:<24}  {}",
            step.step,
            step.published.to_string(),
            displayed,
            source_label(step.source)
        );
    }
    println!();
    match report.final_view.position {
        Some(position) => println!(
            "Final:   {position} ({})",
            source_label(report.final_view.source)
        ),
        None => println!("Final:   no position"),
    }
    println!("Checks:  {}", report.checks);
    println!("Polls:   {}", report.requests);
}

async fn handle_watch(config: &Config, cmd: &WatchCommand) -> Result<()> {
    let mut connection = config.connection.clone();
    if let Some(relay) = &cmd.relay {
        connection.relay_url = Some(relay.clone());
    }
    let transport =
        WebSocketTransport::from_config(&connection).context("no relay to connect to")?;
    let manager = ConnectionManager::new(Arc::new(transport), connection);
    let resolver = RouteStopResolver::new(directory(config)?, &config.directory);

    let mut session = TrackingSession::viewer(
        cmd.school.clone(),
        cmd.user.clone(),
        resolver,
        manager,
        &config.tracking,
    )
    .with_track_type(cmd.track_type.into());
    session.start().await.context("failed to start tracking")?;

    let mut view = session
        .consumer()
        .map(LocationConsumer::watch_view)
        .ok_or_else(|| anyhow!("viewer session has no consumer"))?;
    let first = view.borrow_and_update().clone();
    print_view(&first, cmd.json)?;

    let deadline = async {
        match cmd.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                print_view(&snapshot, cmd.json)?;
            }
            _ = tokio::signal::ctrl_c() => break,
            () = &mut deadline => break,
        }
    }

    session.stop().await;
    Ok(())
}

fn print_view(view: &TrackView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(view)?);
        return Ok(());
    }
    let route = view.route.as_ref().map_or("-", |r| r.route_id.as_str());
    match view.position {
        Some(position) => println!(
            "{route} {}  {position}  ({})",
            view.track_type,
            source_label(view.source)
        ),
        None => println!("{route} {}  no position", view.track_type),
    }
    Ok(())
}

fn source_label(source: PositionSource) -> &'static str {
    match source {
        PositionSource::None => "none",
        PositionSource::Fallback => "fallback",
        PositionSource::Live => "live",
    }
}

async fn handle_route(config: &Config, cmd: RouteCommand) -> Result<()> {
    match cmd {
        RouteCommand::Show {
            route_id,
            school,
            json,
        } => {
            let resolver = RouteStopResolver::new(directory(config)?, &config.directory);
            let route = resolver
                .resolve(&route_id, &school)
                .await
                .with_context(|| format!("failed to resolve route {route_id}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&route)?);
            } else {
                println!("{} - {}", route.route_id, route.route_name);
                println!("=====================");
                println!("  Bus:     {}", route.bus_number);
                println!("  Driver:  {}", route.bus_driver);
                println!("  Contact: {}", route.bus_contact);
                println!();
                for (i, stop) in route.stops.iter().enumerate() {
                    println!(
                        "  {:>2}. {:<20} {:<8} {}",
                        i + 1,
                        stop.name,
                        stop.scheduled_time,
                        stop.position()
                    );
                }
            }
        }
    }
    Ok(())
}

fn handle_config(path: Option<PathBuf>, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = load_config(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Tracking]");
                println!("  Poll interval (ms):       {}", config.tracking.poll_interval_ms);
                println!(
                    "  Min update interval (ms): {}",
                    config.tracking.min_update_interval_ms
                );
                println!(
                    "  Min update distance (m):  {}",
                    config.tracking.min_update_distance_m
                );
                println!("  Ordering:                 {:?}", config.tracking.ordering);
                println!();
                println!("[Connection]");
                println!(
                    "  Backoff (ms):             {} - {}",
                    config.connection.initial_backoff_ms, config.connection.max_backoff_ms
                );
                println!("  Max attempts:             {}", config.connection.max_attempts);
                println!("  Send buffer:              {}", config.connection.send_buffer);
                println!(
                    "  Stable after (ms):        {}",
                    config.connection.stable_after_ms
                );
                match &config.connection.relay_url {
                    Some(url) => println!("  Relay:                    {url}"),
                    None => println!("  Relay:                    (not set)"),
                }
                println!();
                println!("[Directory]");
                match &config.directory.fixture_path {
                    Some(fixture) => println!("  Fixture:                  {}", fixture.display()),
                    None => println!("  Fixture:                  (built-in demo)"),
                }
                println!(
                    "  Request timeout (ms):     {}",
                    config.directory.request_timeout_ms
                );
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
