use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use innkeep::compactor;
use innkeep::config::Config;
use innkeep::engine::{Engine, EngineSettings};
use innkeep::notify::NotifyHub;

#[derive(Debug, Parser)]
#[command(name = "innkeep")]
#[command(about = "Room availability, booking allocation and front-desk board")]
struct Args {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Board status of every active room
    Status {
        /// Day to show (default today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Rebuild and print one month of the calendar
    Calendar {
        /// Month as YYYY-MM
        #[arg(long)]
        month: String,
    },
    /// Check whether a room is free for a stay
    Availability {
        /// Room number
        #[arg(long)]
        room: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Rewrite the WAL as a snapshot
    Compact,
    /// Keep the store open: export metrics and compact in the background
    Serve,
}

fn parse_month(raw: &str) -> Option<(i32, u32)> {
    let (year, month) = raw.trim().split_once('-')?;
    Some((year.parse().ok()?, month.parse().ok()?))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    innkeep::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let settings = EngineSettings {
        default_check_in_time: config.default_check_in_time.clone(),
        lock_timeout: config.lock_timeout,
        ..EngineSettings::default()
    };
    let engine = Arc::new(Engine::open(config.wal_path(), Arc::new(NotifyHub::new()), settings)?);

    match args.command {
        Command::Status { date } => {
            let board = engine.display_board(date).await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&board)?);
            } else {
                for room in &board {
                    let cleaning = room.cleaning.as_ref().map_or("", |c| c.label.as_str());
                    let marker = if room.degraded { " (degraded)" } else { "" };
                    println!("{:<8} {:<20} {cleaning}{marker}", room.room_number, room.status.code());
                }
            }
        }
        Command::Calendar { month } => {
            let (year, month) = parse_month(&month).ok_or("month must be YYYY-MM")?;
            let written = engine.regenerate_for_month(year, month).await?;
            let calendar = engine.month_calendar(year, month).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&calendar)?);
            } else {
                println!("{year}-{month:02}: {written} rows");
                for (room, rows) in &calendar {
                    let days: Vec<String> = rows
                        .iter()
                        .map(|r| format!("{}={}", r.date.format("%d"), r.status.as_str()))
                        .collect();
                    println!("{room:<8} {}", days.join(" "));
                }
            }
        }
        Command::Availability { room, from, to } => {
            let found = engine
                .room_by_number(&room)
                .await
                .ok_or_else(|| format!("no room numbered {room}"))?;
            let free = engine.is_room_available(found.id, from, to, None).await;
            if args.json {
                println!("{}", serde_json::json!({ "room": room, "from": from, "to": to, "available": free }));
            } else {
                println!("room {room} {from}..{to}: {}", if free { "available" } else { "taken" });
            }
        }
        Command::Compact => {
            let units = engine.compact_wal().await?;
            info!("WAL rewritten as {units} units");
        }
        Command::Serve => {
            info!("innkeep serving property {}", config.property);
            info!("  wal: {}", config.wal_path().display());
            info!("  compact threshold: {}", config.compact_threshold);
            info!("  lock timeout: {:?}", config.lock_timeout);
            let compactor = tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));
            shutdown_signal().await;
            info!("shutdown signal received");
            compactor.abort();
        }
    }
    Ok(())
}
