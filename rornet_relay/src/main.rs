// CLI entry point for the RoRnet relay.
//
// Starts a standalone server that RoRnet clients connect to. Settings come
// from an optional JSON file, then command-line flags override them. See
// `server.rs` for the networking architecture and `registry.rs` for the peer
// table.
//
// Usage:
//   relay [OPTIONS]
//     --config <FILE>         JSON settings file
//     --bind <ADDR>           Listen address (default: 127.0.0.1)
//     --port <PORT>           Listen port (default: 12000)
//     --name <NAME>           Server name
//     --terrain <NAME>        Terrain clients must load
//     --password <PASS>       Server password (optional)
//     --max-players <N>       Max players (default: 16)
//     --verbose, -v           Debug logging
//
// RUST_LOG overrides the log filter.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rornet_relay::config::RelayConfig;
use rornet_relay::server::start_relay;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Args {
    config_file: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
    name: Option<String>,
    terrain: Option<String>,
    password: Option<String>,
    max_players: Option<usize>,
    verbose: bool,
}

fn main() {
    let args = parse_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!(
        name = %config.server_name,
        terrain = %config.terrain,
        max_players = config.max_players,
        passworded = config.password.is_some(),
        "starting relay"
    );

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Relay listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // The process exits on SIGINT/SIGTERM; the loop only ends if something
    // clears the flag.
    let running = Arc::new(AtomicBool::new(true));
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    handle.stop();
}

/// File settings first, then flags on top.
fn build_config(args: Args) -> Result<RelayConfig, rornet_relay::ConfigError> {
    let mut config = match &args.config_file {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(name) = args.name {
        config.server_name = name;
    }
    if let Some(terrain) = args.terrain {
        config.terrain = terrain;
    }
    if args.password.is_some() {
        config.password = args.password;
    }
    if let Some(max_players) = args.max_players {
        config.max_players = max_players;
    }
    Ok(config)
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching.
fn parse_args() -> Args {
    let mut parsed = Args::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                parsed.config_file = Some(PathBuf::from(value(&args, i, "--config")));
            }
            "--bind" => {
                i += 1;
                parsed.bind = Some(value(&args, i, "--bind"));
            }
            "--port" => {
                i += 1;
                parsed.port = Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                }));
            }
            "--name" => {
                i += 1;
                parsed.name = Some(value(&args, i, "--name"));
            }
            "--terrain" => {
                i += 1;
                parsed.terrain = Some(value(&args, i, "--terrain"));
            }
            "--password" => {
                i += 1;
                parsed.password = Some(value(&args, i, "--password"));
            }
            "--max-players" => {
                i += 1;
                parsed.max_players =
                    Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--max-players requires a valid number");
                        std::process::exit(1);
                    }));
            }
            "--verbose" | "-v" => parsed.verbose = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <FILE>         JSON settings file");
    println!("  --bind <ADDR>           Listen address (default: 127.0.0.1)");
    println!("  --port <PORT>           Listen port (default: 12000)");
    println!("  --name <NAME>           Server name");
    println!("  --terrain <NAME>        Terrain clients must load");
    println!("  --password <PASS>       Server password (optional)");
    println!("  --max-players <N>       Max players (default: 16)");
    println!("  --verbose, -v           Debug logging");
    println!("  --help, -h              Show this help");
}
