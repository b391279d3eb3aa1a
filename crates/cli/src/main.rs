//! The `rookd` server binary
//!
//! Parses the server flags (optionally merged over a TOML config file),
//! brings the database up, and serves an interactive JSON shell on stdin:
//! each line is one command body, dispatched exactly like a wire message.

mod json;

use clap::Parser;
use rook_core::{ClusterRole, OperationContext, ServerOptions, EXIT_CLEAN, EXIT_UNCAUGHT};
use rook_server::{CommandRequest, Database};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "rookd", about = "RookDB document database server")]
struct Args {
    /// Replica set name.
    #[arg(long = "replSet")]
    repl_set: Option<String>,

    /// Run as a shard server.
    #[arg(long = "shardsvr", conflicts_with = "configsvr")]
    shardsvr: bool,

    /// Run as a config server.
    #[arg(long = "configsvr")]
    configsvr: bool,

    /// Listen port.
    #[arg(long, default_value_t = 27017)]
    port: u16,

    /// Bind address.
    #[arg(long = "bind_ip", default_value = "127.0.0.1")]
    bind_ip: String,

    /// Data directory.
    #[arg(long = "dbpath", default_value = "/data/db")]
    dbpath: PathBuf,

    /// TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn options_from_args(args: &Args) -> Result<ServerOptions, String> {
    let mut options = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config {}: {}", path.display(), e))?;
            toml::from_str(&text).map_err(|e| format!("bad config file: {}", e))?
        }
        None => ServerOptions::default(),
    };
    options.repl_set = args.repl_set.clone().or(options.repl_set);
    options.port = args.port;
    options.bind_ip = args.bind_ip.clone();
    options.db_path = args.dbpath.clone();
    if args.shardsvr {
        options.cluster_role = ClusterRole::ShardServer;
    } else if args.configsvr {
        options.cluster_role = ClusterRole::ConfigServer;
    }
    Ok(options)
}

fn shell(db: &Database) -> std::io::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "rookdb shell: one JSON command body per line")?;
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == "quit" {
            break;
        }
        let response = match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(parsed) => match json::json_to_document(&parsed) {
                Some(body) => {
                    let name = body
                        .keys()
                        .next()
                        .unwrap_or("")
                        .to_string();
                    let request = CommandRequest {
                        name,
                        body,
                        sequences: Vec::new(),
                    };
                    let opctx = OperationContext::new();
                    rook_server::dispatch(db, &request, &opctx)
                }
                None => {
                    writeln!(stdout, "error: command must be a JSON object")?;
                    continue;
                }
            },
            Err(e) => {
                writeln!(stdout, "error: {}", e)?;
                continue;
            }
        };
        writeln!(stdout, "{}", json::document_to_json(&response))?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = match options_from_args(&args) {
        Ok(options) => options,
        Err(message) => {
            error!(target: "rook::server", %message, "bad configuration");
            std::process::exit(EXIT_UNCAUGHT);
        }
    };

    let db = match Database::open(options) {
        Ok(db) => db,
        Err(e) => {
            error!(target: "rook::server", error = %e, "startup failed");
            std::process::exit(EXIT_UNCAUGHT);
        }
    };
    info!(
        target: "rook::server",
        port = db.options().port,
        bind = %db.options().bind_ip,
        "rookd ready"
    );

    if let Err(e) = shell(&db) {
        error!(target: "rook::server", error = %e, "shell terminated");
        std::process::exit(EXIT_UNCAUGHT);
    }
    std::process::exit(EXIT_CLEAN);
}
