// src/main.rs

//! The main entry point for the resql server binary.

use anyhow::Result;
use resql::config::Config;
use resql::server;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

fn usage() -> ! {
    eprintln!(
        "usage: resql [--config <file>] [--version] [-e|--empty] [-w|--wipe]\n\
         \x20      [--node-name=] [--node-bind-url=] [--node-advertise-url=]\n\
         \x20      [--node-source-addr=] [--node-source-port=] [--node-log-level=]\n\
         \x20      [--node-log-destination=] [--node-directory=] [--node-in-memory=]\n\
         \x20      [--cluster-name=] [--cluster-nodes=]\n\
         \x20      [--advanced-heartbeat=] [--advanced-fsync=] [--advanced-session-timeout=]"
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version") {
        println!("resql version {VERSION}");
        return Ok(());
    }

    // A config file is optional; defaults describe a single local node.
    let mut config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let Some(path) = args.get(i + 1) else { usage() };
            match Config::from_file(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => Config::default(),
    };

    let mut empty = false;
    let mut wipe = false;

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                iter.next();
            }
            "-e" | "--empty" => empty = true,
            "-w" | "--wipe" => wipe = true,
            _ => {
                let Some(rest) = arg.strip_prefix("--") else {
                    usage()
                };
                let Some((key, value)) = rest.split_once('=') else {
                    usage()
                };
                if let Err(e) = config.apply_cmdline(key, value) {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
    }

    if wipe || empty {
        let dir = PathBuf::from(&config.node.directory);
        if dir.exists() {
            server::wipe_dir(&dir)?;
        }
        if wipe {
            println!("wiped {}", dir.display());
            return Ok(());
        }
    }

    // RUST_LOG wins over the configured level.
    let level = env::var("RUST_LOG").unwrap_or_else(|_| config.node.log_level.to_lowercase());
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .compact();

    if config.node.log_destination == "file" {
        let dir = PathBuf::from(&config.node.directory);
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("resql.log"))?;
        fmt.with_ansi(false).with_writer(std::sync::Arc::new(file)).init();
    } else {
        fmt.with_ansi(true).init();
    }

    server::run(config).await
}
