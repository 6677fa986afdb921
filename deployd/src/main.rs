//! deployd - Entry Point
//!
//! Fetches web application sources, runs their build commands and publishes
//! the output, tracking every step behind a local HTTP API.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info};

use deployd::app::options::AppOptions;
use deployd::app::run::run;
use deployd::filesys::file::File;
use deployd::logs::{init_logging, LogOptions};
use deployd::storage::layout::StorageLayout;
use deployd::storage::settings::Settings;
use deployd::utils::version_info;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    if let Err(e) = start(&cli_args).await {
        error!("Failed to run deployd: {:#}", e);
        eprintln!("deployd: {:#}", e);
        std::process::exit(1);
    }
}

async fn start(cli_args: &HashMap<String, String>) -> anyhow::Result<()> {
    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(PathBuf::from(path)),
        None => StorageLayout::default().settings_file(),
    };
    let settings = Settings::load(&settings_file)
        .await
        .with_context(|| format!("loading settings from {}", settings_file.path().display()))?;

    let mut options = AppOptions::from_settings(&settings);
    if let Some(host) = cli_args.get("host") {
        options.server.host = host.clone();
    }
    if let Some(port) = cli_args.get("port") {
        options.server.port = port
            .parse()
            .with_context(|| format!("invalid --port value: {}", port))?;
    }

    // Initialize logging
    let log_dir = settings
        .log_to_file
        .then(|| options.storage.layout.logs_dir().path().to_path_buf());
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
        log_dir,
        ..Default::default()
    };
    let _log_guard = init_logging(log_options).context("initializing logging")?;

    info!("Running deployd {} with options: {:?}", version_info().version, options);
    run(options, await_shutdown_signal())
        .await
        .context("running deploy service")?;
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
