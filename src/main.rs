// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rand::Rng;

use fs2::FileExt;
use std::env;
use std::fs;
use std::fs::File;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use seedgate::config::{self, load_settings, reloaded_settings, save_settings, Settings};
use seedgate::resource_manager::{ResourceLimits, ResourceManager};
use seedgate::server::Server;
use seedgate::storage::Library;
use seedgate::upload::UploadManager;

use notify::{RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{event, Level};
use tracing_appender::rolling;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    /// Listen on this port instead of the configured one.
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a file to the shared set.
    Share { path: PathBuf },
    /// Print the effective settings.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let base_data_dir = data_dir();
    let log_dir = base_data_dir.join("logs");
    let general_log = rolling::never(&log_dir, "seedgate.log");
    let (non_blocking_general, _guard_general) = tracing_appender::non_blocking(general_log);
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    // Without a log directory only the console layer is installed.
    let general_layer = fs::create_dir_all(&log_dir).is_ok().then(|| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_general)
            .with_filter(level)
    });
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(level);
    let _subscriber_result = tracing_subscriber::registry()
        .with(general_layer)
        .with(console_layer)
        .try_init();

    let mut settings = load_settings();

    if let Some(command) = cli.command {
        match command {
            Commands::Share { path } => {
                let absolute_path = fs::canonicalize(&path)?;
                if !settings.shared_files.contains(&absolute_path) {
                    settings.shared_files.push(absolute_path.clone());
                    save_settings(&settings)?;
                }
                println!("Sharing {}", absolute_path.display());
            }
            Commands::ShowConfig => {
                println!("{}", toml::to_string_pretty(&settings)?);
            }
        }
        return Ok(());
    }

    let mut _lock_file_handle: Option<File> = None;
    let lock_path = base_data_dir.join("seedgate.lock");
    if fs::create_dir_all(&base_data_dir).is_ok() {
        if let Ok(file) = File::create(&lock_path) {
            if file.try_lock_exclusive().is_err() {
                println!("seedgate is already running.");
                return Ok(());
            }
            _lock_file_handle = Some(file);
        }
    }

    if settings.client_id.is_empty() {
        settings.client_id = generate_client_id_string();
        if let Err(e) = save_settings(&settings) {
            event!(Level::WARN, error = %e, "Could not persist the generated client id");
        }
    }
    if let Some(port) = cli.port {
        settings.client_port = port;
    }

    run(settings).await
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let library = Arc::new(Library::load(&settings.shared_files).await);
    if library.is_empty() {
        event!(Level::WARN, "Nothing is shared; add files with `seedgate share <path>`");
    }

    let (resource_manager, resources) = ResourceManager::new(ResourceLimits {
        max_connections: settings.max_connections,
        disk_read_permits: settings.disk_read_permits,
    });
    tokio::spawn(resource_manager.run());

    let manager = Arc::new(UploadManager::new(&settings, library, resources.clone()));
    spawn_settings_watcher(manager.clone());
    spawn_status_reporter(manager.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.client_port));
    let server = Server::bind(addr, manager.clone(), resources).await?;
    event!(
        Level::INFO,
        addr = %server.local_addr()?,
        client_id = %settings.client_id,
        "Serving uploads"
    );

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                event!(Level::ERROR, error = %e, "Failed to listen for ctrl-c");
            }
        })
        .await;

    for (name, value) in manager.stats().snapshot() {
        event!(Level::INFO, stat = name, value, "Upload statistics");
    }
    Ok(())
}

/// Applies edits to the settings file without a restart. Shared files and
/// the listening port are read once at startup.
fn spawn_settings_watcher(manager: Arc<UploadManager>) {
    let path = match config::settings_path() {
        Ok(path) => path,
        Err(e) => {
            event!(Level::WARN, error = %e, "Settings will not be reloaded");
            return;
        }
    };
    let Some(dir) = path.parent().map(PathBuf::from) else {
        return;
    };
    if let Err(e) = fs::create_dir_all(&dir) {
        event!(Level::WARN, error = %e, "Settings will not be reloaded");
        return;
    }

    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel(10);
        let event_handler = move |res: DebounceEventResult| {
            if let Err(e) = tx.blocking_send(res) {
                event!(Level::ERROR, "Failed to send debouncer event: {}", e);
            }
        };
        let mut debouncer = match new_debouncer(Duration::from_secs(2), None, event_handler) {
            Ok(debouncer) => debouncer,
            Err(e) => {
                event!(Level::WARN, error = %e, "Could not watch the settings file");
                return;
            }
        };
        if let Err(e) = debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive) {
            event!(Level::WARN, error = %e, "Could not watch the settings file");
            return;
        }

        while let Some(res) = rx.recv().await {
            let Ok(events) = res else {
                continue;
            };
            let touched = events.iter().any(|event| {
                (event.kind.is_create() || event.kind.is_modify())
                    && event.paths.iter().any(|p| p == &path)
            });
            if !touched {
                continue;
            }
            if let Some(settings) = reloaded_settings(&manager.settings(), load_settings()) {
                manager.apply_settings(&settings);
            }
        }
    });
}

fn spawn_status_reporter(manager: Arc<UploadManager>) {
    tokio::spawn(async move {
        let mut status_interval = time::interval(Duration::from_secs(60));
        status_interval.tick().await;
        loop {
            status_interval.tick().await;
            let slots = manager.slots();
            event!(
                Level::INFO,
                active = slots.num_active(),
                queued = slots.num_queued(),
                accepting = slots.has_http_slot(),
                bandwidth = slots.measured_bandwidth(),
                "Upload status"
            );
        }
    });
}

fn data_dir() -> PathBuf {
    config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn generate_client_id_string() -> String {
    const CLIENT_PREFIX: &str = "-SG0100-";
    const RANDOM_LEN: usize = 12;

    let mut rng = rand::rng();
    let random_chars: String = (0..RANDOM_LEN)
        .map(|_| {
            const CHARSET: &[u8] =
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{}{}", CLIENT_PREFIX, random_chars)
}
