use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;

use plank_core::change::ChangeEntry;
use plank_engine::NotificationFanout;
use plank_store::notifications::NotificationRepo;
use plank_store::Database;
use plank_telemetry::{init_telemetry, TelemetryConfig};

/// Board ordering and real-time synchronization server.
#[derive(Parser)]
#[command(name = "plank", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9272)]
    port: u16,

    /// Database file. Defaults to ~/.plank/database/plank.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Default log level (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    let telemetry = init_telemetry(TelemetryConfig {
        log_level,
        ..Default::default()
    });

    tracing::info!("starting plank server");

    let db_path = args
        .db
        .unwrap_or_else(|| dirs_home().join(".plank").join("database").join("plank.db"));
    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    // Every accepted mutation flows through this channel: the broadcaster
    // fans it out to subscribed sessions, the fanout derives notifications.
    let (change_tx, _) = broadcast::channel::<ChangeEntry>(1024);

    let config = plank_server::ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = match telemetry.logs() {
        Some(logs) => {
            plank_server::start_with_telemetry(config, db.clone(), change_tx.clone(), logs)
                .await
                .expect("failed to start server")
        }
        None => plank_server::start(config, db.clone(), change_tx.clone())
            .await
            .expect("failed to start server"),
    };

    // Notifications deliver through the server's client registry
    let channel: Arc<dyn plank_engine::NotificationChannel> = handle.registry.clone();
    let fanout = Arc::new(NotificationFanout::new(
        NotificationRepo::new(db),
        channel,
    ));
    let _fanout_task = fanout.start(change_tx.subscribe());

    tracing::info!(port = handle.port, "plank ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
