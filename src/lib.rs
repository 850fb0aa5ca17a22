pub mod battery;     // Status/Config records and the in-memory state store
pub mod calibration; // Per-battery sensor calibration and the cm<->raw transform
pub mod channels;    // Inter-component communication channels
pub mod config;      // Configuration management
pub mod coordinator; // The reconciliation engine
pub mod database;    // Status/config history persistence
pub mod directory;   // Battery <-> device/channel mapping
pub mod error;       // Protocol error taxonomy
pub mod mqtt;        // MQTT client and messaging
pub mod options;     // Command line options parsing
pub mod packet;      // Binary uplink/downlink codec
pub mod prelude;     // Common imports and types
pub mod ttn;         // Network-server JSON envelopes

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::coordinator::Stats;
use crate::prelude::*;
use std::io::Write;
use std::sync::Mutex;

/// Initialize and run every component, then block until the shutdown
/// signal fires. The database is connected, migrated and drained into
/// the battery store before the coordinator or the MQTT client start:
/// no live frame is processed against incomplete state.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let options = Options::new();
    let config = config::Config::new(options.config_file)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.loglevel()),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "[{} {} {}] {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.module_path().unwrap_or(""),
            record.args()
        )
    })
    .write_style(env_logger::WriteStyle::Never)
    .init();

    info!("battery-bridge {} starting", CARGO_PKG_VERSION);
    info!(
        "  devices: {}, batteries: {}",
        config.devices().len(),
        config.devices().values().map(Vec::len).sum::<usize>()
    );
    info!("  mqtt: {}:{}", config.mqtt().host(), config.mqtt().port());
    info!("  database: {}", config.database().url());

    let config = Arc::new(config);
    let channels = Channels::new();
    let stats = Arc::new(Mutex::new(Stats::default()));

    let directory = Arc::new(DeviceDirectory::new(config.devices())?);
    let batteries = directory.batteries();

    let calibrations = Arc::new(Calibrations::load(config.calibration_file(), &batteries)?);

    info!("initializing database");
    let database = Database::new(config.database().clone(), channels.clone(), stats.clone());
    database.connect().await?;
    database.migrate().await?;

    let store = Arc::new(database.hydrate(&batteries).await?);
    info!("hydrated startup state for {} batteries", store.len());

    let coordinator = Coordinator::new(
        config.clone(),
        channels.clone(),
        store,
        directory,
        calibrations,
        stats.clone(),
    );
    let mqtt = mqtt::Mqtt::new(config.clone(), channels.clone(), stats.clone());

    let database_clone = database.clone();
    let database_handle = tokio::spawn(async move {
        if let Err(e) = database_clone.start().await {
            error!("database task failed: {}", e);
        }
    });

    let coordinator_clone = coordinator.clone();
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator_clone.start().await {
            error!("coordinator task failed: {}", e);
        }
    });

    let mqtt_clone = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_clone.start().await {
            error!("mqtt task failed: {}", e);
        }
    });

    let _ = shutdown_rx.recv().await;
    info!("shutdown signal received, stopping components");

    coordinator.stop();
    let _ = mqtt.stop().await;
    database.stop();

    if let Err(e) = coordinator_handle.await {
        error!("error waiting for coordinator task: {}", e);
    }
    if let Err(e) = database_handle.await {
        error!("error waiting for database task: {}", e);
    }
    // the mqtt receiver polls the broker until the process ends
    mqtt_handle.abort();

    info!("shutdown complete");
    Ok(())
}

/// Entry point: install the ctrl-c handler and run the application.
pub async fn run() -> Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {}", e);
        }
        let _ = shutdown_tx_clone.send(());
    });

    app(shutdown_rx).await
}
