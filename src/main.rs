use carbridge::bridge::{BridgeEngine, Supervisor, TopicNamer};
use carbridge::config::{Config, Settings};
use carbridge::model::{Model, MemoryModel};
use carbridge::mqtt::{BrokerClient, ConnectionState, MqttHandler, QoS};
use color_eyre::{eyre::eyre, Result};
use rumqttc::LastWill;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let arg = std::env::args().nth(1);
    let path = Config::locate(arg.as_deref())?;
    let settings = Config::load(&path)
        .await?
        .validate()
        .map_err(|e| eyre!("Invalid configuration in {}: {}", path.display(), e))?;
    setup_logging_env(&settings.log_level);
    info!("Configuration loaded from {}", path.display());

    let model = Arc::new(
        MemoryModel::from_seeds(settings.elements.clone())
            .map_err(|e| eyre!("Failed to seed model: {}", e))?,
    );
    info!("Model seeded with {} elements", model.get_all_elements().len());

    let handler = Arc::new(
        MqttHandler::new(&settings.mqtt, last_will(&settings))
            .map_err(|e| eyre!("Failed to create MQTT client: {}", e))?,
    );
    let broker: Arc<dyn BrokerClient> = handler.clone();
    let engine = BridgeEngine::new(model, broker, settings.bridge.clone());

    let supervisor = Supervisor::create(engine, handler)
        .start()
        .map_err(|e| eyre!("Failed to start connection supervisor: {}", e))?;

    info!("Connecting to MQTT-Server {}", settings.mqtt.address());
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    supervisor.shutdown().await;
    Ok(())
}

/// The broker publishes `DISCONNECTED` on our status topic if we vanish.
fn last_will(settings: &Settings) -> LastWill {
    let namer = TopicNamer::new(
        settings.bridge.prefix.clone(),
        settings.bridge.plugin_id.clone(),
        settings.bridge.topic_format,
        None,
    );
    LastWill::new(
        namer.status_topic(),
        ConnectionState::Disconnected.as_str(),
        QoS::AtLeastOnce,
        true,
    )
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(configured: &str) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", configured)
    }
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|l| Level::from_str(&l).ok())
        .unwrap_or(Level::INFO);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
