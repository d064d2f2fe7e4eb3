mod bot;
mod config;
mod platform;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bot::Router;
use crate::config::Config;
use crate::telemetry::{InfluxReader, MqttPublisher};

const DEFAULT_LOG_FILTER: &str = "info,smarthub_bot=debug";

fn init_logging() {
    // The service's own log level variable wins over RUST_LOG
    let filter = std::env::var(config::LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| EnvFilter::try_new(level.to_lowercase()).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting MDCSmartHub Telegram service");
    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Allowed chats: {:?}", config.telegram.allowed_chat_ids);
    info!("  Display timezone: {}", config.display_timezone);
    if let Some(level) = &config.log_level {
        info!("  Log level: {}", level);
    }

    let publisher = Arc::new(MqttPublisher::new(&config.mqtt));
    info!("  MQTT topic: {}", publisher.topic());
    let reader = Arc::new(InfluxReader::new(&config.influx));
    if !reader.is_enabled() {
        info!("Telemetry commands will reply with no data");
    }

    let router = Arc::new(Router::new(
        config.telegram.allowed_chat_ids.clone(),
        publisher,
        reader,
        config.display_timezone,
    ));

    let bot = teloxide::Bot::new(&config.telegram.bot_token);

    info!("Run main loop - wait for stop signal");
    platform::telegram::run(router, bot).await?;
    info!("Stopping main loop");

    Ok(())
}
