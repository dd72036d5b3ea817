use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_max_reconnects: u32,
    pub mqtt_reconnect_delay_secs: u64,

    pub environment: String,

    pub heartbeat_url: Option<String>,
    pub heartbeat_interval_secs: u64,

    pub dry_run: bool,

    pub management_api_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env_string("DATABASE_URL", None)?;
        let db_pool_size = env_u64("INGEST_DB_POOL_SIZE", Some(5))? as u32;

        let mqtt_host = env_string("MQTT_HOST", Some("127.0.0.1".to_string()))?;
        let mqtt_port = env_u64("MQTT_PORT", Some(1883))? as u16;
        let mqtt_username = env_optional("MQTT_USERNAME");
        let mqtt_password = env_optional("MQTT_PASSWORD");
        let mqtt_client_id = env_string(
            "MQTT_CLIENT_ID",
            Some(format!("fleet-ingest-{}", std::process::id())),
        )?;
        let mqtt_keepalive_secs = env_u64("MQTT_KEEPALIVE_SECS", Some(60))?;
        let mqtt_max_reconnects = env_u64("MQTT_MAX_RECONNECTS", Some(10))? as u32;
        let mqtt_reconnect_delay_secs = env_u64("MQTT_RECONNECT_DELAY_SECS", Some(5))?;

        let environment = env_string("MQTT_ENV", Some("production".to_string()))?;

        let heartbeat_url = env_optional("HEARTBEAT_URL");
        let heartbeat_interval_secs = env_u64("HEARTBEAT_INTERVAL_SECS", Some(60))?;

        let dry_run = env::var("INGEST_DRY_RUN")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let management_api_url = env_optional("MANAGEMENT_API_URL");

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            mqtt_max_reconnects,
            mqtt_reconnect_delay_secs,
            environment,
            heartbeat_url,
            heartbeat_interval_secs,
            dry_run,
            management_api_url,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.mqtt_reconnect_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
