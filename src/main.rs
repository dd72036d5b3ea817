mod config;
mod device;
mod heartbeat;
mod management;
mod message;
mod mqtt;
mod schema;
mod writer;

use crate::config::Config;
use crate::heartbeat::HeartbeatReporter;
use crate::management::ManagementClient;
use crate::writer::StorageWriter;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinError;

#[derive(Parser)]
#[command(
    name = "fleet-ingest",
    about = "MQTT -> Postgres fleet telemetry ingest with dynamic device state"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingest pipeline (the default).
    Run,
    /// Out-of-band attribute maintenance through the device-management facade.
    Attr {
        #[command(subcommand)]
        action: AttrAction,
    },
    /// Look up a device key through the device-management facade.
    Find { device: String },
}

#[derive(Subcommand)]
enum AttrAction {
    Get {
        device: String,
        attribute: String,
    },
    Set {
        device: String,
        attribute: String,
        value: String,
    },
    Unset {
        device: String,
        attribute: String,
    },
}

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fleet_ingest=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_ingest(config).await,
        Command::Attr { action } => {
            let mut client = management_client(&config)?;
            match action {
                AttrAction::Get { device, attribute } => {
                    let value = client.attribute(&device, &attribute).await?;
                    println!("{value}");
                }
                AttrAction::Set {
                    device,
                    attribute,
                    value,
                } => {
                    client.set_attribute(&device, &attribute, &value).await?;
                    println!("ok");
                }
                AttrAction::Unset { device, attribute } => {
                    client.unset_attribute(&device, &attribute).await?;
                    println!("ok");
                }
            }
            Ok(())
        }
        Command::Find { device } => {
            let mut client = management_client(&config)?;
            match client.find_device(&device).await? {
                Some(key) => println!("{key}"),
                None => println!("not found"),
            }
            Ok(())
        }
    }
}

fn management_client(config: &Config) -> Result<ManagementClient> {
    let api_url = config
        .management_api_url
        .clone()
        .context("MANAGEMENT_API_URL is required for facade commands")?;
    // The facade shares credentials with the broker account.
    let username = config
        .mqtt_username
        .clone()
        .context("MQTT_USERNAME is required for facade commands")?;
    let password = config.mqtt_password.clone().unwrap_or_default();
    Ok(ManagementClient::new(api_url, username, password))
}

async fn run_ingest(config: Config) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let writer = StorageWriter::new(pool, config.environment.clone(), config.dry_run).await?;
    let heartbeat =
        HeartbeatReporter::new(config.heartbeat_url.clone(), config.heartbeat_interval());
    let (tx, rx) = mpsc::unbounded_channel();

    let mut writer_handle = tokio::spawn(writer.run(rx, heartbeat));
    let supervisor_config = config.clone();
    let mut supervisor_handle = tokio::spawn(mqtt::run_supervisor(supervisor_config, tx));

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        res = &mut writer_handle => {
            supervisor_handle.abort();
            flatten(res).context("storage writer failed")
        }
        res = &mut supervisor_handle => {
            match flatten(res) {
                // The only clean supervisor exit is a closed queue, so the
                // writer's own result carries the cause.
                Ok(()) => flatten(writer_handle.await).context("storage writer failed"),
                Err(err) => {
                    writer_handle.abort();
                    Err(err).context("broker supervisor failed")
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(signal = "SIGINT", "termination signal received; shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::info!(signal = "SIGTERM", "termination signal received; shutting down");
            Ok(())
        }
    }
}

fn flatten(res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(err) => Err(err.into()),
    }
}
