mod db;


use crate::device::{self, DeviceClass, DeviceTarget};
use crate::heartbeat::HeartbeatReporter;
use crate::message::{self, InboundMessage};
use crate::schema::{is_safe_identifier, SchemaCache};
use anyhow::{Context, Result};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Short wake so the heartbeat check stays live through quiet stretches.
const HEARTBEAT_POLL: Duration = Duration::from_secs(5);

const UNDEFINED_COLUMN: &str = "42703";

/// Store-side failures the drain loop can act on. Anything that is not a
/// missing attribute column is fatal to the process.
#[derive(Debug, Error)]
enum WriteError {
    #[error("state table has no column for attribute {0:?}")]
    MissingColumn(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a message does to the device state table, decided before the
/// transaction opens.
enum StatePlan {
    Update(DeviceClass),
    Insert(DeviceClass),
    Skip,
}

/// The single writer. It alone issues SQL, which serializes column-adding
/// DDL with the row writes that depend on it.
pub struct StorageWriter {
    pool: PgPool,
    schema: SchemaCache,
    environment: String,
    dry_run: bool,
}

impl StorageWriter {
    pub async fn new(pool: PgPool, environment: String, dry_run: bool) -> Result<Self> {
        let schema = SchemaCache::load(&pool)
            .await
            .context("failed to load state table columns")?;
        Ok(Self {
            pool,
            schema,
            environment,
            dry_run,
        })
    }

    /// Drain the ingestion queue until it closes or a write fails.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<InboundMessage>,
        mut heartbeat: HeartbeatReporter,
    ) -> Result<()> {
        let mut ticker = interval(HEARTBEAT_POLL);
        loop {
            tokio::select! {
                _ = ticker.tick() => heartbeat.tick().await,
                received = rx.recv() => {
                    let Some(msg) = received else {
                        tracing::info!("ingestion queue closed; storage writer stopping");
                        return Ok(());
                    };
                    self.process(&msg).await?;
                    heartbeat.tick().await;
                }
            }
        }
    }

    /// One message, one commit. A missing attribute column rolls the write
    /// back, widens the schema in its own committed statement, and retries
    /// the write exactly once; any failure after that is fatal.
    pub(crate) async fn process(&mut self, msg: &InboundMessage) -> Result<()> {
        let attribute = message::attribute(&msg.topic).to_string();
        match self.write(msg, &attribute).await {
            Ok(()) => Ok(()),
            Err(WriteError::MissingColumn(column)) => {
                tracing::warn!(column = %column, topic = %msg.topic, "attribute column missing; widening state table");
                self.schema.create_column(&self.pool, &column).await?;
                self.write(msg, &attribute)
                    .await
                    .with_context(|| format!("write retry after creating column {column:?} failed"))
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to store message from topic {:?}", msg.topic)),
        }
    }

    async fn write(&mut self, msg: &InboundMessage, attribute: &str) -> Result<(), WriteError> {
        let plan = self.plan_state_write(msg, attribute).await?;

        // Cache miss means the column is genuinely new; widening here keeps
        // the undefined-column catch below for the race the cache loses.
        if !matches!(plan, StatePlan::Skip) && !self.dry_run && !self.schema.contains(attribute) {
            self.schema.ensure_column(&self.pool, attribute).await?;
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO mqtt (timestamp, imei, message, payload, crc, env, topic) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(msg.received_at)
        .bind(&msg.device_id)
        .bind(&msg.topic)
        .bind(&msg.payload)
        .bind(&msg.fingerprint)
        .bind(&self.environment)
        .bind(attribute)
        .execute(&mut *tx)
        .await?;

        match plan {
            StatePlan::Skip => {}
            StatePlan::Update(class) => {
                let sql = format!(
                    "UPDATE things SET {attribute} = $1, lastupdated = NOW() WHERE {key} = $2",
                    key = class.key_column()
                );
                if self.dry_run {
                    tracing::info!(sql = %sql, device = %msg.device_id, "dry run; state update skipped");
                } else {
                    sqlx::query(&sql)
                        .bind(&msg.payload)
                        .bind(&msg.device_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| classify_db_error(err, attribute))?;
                }
            }
            StatePlan::Insert(class) => {
                let sql = format!(
                    "INSERT INTO things ({key}, {attribute}, lastupdated, firstseen) \
                     VALUES ($1, $2, NOW(), NOW())",
                    key = class.key_column()
                );
                if self.dry_run {
                    tracing::info!(sql = %sql, device = %msg.device_id, "dry run; state insert skipped");
                } else {
                    sqlx::query(&sql)
                        .bind(&msg.device_id)
                        .bind(&msg.payload)
                        .execute(&mut *tx)
                        .await
                        .map_err(|err| classify_db_error(err, attribute))?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn plan_state_write(
        &self,
        msg: &InboundMessage,
        attribute: &str,
    ) -> Result<StatePlan, WriteError> {
        let target = self.resolve_device(&msg.device_id, attribute).await?;
        let plan = match target {
            DeviceTarget::Existing(class) => StatePlan::Update(class),
            DeviceTarget::New(_) if device::is_denylisted(attribute) => StatePlan::Skip,
            DeviceTarget::New(class) => StatePlan::Insert(class),
        };
        if !matches!(plan, StatePlan::Skip) && !is_safe_identifier(attribute) {
            tracing::warn!(
                topic = %msg.topic,
                attribute = %attribute,
                "attribute is not usable as a column name; event logged, state skipped"
            );
            return Ok(StatePlan::Skip);
        }
        Ok(plan)
    }
}

fn classify_db_error(err: sqlx::Error, attribute: &str) -> WriteError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNDEFINED_COLUMN) {
            return WriteError::MissingColumn(attribute.to_string());
        }
    }
    WriteError::Db(err)
}
