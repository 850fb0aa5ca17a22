use crate::prelude::*;
use crate::coordinator::Stats;

use chrono::{DateTime, Utc};
use sqlx::{any::AnyConnectOptions, Any, Executor, Pool, Row};
use std::sync::{Mutex, RwLock};

/// Reply slot for an appended config row's surrogate id. Wrapped the
/// same way the oneshot in a broadcast message always has to be.
pub type InsertReply = Arc<Mutex<Option<oneshot::Sender<i64>>>>;

#[derive(Clone, Debug)]
pub enum ChannelData {
    StatusRow(Box<Status>),
    ConfigRow(Box<Config>, InsertReply),
    AckConfig { id: i64, timestamp: DateTime<Utc> },
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

enum DatabaseType {
    MySQL,
    Postgres,
    SQLite,
}

#[derive(Clone)]
pub struct Database {
    config: config::Database,
    channels: Channels,
    stats: Arc<Mutex<Stats>>,
    pool: Arc<RwLock<Option<Pool<Any>>>>,
}

impl Database {
    pub fn new(config: config::Database, channels: Channels, stats: Arc<Mutex<Stats>>) -> Self {
        Self {
            config,
            channels,
            stats,
            pool: Arc::new(RwLock::new(None)),
        }
    }

    /// Connect, migrate and start draining the insert channel. `app()`
    /// connects and hydrates before spawning this, so the connection
    /// usually already exists.
    pub async fn start(&self) -> Result<()> {
        if self.connection().await.is_err() {
            self.connect().await?;
            self.migrate().await?;
        }

        futures::try_join!(self.inserter())?;

        info!("database loop exiting");

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_database.send(ChannelData::Shutdown);
    }

    fn database(&self) -> Result<DatabaseType> {
        let prefix: Vec<&str> = self.config.url().splitn(2, ':').collect();
        match prefix[0] {
            "sqlite" => Ok(DatabaseType::SQLite),
            "mysql" => Ok(DatabaseType::MySQL),
            "postgres" => Ok(DatabaseType::Postgres),
            _ => Err(anyhow!("unsupported database {}", self.config.url())),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        sqlx::any::install_default_drivers();

        let options = AnyConnectOptions::from_str(self.config.url())?;
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;

        *self
            .pool
            .write()
            .map_err(|_| anyhow!("failed to acquire pool write lock"))? = Some(pool);

        Ok(())
    }

    pub async fn connection(&self) -> Result<Pool<Any>> {
        match &*self
            .pool
            .read()
            .map_err(|_| anyhow!("failed to acquire pool read lock"))?
        {
            Some(pool) => Ok(pool.clone()),
            None => Err(anyhow!("database not connected")),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        use DatabaseType::*;

        let pool = self.connection().await?;

        // work out migration directory to use based on database url
        let migrator = match self.database()? {
            SQLite => sqlx::migrate!("db/migrations/sqlite"),
            MySQL => sqlx::migrate!("db/migrations/mysql"),
            Postgres => sqlx::migrate!("db/migrations/postgres"),
        };

        migrator.run(&pool).await?;

        Ok(())
    }

    /// Build the startup state: most recent status and config row per
    /// configured battery. Must finish before any live frame is
    /// processed.
    pub async fn hydrate(&self, batteries: &[String]) -> Result<BatteryStore> {
        let store = BatteryStore::new(batteries);

        for battery in batteries {
            let entry = store.entry(battery)?;
            let mut entry = entry.lock().await;
            entry.status = self.last_status(battery).await?;
            entry.config = self.last_config(battery).await?;
        }

        Ok(store)
    }

    async fn inserter(&self) -> Result<()> {
        let mut receiver = self.channels.to_database.subscribe();

        loop {
            use ChannelData::*;

            match receiver.recv().await? {
                Shutdown => break,
                StatusRow(status) => {
                    self.with_retries(|| self.insert_status(&status)).await;
                }
                ConfigRow(config, reply) => {
                    if let Some(id) = self.with_retries(|| self.insert_config(&config)).await {
                        if let Ok(mut tx) = reply.lock() {
                            if let Some(tx) = tx.take() {
                                let _ = tx.send(id);
                            }
                        }
                    }
                }
                AckConfig { id, timestamp } => {
                    self.with_retries(|| self.ack_config(id, timestamp)).await;
                }
            }
        }

        Ok(())
    }

    async fn with_retries<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = 1;

        for attempt in 1..=3 {
            match op().await {
                Ok(value) => {
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.database_writes += 1;
                    }
                    return Some(value);
                }
                Err(err) => {
                    error!("database write failed (attempt {}/3): {:?}", attempt, err);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.database_errors += 1;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    backoff *= 2;
                }
            }
        }

        None
    }

    async fn insert_status(&self, status: &Status) -> Result<()> {
        let query = format!(
            "INSERT INTO status ({}) VALUES ({})",
            Self::status_columns(),
            self.placeholders(35)?
        );

        let pool = self.connection().await?;
        let mut conn = pool.acquire().await?;

        let mut q = sqlx::query(&query)
            .bind(status.battery.clone())
            .bind(status.timestamp.to_rfc3339())
            .bind(status.panic as i64)
            .bind(status.manual_timeout as i64);
        for on in status.pump {
            q = q.bind(on as i64);
        }
        q = q
            .bind(status.target_flow as i64)
            .bind(status.flow_in as i64)
            .bind(status.flow_out as i64);
        for triple in [
            &status.current_level_raw,
            &status.target_level_raw,
            &status.min_level_raw,
            &status.max_level_raw,
        ] {
            for value in triple {
                q = q.bind(*value as i64);
            }
        }
        for triple in [
            &status.current_level,
            &status.target_level,
            &status.min_level,
            &status.max_level,
        ] {
            for value in triple {
                q = q.bind(*value);
            }
        }

        conn.execute(q.persistent(true)).await?;

        Ok(())
    }

    async fn insert_config(&self, config: &Config) -> Result<i64> {
        let query = format!(
            "INSERT INTO config ({}) VALUES ({})",
            Self::config_columns(),
            self.placeholders(28)?
        );

        let pool = self.connection().await?;
        let mut conn = pool.acquire().await?;

        let mut q = sqlx::query(&query)
            .bind(config.battery.clone())
            .bind(config.username.clone())
            .bind(config.timestamp.to_rfc3339())
            .bind(config.ack_timestamp.map(|ts| ts.to_rfc3339()))
            .bind(config.manual_timeout as i64);
        for on in config.pump {
            q = q.bind(on as i64);
        }
        q = q.bind(config.target_flow as i64);
        for triple in [&config.target_level, &config.min_level, &config.max_level] {
            for value in triple {
                q = q.bind(*value);
            }
        }
        for triple in [
            &config.target_level_raw,
            &config.min_level_raw,
            &config.max_level_raw,
        ] {
            for value in triple {
                q = q.bind(*value as i64);
            }
        }

        let result = conn.execute(q.persistent(true)).await?;

        match result.last_insert_id() {
            Some(id) => Ok(id),
            // postgres does not report one; the row we just wrote is
            // the most recent for this battery
            None => self.most_recent_config_id(&config.battery).await,
        }
    }

    async fn most_recent_config_id(&self, battery: &str) -> Result<i64> {
        let query = format!(
            "SELECT id FROM config WHERE battery = {} ORDER BY timestamp DESC LIMIT 1",
            self.placeholder(1)?
        );

        let pool = self.connection().await?;
        let row = sqlx::query(&query)
            .bind(battery.to_string())
            .fetch_one(&pool)
            .await?;

        Ok(row.try_get::<i64, _>("id")?)
    }

    async fn ack_config(&self, id: i64, timestamp: DateTime<Utc>) -> Result<()> {
        let query = format!(
            "UPDATE config SET ack_timestamp = {} WHERE id = {}",
            self.placeholder(1)?,
            self.placeholder(2)?
        );

        let pool = self.connection().await?;
        sqlx::query(&query)
            .bind(timestamp.to_rfc3339())
            .bind(id)
            .execute(&pool)
            .await?;

        Ok(())
    }

    pub async fn last_status(&self, battery: &str) -> Result<Option<Status>> {
        let query = format!(
            "SELECT * FROM status WHERE battery = {} ORDER BY timestamp DESC LIMIT 1",
            self.placeholder(1)?
        );

        let pool = self.connection().await?;
        let row = sqlx::query(&query)
            .bind(battery.to_string())
            .fetch_optional(&pool)
            .await?;

        row.map(|row| Self::row_to_status(&row)).transpose()
    }

    pub async fn last_config(&self, battery: &str) -> Result<Option<Config>> {
        let query = format!(
            "SELECT * FROM config WHERE battery = {} ORDER BY timestamp DESC LIMIT 1",
            self.placeholder(1)?
        );

        let pool = self.connection().await?;
        let row = sqlx::query(&query)
            .bind(battery.to_string())
            .fetch_optional(&pool)
            .await?;

        row.map(|row| Self::row_to_config(&row)).transpose()
    }

    fn row_to_status(row: &sqlx::any::AnyRow) -> Result<Status> {
        Ok(Status {
            battery: row.try_get("battery")?,
            timestamp: Self::parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
            panic: row.try_get::<i64, _>("panic")? != 0,
            manual_timeout: row.try_get::<i64, _>("manual_timeout")? as u16,
            pump: [
                row.try_get::<i64, _>("pump0")? != 0,
                row.try_get::<i64, _>("pump1")? != 0,
                row.try_get::<i64, _>("pump2")? != 0,
                row.try_get::<i64, _>("pump3")? != 0,
            ],
            target_flow: row.try_get::<i64, _>("target_flow")? as u8,
            flow_in: row.try_get::<i64, _>("flow_in")? as u8,
            flow_out: row.try_get::<i64, _>("flow_out")? as u8,
            current_level_raw: Self::raw_triple(row, "current_level_raw")?,
            target_level_raw: Self::raw_triple(row, "target_level_raw")?,
            min_level_raw: Self::raw_triple(row, "min_level_raw")?,
            max_level_raw: Self::raw_triple(row, "max_level_raw")?,
            current_level: Self::cm_triple(row, "current_level")?,
            target_level: Self::cm_triple(row, "target_level")?,
            min_level: Self::cm_triple(row, "min_level")?,
            max_level: Self::cm_triple(row, "max_level")?,
        })
    }

    fn row_to_config(row: &sqlx::any::AnyRow) -> Result<Config> {
        Ok(Config {
            id: Some(row.try_get::<i64, _>("id")?),
            battery: row.try_get("battery")?,
            username: row.try_get("username")?,
            timestamp: Self::parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
            ack_timestamp: row
                .try_get::<Option<String>, _>("ack_timestamp")?
                .map(|ts| Self::parse_timestamp(&ts))
                .transpose()?,
            manual_timeout: row.try_get::<i64, _>("manual_timeout")? as u16,
            pump: [
                row.try_get::<i64, _>("pump0")? != 0,
                row.try_get::<i64, _>("pump1")? != 0,
                row.try_get::<i64, _>("pump2")? != 0,
                row.try_get::<i64, _>("pump3")? != 0,
            ],
            target_flow: row.try_get::<i64, _>("target_flow")? as u8,
            target_level: Self::cm_triple(row, "target_level")?,
            min_level: Self::cm_triple(row, "min_level")?,
            max_level: Self::cm_triple(row, "max_level")?,
            target_level_raw: Self::raw_triple(row, "target_level_raw")?,
            min_level_raw: Self::raw_triple(row, "min_level_raw")?,
            max_level_raw: Self::raw_triple(row, "max_level_raw")?,
        })
    }

    fn raw_triple(row: &sqlx::any::AnyRow, prefix: &str) -> Result<[u8; 3]> {
        Ok([
            row.try_get::<i64, _>(format!("{}1", prefix).as_str())? as u8,
            row.try_get::<i64, _>(format!("{}2", prefix).as_str())? as u8,
            row.try_get::<i64, _>(format!("{}3", prefix).as_str())? as u8,
        ])
    }

    fn cm_triple(row: &sqlx::any::AnyRow, prefix: &str) -> Result<[f64; 3]> {
        Ok([
            row.try_get::<f64, _>(format!("{}1", prefix).as_str())?,
            row.try_get::<f64, _>(format!("{}2", prefix).as_str())?,
            row.try_get::<f64, _>(format!("{}3", prefix).as_str())?,
        ])
    }

    fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(value)
            .map_err(|err| anyhow!("bad timestamp {}: {}", value, err))?
            .with_timezone(&Utc))
    }

    fn placeholders(&self, count: usize) -> Result<String> {
        let marks: Vec<String> = (1..=count).map(|i| self.mark(i)).collect::<Result<_>>()?;
        Ok(marks.join(", "))
    }

    fn placeholder(&self, position: usize) -> Result<String> {
        self.mark(position)
    }

    fn mark(&self, position: usize) -> Result<String> {
        Ok(match self.database()? {
            DatabaseType::MySQL => "?".to_string(),
            _ => format!("${}", position),
        })
    }

    fn status_columns() -> &'static str {
        "battery, timestamp, panic, manual_timeout, pump0, pump1, pump2, pump3,
        target_flow, flow_in, flow_out,
        current_level_raw1, current_level_raw2, current_level_raw3,
        target_level_raw1, target_level_raw2, target_level_raw3,
        min_level_raw1, min_level_raw2, min_level_raw3,
        max_level_raw1, max_level_raw2, max_level_raw3,
        current_level1, current_level2, current_level3,
        target_level1, target_level2, target_level3,
        min_level1, min_level2, min_level3,
        max_level1, max_level2, max_level3"
    }

    fn config_columns() -> &'static str {
        "battery, username, timestamp, ack_timestamp, manual_timeout,
        pump0, pump1, pump2, pump3, target_flow,
        target_level1, target_level2, target_level3,
        min_level1, min_level2, min_level3,
        max_level1, max_level2, max_level3,
        target_level_raw1, target_level_raw2, target_level_raw3,
        min_level_raw1, min_level_raw2, min_level_raw3,
        max_level_raw1, max_level_raw2, max_level_raw3"
    }
}
