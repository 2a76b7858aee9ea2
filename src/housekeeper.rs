// housekeeper/src/housekeeper.rs
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backup::db_dump::{DatabaseConnection, PostgresConnection};
use crate::backup::BackupService;
use crate::config::Config;
use crate::health::{HealthServer, Readiness, State};

const DATABASE_WAIT: Duration = Duration::from_secs(60);

/// Ties configuration, database, backups and the readiness probe together.
pub struct Housekeeper {
    config: Config,
    database: Option<Arc<dyn DatabaseConnection>>,
    backup: BackupService,
    readiness: Readiness,
    health: Option<HealthServer>,
}

impl Housekeeper {
    pub fn new(config: Config) -> Result<Self> {
        let database = if config.has_database() {
            let connection = PostgresConnection::new(config.database.clone())
                .context("Invalid database configuration")?;
            Some(Arc::new(connection) as Arc<dyn DatabaseConnection>)
        } else {
            None
        };
        Ok(Self::with_database(config, database))
    }

    fn with_database(config: Config, database: Option<Arc<dyn DatabaseConnection>>) -> Self {
        let backup = BackupService::new(config.backup.clone(), database.clone());
        Self {
            config,
            database,
            backup,
            readiness: Readiness::default(),
            health: None,
        }
    }

    /// Starts the probe, waits for and provisions the database, readies the
    /// backup destination. Reports ready only when all of it succeeded.
    pub async fn prepare(&mut self) -> Result<()> {
        self.health = Some(HealthServer::start(
            &self.config.healthcheck_socket,
            self.readiness.clone(),
        )?);

        if let Some(database) = &self.database {
            info!("Waiting for database connection");
            database.wait_for_connection(DATABASE_WAIT).await?;
            database.init().await.context("Failed to initialize database")?;
        }

        self.backup
            .prepare()
            .await
            .context("Failed to prepare backup")?;

        self.readiness.set(State::Ready);
        info!("Housekeeper ready");
        Ok(())
    }

    pub fn backup_service(&self) -> &BackupService {
        &self.backup
    }
}
