// housekeeper/src/backup/db_dump.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection};
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DatabaseConfig;
use crate::errors::HousekeeperError;
use crate::utils::find_executable;

/// Database the archive's `database` entry is produced from.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Creates the login role, database and extensions if they are missing.
    async fn init(&self) -> Result<()>;

    /// Polls once a second until the server accepts a connection or `timeout` elapses.
    async fn wait_for_connection(&self, timeout: Duration) -> Result<()>;

    /// Streams a plain SQL dump into `writer`. Blocks until the dump is complete.
    fn backup(&self, writer: &mut dyn Write) -> Result<()>;
}

pub struct PostgresConnection {
    config: DatabaseConfig,
    connection_url: Url,
}

impl PostgresConnection {
    /// Connects as root when a root password is given, as the application user otherwise.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let connection_url = if config.root_password.is_empty() {
            build_url(&config, &config.username, &config.password, &config.database)?
        } else {
            build_url(&config, &config.root_username, &config.root_password, "postgres")?
        };
        Ok(Self {
            config,
            connection_url,
        })
    }

    async fn connect(&self, url: &Url) -> Result<PgConnection> {
        PgConnection::connect(url.as_str()).await.with_context(|| {
            format!(
                "Failed to connect to database server {}:{}",
                self.config.host, self.config.port
            )
        })
    }

    fn dump_args(&self) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.config.host.clone(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-U".to_string(),
            self.config.username.clone(),
            self.config.database.clone(),
        ]
    }

    fn extensions(&self) -> Vec<&str> {
        self.config
            .pg_extensions
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect()
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn init(&self) -> Result<()> {
        if self.config.root_password.is_empty() {
            info!("No root password given, skipping user and database creation");
            return Ok(());
        }
        info!(database = %self.config.database, "Initializing database");

        let db = &self.config;
        let mut conn = self.connect(&self.connection_url).await?;

        let role_exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1")
            .bind(&db.username)
            .fetch_optional(&mut conn)
            .await
            .context("Failed to check if user exists")?
            .is_some();
        if role_exists {
            info!(user = %db.username, "User already exists");
        } else {
            let sql = format!(
                "CREATE ROLE {} WITH LOGIN CREATEDB PASSWORD {}",
                quote_ident(&db.username),
                quote_literal(&db.password)
            );
            conn.execute(sql.as_str())
                .await
                .with_context(|| format!("Failed to create user {}", db.username))?;
            info!(user = %db.username, "User created");
        }

        let database_exists =
            sqlx::query_scalar::<_, i32>("SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1")
                .bind(&db.database)
                .fetch_optional(&mut conn)
                .await
                .context("Failed to check if database exists")?
                .is_some();
        if database_exists {
            info!(database = %db.database, "Database already exists");
        } else {
            let sql = format!(
                "CREATE DATABASE {} OWNER {}",
                quote_ident(&db.database),
                quote_ident(&db.username)
            );
            conn.execute(sql.as_str())
                .await
                .with_context(|| format!("Failed to create database {}", db.database))?;
            info!(database = %db.database, "Database created");
        }

        let sql = format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            quote_ident(&db.database),
            quote_ident(&db.username)
        );
        conn.execute(sql.as_str())
            .await
            .context("Failed to grant database permissions")?;
        conn.close().await.ok();

        let extensions = self.extensions();
        if !extensions.is_empty() {
            // extensions live inside the application database, not the maintenance one
            let url = build_url(db, &db.root_username, &db.root_password, &db.database)?;
            let mut conn = self.connect(&url).await?;
            for extension in extensions {
                let sql = format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(extension));
                conn.execute(sql.as_str())
                    .await
                    .with_context(|| format!("Failed to add extension {}", extension))?;
                info!(extension = %extension, "Extension available");
            }
            conn.close().await.ok();
        }

        Ok(())
    }

    async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut last_error = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        let connected = tokio::time::timeout(timeout, async {
            loop {
                ticker.tick().await;
                match PgConnection::connect(self.connection_url.as_str()).await {
                    Ok(conn) => {
                        conn.close().await.ok();
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "Database not reachable yet");
                        last_error = Some(e);
                    }
                }
            }
        })
        .await;

        match connected {
            Ok(()) => {
                info!(host = %self.config.host, port = self.config.port, "Database connection established");
                Ok(())
            }
            Err(_) => {
                let reason = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempt finished".to_string());
                Err(HousekeeperError::Connectivity(format!(
                    "timeout after {:?} while trying to connect to database: {}",
                    timeout, reason
                ))
                .into())
            }
        }
    }

    fn backup(&self, writer: &mut dyn Write) -> Result<()> {
        let pg_dump = find_executable("pg_dump")?;
        let mut command = Command::new(&pg_dump);
        command
            .args(self.dump_args())
            .env("PGPASSWORD", &self.config.password);
        debug!(program = %pg_dump.display(), database = %self.config.database, "Running pg_dump");
        run_dump(command, writer)
    }
}

/// Runs `command`, copying its stdout into `writer`. Stderr is collected on a
/// helper thread so neither pipe can stall the child.
fn run_dump(mut command: Command, writer: &mut dyn Write) -> Result<()> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to execute pg_dump")?;

    let mut stdout = child.stdout.take().context("pg_dump stdout was not captured")?;
    let mut stderr = child.stderr.take().context("pg_dump stderr was not captured")?;
    let stderr_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    });

    let copied = io::copy(&mut stdout, writer);
    drop(stdout);
    if copied.is_err() {
        let _ = child.kill();
    }
    let status = child.wait().context("Failed to wait for pg_dump")?;
    let stderr = stderr_reader.join().unwrap_or_default();

    let bytes = copied.context("Failed to copy pg_dump output into archive")?;
    if !status.success() {
        return Err(HousekeeperError::Dump {
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }
        .into());
    }
    if !stderr.trim().is_empty() {
        warn!(stderr = %stderr.trim(), "pg_dump reported warnings");
    }
    debug!(bytes, "pg_dump finished");
    Ok(())
}

fn build_url(config: &DatabaseConfig, user: &str, password: &str, database: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("postgres://{}:{}", config.host, config.port))
        .with_context(|| format!("Invalid database host: {}", config.host))?;
    url.set_username(user)
        .map_err(|_| anyhow::anyhow!("Invalid database user name: {}", user))?;
    url.set_password(Some(password))
        .map_err(|_| anyhow::anyhow!("Invalid database password for user {}", user))?;
    url.set_path(&format!("/{}", database));
    url.query_pairs_mut().append_pair("sslmode", "disable");
    Ok(url)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}
