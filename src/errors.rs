// housekeeper/src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HousekeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database connection error: {0}")]
    Connectivity(String),

    #[error("Database dump failed with status {status}: {stderr}")]
    Dump { status: String, stderr: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Remote upload failed: {0}")]
    Upload(String),

    #[error("Schedule error: {0}")]
    Schedule(#[from] tokio_cron_scheduler::JobSchedulerError),
}

pub type Result<T> = std::result::Result<T, HousekeeperError>;
