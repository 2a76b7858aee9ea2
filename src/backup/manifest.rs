// housekeeper/src/backup/manifest.rs
//! Manifest written as the last entry of every archive.
//!
//! It is the index a restore reads first: an archive without `backup.yml`
//! comes from a run that did not finish and must not be trusted.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;

pub const MANIFEST_ENTRY: &str = "backup.yml";
pub const DATABASE_ENTRY: &str = "database";
pub const FORMAT_VERSION: u32 = 1;

/// Archive entry name of the `index`-th configured directory.
pub fn directory_entry(index: usize) -> String {
    format!("data_{}", index)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// Archive format revision.
    pub version: u32,
    /// Start of the run, RFC 3339.
    pub date: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_backup: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<BackupMetaDirectory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetaDirectory {
    /// Where the data was located on the host.
    pub directory_path: String,
    /// Entry holding the directory's tarball.
    pub filename: String,
}

impl BackupMeta {
    pub fn new(date: DateTime<Local>) -> Self {
        Self {
            version: FORMAT_VERSION,
            date,
            database_backup: None,
            directories: Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: W) -> serde_yaml::Result<()> {
        serde_yaml::to_writer(writer, self)
    }
}
