// housekeeper/src/backup/logic.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;
use tracing::{error, info, warn};

use super::archive::tar_dir;
use super::container::Container;
use super::db_dump::DatabaseConnection;
use super::manifest::{
    directory_entry, BackupMeta, BackupMetaDirectory, DATABASE_ENTRY, MANIFEST_ENTRY,
};
use super::sink::Sink;
use crate::config::BackupConfig;

/// `backup_<RFC 3339 start>.zip`, with `.age` appended for encrypted archives.
pub fn archive_name(started: DateTime<Local>, encrypted: bool) -> String {
    let timestamp = started.to_rfc3339_opts(SecondsFormat::Secs, false);
    if encrypted {
        format!("backup_{}.zip.age", timestamp)
    } else {
        format!("backup_{}.zip", timestamp)
    }
}

/// Runs one backup into `sink` and returns the archive name.
///
/// Blocks for the whole run; call it from a blocking thread. The sink is always
/// closed, also when writing failed. A close error is returned ahead of the
/// write error it caused; the other one is only logged.
pub(crate) fn perform_backup(
    config: &BackupConfig,
    database: Option<&dyn DatabaseConnection>,
    sink: &Sink,
    started: DateTime<Local>,
) -> Result<String> {
    let name = archive_name(started, config.encryption.is_enabled());
    info!(archive = %name, "Creating backup");

    let mut output = sink.open(&name)?;
    let written = write_archive(&mut output, config, database, started);
    let closed = output
        .close()
        .with_context(|| format!("Failed to close backup {}", name));

    // a sink that gave up explains the write errors it caused
    first_error(closed, written)?;
    info!(archive = %name, "Backup finished");
    Ok(name)
}

/// Writes the container, optionally encrypted, into `output`. Encryption and
/// container are finished even if an entry failed.
pub(crate) fn write_archive<W: Write>(
    output: W,
    config: &BackupConfig,
    database: Option<&dyn DatabaseConnection>,
    started: DateTime<Local>,
) -> Result<()> {
    let encrypted = config
        .encryption
        .wrap(output)
        .context("Failed to set up encryption")?;
    let mut container = Container::new(encrypted, started);

    let written = write_entries(&mut container, config, database, started);
    let finished = container.finish().and_then(|encrypted| {
        encrypted
            .finish()
            .map(|_| ())
            .context("Failed to finish encryption")
    });

    first_error(written, finished)
}

fn write_entries<W: Write>(
    container: &mut Container<W>,
    config: &BackupConfig,
    database: Option<&dyn DatabaseConnection>,
    started: DateTime<Local>,
) -> Result<()> {
    let mut meta = BackupMeta::new(started);

    if config.database {
        match database {
            Some(database) => {
                info!(entry = DATABASE_ENTRY, "Dumping database");
                let entry = container.start_entry(DATABASE_ENTRY)?;
                let mut gz = GzEncoder::new(entry, Compression::default());
                database
                    .backup(&mut gz)
                    .with_context(|| format!("Failed to dump database into {}", DATABASE_ENTRY))?;
                gz.finish()
                    .with_context(|| format!("Failed to finish {}", DATABASE_ENTRY))?;
                meta.database_backup = Some(DATABASE_ENTRY.to_string());
            }
            None => warn!("Database backup enabled but no database connection configured"),
        }
    }

    let excludes = config.excludes();
    for (index, directory) in config.directories().into_iter().enumerate() {
        let filename = directory_entry(index);
        info!(entry = %filename, directory = %directory, "Archiving directory");
        let entry = container.start_entry(&filename)?;
        tar_dir(entry, Path::new(&directory), &excludes)
            .with_context(|| format!("Failed to create {} from {}", filename, directory))?;
        meta.directories.push(BackupMetaDirectory {
            directory_path: directory,
            filename,
        });
    }

    let entry = container.start_entry(MANIFEST_ENTRY)?;
    meta.write_to(entry)
        .with_context(|| format!("Failed to write {}", MANIFEST_ENTRY))?;
    Ok(())
}

fn first_error(first: Result<()>, then: Result<()>) -> Result<()> {
    match (first, then) {
        (Err(e), Err(later)) => {
            error!(error = %format!("{:#}", later), "Cleanup after failed backup failed too");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}
