// housekeeper/src/backup/container.rs
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::io::Write;
use zip::write::{SimpleFileOptions, StreamWriter};
use zip::{CompressionMethod, ZipWriter};

/// Zip container written front to back, so the underlying writer never needs to seek.
///
/// Entries are stored uncompressed: whatever goes in is already gzip'd.
pub struct Container<W: Write> {
    zip: ZipWriter<StreamWriter<W>>,
    options: SimpleFileOptions,
}

impl<W: Write> Container<W> {
    pub fn new(inner: W, modified: DateTime<Local>) -> Self {
        let modified = zip::DateTime::try_from(modified.naive_local()).unwrap_or_default();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(modified)
            .unix_permissions(0o644)
            .large_file(true);

        Self {
            zip: ZipWriter::new_stream(inner),
            options,
        }
    }

    /// Starts a new entry, finalizing the previous one. Writes to the returned
    /// writer land in that entry until the next call.
    pub fn start_entry(&mut self, name: &str) -> Result<&mut impl Write> {
        self.zip
            .start_file(name, self.options)
            .with_context(|| format!("Failed to create archive entry {}", name))?;
        Ok(&mut self.zip)
    }

    /// Writes the central directory and hands back the wrapped writer.
    pub fn finish(self) -> Result<W> {
        let stream = self
            .zip
            .finish()
            .context("Failed to write archive central directory")?;
        Ok(stream.into_inner())
    }
}
