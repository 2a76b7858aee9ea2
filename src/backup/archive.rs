// housekeeper/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Writes a gzip'd tarball of everything below `source_dir` to `writer`.
///
/// Paths inside the tarball are relative to `source_dir` and always use `/`.
/// Symlinks are stored as links, never followed. Entries matching `excludes`
/// (absolute, or relative to `source_dir`) are skipped with their subtree.
pub fn tar_dir<W: Write>(writer: W, source_dir: &Path, excludes: &[PathBuf]) -> Result<()> {
    if !source_dir.is_dir() {
        return Err(anyhow::anyhow!(
            "Source for archival is not a directory: {}",
            source_dir.display()
        ));
    }

    let enc = GzEncoder::new(writer, Compression::default());
    let mut tar_builder = Builder::new(enc);

    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry, source_dir, excludes));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(source_dir).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source_dir.display(),
                path.display()
            )
        })?;

        if name.as_os_str().is_empty() {
            continue;
        }
        let name = to_slash(name);

        append_entry(&mut tar_builder, &entry, &name)
            .with_context(|| format!("Failed to add {} to archive", path.display()))?;
    }

    let encoder = tar_builder
        .into_inner()
        .with_context(|| format!("Failed to finish tar stream for {}", source_dir.display()))?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish gzip stream for {}", source_dir.display()))?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, entry: &DirEntry, name: &str) -> io::Result<()> {
    let path = entry.path();
    let file_type = entry.file_type();
    let mut header = Header::new_gnu();

    if file_type.is_symlink() {
        let metadata = fs::symlink_metadata(path)?;
        let target = fs::read_link(path)?;
        header.set_metadata(&metadata);
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, name, &target)
    } else if file_type.is_dir() {
        let metadata = entry.metadata().map_err(io::Error::from)?;
        header.set_metadata(&metadata);
        header.set_size(0);
        builder.append_data(&mut header, format!("{}/", name), io::empty())
    } else if file_type.is_file() {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        header.set_metadata(&metadata);
        let size = metadata.len();
        builder.append_data(&mut header, name, ExactReader::new(file, size))
    } else {
        warn!(path = %path.display(), "Skipping special file");
        Ok(())
    }
}

/// Yields exactly `remaining` bytes of `inner` and fails if it ends early.
/// The tar header already carries the size, so a short body would shift every
/// following entry.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn is_excluded(entry: &DirEntry, source_dir: &Path, excludes: &[PathBuf]) -> bool {
    let path = entry.path();
    let relative = path.strip_prefix(source_dir).ok();
    let excluded = excludes.iter().any(|exclude| {
        if exclude.is_absolute() {
            path.starts_with(exclude)
        } else {
            let exclude: PathBuf = exclude
                .components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect();
            relative.is_some_and(|rel| !rel.as_os_str().is_empty() && rel.starts_with(&exclude))
        }
    });
    if excluded {
        debug!(path = %path.display(), "Excluded from backup");
    }
    excluded
}

/// Joins path components with `/`, whatever the host separator is.
fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
