// housekeeper/src/backup/mod.rs
pub(crate) mod archive;
pub(crate) mod container;
pub(crate) mod db_dump;
pub(crate) mod encryption;
mod logic;
pub(crate) mod manifest;
pub(crate) mod s3_upload;
pub(crate) mod sink;

use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::sync::Arc;
use tracing::info;

use crate::config::BackupConfig;
use db_dump::DatabaseConnection;
use s3_upload::S3Store;
use sink::Sink;

/// Produces backup archives from the configured database and directories.
///
/// Cheap to clone; clones share the database connection and the object store.
#[derive(Clone)]
pub struct BackupService {
    config: Arc<BackupConfig>,
    database: Option<Arc<dyn DatabaseConnection>>,
    sink: Option<Sink>,
}

impl BackupService {
    pub fn new(config: BackupConfig, database: Option<Arc<dyn DatabaseConnection>>) -> Self {
        Self {
            config: Arc::new(config),
            database,
            sink: None,
        }
    }

    /// Readies the destination: creates the storage directory, or connects the
    /// object store when a bucket is configured.
    pub async fn prepare(&mut self) -> Result<()> {
        let remote = &self.config.remote;
        let sink = if remote.is_configured() {
            let store = S3Store::connect(remote).await.with_context(|| {
                format!("Failed to configure S3 bucket {}", remote.bucket_name)
            })?;
            Sink::Remote(Arc::new(store))
        } else {
            let storage = &self.config.storage;
            fs::create_dir_all(storage)
                .with_context(|| format!("Failed to create backup dir {}", storage.display()))?;
            Sink::Local(storage.clone())
        };
        self.sink = Some(sink);
        Ok(())
    }

    /// Uses `store` instead of connecting to the configured bucket.
    #[cfg(test)]
    pub(crate) fn with_store(mut self, store: Arc<dyn s3_upload::ObjectStore>) -> Self {
        self.sink = Some(Sink::Remote(store));
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// True when there is anything to back up.
    pub fn is_enabled(&self) -> bool {
        self.config.database || !self.config.directories().is_empty()
    }

    /// Runs one backup to completion.
    pub async fn backup(&self) -> Result<()> {
        if !self.is_enabled() {
            info!("Nothing to backup");
            return Ok(());
        }
        let sink = self
            .sink
            .clone()
            .context("Backup service used before prepare")?;
        let config = Arc::clone(&self.config);
        let database = self.database.clone();
        let started = Local::now();

        tokio::task::spawn_blocking(move || {
            logic::perform_backup(&config, database.as_deref(), &sink, started)
        })
        .await
        .context("Backup task panicked")??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::encryption::Encryption;
    use crate::backup::manifest::BackupMeta;
    use crate::backup::s3_upload::testing::{FailingStore, MemoryStore};
    use crate::errors::HousekeeperError;
    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use std::io::{Cursor, Read, Write};
    use std::path::Path;
    use std::time::Duration;

    /// Stands in for PostgreSQL; `backup` writes a fixed dump or fails.
    struct FakeDatabase {
        dump: Option<&'static [u8]>,
    }

    #[async_trait]
    impl DatabaseConnection for FakeDatabase {
        async fn init(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn wait_for_connection(&self, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }

        fn backup(&self, writer: &mut dyn Write) -> anyhow::Result<()> {
            match self.dump {
                Some(dump) => Ok(writer.write_all(dump)?),
                None => Err(HousekeeperError::Dump {
                    status: "exit status: 1".to_string(),
                    stderr: "connection refused".to_string(),
                }
                .into()),
            }
        }
    }

    fn local_config(storage: &Path) -> BackupConfig {
        BackupConfig {
            storage: storage.to_path_buf(),
            ..Default::default()
        }
    }

    async fn prepared(config: BackupConfig, database: Option<FakeDatabase>) -> anyhow::Result<BackupService> {
        let database = database.map(|db| Arc::new(db) as Arc<dyn DatabaseConnection>);
        let mut service = BackupService::new(config, database);
        service.prepare().await?;
        Ok(service)
    }

    fn archives(storage: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
        let mut files: Vec<_> = fs::read_dir(storage)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        files.sort();
        Ok(files)
    }

    fn entries(bytes: Vec<u8>) -> anyhow::Result<Vec<String>> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        Ok(archive.file_names().map(str::to_string).collect())
    }

    fn read_entry(bytes: &[u8], name: &str) -> anyhow::Result<Vec<u8>> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut data = Vec::new();
        archive.by_name(name)?.read_to_end(&mut data)?;
        Ok(data)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nothing_enabled_creates_no_archive() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let service = prepared(local_config(storage.path()), None).await?;

        assert!(!service.is_enabled());
        service.backup().await?;
        assert!(archives(storage.path())?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prepare_creates_storage_dir() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let storage = root.path().join("nested/backups");
        prepared(local_config(&storage), None).await?;
        assert!(storage.is_dir());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_directories_only() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let dir_a = data.path().join("A");
        let dir_b = data.path().join("B");
        fs::create_dir_all(&dir_a)?;
        fs::create_dir_all(dir_b.join("sub"))?;
        fs::write(dir_a.join("a.txt"), b"alpha")?;
        fs::write(dir_b.join("sub/b.txt"), b"beta")?;

        let mut config = local_config(storage.path());
        config.data_directories = format!("{}, {}", dir_a.display(), dir_b.display());
        let service = prepared(config, None).await?;
        service.backup().await?;

        let files = archives(storage.path())?;
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("backup_") && name.ends_with(".zip"));

        let bytes = fs::read(&files[0])?;
        assert_eq!(entries(bytes.clone())?, vec!["data_0", "data_1", "backup.yml"]);

        let meta: BackupMeta = serde_yaml::from_slice(&read_entry(&bytes, "backup.yml")?)?;
        assert_eq!(meta.version, 1);
        assert!(meta.database_backup.is_none());
        let dirs: Vec<(&str, &str)> = meta
            .directories
            .iter()
            .map(|d| (d.directory_path.as_str(), d.filename.as_str()))
            .collect();
        let (a, b) = (dir_a.display().to_string(), dir_b.display().to_string());
        assert_eq!(dirs, vec![(a.as_str(), "data_0"), (b.as_str(), "data_1")]);

        let tarball = read_entry(&bytes, "data_1")?;
        let mut tar = tar::Archive::new(GzDecoder::new(tarball.as_slice()));
        let mut found = Vec::new();
        for entry in tar.entries()? {
            found.push(entry?.path()?.to_string_lossy().into_owned());
        }
        assert_eq!(found, vec!["sub/", "sub/b.txt"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_database_only() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let mut config = local_config(storage.path());
        config.database = true;
        let db = FakeDatabase {
            dump: Some(b"CREATE TABLE items (id int);\n"),
        };
        let service = prepared(config, Some(db)).await?;
        service.backup().await?;

        let files = archives(storage.path())?;
        let bytes = fs::read(&files[0])?;
        assert_eq!(entries(bytes.clone())?, vec!["database", "backup.yml"]);

        let mut dump = String::new();
        GzDecoder::new(read_entry(&bytes, "database")?.as_slice()).read_to_string(&mut dump)?;
        assert_eq!(dump, "CREATE TABLE items (id int);\n");

        let meta: BackupMeta = serde_yaml::from_slice(&read_entry(&bytes, "backup.yml")?)?;
        assert_eq!(meta.database_backup.as_deref(), Some("database"));
        assert!(meta.directories.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_directory_leaves_no_manifest() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        fs::write(data.path().join("ok.txt"), b"ok")?;

        let mut config = local_config(storage.path());
        config.data_directories = format!(
            "{},{}",
            data.path().display(),
            data.path().join("missing").display()
        );
        let service = prepared(config, None).await?;

        let err = service.backup().await.unwrap_err();
        assert!(format!("{:#}", err).contains("data_1"));

        let files = archives(storage.path())?;
        assert_eq!(files.len(), 1);
        let names = entries(fs::read(&files[0])?)?;
        assert!(names.contains(&"data_0".to_string()));
        assert!(!names.contains(&"backup.yml".to_string()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_database_failure_aborts_run() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let mut config = local_config(storage.path());
        config.database = true;
        config.data_directories = data.path().display().to_string();
        let service = prepared(config, Some(FakeDatabase { dump: None })).await?;

        let err = service.backup().await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection refused"));

        let names = entries(fs::read(&archives(storage.path())?[0])?)?;
        assert_eq!(names, vec!["database"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_encrypted_archive_round_trip() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        fs::write(data.path().join("secret.txt"), b"top secret")?;
        let identity = age::x25519::Identity::generate();

        let mut config = local_config(storage.path());
        config.data_directories = data.path().display().to_string();
        config.encryption = Encryption::Recipients(vec![identity.to_public()]);
        let service = prepared(config, None).await?;
        service.backup().await?;

        let files = archives(storage.path())?;
        let name = files[0].display().to_string();
        assert!(name.ends_with(".zip.age"));

        let ciphertext = fs::read(&files[0])?;
        assert!(zip::ZipArchive::new(Cursor::new(ciphertext.clone())).is_err());

        let decryptor = age::Decryptor::new(ciphertext.as_slice())?;
        let mut reader = decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?;
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext)?;
        assert_eq!(entries(plaintext)?, vec!["data_0", "backup.yml"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_backup_uploads_archive() -> anyhow::Result<()> {
        let data = tempfile::tempdir()?;
        fs::write(data.path().join("file.bin"), vec![42u8; 300_000])?;
        let store = Arc::new(MemoryStore::default());

        let config = BackupConfig {
            data_directories: data.path().display().to_string(),
            ..Default::default()
        };
        let service = BackupService::new(config, None).with_store(store.clone());
        service.backup().await?;

        let names = store.names();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("backup_"));
        let bytes = store.object(&names[0]).unwrap_or_default();
        assert_eq!(entries(bytes)?, vec!["data_0", "backup.yml"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_upload_failure_fails_run() -> anyhow::Result<()> {
        let data = tempfile::tempdir()?;
        // xorshift output does not compress, so the archive stays well above the limit
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let noise: Vec<u8> = (0..2_000_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        fs::write(data.path().join("noise.bin"), noise)?;

        let config = BackupConfig {
            data_directories: data.path().display().to_string(),
            ..Default::default()
        };
        let service = BackupService::new(config, None).with_store(Arc::new(FailingStore { limit: 128 * 1024 }));

        let err = service.backup().await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Failed to close backup"), "{}", message);
        assert!(message.contains("connection reset while uploading"), "{}", message);
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_before_prepare_fails() {
        let config = BackupConfig {
            database: true,
            ..Default::default()
        };
        let service = BackupService::new(config, None);
        assert!(service.backup().await.is_err());
    }
}
