// housekeeper/src/config/mod.rs
use age::secrecy::SecretString;
use age::x25519;
use std::env;
use std::path::PathBuf;
use tracing::debug;

use crate::backup::encryption::Encryption;
use crate::errors::{HousekeeperError, Result};

const DEFAULT_HEALTHCHECK_SOCKET: &str = "/tmp/housekeeper.socket";

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub root_username: String,
    pub root_password: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub pg_extensions: String,
}

/// S3-compatible bucket the archive is streamed to instead of local storage.
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub folder_prefix: String,
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        !self.bucket_name.is_empty()
    }

    /// Object key for an archive, honouring the optional folder prefix.
    pub fn object_key(&self, name: &str) -> String {
        let prefix = self.folder_prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupConfig {
    pub database: bool,
    pub data_directories: String,
    pub data_directories_exclude: String,
    pub schedule: String,
    pub storage: PathBuf,
    pub encryption: Encryption,
    pub remote: RemoteConfig,
}

impl BackupConfig {
    /// Configured data directories in order, blanks dropped.
    pub fn directories(&self) -> Vec<String> {
        split_list(&self.data_directories)
    }

    pub fn excludes(&self) -> Vec<PathBuf> {
        split_list(&self.data_directories_exclude)
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub backup: BackupConfig,
    pub healthcheck_socket: PathBuf,
    pub log_level: String,
}

/// One environment variable: where it lands in `Config` and what it falls back to.
struct Setting {
    key: &'static str,
    default: Option<&'static str>,
    apply: fn(&mut Config, &str) -> Result<()>,
}

impl Setting {
    const fn new(
        key: &'static str,
        default: Option<&'static str>,
        apply: fn(&mut Config, &str) -> Result<()>,
    ) -> Self {
        Self { key, default, apply }
    }
}

fn settings() -> Vec<Setting> {
    vec![
        Setting::new("DB_HOST", None, |c, v| {
            c.database.host = v.to_string();
            Ok(())
        }),
        Setting::new("DB_PORT", Some("5432"), |c, v| {
            c.database.port = parse_port(v)?;
            Ok(())
        }),
        Setting::new("DB_ROOT_USER", Some("postgres"), |c, v| {
            c.database.root_username = v.to_string();
            Ok(())
        }),
        Setting::new("DB_ROOT_PASSWORD", None, |c, v| {
            c.database.root_password = v.to_string();
            Ok(())
        }),
        Setting::new("DB_USER_NAME", None, |c, v| {
            c.database.username = v.to_string();
            Ok(())
        }),
        Setting::new("DB_USER_PASSWORD", None, |c, v| {
            c.database.password = v.to_string();
            Ok(())
        }),
        Setting::new("DB_DATABASE", None, |c, v| {
            c.database.database = v.to_string();
            Ok(())
        }),
        Setting::new("DB_PG_EXTENSIONS", None, |c, v| {
            c.database.pg_extensions = v.to_string();
            Ok(())
        }),
        Setting::new("BACKUP_DATABASE", Some("false"), |c, v| {
            c.backup.database = parse_bool(v)?;
            Ok(())
        }),
        Setting::new("BACKUP_DATA_DIR", None, |c, v| {
            c.backup.data_directories = v.to_string();
            Ok(())
        }),
        Setting::new("BACKUP_DATA_EXCLUDE", None, |c, v| {
            c.backup.data_directories_exclude = v.to_string();
            Ok(())
        }),
        Setting::new("BACKUP_SCHEDULE", Some("@daily"), |c, v| {
            c.backup.schedule = v.trim().to_string();
            Ok(())
        }),
        Setting::new("BACKUP_STORAGE", Some("/backup"), |c, v| {
            c.backup.storage = PathBuf::from(v);
            Ok(())
        }),
        Setting::new("BACKUP_AGE_RECIPIENTS", None, |c, v| {
            let recipients = parse_recipients(v)?;
            if recipients.is_empty() {
                return Ok(());
            }
            c.backup.encryption = match &c.backup.encryption {
                Encryption::Passphrase(_) => return Err(exclusive_recipients()),
                _ => Encryption::Recipients(recipients),
            };
            Ok(())
        }),
        Setting::new("BACKUP_AGE_PASSWORD", None, |c, v| {
            if v.is_empty() {
                return Ok(());
            }
            c.backup.encryption = match &c.backup.encryption {
                Encryption::Recipients(_) => return Err(exclusive_recipients()),
                _ => Encryption::Passphrase(SecretString::from(v.to_string())),
            };
            Ok(())
        }),
        Setting::new("BACKUP_S3_BUCKET", None, |c, v| {
            c.backup.remote.bucket_name = v.trim().to_string();
            Ok(())
        }),
        Setting::new("BACKUP_S3_REGION", None, |c, v| {
            c.backup.remote.region = v.trim().to_string();
            Ok(())
        }),
        Setting::new("BACKUP_S3_ENDPOINT", None, |c, v| {
            c.backup.remote.endpoint_url = v.trim().to_string();
            Ok(())
        }),
        Setting::new("BACKUP_S3_ACCESS_KEY_ID", None, |c, v| {
            c.backup.remote.access_key_id = v.trim().to_string();
            Ok(())
        }),
        Setting::new("BACKUP_S3_SECRET_ACCESS_KEY", None, |c, v| {
            c.backup.remote.secret_access_key = v.trim().to_string();
            Ok(())
        }),
        Setting::new("BACKUP_S3_PREFIX", None, |c, v| {
            c.backup.remote.folder_prefix = v.trim().to_string();
            Ok(())
        }),
        Setting::new("HEALTHCHECK_SOCKET", Some(DEFAULT_HEALTHCHECK_SOCKET), |c, v| {
            c.healthcheck_socket = PathBuf::from(v);
            Ok(())
        }),
        Setting::new("LOG_LEVEL", Some("info"), |c, v| {
            c.log_level = v.to_string();
            Ok(())
        }),
    ]
}

impl Config {
    /// Loads configuration from the process environment (and `.env`, if present).
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::load_from(|key| env::var(key).ok())
    }

    /// Loads configuration through `lookup`, applying declared defaults for unset keys.
    pub fn load_from<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        for setting in settings() {
            let value = match lookup(setting.key) {
                Some(value) => value,
                None => match setting.default {
                    Some(default) => default.to_string(),
                    None => continue,
                },
            };
            (setting.apply)(&mut config, &value).map_err(|e| match e {
                HousekeeperError::Config(msg) => {
                    HousekeeperError::Config(format!("{}: {}", setting.key, msg))
                }
                other => other,
            })?;
        }
        config.validate()?;
        debug!(
            database = config.backup.database,
            directories = %config.backup.data_directories,
            schedule = %config.backup.schedule,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let db = &self.database;
        if !db.host.is_empty() {
            if db.username.is_empty() {
                return Err(config_error("database host given but username is missing"));
            }
            if db.password.is_empty() {
                return Err(config_error("database host given but user password is missing"));
            }
            if db.database.is_empty() {
                return Err(config_error("database host given but database name is missing"));
            }
        }

        if self.backup.database && db.host.is_empty() {
            return Err(config_error("database config missing for backup"));
        }

        let remote = &self.backup.remote;
        if remote.is_configured()
            && (remote.region.is_empty()
                || remote.access_key_id.is_empty()
                || remote.secret_access_key.is_empty())
        {
            return Err(config_error(
                "BACKUP_S3_BUCKET given but region, access key id or secret access key is missing",
            ));
        }
        Ok(())
    }

    pub fn has_database(&self) -> bool {
        !self.database.host.is_empty()
    }
}

/// Readiness socket path, without loading (or validating) anything else.
pub fn healthcheck_socket() -> PathBuf {
    dotenv::dotenv().ok();
    env::var("HEALTHCHECK_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_HEALTHCHECK_SOCKET))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "" | "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(config_error(&format!("invalid boolean '{}'", other))),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| config_error(&format!("invalid port '{}'", value)))
}

fn parse_recipients(value: &str) -> Result<Vec<x25519::Recipient>> {
    split_list(value)
        .iter()
        .map(|key| {
            key.parse::<x25519::Recipient>()
                .map_err(|e| config_error(&format!("invalid recipient given {}: {}", key, e)))
        })
        .collect()
}

fn exclusive_recipients() -> HousekeeperError {
    config_error("only age recipients OR a password is supported")
}

fn config_error(msg: &str) -> HousekeeperError {
    HousekeeperError::Config(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load_from(|key| vars.get(key).cloned())
    }

    fn recipient() -> String {
        x25519::Identity::generate().to_public().to_string()
    }

    #[test]
    fn test_defaults_applied() -> anyhow::Result<()> {
        let config = load(&[])?;
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.root_username, "postgres");
        assert!(!config.backup.database);
        assert_eq!(config.backup.schedule, "@daily");
        assert_eq!(config.backup.storage, PathBuf::from("/backup"));
        assert_eq!(config.healthcheck_socket, PathBuf::from(DEFAULT_HEALTHCHECK_SOCKET));
        assert!(matches!(config.backup.encryption, Encryption::None));
        assert!(!config.backup.remote.is_configured());
        Ok(())
    }

    #[test]
    fn test_values_override_defaults() -> anyhow::Result<()> {
        let config = load(&[
            ("DB_HOST", "db"),
            ("DB_PORT", "6543"),
            ("DB_USER_NAME", "app"),
            ("DB_USER_PASSWORD", "secret"),
            ("DB_DATABASE", "appdb"),
            ("BACKUP_DATABASE", "true"),
            ("BACKUP_DATA_DIR", "/data/A, /data/B"),
            ("BACKUP_SCHEDULE", "0 3 * * *"),
        ])?;
        assert_eq!(config.database.port, 6543);
        assert!(config.backup.database);
        assert_eq!(config.backup.directories(), vec!["/data/A", "/data/B"]);
        assert_eq!(config.backup.schedule, "0 3 * * *");
        Ok(())
    }

    #[test]
    fn test_empty_schedule_is_kept() -> anyhow::Result<()> {
        let config = load(&[("BACKUP_SCHEDULE", "")])?;
        assert!(config.backup.schedule.is_empty());
        Ok(())
    }

    #[test]
    fn test_database_host_requires_credentials() {
        let err = load(&[("DB_HOST", "db"), ("DB_USER_NAME", "app")]).unwrap_err();
        assert!(err.to_string().contains("user password is missing"));
    }

    #[test]
    fn test_database_backup_requires_host() {
        let err = load(&[("BACKUP_DATABASE", "1")]).unwrap_err();
        assert!(err.to_string().contains("database config missing"));
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = load(&[("DB_PORT", "abc")]).unwrap_err();
        assert!(err.to_string().contains("DB_PORT"));

        let err = load(&[("BACKUP_DATABASE", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("BACKUP_DATABASE"));

        let err = load(&[("BACKUP_AGE_RECIPIENTS", "not-a-key")]).unwrap_err();
        assert!(err.to_string().contains("BACKUP_AGE_RECIPIENTS"));
    }

    #[test]
    fn test_recipients_parsed() -> anyhow::Result<()> {
        let list = format!("{}, {}", recipient(), recipient());
        let config = load(&[("BACKUP_AGE_RECIPIENTS", &list)])?;
        match config.backup.encryption {
            Encryption::Recipients(recipients) => assert_eq!(recipients.len(), 2),
            other => panic!("unexpected encryption {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_recipients_and_password_are_exclusive() {
        let key = recipient();
        let err = load(&[
            ("BACKUP_AGE_RECIPIENTS", key.as_str()),
            ("BACKUP_AGE_PASSWORD", "hunter2"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("only age recipients OR a password"));
    }

    #[test]
    fn test_remote_requires_credentials() {
        let err = load(&[("BACKUP_S3_BUCKET", "backups")]).unwrap_err();
        assert!(err.to_string().contains("BACKUP_S3_BUCKET"));
    }

    #[test]
    fn test_remote_object_key_prefix() -> anyhow::Result<()> {
        let config = load(&[
            ("BACKUP_S3_BUCKET", "backups"),
            ("BACKUP_S3_REGION", "eu-central-1"),
            ("BACKUP_S3_ACCESS_KEY_ID", "id"),
            ("BACKUP_S3_SECRET_ACCESS_KEY", "secret"),
            ("BACKUP_S3_PREFIX", "/nightly/"),
        ])?;
        assert!(config.backup.remote.is_configured());
        assert_eq!(
            config.backup.remote.object_key("backup_x.zip"),
            "nightly/backup_x.zip"
        );
        Ok(())
    }

    #[test]
    fn test_excludes_split() -> anyhow::Result<()> {
        let config = load(&[("BACKUP_DATA_EXCLUDE", "/data/A/cache,,tmp")])?;
        assert_eq!(
            config.backup.excludes(),
            vec![PathBuf::from("/data/A/cache"), PathBuf::from("tmp")]
        );
        Ok(())
    }
}
