/// Agent configuration
/// Loaded from /etc/platform-backup-agent/config.toml unless --config says otherwise

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::constants::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceSettings,
    pub backups: BackupSettings,
    /// Storage sections keyed by the name `backups.storage` refers to
    pub storage: StorageSections,
    pub platform: PlatformSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub id: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Backup system variant; empty disables backup and restore
    pub system: String,
    pub storage: String,
    pub data_path: PathBuf,
    /// Directory holding the compose file
    pub compose_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            system: String::new(),
            storage: "s3".to_string(),
            data_path: PathBuf::from("/data"),
            compose_path: PathBuf::from("/"),
            callback_url: None,
            callback_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSections {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Settings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// S3-compatible endpoint; path-style addressing is used when set
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_part_size")]
    pub part_size: u64,
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub application: String,
    pub primary_database: String,
    pub timeseries_database: String,
    pub timeseries_legacy_database: String,
    pub database_user: String,
    pub timeseries_ping_url: String,
    pub docker_socket: String,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            application: APPLICATION_CONTAINER.to_string(),
            primary_database: PRIMARY_DATABASE_CONTAINER.to_string(),
            timeseries_database: TIMESERIES_CONTAINER.to_string(),
            timeseries_legacy_database: TIMESERIES_LEGACY_CONTAINER.to_string(),
            database_user: DEFAULT_DATABASE_USER.to_string(),
            timeseries_ping_url: DEFAULT_TIMESERIES_PING_URL.to_string(),
            docker_socket: DEFAULT_DOCKER_SOCKET.to_string(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }
        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// S3 settings of the selected storage, if that storage is S3
    pub fn s3(&self) -> Option<&S3Settings> {
        if self.backups.storage.eq_ignore_ascii_case("s3") {
            self.storage.s3.as_ref()
        } else {
            None
        }
    }

    pub fn compose_file(&self) -> PathBuf {
        self.backups.compose_path.join(COMPOSE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL: &str = r#"
[device]
id = "edge-01"
hostname = "edge-host"

[backups]
system = "platform"
storage = "s3"
data_path = "/srv/data"
compose_path = "/srv"
callback_url = "https://console.example.com/v1/devices/edge-01/callback"
callback_token = "tok"

[storage.s3]
bucket = "device-backups"
region = "eu-west-1"
access_key = "AK"
secret_key = "SK"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = AgentConfig::from_toml(FULL).unwrap();
        assert_eq!(config.device.id.as_deref(), Some("edge-01"));
        assert_eq!(config.backups.system, "platform");
        assert_eq!(config.backups.data_path, PathBuf::from("/srv/data"));
        assert_eq!(config.compose_file(), PathBuf::from("/srv/docker-compose.yml"));

        let s3 = config.s3().unwrap();
        assert_eq!(s3.bucket, "device-backups");
        assert_eq!(s3.endpoint, None);
        assert_eq!(s3.part_size, DEFAULT_PART_SIZE);
    }

    #[test]
    fn test_platform_defaults() {
        let config = AgentConfig::from_toml("").unwrap();
        assert_eq!(config.platform.application, "thinger");
        assert_eq!(config.platform.primary_database, "mongodb");
        assert_eq!(config.platform.timeseries_database, "influxdb2");
        assert_eq!(config.platform.docker_socket, DEFAULT_DOCKER_SOCKET);
        assert!(config.backups.system.is_empty());
        assert!(config.s3().is_none());
    }

    #[test]
    fn test_unknown_storage_has_no_s3() {
        let config = AgentConfig::from_toml(
            "[backups]\nstorage = \"ftp\"\n[storage.s3]\nbucket=\"b\"\nregion=\"r\"\naccess_key=\"a\"\nsecret_key=\"s\"\n",
        )
        .unwrap();
        assert!(config.s3().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent").join("config.toml");
        let config = AgentConfig::from_toml(FULL).unwrap();
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.s3().unwrap().region, "eu-west-1");
        assert_eq!(loaded.backups.callback_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(AgentConfig::load(&dir.path().join("absent.toml")).is_err());
    }
}
