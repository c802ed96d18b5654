/// Agent-wide constants
///
/// Container names, in-container paths and the credential variables the
/// platform's compose file defines. Names that differ per deployment live in
/// `PlatformSettings` instead and default to the values here.

/// Default location of the agent configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/platform-backup-agent/config.toml";

/// Runtime control-plane socket
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Read timeout for runtime calls; dumps of large databases take minutes
pub const DOCKER_TIMEOUT_SECS: u64 = 600;

/// Core service containers
pub const APPLICATION_CONTAINER: &str = "thinger";
pub const PRIMARY_DATABASE_CONTAINER: &str = "mongodb";
pub const TIMESERIES_CONTAINER: &str = "influxdb2";
pub const TIMESERIES_LEGACY_CONTAINER: &str = "influxdb";

/// Data directories as mounted inside each container
pub const APPLICATION_MOUNT: &str = "/data";
pub const PRIMARY_DATABASE_MOUNT: &str = "/data/db";
pub const TIMESERIES_MOUNT: &str = "/var/lib/influxdb2";
pub const TIMESERIES_LEGACY_MOUNT: &str = "/var/lib/influxdb";

/// Owner the database image runs as
pub const PRIMARY_DATABASE_OWNER: (u32, u32) = (999, 999);
/// The timeseries image owns its data directory as root
pub const TIMESERIES_OWNER: (u32, u32) = (0, 0);

pub const DEFAULT_DATABASE_USER: &str = "thinger";
pub const DEFAULT_TIMESERIES_PING_URL: &str = "http://localhost:8086/ping";
pub const TIMESERIES_VERSION_HEADER: &str = "X-Influxdb-Version";
pub const TIMESERIES_PROBE_TIMEOUT_SECS: u64 = 5;

/// Compose file and the credential assignments scraped from it
pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";
pub const PRIMARY_PASSWORD_VAR: &str = "MONGO_INITDB_ROOT_PASSWORD";
pub const TIMESERIES_TOKEN_VAR: &str = "DOCKER_INFLUXDB_INIT_ADMIN_TOKEN";

/// Application data layout below `<data_path>/<application>`
pub const USERS_DIR: &str = "users";
pub const CERTIFICATES_DIR: &str = "certificates";
pub const PLUGINS_DIR: &str = "plugins";
pub const PLUGIN_DESCRIPTOR: &str = "files/plugin.json";
/// JSON pointer of the plugin runner type; `docker` means container-backed
pub const PLUGIN_TYPE_POINTER: &str = "/task/type";

/// Scratch space below the data root
pub const BACKUPS_DIR: &str = "backups";

/// Object storage
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_UPLOAD_PARTS: u64 = 10_000;
pub const STORAGE_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-compressed-tar";

/// Remote callback
pub const BACKUP_FINISHED_ENDPOINT: &str = "backup_finished";
pub const RESTORE_FINISHED_ENDPOINT: &str = "restore_finished";
pub const CALLBACK_TIMEOUT_SECS: u64 = 30;

/// Maintenance task names
pub const TASK_UPDATE: &str = "update";
pub const TASK_UPDATE_DISTRO: &str = "update_distro";
pub const TASK_BACKUP: &str = "backup";
pub const TASK_RESTORE: &str = "restore";
