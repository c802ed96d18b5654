//! Backup pipeline for the containerised platform
//!
//! One session produces one archive, `<backups>/<hostname>_<tag>.tar.gz`,
//! holding a sub-archive per sub-system:
//!
//! - `<application>-<tag>.tar`: users and certificates, plus a nested
//!   `plugins-<tag>.tar` with the inspect documents of every plugin network
//!   and container
//! - `<primary>dump-<tag>.gz`: the primary database's archive dump
//! - `influxdbdump-<tag>.tar`: the timeseries database's backup directory
//!
//! Steps run in order and each is recorded on its own; only failing to set up
//! the session folder stops the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::archive::{self, ArchiveWriter};
use crate::core::compose::ComposeFile;
use crate::core::docker::ContainerRuntime;
use crate::core::error::{AgentError, Result};
use crate::core::report::{OperationReport, StepReport};
use crate::core::storage::ArchiveStore;
use crate::core::timeseries::{self, Generation, TimeseriesTarget};
use crate::utils::{
    format_bytes, format_duration, AgentConfig, PlatformSettings, SessionPaths, CERTIFICATES_DIR,
    PLUGINS_DIR, PLUGIN_DESCRIPTOR, PLUGIN_TYPE_POINTER, PRIMARY_DATABASE_MOUNT,
    PRIMARY_PASSWORD_VAR, TIMESERIES_TOKEN_VAR, USERS_DIR,
};

pub const CREATE_SESSION_FOLDER: &str = "create_session_folder";
pub const DUMP_APPLICATION: &str = "dump_application";
pub const DUMP_PRIMARY_DATABASE: &str = "dump_primary_database";
pub const DUMP_TIMESERIES_DATABASE: &str = "dump_timeseries_database";
pub const CLOSE_ARCHIVE: &str = "close_archive";
pub const UPLOAD: &str = "upload";
pub const CLEAN: &str = "clean";

/// Saved inspect documents inside the plugin sub-archive
pub const NETWORKS_DIR: &str = "networks";
pub const CONTAINERS_DIR: &str = "containers";

/// One plugin directory of a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plugin {
    pub name: String,
    /// `<user>-<plugin>`, the name its container runs under
    pub container: String,
    /// Whether the descriptor declares a container-backed runner
    pub containerised: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPlugins {
    pub user: String,
    pub plugins: Vec<Plugin>,
}

fn sorted_dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn is_containerised(plugin_dir: &Path) -> bool {
    let descriptor = plugin_dir.join(PLUGIN_DESCRIPTOR);
    let Ok(contents) = std::fs::read_to_string(&descriptor) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&contents) {
        Ok(doc) => doc.pointer(PLUGIN_TYPE_POINTER).and_then(|v| v.as_str()) == Some("docker"),
        Err(e) => {
            warn!(descriptor = %descriptor.display(), error = %e, "unreadable plugin descriptor");
            false
        }
    }
}

/// Every user that has a plugins directory, with its plugins
pub fn scan_plugins(users_dir: &Path) -> Vec<UserPlugins> {
    sorted_dir_names(users_dir)
        .into_iter()
        .filter_map(|user| {
            let plugins_dir = users_dir.join(&user).join(PLUGINS_DIR);
            if !plugins_dir.is_dir() {
                return None;
            }
            let plugins = sorted_dir_names(&plugins_dir)
                .into_iter()
                .map(|name| Plugin {
                    container: format!("{}-{}", user, name),
                    containerised: is_containerised(&plugins_dir.join(&name)),
                    name,
                })
                .collect();
            Some(UserPlugins { user, plugins })
        })
        .collect()
}

pub fn application_archive_name(application: &str, tag: &str) -> String {
    format!("{}-{}.tar", application, tag)
}

pub fn plugin_archive_name(tag: &str) -> String {
    format!("{}-{}.tar", PLUGINS_DIR, tag)
}

pub fn primary_dump_name(database: &str, tag: &str) -> String {
    format!("{}dump-{}.gz", database, tag)
}

pub fn timeseries_dump_dir(tag: &str) -> String {
    format!("influxdbdump-{}", tag)
}

pub struct PlatformBackup {
    runtime: Arc<dyn ContainerRuntime>,
    platform: PlatformSettings,
    data_path: PathBuf,
    compose: ComposeFile,
    tag: String,
    paths: SessionPaths,
    writer: Option<ArchiveWriter>,
}

impl PlatformBackup {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: &AgentConfig,
        hostname: &str,
        tag: &str,
    ) -> Result<Self> {
        let paths = SessionPaths::new(&config.backups.data_path, hostname, tag)
            .ok_or_else(|| AgentError::Config(format!("invalid session tag '{}'", tag)))?;

        Ok(Self {
            runtime,
            platform: config.platform.clone(),
            data_path: config.backups.data_path.clone(),
            compose: ComposeFile::new(config.compose_file()),
            tag: tag.to_string(),
            paths,
            writer: None,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn archive_path(&self) -> &Path {
        &self.paths.archive
    }

    /// Host directory a container's data volume is bound to
    fn host_dir(&self, container: &str) -> PathBuf {
        self.data_path.join(container)
    }

    /// Build the session archive
    ///
    /// The archive is finalised before returning; a failure doing so is
    /// recorded as its own step.
    pub async fn create(&mut self) -> OperationReport {
        let started = Instant::now();
        let mut report = OperationReport::new();
        info!(tag = %self.tag, archive = %self.paths.archive.display(), "starting backup");

        if !report.record(CREATE_SESSION_FOLDER, self.create_session_folder().await) {
            warn!(tag = %self.tag, "session folder unavailable, backup aborted");
            return report;
        }

        report.record(DUMP_APPLICATION, self.dump_application().await);
        report.record(DUMP_PRIMARY_DATABASE, self.dump_primary_database().await);
        report.record(DUMP_TIMESERIES_DATABASE, self.dump_timeseries_database().await);

        if let Some(writer) = self.writer.take() {
            if let Err(e) = archive::blocking(move || writer.finish()).await {
                report.record(CLOSE_ARCHIVE, StepReport::failed(format!("closing archive: {}", e)));
            }
        }

        info!(
            tag = %self.tag,
            status = report.status(),
            elapsed = %format_duration(started.elapsed().as_secs()),
            "backup archive built"
        );
        report
    }

    /// Create, upload and (on upload success) clean up
    pub async fn run(&mut self, store: &dyn ArchiveStore) -> OperationReport {
        let mut report = self.create().await;
        if !report
            .step(CREATE_SESSION_FOLDER)
            .map(|step| step.status)
            .unwrap_or(false)
        {
            return report;
        }

        let uploaded = report.record(UPLOAD, self.upload(store).await);
        if uploaded {
            report.record(CLEAN, self.clean().await);
        } else {
            warn!(archive = %self.paths.archive.display(), "upload failed, keeping local archive");
            report.record(
                CLEAN,
                StepReport::ok().with_msg(format!(
                    "skipped after failed upload, archive kept at {}",
                    self.paths.archive.display()
                )),
            );
        }
        report
    }

    pub async fn upload(&self, store: &dyn ArchiveStore) -> StepReport {
        let size = tokio::fs::metadata(&self.paths.archive)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        info!(archive = %self.paths.archive.display(), size = %format_bytes(size), "uploading backup");
        StepReport::from_result(store.upload(&self.paths.archive).await, "upload failed")
    }

    /// Remove the scratch folder and the local archive
    pub async fn clean(&mut self) -> StepReport {
        // Drop any writer still holding the archive open
        self.writer = None;

        let mut step = StepReport::ok();
        if let Err(e) = remove_path(&self.paths.session_dir).await {
            step.push_error(e.to_string());
        }
        if let Err(e) = remove_path(&self.paths.archive).await {
            step.push_error(e.to_string());
        }
        // Only succeeds when no other session left files behind
        let _ = tokio::fs::remove_dir(&self.paths.backups_root).await;
        step
    }

    async fn create_session_folder(&mut self) -> StepReport {
        let result: Result<()> = async {
            remove_path(&self.paths.session_dir).await?;
            remove_path(&self.paths.archive).await?;
            tokio::fs::create_dir_all(&self.paths.session_dir)
                .await
                .map_err(|e| {
                    AgentError::io(format!("create {}", self.paths.session_dir.display()), e)
                })?;

            let path = self.paths.archive.clone();
            let writer = archive::blocking(move || ArchiveWriter::create(path)).await?;
            self.writer = Some(writer);
            Ok(())
        }
        .await;

        StepReport::from_result(result, "failed to create session folder")
    }

    /// Add a host file to the session archive under `name`
    async fn fold(&mut self, file: PathBuf, name: String) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| AgentError::NotFound("session archive is not open".to_string()))?;

        debug!(file = %file.display(), entry = %name, "folding into session archive");
        let (added, writer) =
            archive::blocking(move || Ok((writer.add_entry(&file, &name), writer))).await?;
        self.writer = Some(writer);
        added.map_err(AgentError::from)
    }

    async fn dump_application(&mut self) -> StepReport {
        let app_dir = self.host_dir(&self.platform.application);
        let users = app_dir.join(USERS_DIR);
        let certificates = app_dir.join(CERTIFICATES_DIR);
        if !users.is_dir() && !certificates.is_dir() {
            return StepReport::ok().with_msg("platform has no application data");
        }

        let mut step = StepReport::ok();
        let plugins_dir = self.paths.session_dir.join(PLUGINS_DIR);
        let saved = self.save_plugin_documents(&users, &plugins_dir, &mut step).await;

        let name = application_archive_name(&self.platform.application, &self.tag);
        let sub_archive = self.paths.session_dir.join(&name);
        let nested_name = plugin_archive_name(&self.tag);
        let nested = self.paths.session_dir.join(&nested_name);

        let target = sub_archive.clone();
        let built = archive::blocking(move || {
            if saved > 0 {
                let mut plugins = ArchiveWriter::create(&nested)?;
                plugins.add_directory(&plugins_dir, "")?;
                plugins.finish()?;
            }

            let mut writer = ArchiveWriter::create(&target)?;
            if users.is_dir() {
                writer.add_directory(&users, USERS_DIR)?;
            }
            if certificates.is_dir() {
                writer.add_directory(&certificates, CERTIFICATES_DIR)?;
            }
            if saved > 0 {
                writer.add_entry(&nested, &nested_name)?;
            }
            writer.finish()
        })
        .await;

        if let Err(e) = built {
            step.push_error(format!("failed archiving application data: {}", e));
            return step;
        }
        if let Err(e) = self.fold(sub_archive.clone(), name).await {
            step.push_error(format!("failed adding application archive: {}", e));
            return step;
        }
        if let Err(e) = remove_path(&sub_archive).await {
            debug!(error = %e, "leaving application sub-archive behind");
        }

        step
    }

    /// Save network and container inspect documents for every plugin user
    ///
    /// Returns how many documents were written. Failures are recorded on
    /// `step` without stopping the scan.
    async fn save_plugin_documents(
        &self,
        users: &Path,
        plugins_dir: &Path,
        step: &mut StepReport,
    ) -> usize {
        let owners = scan_plugins(users);
        if owners.is_empty() {
            return 0;
        }

        let networks = plugins_dir.join(NETWORKS_DIR);
        let containers = plugins_dir.join(CONTAINERS_DIR);
        for dir in [&networks, &containers] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                step.push_error(format!("failed creating {}: {}", dir.display(), e));
                return 0;
            }
        }

        let mut saved = 0;
        for owner in owners {
            match self.runtime.inspect_network(&owner.user, &networks).await {
                Ok(_) => {
                    saved += 1;
                    step.push_msg(format!("backed up {} network", owner.user));
                }
                Err(e) => step.push_error(format!("failed backing up {} network: {}", owner.user, e)),
            }

            for plugin in owner.plugins {
                if !plugin.containerised {
                    step.push_msg(format!(
                        "ignored {}: no container associated",
                        plugin.container
                    ));
                    continue;
                }
                match self.runtime.inspect_container(&plugin.container, &containers).await {
                    Ok(_) => {
                        saved += 1;
                        step.push_msg(format!("backed up {} container", plugin.container));
                    }
                    Err(e) => step.push_error(format!(
                        "failed backing up {} container: {}",
                        plugin.container, e
                    )),
                }
            }
        }
        saved
    }

    async fn dump_primary_database(&mut self) -> StepReport {
        let database = self.platform.primary_database.clone();
        let password = match self.compose.credential(PRIMARY_PASSWORD_VAR).await {
            Ok(password) => password,
            Err(e) => return StepReport::failed(format!("no database credentials: {}", e)),
        };

        let dump = primary_dump_name(&database, &self.tag);
        let command = format!(
            "mongodump --gzip --archive={}/{} -u {} -p {}",
            PRIMARY_DATABASE_MOUNT, dump, self.platform.database_user, password
        );
        if let Err(e) = self.runtime.exec(&database, &command).await {
            return StepReport::failed(format!("failed dumping {}: {}", database, e));
        }

        let host_dump = self.host_dir(&database).join(&dump);
        if !host_dump.is_file() {
            return StepReport::failed(
                AgentError::NotFound(format!("dump {}", host_dump.display())).to_string(),
            );
        }

        let mut step = StepReport::ok();
        if let Err(e) = self.fold(host_dump, dump.clone()).await {
            step.push_error(format!("failed adding {} dump: {}", database, e));
        }

        let remove = format!("rm -f {}/{}", PRIMARY_DATABASE_MOUNT, dump);
        if let Err(e) = self.runtime.exec(&database, &remove).await {
            step.push_error(format!("failed removing {} dump: {}", database, e));
        }
        step
    }

    async fn dump_timeseries_database(&mut self) -> StepReport {
        let Some(generation) = timeseries::probe(&self.platform.timeseries_ping_url).await else {
            return StepReport::ok().with_msg("timeseries database not detected, nothing to dump");
        };
        let target = TimeseriesTarget::for_generation(generation, &self.platform);

        let token = if generation == Generation::V2 {
            match self.compose.credential(TIMESERIES_TOKEN_VAR).await {
                Ok(token) => Some(token),
                Err(e) => return StepReport::failed(format!("no timeseries token: {}", e)),
            }
        } else {
            None
        };

        let dump_dir = timeseries_dump_dir(&self.tag);
        let command = target.dump_command(&dump_dir, token.as_deref());
        if let Err(e) = self.runtime.exec(&target.container, &command).await {
            return StepReport::failed(format!("failed dumping {}: {}", target.container, e));
        }

        let mut step = StepReport::ok();
        let host_dump = self.host_dir(&target.container).join(&dump_dir);
        let name = format!("{}.tar", dump_dir);
        let sub_archive = self.paths.session_dir.join(&name);

        let source = host_dump.clone();
        let dir_name = dump_dir.clone();
        let target_archive = sub_archive.clone();
        let built = archive::blocking(move || {
            let mut writer = ArchiveWriter::create(&target_archive)?;
            writer.add_directory(&source, &dir_name)?;
            writer.finish()
        })
        .await;

        match built {
            Ok(()) => {
                if let Err(e) = self.fold(sub_archive.clone(), name).await {
                    step.push_error(format!("failed adding {} dump: {}", target.container, e));
                }
                if let Err(e) = remove_path(&sub_archive).await {
                    debug!(error = %e, "leaving timeseries sub-archive behind");
                }
            }
            Err(e) => step.push_error(format!("failed archiving {}: {}", host_dump.display(), e)),
        }

        if let Err(e) = self
            .runtime
            .exec(&target.container, &target.remove_command(&dump_dir))
            .await
        {
            step.push_error(format!("failed removing {} dump: {}", target.container, e));
        }
        step
    }
}

/// Remove a file or directory tree; a missing path is fine
pub(crate) async fn remove_path(path: &Path) -> Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| AgentError::io(format!("remove {}", path.display()), e))
}
