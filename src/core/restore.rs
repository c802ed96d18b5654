//! Restore pipeline for the containerised platform
//!
//! The session archive is self-describing: its entries are dispatched by name
//! prefix, so archives written by older agents (flat `/dump` copies, plain
//! `.tar` archives, top-level plugin documents) restore alongside current
//! ones. Every extraction reopens the archive since reads are forward-only.
//!
//! After the initial download and listing every step runs regardless of
//! earlier failures, and the three core services are always restarted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::core::archive::{self, ArchiveReader};
use crate::core::backup::{
    plugin_archive_name, remove_path, scan_plugins, CLEAN, CONTAINERS_DIR, CREATE_SESSION_FOLDER,
    NETWORKS_DIR,
};
use crate::core::compose::ComposeFile;
use crate::core::docker::ContainerRuntime;
use crate::core::error::{AgentError, Result};
use crate::core::report::{OperationReport, StepReport};
use crate::core::storage::ArchiveStore;
use crate::core::timeseries::{self, Generation, TimeseriesTarget};
use crate::utils::{
    archive_name, format_duration, host_owner, legacy_archive_name, AgentConfig,
    PlatformSettings, SessionPaths, APPLICATION_MOUNT, CERTIFICATES_DIR, PLUGINS_DIR,
    PRIMARY_DATABASE_MOUNT, PRIMARY_DATABASE_OWNER, PRIMARY_PASSWORD_VAR, TIMESERIES_OWNER,
    USERS_DIR,
};

pub const DOWNLOAD: &str = "download";
pub const LIST_ENTRIES: &str = "list_entries";
pub const RESTORE_APPLICATION: &str = "restore_application";
pub const RESTORE_PRIMARY_DATABASE: &str = "restore_primary_database";
pub const RESTORE_TIMESERIES_DATABASE: &str = "restore_timeseries_database";
pub const RESTORE_PLUGINS: &str = "restore_plugins";
pub const RESTART: &str = "restart";

/// Every timeseries dump entry starts with this, whatever the generation
const TIMESERIES_ENTRY_PREFIX: &str = "influxdb";

/// What an archive entry holds, judged by its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Application,
    PrimaryDatabase,
    TimeseriesDatabase,
    Plugins,
}

pub fn classify_entry(name: &str, platform: &PlatformSettings) -> Option<EntryKind> {
    if name.starts_with(&platform.application) {
        Some(EntryKind::Application)
    } else if name.starts_with(&platform.primary_database) {
        Some(EntryKind::PrimaryDatabase)
    } else if name.starts_with(TIMESERIES_ENTRY_PREFIX) {
        Some(EntryKind::TimeseriesDatabase)
    } else if name.starts_with(PLUGINS_DIR) {
        Some(EntryKind::Plugins)
    } else {
        None
    }
}

/// Record `step` under `name`, or under `name:entry` if `name` is taken
fn record_unique(report: &mut OperationReport, name: &str, entry: &str, step: StepReport) {
    if report.step(name).is_some() {
        report.record(format!("{}:{}", name, entry), step);
    } else {
        report.record(name, step);
    }
}

/// Saved inspect document, in its subdirectory or (older layout) flat
fn find_document(plugins_dir: &Path, subdir: &str, id: &str) -> Option<PathBuf> {
    let file = format!("{}.json", id);
    [plugins_dir.join(subdir).join(&file), plugins_dir.join(&file)]
        .into_iter()
        .find(|path| path.is_file())
}

pub struct PlatformRestore {
    runtime: Arc<dyn ContainerRuntime>,
    platform: PlatformSettings,
    data_path: PathBuf,
    compose: ComposeFile,
    hostname: String,
    tag: String,
    paths: SessionPaths,
    /// Owner to give data directories to before writing them from the host
    host_owner: Option<(u32, u32)>,
    downloaded: Option<PathBuf>,
}

impl PlatformRestore {
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
            hostname: hostname.to_string(),
            tag: tag.to_string(),
            paths,
            host_owner: host_owner(),
            downloaded: None,
        })
    }

    pub fn with_host_owner(mut self, owner: Option<(u32, u32)>) -> Self {
        self.host_owner = owner;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn host_dir(&self, container: &str) -> PathBuf {
        self.data_path.join(container)
    }

    pub async fn run(&mut self, store: &dyn ArchiveStore) -> OperationReport {
        let started = Instant::now();
        let mut report = OperationReport::new();
        info!(tag = %self.tag, "starting restore");

        if !report.record(CREATE_SESSION_FOLDER, self.create_session_folder().await) {
            return report;
        }
        if !report.record(DOWNLOAD, self.download(store).await) {
            warn!(tag = %self.tag, "no archive to restore from");
            return report;
        }

        let entries = match self.list_entries().await {
            Ok(entries) => {
                report.record(LIST_ENTRIES, StepReport::ok());
                entries
            }
            Err(e) => {
                report.record(LIST_ENTRIES, StepReport::failed(format!("failed listing archive: {}", e)));
                return report;
            }
        };
        debug!(?entries, "archive entries");

        let mut flat_plugins = false;
        for entry in &entries {
            match classify_entry(entry, &self.platform) {
                Some(EntryKind::Application) => {
                    let step = self.restore_application(entry).await;
                    record_unique(&mut report, RESTORE_APPLICATION, entry, step);
                }
                Some(EntryKind::PrimaryDatabase) => {
                    let step = self.restore_primary_database(entry).await;
                    record_unique(&mut report, RESTORE_PRIMARY_DATABASE, entry, step);
                }
                Some(EntryKind::TimeseriesDatabase) => {
                    let step = self.restore_timeseries_database(entry).await;
                    record_unique(&mut report, RESTORE_TIMESERIES_DATABASE, entry, step);
                }
                Some(EntryKind::Plugins) => match self.stage_plugin_entry(entry).await {
                    Ok(()) => flat_plugins = true,
                    Err(e) => record_unique(
                        &mut report,
                        RESTORE_PLUGINS,
                        entry,
                        StepReport::failed(format!("failed extracting {}: {}", entry, e)),
                    ),
                },
                None => debug!(entry = %entry, "ignoring unknown archive entry"),
            }
        }

        if flat_plugins {
            let plugins_dir = self.paths.session_dir.join(PLUGINS_DIR);
            let step = self.restore_plugins(&plugins_dir).await;
            record_unique(&mut report, RESTORE_PLUGINS, PLUGINS_DIR, step);
        }

        report.record(RESTART, self.restart_platform().await);
        report.record(CLEAN, self.clean().await);

        info!(
            tag = %self.tag,
            status = report.status(),
            elapsed = %format_duration(started.elapsed().as_secs()),
            "restore finished"
        );
        report
    }

    async fn create_session_folder(&self) -> StepReport {
        let result = tokio::fs::create_dir_all(&self.paths.session_dir)
            .await
            .map_err(|e| AgentError::io(format!("create {}", self.paths.session_dir.display()), e));
        StepReport::from_result(result, "failed to create session folder")
    }

    /// Fetch the session archive, falling back to the legacy uncompressed name
    async fn download(&mut self, store: &dyn ArchiveStore) -> StepReport {
        let current = archive_name(&self.hostname, &self.tag);
        let first = store.download(&current, &self.paths.archive).await;

        let (key, path, result) = match first {
            Err(AgentError::NotFound(reason)) => {
                debug!(reason = %reason, "no compressed archive, trying legacy name");
                let _ = remove_path(&self.paths.archive).await;
                let legacy = legacy_archive_name(&self.hostname, &self.tag);
                let result = store.download(&legacy, &self.paths.legacy_archive).await;
                (legacy, self.paths.legacy_archive.clone(), result)
            }
            other => (current, self.paths.archive.clone(), other),
        };

        match result {
            Ok(()) => {
                info!(key = %key, "session archive downloaded");
                self.downloaded = Some(path);
                StepReport::ok().with_msg(format!("downloaded {}", key))
            }
            Err(e) => StepReport::failed(format!("failed downloading {}: {}", key, e)),
        }
    }

    fn downloaded(&self) -> Result<PathBuf> {
        self.downloaded
            .clone()
            .ok_or_else(|| AgentError::NotFound("downloaded session archive".to_string()))
    }

    async fn list_entries(&self) -> Result<Vec<String>> {
        let path = self.downloaded()?;
        archive::blocking(move || ArchiveReader::open(&path)?.list_entries()).await
    }

    /// Extract one entry of the session archive below `dest`
    async fn extract_entry(&self, entry: &str, dest: &Path) -> Result<PathBuf> {
        let path = self.downloaded()?;
        let entry = entry.to_string();
        let dest = dest.to_path_buf();
        archive::blocking(move || ArchiveReader::open(&path)?.extract_one(&entry, &dest)).await
    }

    /// Extract everything in the host archive `file` below `dest`
    async fn unpack(&self, file: &Path, dest: &Path) -> Result<()> {
        let file = file.to_path_buf();
        let dest = dest.to_path_buf();
        archive::blocking(move || ArchiveReader::open(&file)?.extract_all(&dest)).await
    }

    async fn chown(&self, container: &str, path: &str, owner: (u32, u32)) -> Result<()> {
        let command = format!("chown {}:{} {}", owner.0, owner.1, path);
        self.runtime
            .exec(container, &command)
            .await
            .map_err(|e| AgentError::Permission(format!("{} in {}: {}", command, container, e)))
    }

    async fn restore_application(&self, entry: &str) -> StepReport {
        let application = self.platform.application.clone();
        let app_dir = self.host_dir(&application);

        if let Some(owner) = self.host_owner {
            // Installed directories belong to the container user; clear them
            // from inside and hand the data root to us
            let clear = format!(
                "rm -rf {m}/{} {m}/{}",
                USERS_DIR,
                CERTIFICATES_DIR,
                m = APPLICATION_MOUNT
            );
            if let Err(e) = self.runtime.exec(&application, &clear).await {
                return StepReport::failed(
                    AgentError::Permission(format!("clearing {} data: {}", application, e)).to_string(),
                );
            }
            if let Err(e) = self.chown(&application, APPLICATION_MOUNT, owner).await {
                return StepReport::failed(e.to_string());
            }
        }

        if let Err(e) = self.runtime.stop(&application).await {
            return StepReport::failed(format!("failed stopping {}: {}", application, e));
        }

        let mut step = StepReport::ok();
        let sub_archive = match self.extract_entry(entry, &self.paths.session_dir).await {
            Ok(path) => path,
            Err(e) => {
                step.push_error(format!("failed extracting {}: {}", entry, e));
                return step;
            }
        };
        if let Err(e) = self.unpack(&sub_archive, &app_dir).await {
            step.push_error(format!("failed extracting into {}: {}", app_dir.display(), e));
        }
        let _ = remove_path(&sub_archive).await;

        let nested = app_dir.join(plugin_archive_name(&self.tag));
        if nested.is_file() {
            let plugins_dir = self.paths.session_dir.join(PLUGINS_DIR);
            if let Err(e) = self.unpack(&nested, &plugins_dir).await {
                step.push_error(format!("failed extracting plugin documents: {}", e));
            }
            if let Err(e) = remove_path(&nested).await {
                step.push_error(e.to_string());
            }
            step.nest(RESTORE_PLUGINS, self.restore_plugins(&plugins_dir).await);
        } else {
            step.push_msg("backup holds no plugin documents");
        }

        step
    }

    /// Put a top-level plugin entry of an older archive in the plugins folder
    async fn stage_plugin_entry(&self, entry: &str) -> Result<()> {
        let extracted = self.extract_entry(entry, &self.paths.session_dir).await?;
        if entry.ends_with(".tar") {
            let plugins_dir = self.paths.session_dir.join(PLUGINS_DIR);
            self.unpack(&extracted, &plugins_dir).await?;
            remove_path(&extracted).await?;
        }
        Ok(())
    }

    /// Recreate every user's network and containerised plugins
    async fn restore_plugins(&self, plugins_dir: &Path) -> StepReport {
        let users = self.host_dir(&self.platform.application).join(USERS_DIR);
        let owners = scan_plugins(&users);
        if owners.is_empty() {
            return StepReport::ok().with_msg("platform has no plugins");
        }

        let mut step = StepReport::ok();
        for owner in owners {
            let network_id = match find_document(plugins_dir, NETWORKS_DIR, &owner.user) {
                Some(doc) => match self.runtime.create_network_from_inspect(&doc).await {
                    Ok(id) => {
                        step.push_msg(format!("restored {} network", owner.user));
                        Some(id)
                    }
                    Err(e) => {
                        step.push_error(format!("failed restoring {} network: {}", owner.user, e));
                        None
                    }
                },
                None => {
                    step.push_msg(format!("no saved network for {}", owner.user));
                    None
                }
            };

            for plugin in owner.plugins {
                if !plugin.containerised {
                    step.push_msg(format!("ignored {}: no container associated", plugin.container));
                    continue;
                }
                let Some(doc) = find_document(plugins_dir, CONTAINERS_DIR, &plugin.container) else {
                    step.push_error(
                        AgentError::NotFound(format!("saved container {}", plugin.container))
                            .to_string(),
                    );
                    continue;
                };

                let created = self
                    .runtime
                    .create_container_from_inspect(&doc, network_id.clone())
                    .await;
                match created {
                    Ok(name) => match self.runtime.start(&name).await {
                        Ok(()) => step.push_msg(format!("restored {} container", name)),
                        Err(e) => step.push_error(format!("failed starting {}: {}", name, e)),
                    },
                    Err(e) => step.push_error(format!(
                        "failed restoring {} container: {}",
                        plugin.container, e
                    )),
                }
            }
        }

        if let Err(e) = remove_path(plugins_dir).await {
            debug!(error = %e, "leaving plugin documents behind");
        }
        step
    }

    async fn restore_primary_database(&self, entry: &str) -> StepReport {
        let database = self.platform.primary_database.clone();
        let result = if entry.ends_with(".tar") {
            self.restore_primary_from_copy(&database, entry).await
        } else {
            self.restore_primary_from_archive(&database, entry).await
        };
        let mut step = StepReport::from_result(result, "primary database restore failed");

        if self.host_owner.is_some() {
            if let Err(e) = self
                .chown(&database, PRIMARY_DATABASE_MOUNT, PRIMARY_DATABASE_OWNER)
                .await
            {
                step.push_error(e.to_string());
            }
        }
        step
    }

    /// Current layout: a gzip archive dump restored from the data directory
    async fn restore_primary_from_archive(&self, database: &str, entry: &str) -> Result<()> {
        let password = self.compose.credential(PRIMARY_PASSWORD_VAR).await?;

        // The dump is written from the host, then read by the database user
        if let Some(owner) = self.host_owner {
            self.chown(database, PRIMARY_DATABASE_MOUNT, owner).await?;
        }
        self.extract_entry(entry, &self.host_dir(database)).await?;
        if self.host_owner.is_some() {
            self.chown(database, PRIMARY_DATABASE_MOUNT, PRIMARY_DATABASE_OWNER)
                .await?;
        }

        let restore = format!(
            "mongorestore --gzip --archive={}/{} -u {} -p {}",
            PRIMARY_DATABASE_MOUNT, entry, self.platform.database_user, password
        );
        let restored = self.runtime.exec(database, &restore).await;
        let removed = self
            .runtime
            .exec(database, &format!("rm -f {}/{}", PRIMARY_DATABASE_MOUNT, entry))
            .await;
        restored?;
        removed
    }

    /// Older layout: a tar of `/dump` copied out of the container
    async fn restore_primary_from_copy(&self, database: &str, entry: &str) -> Result<()> {
        let password = self.compose.credential(PRIMARY_PASSWORD_VAR).await?;
        let local = self.extract_entry(entry, &self.paths.session_dir).await?;

        self.runtime.copy_to_container(database, &local, "/").await?;
        let restore = format!(
            "mongorestore -u {} -p {} /dump",
            self.platform.database_user, password
        );
        let restored = self.runtime.exec(database, &restore).await;
        let removed = self.runtime.exec(database, "rm -rf /dump").await;
        let _ = remove_path(&local).await;
        restored?;
        removed
    }

    async fn restore_timeseries_database(&self, entry: &str) -> StepReport {
        let mut notes = Vec::new();
        let generation = match timeseries::probe(&self.platform.timeseries_ping_url).await {
            Some(generation) => generation,
            None => {
                notes.push("timeseries version not detected, assuming 2.x".to_string());
                Generation::V2
            }
        };
        let target = TimeseriesTarget::for_generation(generation, &self.platform);

        let result = self.restore_timeseries_dump(&target, entry).await;
        let mut step = StepReport::from_result(result, "timeseries database restore failed");
        for note in notes {
            step.push_msg(note);
        }

        if self.host_owner.is_some() {
            if let Err(e) = self.chown(&target.container, &target.mount, TIMESERIES_OWNER).await {
                step.push_error(e.to_string());
            }
        }
        step
    }

    async fn restore_timeseries_dump(&self, target: &TimeseriesTarget, entry: &str) -> Result<()> {
        if let Some(owner) = self.host_owner {
            self.chown(&target.container, &target.mount, owner).await?;
        }

        let sub_archive = self.extract_entry(entry, &self.paths.session_dir).await?;
        let unpacked = self.unpack(&sub_archive, &self.host_dir(&target.container)).await;
        let _ = remove_path(&sub_archive).await;
        unpacked?;

        let dump_dir = entry.trim_end_matches(".tar");
        let restored = self
            .runtime
            .exec(&target.container, &target.restore_command(dump_dir))
            .await;
        let removed = self
            .runtime
            .exec(&target.container, &target.remove_command(dump_dir))
            .await;
        restored?;
        removed
    }

    /// Restart the core services in dependency order
    pub async fn restart_platform(&self) -> StepReport {
        let mut step = StepReport::ok();
        for container in [
            &self.platform.primary_database,
            &self.platform.timeseries_database,
            &self.platform.application,
        ] {
            match self.runtime.restart(container).await {
                Ok(()) => debug!(container = %container, "restarted"),
                Err(e) => step.push_error(format!("failed restarting {}: {}", container, e)),
            }
        }
        step
    }

    async fn clean(&mut self) -> StepReport {
        self.downloaded = None;

        let mut step = StepReport::ok();
        for path in [
            &self.paths.archive,
            &self.paths.legacy_archive,
            &self.paths.session_dir,
        ] {
            if let Err(e) = remove_path(path).await {
                step.push_error(e.to_string());
            }
        }
        let _ = tokio::fs::remove_dir(&self.paths.backups_root).await;
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::ArchiveWriter;
    use crate::core::backup::{primary_dump_name, PlatformBackup};
    use crate::core::docker::MockContainerRuntime;
    use crate::core::storage::MockArchiveStore;
    use crate::core::testing::{fake_for, seed_platform, Call, FakeRuntime, MIB, TAG};
    use mockall::Sequence;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(dir)
            .into_iter()
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                (
                    entry.path().strip_prefix(dir).unwrap().to_path_buf(),
                    fs::read(entry.path()).unwrap(),
                )
            })
            .collect()
    }

    /// Back up a seeded platform and stash the archive outside the data root
    async fn backed_up(root: &Path, fake: Arc<FakeRuntime>, config: &AgentConfig) -> PathBuf {
        let mut backup = PlatformBackup::new(fake, config, "edge", TAG).unwrap();
        let report = backup.create().await;
        assert!(report.status(), "{:?}", report);

        let stash = root.join("remote.tar.gz");
        fs::copy(backup.archive_path(), &stash).unwrap();
        assert!(backup.clean().await.status);
        stash
    }

    fn serving(stash: PathBuf, key: &'static str) -> MockArchiveStore {
        let mut store = MockArchiveStore::new();
        store
            .expect_download()
            .withf(move |k, _| k == key)
            .times(1)
            .returning(move |_, dest| {
                fs::copy(&stash, dest)
                    .map(|_| ())
                    .map_err(|e| AgentError::io("copy", e))
            });
        store
    }

    #[tokio::test]
    async fn test_restore_scenario() {
        let root = TempDir::new().unwrap();
        let config = seed_platform(root.path());
        let app_dir = config.backups.data_path.join("thinger");
        let expected = snapshot(&app_dir);

        let backup_runtime = Arc::new(fake_for(&config).dump_size(5 * MIB));
        let stash = backed_up(root.path(), backup_runtime, &config).await;

        // Clean environment
        fs::remove_dir_all(&app_dir).unwrap();

        let fake = Arc::new(fake_for(&config));
        let store = serving(stash, "edge_2024-01-01T00:00:00Z.tar.gz");
        let mut restore =
            PlatformRestore::new(fake.clone(), &config, "edge", TAG).unwrap().with_host_owner(None);
        let report = restore.run(&store).await;

        assert!(report.status(), "{:?}", report);
        assert!(report.step(RESTORE_APPLICATION).unwrap().status);
        assert!(report.step(RESTORE_PRIMARY_DATABASE).unwrap().status);
        assert_eq!(snapshot(&app_dir), expected);

        assert_eq!(fake.restarts(), vec!["mongodb", "influxdb2", "thinger"]);
        let stops: Vec<_> = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Stop(_)))
            .collect();
        assert_eq!(stops, vec![Call::Stop("thinger".to_string())]);

        let mongo = fake.execs("mongodb");
        assert!(mongo[0].starts_with("mongorestore --gzip --archive=/data/db/mongodbdump-"));
        // Dump removed again and scratch space gone
        assert!(!config
            .backups
            .data_path
            .join("mongodb")
            .join(primary_dump_name("mongodb", TAG))
            .exists());
        assert!(!config.backups.data_path.join("backups").exists());
    }

    #[tokio::test]
    async fn test_ownership_is_flipped_when_not_root() {
        let root = TempDir::new().unwrap();
        let config = seed_platform(root.path());
        let stash = backed_up(root.path(), Arc::new(fake_for(&config)), &config).await;

        let fake = Arc::new(fake_for(&config));
        let store = serving(stash, "edge_2024-01-01T00:00:00Z.tar.gz");
        let mut restore = PlatformRestore::new(fake.clone(), &config, "edge", TAG).unwrap()
            .with_host_owner(Some((1000, 1000)));
        let report = restore.run(&store).await;
        assert!(report.status(), "{:?}", report);

        let mongo = fake.execs("mongodb");
        assert_eq!(mongo[0], "chown 1000:1000 /data/db");
        assert_eq!(mongo[1], "chown 999:999 /data/db");
        assert!(mongo[2].starts_with("mongorestore "));
        assert!(mongo[3].starts_with("rm -f /data/db/"));
        assert_eq!(mongo[4], "chown 999:999 /data/db");

        let app = fake.execs("thinger");
        assert_eq!(app, vec!["rm -rf /data/users /data/certificates", "chown 1000:1000 /data"]);
    }

    #[tokio::test]
    async fn test_plugins_are_recreated_on_new_network() {
        let root = TempDir::new().unwrap();
        let config = seed_platform(root.path());
        let users = config.backups.data_path.join("thinger/users");
        let runner = users.join("alice/plugins/runner/files");
        fs::create_dir_all(&runner).unwrap();
        fs::write(runner.join("plugin.json"), r#"{"task":{"type":"docker"}}"#).unwrap();
        fs::create_dir_all(users.join("alice/plugins/static")).unwrap();
        let stash = backed_up(root.path(), Arc::new(fake_for(&config)), &config).await;

        let fake = Arc::new(fake_for(&config));
        let store = serving(stash, "edge_2024-01-01T00:00:00Z.tar.gz");
        let mut restore =
            PlatformRestore::new(fake.clone(), &config, "edge", TAG).unwrap().with_host_owner(None);
        let report = restore.run(&store).await;

        let app = report.step(RESTORE_APPLICATION).unwrap();
        let plugins = &app.operation[RESTORE_PLUGINS];
        assert!(plugins.status, "{:?}", plugins);
        assert!(plugins.msg.iter().any(|m| m.contains("ignored alice-static")));

        let calls = fake.calls();
        let network = calls
            .iter()
            .position(|c| matches!(c, Call::CreateNetwork(p) if p.ends_with("networks/alice.json")))
            .expect("network recreated");
        let container = calls
            .iter()
            .position(|c| {
                matches!(c, Call::CreateContainer { inspect, network_id }
                    if inspect.ends_with("containers/alice-runner.json")
                        && network_id.as_deref() == Some("net-alice"))
            })
            .expect("container recreated");
        assert!(network < container);
        assert!(calls.contains(&Call::Start("alice-runner".to_string())));
        assert!(!calls.contains(&Call::Start("alice-static".to_string())));

        // The plugin document archive does not stay in the data directory
        assert!(!config
            .backups
            .data_path
            .join("thinger")
            .join(plugin_archive_name(TAG))
            .exists());
    }

    #[tokio::test]
    async fn test_legacy_archive_name_and_dump_layout() {
        let root = TempDir::new().unwrap();
        let config = seed_platform(root.path());

        // Plain tar holding a `/dump` copy as written by older agents
        let scratch = root.path().join("scratch");
        fs::create_dir_all(scratch.join("dump/thinger")).unwrap();
        fs::write(scratch.join("dump/thinger/devices.bson"), b"bson").unwrap();
        let dump_copy = root.path().join("dumpcopy.tar");
        let mut inner = ArchiveWriter::create(&dump_copy).unwrap();
        inner.add_directory(scratch.join("dump"), "dump").unwrap();
        inner.finish().unwrap();
        let legacy = root.path().join("legacy.tar");
        let mut outer = ArchiveWriter::create(&legacy).unwrap();
        outer.add_entry(&dump_copy, format!("mongodbdump-{}.tar", TAG)).unwrap();
        outer.finish().unwrap();

        let mut store = MockArchiveStore::new();
        store
            .expect_download()
            .withf(|key, _| key.ends_with(".tar.gz"))
            .times(1)
            .returning(|key, _| Err(AgentError::NotFound(key.to_string())));
        store
            .expect_download()
            .withf(|key, _| key == "edge_2024-01-01T00:00:00Z.tar")
            .times(1)
            .returning(move |_, dest| {
                fs::copy(&legacy, dest)
                    .map(|_| ())
                    .map_err(|e| AgentError::io("copy", e))
            });

        let fake = Arc::new(fake_for(&config));
        let mut restore =
            PlatformRestore::new(fake.clone(), &config, "edge", TAG).unwrap().with_host_owner(None);
        let report = restore.run(&store).await;

        assert!(report.status(), "{:?}", report);
        assert!(report.step(DOWNLOAD).unwrap().msg[0].ends_with(".tar"));
        assert!(fake.calls().contains(&Call::CopyTo {
            container: "mongodb".to_string(),
            dest: "/".to_string()
        }));
        assert_eq!(
            fake.execs("mongodb"),
            vec!["mongorestore -u thinger -p pw123 /dump", "rm -rf /dump"]
        );
    }

    #[tokio::test]
    async fn test_failed_download_aborts_without_restart() {
        let root = TempDir::new().unwrap();
        let config = seed_platform(root.path());
        let mut store = MockArchiveStore::new();
        store
            .expect_download()
            .times(2)
            .returning(|key, _| Err(AgentError::NotFound(key.to_string())));

        let fake = Arc::new(fake_for(&config));
        let mut restore =
            PlatformRestore::new(fake.clone(), &config, "edge", TAG).unwrap().with_host_owner(None);
        let report = restore.run(&store).await;

        assert!(!report.status());
        assert!(!report.step(DOWNLOAD).unwrap().status);
        assert!(report.step(RESTART).is_none());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_still_restarts_everything() {
        let root = TempDir::new().unwrap();
        let config = seed_platform(root.path());
        let stash = backed_up(root.path(), Arc::new(fake_for(&config)), &config).await;

        let fake = Arc::new(fake_for(&config).fail("mongodb", "mongorestore"));
        let store = serving(stash, "edge_2024-01-01T00:00:00Z.tar.gz");
        let mut restore =
            PlatformRestore::new(fake.clone(), &config, "edge", TAG).unwrap().with_host_owner(None);
        let report = restore.run(&store).await;

        assert!(!report.status());
        assert!(!report.step(RESTORE_PRIMARY_DATABASE).unwrap().status);
        assert!(report.step(RESTORE_APPLICATION).unwrap().status);
        assert!(report.step(RESTART).unwrap().status);
        assert_eq!(fake.restarts(), vec!["mongodb", "influxdb2", "thinger"]);
        // The dump is still removed after a failed restore
        assert!(fake.execs("mongodb").iter().any(|c| c.starts_with("rm -f ")));
    }

    #[tokio::test]
    async fn test_restart_order_with_mock_runtime() {
        let mut runtime = MockContainerRuntime::new();
        let mut seq = Sequence::new();
        for name in ["mongodb", "influxdb2", "thinger"] {
            runtime
                .expect_restart()
                .withf(move |container| container == name)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        let root = TempDir::new().unwrap();
        let config = crate::core::testing::config_for(root.path());
        let restore = PlatformRestore::new(Arc::new(runtime), &config, "edge", TAG).unwrap();
        assert!(restore.restart_platform().await.status);
    }

    #[test]
    fn test_classify_entry_by_prefix() {
        let platform = PlatformSettings::default();
        let kind = |name: &str| classify_entry(name, &platform);
        assert_eq!(kind("thinger-2024.tar"), Some(EntryKind::Application));
        assert_eq!(kind("mongodbdump-2024.gz"), Some(EntryKind::PrimaryDatabase));
        assert_eq!(kind("mongodbdump-2024.tar"), Some(EntryKind::PrimaryDatabase));
        assert_eq!(kind("influxdbdump-2024.tar"), Some(EntryKind::TimeseriesDatabase));
        assert_eq!(kind("influxdb2dump-2024.tar"), Some(EntryKind::TimeseriesDatabase));
        assert_eq!(kind("plugins/alice.json"), Some(EntryKind::Plugins));
        assert_eq!(kind("README"), None);
    }
}
