//! Entry points for maintenance triggers
//!
//! Every trigger is admitted through the shared [`TaskGuard`] and runs as a
//! detached worker. Backup and restore reports are wrapped with the device
//! identity and handed to the configured sinks when the worker finishes.

use chrono::Utc;
use serde_json::{json, Value};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::backup::{PlatformBackup, CREATE_SESSION_FOLDER};
use crate::core::callback::{deliver_all, HttpReportSink, ReportSink};
use crate::core::docker::{ContainerRuntime, DockerRuntime};
use crate::core::error::{AgentError, Result};
use crate::core::guard::{Admission, TaskGuard};
use crate::core::report::{OperationReport, StepReport};
use crate::core::restore::PlatformRestore;
use crate::core::storage::{ArchiveStore, ObjectStorage};
use crate::core::updater;
use crate::utils::{
    hostname, is_root, session_tag, AgentConfig, SessionPaths, BACKUP_FINISHED_ENDPOINT,
    RESTORE_FINISHED_ENDPOINT, TASK_BACKUP, TASK_RESTORE, TASK_UPDATE, TASK_UPDATE_DISTRO,
};

/// Backup implementations selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSystem {
    Platform,
}

impl FromStr for BackupSystem {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "platform" => Ok(BackupSystem::Platform),
            "" => Err(AgentError::Config("no backup system configured".to_string())),
            other => Err(AgentError::Config(format!("unknown backup system '{}'", other))),
        }
    }
}

/// Answer to a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResponse {
    Launched,
    /// The same task is already running
    AlreadyExecuting,
    /// Another task (named) is running
    Executing(String),
    NotConfigured(String),
}

impl TriggerResponse {
    pub fn is_launched(&self) -> bool {
        matches!(self, TriggerResponse::Launched)
    }

    pub fn message(&self) -> String {
        match self {
            TriggerResponse::Launched => "launched".to_string(),
            TriggerResponse::AlreadyExecuting => "already executing".to_string(),
            TriggerResponse::Executing(task) => format!("executing {}", task),
            TriggerResponse::NotConfigured(reason) => reason.clone(),
        }
    }
}

/// Session tag for a trigger, the current time when none was given
pub fn resolve_tag(tag: Option<String>) -> String {
    tag.map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| session_tag(Utc::now()))
}

/// Report for a session that could not be set up
fn refused_session(error: AgentError) -> OperationReport {
    let mut report = OperationReport::new();
    report.record(CREATE_SESSION_FOLDER, StepReport::failed(error.to_string()));
    report
}

/// Body delivered to the report sinks
pub fn report_payload(device: &str, hostname: &str, kind: &str, report: &OperationReport) -> Value {
    json!({
        "device": device,
        "hostname": hostname,
        kind: report,
    })
}

pub struct Orchestrator {
    guard: Arc<TaskGuard>,
    config: Arc<AgentConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    store: Option<Arc<dyn ArchiveStore>>,
    sinks: Vec<Arc<dyn ReportSink>>,
    device: String,
    hostname: String,
    is_root: bool,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, runtime: Arc<dyn ContainerRuntime>, guard: Arc<TaskGuard>) -> Self {
        let hostname = config.device.hostname.clone().unwrap_or_else(hostname);
        let device = config.device.id.clone().unwrap_or_else(|| hostname.clone());

        Self {
            guard,
            config: Arc::new(config),
            runtime,
            store: None,
            sinks: Vec::new(),
            device,
            hostname,
            is_root: is_root(),
        }
    }

    /// Wire the real runtime, storage and callback from configuration
    pub fn from_config(config: AgentConfig, guard: Arc<TaskGuard>) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::connect(&config.platform.docker_socket)?);
        let store = match config.s3() {
            Some(settings) => Some(Arc::new(ObjectStorage::new(settings)?) as Arc<dyn ArchiveStore>),
            None => {
                warn!(storage = %config.backups.storage, "no usable storage section configured");
                None
            }
        };
        let callback = HttpReportSink::from_config(&config)?;

        let mut orchestrator = Self::new(config, runtime, guard);
        orchestrator.store = store;
        if let Some(sink) = callback {
            orchestrator.sinks.push(Arc::new(sink));
        }
        Ok(orchestrator)
    }

    pub fn with_store(mut self, store: Arc<dyn ArchiveStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    pub fn guard(&self) -> &Arc<TaskGuard> {
        &self.guard
    }

    fn backup_setup(&self) -> std::result::Result<(BackupSystem, Arc<dyn ArchiveStore>), TriggerResponse> {
        let system = self
            .config
            .backups
            .system
            .parse::<BackupSystem>()
            .map_err(|e| TriggerResponse::NotConfigured(e.to_string()))?;
        let store = self.store.clone().ok_or_else(|| {
            TriggerResponse::NotConfigured(format!(
                "storage '{}' is not configured",
                self.config.backups.storage
            ))
        })?;
        Ok((system, store))
    }

    /// Refuse tags that would place session files outside the backups directory
    fn check_session(&self, tag: &str) -> std::result::Result<(), TriggerResponse> {
        match SessionPaths::new(&self.config.backups.data_path, &self.hostname, tag) {
            Some(_) => Ok(()),
            None => Err(TriggerResponse::NotConfigured(format!(
                "invalid session tag '{}'",
                tag
            ))),
        }
    }

    fn admit<F>(&self, task: &str, tag: Option<String>, work: F) -> TriggerResponse
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.guard.submit(task, tag, work) {
            Admission::Accepted => TriggerResponse::Launched,
            Admission::Busy(running) if running == task => TriggerResponse::AlreadyExecuting,
            Admission::Busy(running) => TriggerResponse::Executing(running),
        }
    }

    pub fn backup(&self, tag: Option<String>, endpoint: Option<String>) -> TriggerResponse {
        let (system, store) = match self.backup_setup() {
            Ok(setup) => setup,
            Err(response) => return response,
        };
        let tag = resolve_tag(tag);
        if let Err(response) = self.check_session(&tag) {
            return response;
        }
        let endpoint = endpoint.unwrap_or_else(|| BACKUP_FINISHED_ENDPOINT.to_string());

        let runtime = self.runtime.clone();
        let config = self.config.clone();
        let sinks = self.sinks.clone();
        let device = self.device.clone();
        let hostname = self.hostname.clone();
        let session = tag.clone();

        let work = async move {
            let report = match system {
                BackupSystem::Platform => match PlatformBackup::new(runtime, &config, &hostname, &session) {
                    Ok(mut backup) => backup.run(store.as_ref()).await,
                    Err(e) => refused_session(e),
                },
            };
            info!(tag = %session, status = report.status(), "backup task finished");
            let payload = report_payload(&device, &hostname, TASK_BACKUP, &report);
            deliver_all(&sinks, &endpoint, &payload).await;
        };

        self.admit(TASK_BACKUP, Some(tag), work)
    }

    pub fn restore(&self, tag: &str, endpoint: Option<String>) -> TriggerResponse {
        let (system, store) = match self.backup_setup() {
            Ok(setup) => setup,
            Err(response) => return response,
        };
        if tag.trim().is_empty() {
            return TriggerResponse::NotConfigured("restore needs a backup tag".to_string());
        }
        if let Err(response) = self.check_session(tag.trim()) {
            return response;
        }
        let endpoint = endpoint.unwrap_or_else(|| RESTORE_FINISHED_ENDPOINT.to_string());

        let runtime = self.runtime.clone();
        let config = self.config.clone();
        let sinks = self.sinks.clone();
        let device = self.device.clone();
        let hostname = self.hostname.clone();
        let session = tag.trim().to_string();

        let work = async move {
            let report = match system {
                BackupSystem::Platform => match PlatformRestore::new(runtime, &config, &hostname, &session) {
                    Ok(mut restore) => restore.run(store.as_ref()).await,
                    Err(e) => refused_session(e),
                },
            };
            info!(tag = %session, status = report.status(), "restore task finished");
            let payload = report_payload(&device, &hostname, TASK_RESTORE, &report);
            deliver_all(&sinks, &endpoint, &payload).await;
        };

        self.admit(TASK_RESTORE, Some(tag.trim().to_string()), work)
    }

    pub fn update(&self) -> TriggerResponse {
        if !self.is_root {
            return TriggerResponse::NotConfigured("system updates require root".to_string());
        }
        self.admit(TASK_UPDATE, None, async {
            if let Err(e) = updater::upgrade_packages().await {
                error!(error = %e, "package upgrade failed");
            }
        })
    }

    pub fn update_distro(&self) -> TriggerResponse {
        if !self.is_root {
            return TriggerResponse::NotConfigured("system updates require root".to_string());
        }
        self.admit(TASK_UPDATE_DISTRO, None, async {
            if let Err(e) = updater::upgrade_distribution().await {
                error!(error = %e, "release upgrade failed");
            }
        })
    }
}
