pub mod archive;
pub mod backup;
pub mod callback;
pub mod compose;
pub mod docker;
pub mod error;
pub mod guard;
pub mod orchestrator;
pub mod report;
pub mod restore;
pub mod sigv4;
pub mod storage;
pub mod timeseries;
pub mod updater;

#[cfg(test)]
pub(crate) mod testing;

pub use backup::PlatformBackup;
pub use docker::{ContainerRuntime, DockerRuntime};
pub use error::{AgentError, ArchiveError};
pub use guard::{Admission, TaskGuard};
pub use orchestrator::{BackupSystem, Orchestrator, TriggerResponse};
pub use report::{OperationReport, StepReport};
pub use restore::PlatformRestore;
pub use storage::{ArchiveStore, ObjectStorage};
