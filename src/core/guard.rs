//! Exclusive maintenance task slot
//!
//! At most one long operation (update, update_distro, backup, restore) runs
//! at a time. Admission never waits: the stored handle is polled and a
//! trigger arriving while it is still running is rejected on the spot.
//!
//! Workers are detached. Nothing cancels or times them out; a stuck worker
//! keeps the slot busy until the process restarts.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Outcome of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Another task (named) is still running
    Busy(String),
}

struct RunningTask {
    name: String,
    tag: Option<String>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskGuard {
    slot: Mutex<Option<RunningTask>>,
}

impl TaskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningTask>> {
        // The slot holds no invariant a panicking holder could break
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `work` as a detached worker unless a task is already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&self, name: &str, tag: Option<String>, work: F) -> Admission
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.lock();

        if let Some(running) = slot.as_ref() {
            if !running.handle.is_finished() {
                debug!(running = %running.name, rejected = name, "maintenance task busy");
                return Admission::Busy(running.name.clone());
            }
        }

        info!(task = name, tag = tag.as_deref().unwrap_or(""), "launching maintenance task");
        let handle = tokio::spawn(work);
        *slot = Some(RunningTask {
            name: name.to_string(),
            tag,
            handle,
        });

        Admission::Accepted
    }

    /// Name and tag of the running task, if any
    ///
    /// A finished handle is discarded here.
    pub fn current(&self) -> Option<(String, Option<String>)> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(running) if !running.handle.is_finished() => {
                Some((running.name.clone(), running.tag.clone()))
            }
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_idle(guard: &TaskGuard) {
        for _ in 0..200 {
            if guard.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never finished");
    }

    #[tokio::test]
    async fn test_busy_while_running_then_accepted() {
        let guard = TaskGuard::new();
        let (release, hold) = oneshot::channel::<()>();

        let first = guard.submit("backup", Some("t1".into()), async move {
            let _ = hold.await;
        });
        assert_eq!(first, Admission::Accepted);

        assert_eq!(
            guard.submit("restore", None, async {}),
            Admission::Busy("backup".to_string())
        );
        assert_eq!(
            guard.current(),
            Some(("backup".to_string(), Some("t1".to_string())))
        );

        release.send(()).unwrap();
        wait_idle(&guard).await;

        assert_eq!(guard.submit("restore", None, async {}), Admission::Accepted);
    }

    #[tokio::test]
    async fn test_same_name_is_not_reentrant() {
        let guard = TaskGuard::new();
        let (release, hold) = oneshot::channel::<()>();

        guard.submit("update", None, async move {
            let _ = hold.await;
        });
        assert_eq!(
            guard.submit("update", None, async {}),
            Admission::Busy("update".to_string())
        );

        drop(release);
        wait_idle(&guard).await;
    }

    #[tokio::test]
    async fn test_empty_slot_counts_as_finished() {
        let guard = TaskGuard::new();
        assert!(guard.is_idle());
        assert_eq!(guard.submit("update_distro", None, async {}), Admission::Accepted);
    }
}
