use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::utils::short_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Capture,
    Export,
    Render,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Capture => write!(f, "capture"),
            TaskKind::Export => write!(f, "export"),
            TaskKind::Render => write!(f, "render"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a job body ended, when it did not fail: ran to completion, or
/// noticed a cancellation request and stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
}

pub type JobBody =
    Box<dyn FnOnce(JobContext) -> BoxFuture<'static, anyhow::Result<JobOutcome>> + Send>;

struct TaskState {
    kind: TaskKind,
    subject: String,
    status: TaskStatus,
    progress: f64,
    current: u64,
    total: u64,
    message: String,
    error: Option<String>,
    created_at: DateTime<Local>,
    started_at: Option<DateTime<Local>>,
    finished_at: Option<DateTime<Local>>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

struct TaskHandle {
    id: String,
    state: Mutex<TaskState>,
    cancel: AtomicBool,
}

/// Point-in-time copy of one task, safe to hand to pollers. `rate`,
/// `elapsed` and `eta` are derived from the counters at snapshot time and
/// never stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub kind: TaskKind,
    pub subject: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub current: u64,
    pub total: u64,
    pub message: String,
    pub rate: f64,
    pub elapsed: f64,
    pub eta: f64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl TaskHandle {
    fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().expect("task state poisoned");
        let elapsed = match (state.started, state.finished) {
            (Some(started), Some(finished)) => finished.duration_since(started).as_secs_f64(),
            (Some(started), None) => started.elapsed().as_secs_f64(),
            _ => 0.0,
        };
        let rate = if elapsed > 0.0 && state.current > 0 {
            state.current as f64 / elapsed
        } else {
            0.0
        };
        let eta = if rate > 0.0 && state.total > state.current {
            (state.total - state.current) as f64 / rate
        } else {
            0.0
        };
        TaskSnapshot {
            id: self.id.clone(),
            kind: state.kind,
            subject: state.subject.clone(),
            status: state.status,
            progress: state.progress,
            current: state.current,
            total: state.total,
            message: state.message.clone(),
            rate,
            elapsed,
            eta,
            error: state.error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }
}

/// Capability handed to a running job body: report progress, check for a
/// cancellation request. Both are cheap and never block.
#[derive(Clone)]
pub struct JobContext {
    handle: Arc<TaskHandle>,
}

impl JobContext {
    /// Update the progress counters. `total == 0` means unknown; the
    /// percentage only moves forward while the task runs.
    pub fn report(&self, current: u64, total: u64, message: impl Into<String>) {
        let mut state = self.handle.state.lock().expect("task state poisoned");
        if state.status != TaskStatus::Running {
            return;
        }
        state.current = current;
        state.total = total;
        state.message = message.into();
        if total > 0 {
            let pct = (current as f64 / total as f64 * 100.0).min(100.0);
            if pct > state.progress {
                state.progress = pct;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.cancel.load(Ordering::Relaxed)
    }
}

/// Registry of all in-flight and recently finished tasks, plus the bounded
/// pool their bodies run on. One instance is constructed at startup and
/// shared by handle; there is no global lookup.
pub struct TaskManager {
    tasks: Mutex<HashMap<String, Arc<TaskHandle>>>,
    pool: Arc<Semaphore>,
    retention: Duration,
}

impl TaskManager {
    pub fn new(max_workers: usize, retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            pool: Arc::new(Semaphore::new(max_workers.max(1))),
            retention,
        })
    }

    /// Create a pending task and schedule its body on the worker pool.
    /// Returns the task id immediately; the body runs asynchronously.
    pub fn submit(&self, kind: TaskKind, subject: &str, body: JobBody) -> String {
        let handle = Arc::new(TaskHandle {
            id: short_id(),
            state: Mutex::new(TaskState {
                kind,
                subject: subject.to_string(),
                status: TaskStatus::Pending,
                progress: 0.0,
                current: 0,
                total: 0,
                message: String::new(),
                error: None,
                created_at: Local::now(),
                started_at: None,
                finished_at: None,
                started: None,
                finished: None,
            }),
            cancel: AtomicBool::new(false),
        });
        let id = handle.id.clone();
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .insert(id.clone(), handle.clone());
        info!("task {id} submitted: {kind} for {subject}");

        let pool = self.pool.clone();
        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool closed during shutdown
            };

            {
                let mut state = handle.state.lock().expect("task state poisoned");
                if state.status != TaskStatus::Pending {
                    // cancelled before it ever started; the body never runs
                    return;
                }
                state.status = TaskStatus::Running;
                state.started = Some(Instant::now());
                state.started_at = Some(Local::now());
            }

            let ctx = JobContext {
                handle: handle.clone(),
            };
            let result = body(ctx).await;

            let mut state = handle.state.lock().expect("task state poisoned");
            state.finished = Some(Instant::now());
            state.finished_at = Some(Local::now());
            match result {
                Ok(JobOutcome::Completed) => {
                    state.status = TaskStatus::Completed;
                    state.progress = 100.0;
                    info!("task {} completed", handle.id);
                }
                Ok(JobOutcome::Cancelled) => {
                    state.status = TaskStatus::Cancelled;
                    info!("task {} cancelled", handle.id);
                }
                Err(err) => {
                    state.status = TaskStatus::Failed;
                    state.error = Some(format!("{err:#}"));
                    error!("task {} failed: {err:#}", handle.id);
                }
            }
        });

        id
    }

    /// Request cancellation. Returns true iff the task exists and was not
    /// already terminal. A pending task is cancelled on the spot; a running
    /// one only gets the flag and stops when its body next checks it.
    pub fn cancel(&self, id: &str) -> bool {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        let Some(handle) = tasks.get(id) else {
            return false;
        };
        let mut state = handle.state.lock().expect("task state poisoned");
        if state.status.is_terminal() {
            return false;
        }
        handle.cancel.store(true, Ordering::Relaxed);
        if state.status == TaskStatus::Pending {
            state.status = TaskStatus::Cancelled;
            state.finished = Some(Instant::now());
            state.finished_at = Some(Local::now());
        }
        info!("task {id} cancellation requested");
        true
    }

    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.get(id).map(|handle| handle.snapshot())
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        let handles: Vec<Arc<TaskHandle>> = {
            let tasks = self.tasks.lock().expect("task registry poisoned");
            tasks.values().cloned().collect()
        };
        let mut snapshots: Vec<(DateTime<Local>, TaskSnapshot)> = handles
            .iter()
            .map(|handle| {
                let created = handle
                    .state
                    .lock()
                    .expect("task state poisoned")
                    .created_at;
                (created, handle.snapshot())
            })
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        snapshots.into_iter().map(|(_, snap)| snap).collect()
    }

    pub fn list_active(&self) -> Vec<TaskSnapshot> {
        self.list()
            .into_iter()
            .filter(|snap| !snap.status.is_terminal())
            .collect()
    }

    /// Whether a pending or running task already exists for this
    /// subject+kind. The scheduler uses this for de-duplication.
    pub fn has_active(&self, subject: &str, kind: TaskKind) -> bool {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.values().any(|handle| {
            let state = handle.state.lock().expect("task state poisoned");
            state.subject == subject && state.kind == kind && !state.status.is_terminal()
        })
    }

    /// Evict terminal tasks older than the retention window. Active tasks
    /// are never touched.
    pub fn gc(&self) {
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        let retention = self.retention;
        tasks.retain(|_, handle| {
            let state = handle.state.lock().expect("task state poisoned");
            if !state.status.is_terminal() {
                return true;
            }
            match state.finished {
                Some(finished) => finished.elapsed() <= retention,
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tokio::sync::Notify;

    fn body<F, Fut>(f: F) -> JobBody
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
    {
        Box::new(move |ctx| Box::pin(f(ctx)))
    }

    async fn wait_terminal(manager: &Arc<TaskManager>, id: &str) -> TaskSnapshot {
        for _ in 0..500 {
            let snap = manager.get(id).expect("task should exist");
            if snap.status.is_terminal() {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let manager = TaskManager::new(2, Duration::from_secs(300));
        let id = manager.submit(
            TaskKind::Export,
            "garden",
            body(|ctx| async move {
                ctx.report(3, 10, "writing");
                ctx.report(10, 10, "done");
                Ok(JobOutcome::Completed)
            }),
        );
        let snap = wait_terminal(&manager, &id).await;
        assert_eq!(snap.status, TaskStatus::Completed);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.current, 10);
        assert_eq!(snap.error, None);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let manager = TaskManager::new(1, Duration::from_secs(300));
        let checkpoint = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        let (cp, rs) = (checkpoint.clone(), resume.clone());
        let id = manager.submit(
            TaskKind::Export,
            "garden",
            body(move |ctx| async move {
                ctx.report(3, 10, "ahead");
                cp.notify_one();
                rs.notified().await;
                // a lower current must not move the percentage backwards
                ctx.report(2, 10, "behind");
                cp.notify_one();
                rs.notified().await;
                Ok(JobOutcome::Completed)
            }),
        );
        checkpoint.notified().await;
        let before = manager.get(&id).unwrap();
        assert_eq!(before.progress, 30.0);
        resume.notify_one();
        checkpoint.notified().await;
        let after = manager.get(&id).unwrap();
        assert_eq!(after.progress, 30.0);
        assert_eq!(after.current, 2);
        resume.notify_one();
        wait_terminal(&manager, &id).await;
    }

    #[tokio::test]
    async fn rate_and_eta_are_derived() {
        let manager = TaskManager::new(1, Duration::from_secs(300));
        let checkpoint = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        let (cp, rs) = (checkpoint.clone(), resume.clone());
        let id = manager.submit(
            TaskKind::Render,
            "garden",
            body(move |ctx| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.report(5, 10, "encoding");
                cp.notify_one();
                rs.notified().await;
                Ok(JobOutcome::Completed)
            }),
        );
        checkpoint.notified().await;
        let snap = manager.get(&id).unwrap();
        assert!(snap.elapsed > 0.0);
        assert!(snap.rate > 0.0);
        assert!(snap.eta > 0.0);
        resume.notify_one();
        wait_terminal(&manager, &id).await;
    }

    #[tokio::test]
    async fn cancelling_pending_task_skips_the_body() {
        let manager = TaskManager::new(1, Duration::from_secs(300));
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        // occupy the single worker so the next submit stays pending
        let blocker = manager.submit(
            TaskKind::Capture,
            "front",
            body(move |_ctx| async move {
                release.notified().await;
                Ok(JobOutcome::Completed)
            }),
        );
        for _ in 0..100 {
            if manager.get(&blocker).unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();
        let victim = manager.submit(
            TaskKind::Capture,
            "back",
            body(move |_ctx| async move {
                ran_flag.store(true, Ordering::Relaxed);
                Ok(JobOutcome::Completed)
            }),
        );
        assert!(manager.cancel(&victim));
        assert_eq!(manager.get(&victim).unwrap().status, TaskStatus::Cancelled);
        gate.notify_one();
        wait_terminal(&manager, &blocker).await;
        // give the worker a chance to (incorrectly) run the cancelled body
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn running_task_observes_cancellation() {
        let manager = TaskManager::new(1, Duration::from_secs(300));
        let id = manager.submit(
            TaskKind::Export,
            "garden",
            body(|ctx| async move {
                loop {
                    if ctx.is_cancelled() {
                        return Ok(JobOutcome::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }),
        );
        // let it reach running before requesting cancellation
        for _ in 0..100 {
            if manager.get(&id).unwrap().status == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.cancel(&id));
        let snap = wait_terminal(&manager, &id).await;
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert_eq!(snap.error, None);
    }

    #[tokio::test]
    async fn body_error_marks_task_failed() {
        let manager = TaskManager::new(2, Duration::from_secs(300));
        let id = manager.submit(
            TaskKind::Capture,
            "front",
            body(|_ctx| async move { Err(anyhow!("fetch refused")) }),
        );
        let snap = wait_terminal(&manager, &id).await;
        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.error.unwrap().contains("fetch refused"));
    }

    #[tokio::test]
    async fn one_failure_does_not_touch_other_tasks() {
        let manager = TaskManager::new(2, Duration::from_secs(300));
        let bad = manager.submit(
            TaskKind::Capture,
            "front",
            body(|_ctx| async move { Err(anyhow!("boom")) }),
        );
        let good = manager.submit(
            TaskKind::Capture,
            "back",
            body(|_ctx| async move { Ok(JobOutcome::Completed) }),
        );
        assert_eq!(wait_terminal(&manager, &bad).await.status, TaskStatus::Failed);
        assert_eq!(
            wait_terminal(&manager, &good).await.status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_is_false_for_terminal_or_unknown_tasks() {
        let manager = TaskManager::new(1, Duration::from_secs(300));
        let id = manager.submit(
            TaskKind::Capture,
            "front",
            body(|_ctx| async move { Ok(JobOutcome::Completed) }),
        );
        wait_terminal(&manager, &id).await;
        assert!(!manager.cancel(&id));
        assert!(!manager.cancel("nope"));
    }

    #[tokio::test]
    async fn has_active_tracks_subject_and_kind() {
        let manager = TaskManager::new(1, Duration::from_secs(300));
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        let id = manager.submit(
            TaskKind::Capture,
            "front",
            body(move |_ctx| async move {
                release.notified().await;
                Ok(JobOutcome::Completed)
            }),
        );
        assert!(manager.has_active("front", TaskKind::Capture));
        assert!(!manager.has_active("front", TaskKind::Export));
        assert!(!manager.has_active("back", TaskKind::Capture));
        gate.notify_one();
        wait_terminal(&manager, &id).await;
        assert!(!manager.has_active("front", TaskKind::Capture));
    }

    #[tokio::test]
    async fn gc_evicts_only_expired_terminal_tasks() {
        let manager = TaskManager::new(2, Duration::from_millis(0));
        let done = manager.submit(
            TaskKind::Export,
            "garden",
            body(|_ctx| async move { Ok(JobOutcome::Completed) }),
        );
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        let active = manager.submit(
            TaskKind::Export,
            "yard",
            body(move |_ctx| async move {
                release.notified().await;
                Ok(JobOutcome::Completed)
            }),
        );
        wait_terminal(&manager, &done).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.gc();
        assert!(manager.get(&done).is_none());
        assert!(manager.get(&active).is_some());
        gate.notify_one();
        wait_terminal(&manager, &active).await;
    }

    #[tokio::test]
    async fn list_active_excludes_terminal_tasks() {
        let manager = TaskManager::new(2, Duration::from_secs(300));
        let done = manager.submit(
            TaskKind::Capture,
            "front",
            body(|_ctx| async move { Ok(JobOutcome::Completed) }),
        );
        wait_terminal(&manager, &done).await;
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        let running = manager.submit(
            TaskKind::Capture,
            "back",
            body(move |_ctx| async move {
                release.notified().await;
                Ok(JobOutcome::Completed)
            }),
        );
        let active = manager.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running);
        assert_eq!(manager.list().len(), 2);
        gate.notify_one();
        wait_terminal(&manager, &running).await;
    }
}
