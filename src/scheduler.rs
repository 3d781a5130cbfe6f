use crate::schedule::ScheduleRule;
use crate::tasks::{JobBody, TaskKind, TaskManager};
use anyhow::{Result, anyhow};
use chrono::{Local, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One schedulable unit: a camera (capture jobs) or an export definition
/// (export jobs). Read-only to the scheduler; editing happens in config.
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: String,
    pub kind: TaskKind,
    pub enabled: bool,
    pub rules: Vec<ScheduleRule>,
}

/// Builds the job body to run when a subject fires. The scheduler never
/// knows what a job does; it only submits what the factory hands back.
pub type JobFactory = Arc<dyn Fn(&Subject) -> JobBody + Send + Sync>;

/// Evaluates every enabled schedule once per tick and submits matching
/// jobs to the task manager. Job bodies run on the manager's worker pool,
/// so a slow job never delays the next tick.
pub struct Scheduler {
    tasks: Arc<TaskManager>,
    factory: JobFactory,
    subjects: Arc<Mutex<Arc<Vec<Subject>>>>,
    tick_interval: Duration,
    running: Arc<AtomicBool>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

/// Submit a job for `subject` unless one of the same kind is already
/// pending or running. A skipped duplicate is a log line, not an error.
fn fire(subject: &Subject, tasks: &TaskManager, factory: &JobFactory) -> Option<String> {
    if tasks.has_active(&subject.id, subject.kind) {
        info!(
            "skipping {} for {}: a {} task is already active",
            subject.kind, subject.id, subject.kind
        );
        return None;
    }
    debug!("firing {} for {}", subject.kind, subject.id);
    Some(tasks.submit(subject.kind, &subject.id, factory(subject)))
}

fn tick_set(subjects: &[Subject], tasks: &TaskManager, factory: &JobFactory, now: NaiveDateTime) {
    for subject in subjects {
        if !subject.enabled {
            continue;
        }
        let matched = subject
            .rules
            .iter()
            .any(|rule| rule.enabled && rule.trigger.matches(now));
        if matched {
            fire(subject, tasks, factory);
        }
    }
    tasks.gc();
}

impl Scheduler {
    pub fn new(tasks: Arc<TaskManager>, factory: JobFactory, tick_interval: Duration) -> Self {
        Self {
            tasks,
            factory,
            subjects: Arc::new(Mutex::new(Arc::new(Vec::new()))),
            tick_interval,
            running: Arc::new(AtomicBool::new(false)),
            runner: Mutex::new(None),
        }
    }

    /// Replace the whole subject set in one swap. In-flight tasks keep
    /// running; a tick that already started keeps evaluating the set it
    /// saw, the next tick sees only the new one.
    pub fn reload(&self, subjects: Vec<Subject>) {
        let count = subjects.len();
        *self.subjects.lock().expect("subject set poisoned") = Arc::new(subjects);
        info!("scheduler reloaded with {count} subjects");
    }

    pub fn subjects(&self) -> Arc<Vec<Subject>> {
        self.subjects.lock().expect("subject set poisoned").clone()
    }

    /// Evaluate every enabled rule of every enabled subject against `now`
    /// and submit at most one job per subject. Also sweeps expired
    /// terminal tasks, this being the only periodic actor.
    pub fn tick(&self, now: NaiveDateTime) {
        let subjects = self.subjects();
        tick_set(&subjects, &self.tasks, &self.factory, now);
    }

    /// Manual trigger for one subject, bypassing its schedules but going
    /// through the same de-duplication and task machinery as a tick.
    /// `Ok(None)` means an identical task was already active.
    pub fn run_now(&self, subject_id: &str) -> Result<Option<String>> {
        let subjects = self.subjects();
        let subject = subjects
            .iter()
            .find(|s| s.id == subject_id)
            .ok_or_else(|| anyhow!("unknown subject: {subject_id}"))?;
        Ok(fire(subject, &self.tasks, &self.factory))
    }

    /// Start the periodic tick loop.
    pub fn start(&self) {
        self.running.store(true, Ordering::Relaxed);
        let running = self.running.clone();
        let subjects = self.subjects.clone();
        let tasks = self.tasks.clone();
        let factory = self.factory.clone();
        let interval = self.tick_interval;
        let handle = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let snapshot = subjects.lock().expect("subject set poisoned").clone();
                tick_set(
                    &snapshot,
                    &tasks,
                    &factory,
                    Local::now().naive_local(),
                );
                tokio::time::sleep(interval).await;
            }
        });
        let mut slot = self.runner.lock().expect("runner slot poisoned");
        *slot = Some(handle);
        info!("scheduler started, ticking every {:?}", self.tick_interval);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.runner.lock().expect("runner slot poisoned").take() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Trigger;
    use crate::tasks::JobOutcome;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn cron_rule(second: &str, minute: &str, hour: &str) -> ScheduleRule {
        ScheduleRule {
            id: "r0".to_string(),
            enabled: true,
            trigger: Trigger::cron(second, minute, hour).unwrap(),
        }
    }

    fn subject(id: &str, kind: TaskKind, rules: Vec<ScheduleRule>) -> Subject {
        Subject {
            id: id.to_string(),
            kind,
            enabled: true,
            rules,
        }
    }

    fn counting_factory(counter: Arc<AtomicUsize>, gate: Option<Arc<Notify>>) -> JobFactory {
        Arc::new(move |_subject| {
            let counter = counter.clone();
            let gate = gate.clone();
            Box::new(move |_ctx| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    Ok(JobOutcome::Completed)
                })
            })
        })
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn tick_submits_on_match() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), None),
            Duration::from_secs(1),
        );
        scheduler.reload(vec![subject(
            "front",
            TaskKind::Capture,
            vec![cron_rule("0", "0", "12")],
        )]);
        scheduler.tick(noon());
        settle().await;
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // a non-matching instant fires nothing
        scheduler.tick(noon() + chrono::Duration::seconds(1));
        settle().await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn duplicate_match_is_skipped_while_task_is_active() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), Some(gate.clone())),
            Duration::from_secs(1),
        );
        scheduler.reload(vec![subject(
            "front",
            TaskKind::Capture,
            vec![cron_rule("*", "*", "*")],
        )]);
        scheduler.tick(noon());
        settle().await;
        scheduler.tick(noon() + chrono::Duration::seconds(1));
        settle().await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(tasks.list().len(), 1);

        gate.notify_one();
        settle().await;
        // once the first task finished, the next tick may fire again
        scheduler.tick(noon() + chrono::Duration::seconds(2));
        settle().await;
        gate.notify_one();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn two_matching_rules_submit_one_job() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), None),
            Duration::from_secs(1),
        );
        scheduler.reload(vec![subject(
            "front",
            TaskKind::Capture,
            vec![cron_rule("0", "*", "*"), cron_rule("*", "0", "12")],
        )]);
        scheduler.tick(noon());
        settle().await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn disabled_subjects_and_rules_never_fire() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), None),
            Duration::from_secs(1),
        );
        let mut off_subject = subject("front", TaskKind::Capture, vec![cron_rule("*", "*", "*")]);
        off_subject.enabled = false;
        let mut off_rule = cron_rule("*", "*", "*");
        off_rule.enabled = false;
        scheduler.reload(vec![
            off_subject,
            subject("back", TaskKind::Capture, vec![off_rule]),
        ]);
        scheduler.tick(noon());
        settle().await;
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn reload_swaps_the_whole_subject_set() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), None),
            Duration::from_secs(1),
        );
        scheduler.reload(vec![subject(
            "old",
            TaskKind::Capture,
            vec![cron_rule("*", "*", "*")],
        )]);
        scheduler.reload(vec![subject(
            "new",
            TaskKind::Export,
            vec![cron_rule("*", "*", "*")],
        )]);
        scheduler.tick(noon());
        settle().await;
        let all = tasks.list();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].subject, "new");
        assert_eq!(all[0].kind, TaskKind::Export);
    }

    #[tokio::test]
    async fn run_now_bypasses_schedules_but_not_dedup() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), Some(gate.clone())),
            Duration::from_secs(1),
        );
        // a subject whose schedule never fires on its own
        scheduler.reload(vec![subject(
            "front",
            TaskKind::Capture,
            vec![cron_rule("0", "0", "3")],
        )]);

        let first = scheduler.run_now("front").unwrap();
        assert!(first.is_some());
        settle().await;
        let second = scheduler.run_now("front").unwrap();
        assert!(second.is_none());
        assert!(scheduler.run_now("ghost").is_err());
        gate.notify_one();
    }

    #[tokio::test]
    async fn tick_loop_fires_and_stops() {
        let tasks = TaskManager::new(2, Duration::from_secs(300));
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            tasks.clone(),
            counting_factory(count.clone(), None),
            Duration::from_millis(20),
        );
        scheduler.reload(vec![subject(
            "front",
            TaskKind::Capture,
            vec![cron_rule("*", "*", "*")],
        )]);
        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(count.load(Ordering::Relaxed) >= 1);
    }
}
