//! Named periodic and one-shot task dispatcher.
//!
//! All background work in the gateway (topology re-probes, subscription
//! renewals, cache refreshes, library re-indexing) flows through one
//! `Scheduler` so that shutdown reliably drains everything. Tasks run on
//! dedicated threads and sleep on a condvar, so cancellation interrupts a
//! waiting task immediately.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Options for a scheduled task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// An unref task does not block shutdown: it is cancelled but never
    /// joined.
    pub unref: bool,
}

/// Task flavor, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Interval,
    Timeout,
}

/// Serializable description of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub id: String,
    pub kind: TaskKind,
    /// Period (interval tasks) or delay (one-shot tasks), in milliseconds
    pub period_ms: u64,
    pub unref: bool,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Aggregate counts for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub total: usize,
    pub interval_tasks: usize,
    pub timeout_tasks: usize,
}

/// Cancellation latch shared between the scheduler and a task thread.
struct Cancel {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl Cancel {
    fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn cancel(&self) {
        *self.cancelled.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    /// Sleep up to `duration`, returning `true` if cancelled meanwhile.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock().unwrap();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap();
            cancelled = guard;
        }
        true
    }
}

struct TaskStats {
    run_count: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
    finished: AtomicBool,
}

struct TaskEntry {
    kind: TaskKind,
    period: Duration,
    unref: bool,
    created_at: DateTime<Utc>,
    cancel: Arc<Cancel>,
    stats: Arc<TaskStats>,
    handle: Option<JoinHandle<()>>,
}

/// Named-task dispatcher. Scheduling the same id again replaces (and
/// cancels) the prior task.
pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    shutting_down: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Run `task` every `period`, starting one period from now.
    pub fn schedule_interval(
        &self,
        id: &str,
        period: Duration,
        opts: TaskOptions,
        task: impl Fn() + Send + 'static,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(id, "scheduler shutting down, interval task rejected");
            return;
        }
        let cancel = Arc::new(Cancel::new());
        let stats = Arc::new(TaskStats {
            run_count: AtomicU64::new(0),
            last_run: Mutex::new(None),
            finished: AtomicBool::new(false),
        });

        let thread_cancel = Arc::clone(&cancel);
        let thread_stats = Arc::clone(&stats);
        let thread_id = id.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                loop {
                    if thread_cancel.sleep(period) {
                        break;
                    }
                    tracing::trace!(id = %thread_id, "interval task firing");
                    task();
                    thread_stats.run_count.fetch_add(1, Ordering::SeqCst);
                    *thread_stats.last_run.lock().unwrap() = Some(Utc::now());
                }
                thread_stats.finished.store(true, Ordering::SeqCst);
            })
            .expect("failed to spawn scheduler thread");

        self.install(
            id,
            TaskEntry {
                kind: TaskKind::Interval,
                period,
                unref: opts.unref,
                created_at: Utc::now(),
                cancel,
                stats,
                handle: Some(handle),
            },
        );
    }

    /// Run `task` once after `delay`.
    pub fn schedule_timeout(
        &self,
        id: &str,
        delay: Duration,
        opts: TaskOptions,
        task: impl FnOnce() + Send + 'static,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(id, "scheduler shutting down, timeout task rejected");
            return;
        }
        let cancel = Arc::new(Cancel::new());
        let stats = Arc::new(TaskStats {
            run_count: AtomicU64::new(0),
            last_run: Mutex::new(None),
            finished: AtomicBool::new(false),
        });

        let thread_cancel = Arc::clone(&cancel);
        let thread_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                if !thread_cancel.sleep(delay) {
                    task();
                    thread_stats.run_count.fetch_add(1, Ordering::SeqCst);
                    *thread_stats.last_run.lock().unwrap() = Some(Utc::now());
                }
                thread_stats.finished.store(true, Ordering::SeqCst);
            })
            .expect("failed to spawn scheduler thread");

        self.install(
            id,
            TaskEntry {
                kind: TaskKind::Timeout,
                period: delay,
                unref: opts.unref,
                created_at: Utc::now(),
                cancel,
                stats,
                handle: Some(handle),
            },
        );
    }

    /// Cancel a task by id. Returns whether a live task was cleared.
    ///
    /// The thread is detached, not joined: a task may clear itself (or a
    /// sibling holding the same locks) without deadlocking. The cancel
    /// latch guarantees no further invocation starts after this returns.
    pub fn clear_task(&self, id: &str) -> bool {
        let entry = self.tasks.lock().unwrap().remove(id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.prune_finished();
        self.tasks.lock().unwrap().contains_key(id)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.prune_finished();
        let tasks = self.tasks.lock().unwrap();
        let interval_tasks = tasks
            .values()
            .filter(|t| t.kind == TaskKind::Interval)
            .count();
        SchedulerStatus {
            total: tasks.len(),
            interval_tasks,
            timeout_tasks: tasks.len() - interval_tasks,
        }
    }

    pub fn detailed_tasks(&self) -> Vec<TaskDetail> {
        self.prune_finished();
        let tasks = self.tasks.lock().unwrap();
        let mut details: Vec<TaskDetail> = tasks
            .iter()
            .map(|(id, entry)| TaskDetail {
                id: id.clone(),
                kind: entry.kind,
                period_ms: entry.period.as_millis() as u64,
                unref: entry.unref,
                run_count: entry.stats.run_count.load(Ordering::SeqCst),
                created_at: entry.created_at,
                last_run: *entry.stats.last_run.lock().unwrap(),
            })
            .collect();
        details.sort_by(|a, b| a.id.cmp(&b.id));
        details
    }

    /// Cancel every task. Non-unref tasks are joined so their current
    /// iteration finishes before shutdown proceeds.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for entry in tasks.values() {
            entry.cancel.cancel();
        }
        for (id, entry) in tasks.iter_mut() {
            if entry.unref {
                continue;
            }
            if let Some(handle) = entry.handle.take() {
                if handle.join().is_err() {
                    tracing::error!(id, "task thread panicked");
                }
            }
        }
        tracing::info!("scheduler drained");
    }

    fn install(&self, id: &str, entry: TaskEntry) {
        let previous = self.tasks.lock().unwrap().insert(id.to_string(), entry);
        if let Some(previous) = previous {
            tracing::debug!(id, "replacing existing task");
            // Cancel and detach: a task rescheduling itself under its own id
            // must not join its own thread.
            previous.cancel.cancel();
        }
        self.prune_finished();
    }

    /// Drop one-shot tasks that have already fired.
    fn prune_finished(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, entry| {
            !(entry.kind == TaskKind::Timeout && entry.stats.finished.load(Ordering::SeqCst))
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_interval_task_fires_repeatedly() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);

        scheduler.schedule_interval(
            "tick",
            Duration::from_millis(10),
            TaskOptions::default(),
            move || {
                task_count.fetch_add(1, Ordering::SeqCst);
            },
        );

        std::thread::sleep(Duration::from_millis(100));
        scheduler.clear_task("tick");
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected repeated firings, got {fired}");
    }

    #[test]
    fn test_clear_task_stops_invocations() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);

        scheduler.schedule_interval(
            "tick",
            Duration::from_millis(10),
            TaskOptions::default(),
            move || {
                task_count.fetch_add(1, Ordering::SeqCst);
            },
        );
        std::thread::sleep(Duration::from_millis(35));
        assert!(scheduler.clear_task("tick"));

        // Let any in-flight iteration drain before snapshotting
        std::thread::sleep(Duration::from_millis(20));
        let after_clear = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_clear);
        assert!(!scheduler.clear_task("tick"));
    }

    #[test]
    fn test_timeout_task_fires_once() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);

        scheduler.schedule_timeout(
            "once",
            Duration::from_millis(10),
            TaskOptions::default(),
            move || {
                task_count.fetch_add(1, Ordering::SeqCst);
            },
        );
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Fired one-shots are pruned from introspection
        assert!(!scheduler.has_task("once"));
    }

    #[test]
    fn test_duplicate_id_replaces_task() {
        let scheduler = Scheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&first);
        scheduler.schedule_interval("job", Duration::from_millis(10), TaskOptions::default(), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&second);
        scheduler.schedule_interval("job", Duration::from_millis(10), TaskOptions::default(), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(20));
        let first_after_replace = first.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        scheduler.clear_task("job");

        assert_eq!(first.load(Ordering::SeqCst), first_after_replace);
        assert!(second.load(Ordering::SeqCst) >= 1);
        assert_eq!(scheduler.status().total, 0);
    }

    #[test]
    fn test_status_and_details() {
        let scheduler = Scheduler::new();
        scheduler.schedule_interval("a", Duration::from_secs(60), TaskOptions::default(), || {});
        scheduler.schedule_timeout(
            "b",
            Duration::from_secs(60),
            TaskOptions { unref: true },
            || {},
        );

        let status = scheduler.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.interval_tasks, 1);
        assert_eq!(status.timeout_tasks, 1);

        let details = scheduler.detailed_tasks();
        assert_eq!(details[0].id, "a");
        assert_eq!(details[0].kind, TaskKind::Interval);
        assert_eq!(details[1].period_ms, 60_000);
        assert!(details[1].unref);

        scheduler.shutdown();
        assert_eq!(scheduler.status().total, 0);
    }

    #[test]
    fn test_shutdown_cancels_pending_timeout() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = Arc::clone(&count);
        scheduler.schedule_timeout(
            "later",
            Duration::from_secs(3600),
            TaskOptions::default(),
            move || {
                task_count.fetch_add(1, Ordering::SeqCst);
            },
        );
        scheduler.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
