//! Global task scheduler
//!
//! A fixed number of conversion slots is shared by every job. Pending tasks
//! wait in per-job FIFO queues; a single dispatcher hands free slots to jobs in
//! round-robin order so one large batch cannot starve a small one.

use dashmap::DashSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::conversion::{ConversionError, Converter};
use crate::types::{FailureKind, JobId, TaskFailure, TaskId, TaskOutcome};

use super::packager::Packager;
use super::registry::{DispatchTicket, JobRegistry, UpdateOutcome};

/// Scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub concurrency: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub queued_tasks: usize,
    pub queued_jobs: usize,
    pub overrunning: usize,
}

/// Converter work still running after its task was recorded as timed out
type Overrun = JoinHandle<Result<PathBuf, ConversionError>>;

/// Per-job FIFO queues served round-robin
#[derive(Debug, Default)]
struct RunQueue {
    ring: VecDeque<(JobId, VecDeque<TaskId>)>,
}

impl RunQueue {
    fn push(&mut self, job_id: JobId, tasks: impl IntoIterator<Item = TaskId>) {
        match self.ring.iter_mut().find(|(id, _)| *id == job_id) {
            Some((_, queue)) => queue.extend(tasks),
            None => {
                let queue: VecDeque<TaskId> = tasks.into_iter().collect();
                if !queue.is_empty() {
                    self.ring.push_back((job_id, queue));
                }
            }
        }
    }

    /// Next task from the job at the front; that job then moves to the back
    fn pop(&mut self) -> Option<(JobId, TaskId)> {
        while let Some((job_id, mut queue)) = self.ring.pop_front() {
            if let Some(task_id) = queue.pop_front() {
                if !queue.is_empty() {
                    self.ring.push_back((job_id, queue));
                }
                return Some((job_id, task_id));
            }
        }
        None
    }

    fn remove(&mut self, job_id: &JobId) -> usize {
        let mut removed = 0;
        self.ring.retain(|(id, queue)| {
            if id == job_id {
                removed += queue.len();
                false
            } else {
                true
            }
        });
        removed
    }

    fn len(&self) -> usize {
        self.ring.iter().map(|(_, q)| q.len()).sum()
    }
}

struct SchedulerInner {
    registry: Arc<JobRegistry>,
    converter: Arc<dyn Converter>,
    packager: Arc<Packager>,
    slots: Arc<Semaphore>,
    queue: Mutex<RunQueue>,
    wakeup: Notify,
    concurrency: usize,
    task_timeout: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    overrunning: DashSet<(JobId, TaskId)>,
}

/// Task scheduler handle
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Create the scheduler and start its dispatcher on the current runtime
    pub fn start(
        registry: Arc<JobRegistry>,
        converter: Arc<dyn Converter>,
        packager: Arc<Packager>,
        concurrency: usize,
        task_timeout: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);
        tracing::info!(
            "Scheduler configured: {} conversion slots, {}s task timeout, converter '{}'",
            concurrency,
            task_timeout.as_secs(),
            converter.name()
        );

        let inner = Arc::new(SchedulerInner {
            registry,
            converter,
            packager,
            slots: Arc::new(Semaphore::new(concurrency)),
            queue: Mutex::new(RunQueue::default()),
            wakeup: Notify::new(),
            concurrency,
            task_timeout,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            overrunning: DashSet::new(),
        });

        let handle = tokio::spawn(Arc::clone(&inner).dispatch_loop());
        Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue tasks of a job for dispatch
    pub fn submit(&self, job_id: JobId, tasks: impl IntoIterator<Item = TaskId>) {
        let queued = {
            let mut queue = self.inner.queue.lock();
            queue.push(job_id, tasks);
            queue.len()
        };
        tracing::debug!("Queued tasks for job {} ({} tasks waiting)", job_id, queued);
        self.inner.wakeup.notify_one();
    }

    /// Drop every queued task of a job. Tasks already running are unaffected.
    pub fn cancel(&self, job_id: &JobId) -> usize {
        let removed = self.inner.queue.lock().remove(job_id);
        if removed > 0 {
            tracing::debug!("Cancelled {} queued tasks of job {}", removed, job_id);
        }
        removed
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Conversions currently occupying a slot
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous conversions observed
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Whether a timed-out attempt of this task is still holding a slot
    pub fn is_overrunning(&self, job_id: JobId, task_id: TaskId) -> bool {
        self.inner.overrunning.contains(&(job_id, task_id))
    }

    /// Tasks waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let (queued_tasks, queued_jobs) = {
            let queue = self.inner.queue.lock();
            (queue.len(), queue.ring.len())
        };
        SchedulerStats {
            concurrency: self.inner.concurrency,
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
            queued_tasks,
            queued_jobs,
            overrunning: self.inner.overrunning.len(),
        }
    }

    /// Stop admitting new tasks. Running conversions finish normally.
    pub fn shutdown(&self) {
        self.inner.slots.close();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        tracing::info!("Scheduler stopped");
    }
}

impl SchedulerInner {
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let (job_id, task_id) = self.next_task().await;

            // Cancelled, timed out or deleted since it was queued
            let Some(ticket) = self.registry.mark_running(job_id, task_id) else {
                tracing::debug!("Skipping stale task {} of job {}", task_id, job_id);
                continue;
            };

            self.spawn_task(permit, ticket);
        }
    }

    async fn next_task(&self) -> (JobId, TaskId) {
        loop {
            let next = self.queue.lock().pop();
            if let Some(next) = next {
                return next;
            }
            self.wakeup.notified().await;
        }
    }

    fn spawn_task(self: &Arc<Self>, permit: OwnedSemaphorePermit, ticket: DispatchTicket) {
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let running = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            inner.peak_in_flight.fetch_max(running, Ordering::SeqCst);

            let (outcome, overrun) = inner.execute(&ticket).await;

            // A timed-out attempt keeps its slot until the converter stops
            if overrun.is_some() {
                inner.overrunning.insert((ticket.job_id, ticket.task_id));
            }
            let job_id = ticket.job_id;
            let update = inner
                .registry
                .update_task_status(job_id, ticket.task_id, outcome);

            match overrun {
                Some(handle) => {
                    let drain = Arc::clone(&inner);
                    tokio::spawn(async move {
                        drain.drain_overrun(&ticket, handle).await;
                        drain.in_flight.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
                None => {
                    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                }
            }

            if update == UpdateOutcome::ReadyToPackage {
                inner.packager.run(job_id).await;
            }
        });
    }

    /// Wait out a converter that outlived its timeout and discard whatever it
    /// produced, since the task is already recorded as failed
    async fn drain_overrun(&self, ticket: &DispatchTicket, handle: Overrun) {
        if let Ok(Ok(path)) = handle.await {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(
                    "[{}] Could not remove late output {}: {}",
                    ticket.job_id,
                    path.display(),
                    e
                );
            }
        }
        self.overrunning.remove(&(ticket.job_id, ticket.task_id));
        tracing::debug!(
            "[{}] Timed-out conversion of '{}' has stopped",
            ticket.job_id,
            ticket.file_name
        );
    }

    /// Run the converter for one task, turning every way it can end into a
    /// task outcome. On timeout the still-running converter is handed back.
    async fn execute(&self, ticket: &DispatchTicket) -> (TaskOutcome, Option<Overrun>) {
        let start = Instant::now();
        tracing::info!(
            "[{}] Converting '{}' (task {}) to {}",
            ticket.job_id,
            ticket.file_name,
            ticket.task_id,
            ticket.options.format
        );

        let converter = Arc::clone(&self.converter);
        let source = ticket.source_path.clone();
        let options = ticket.options.clone();
        let output_dir = ticket.output_dir.clone();

        // Separate task so a panicking converter surfaces as a JoinError
        let mut handle = tokio::spawn(async move {
            converter.convert(&source, &options, &output_dir).await
        });

        let outcome = match timeout(self.task_timeout, &mut handle).await {
            Ok(Ok(Ok(path))) => TaskOutcome::Succeeded(path),
            Ok(Ok(Err(e))) => {
                tracing::warn!("[{}] Failed '{}': {}", ticket.job_id, ticket.file_name, e);
                TaskOutcome::Failed(e.into())
            }
            Ok(Err(join_err)) => {
                tracing::error!(
                    "[{}] Converter crashed on '{}': {}",
                    ticket.job_id,
                    ticket.file_name,
                    join_err
                );
                TaskOutcome::Failed(TaskFailure::internal())
            }
            Err(_) => {
                tracing::error!(
                    "[{}] TIMEOUT converting '{}' after {:.1}s (limit: {}s)",
                    ticket.job_id,
                    ticket.file_name,
                    start.elapsed().as_secs_f64(),
                    self.task_timeout.as_secs()
                );
                let failure = TaskFailure::new(
                    FailureKind::ResourceExceeded,
                    format!(
                        "conversion timed out after {}s",
                        self.task_timeout.as_secs()
                    ),
                );
                return (TaskOutcome::Failed(failure), Some(handle));
            }
        };

        if matches!(outcome, TaskOutcome::Succeeded(_)) {
            tracing::info!(
                "[{}] Converted '{}' in {}ms",
                ticket.job_id,
                ticket.file_name,
                start.elapsed().as_millis()
            );
        }
        (outcome, None)
    }
}
