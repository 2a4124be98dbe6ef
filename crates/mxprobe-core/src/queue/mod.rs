//! In-process job queue.
//!
//! A fixed set of tokio workers pulls [`ProbeJob`]s and [`BatchJob`]s off
//! a shared channel and runs them on a [`ProbeExecutor`]. Progress for
//! every job is published on a broadcast channel (see
//! [`JobQueue::subscribe`]); status can also be polled by request id.
//! Finished jobs stay queryable until they fall outside the retention
//! limits in [`QueueSettings`].

mod model;

pub use model::{
    BatchJob, JobOutcome, JobResult, JobStatus, ProbeJob, QueueStats, next_request_id,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use mxprobe_smtp::Transport;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::QueueSettings;
use crate::probe::{BatchResult, ProbeResult, Prober};
use crate::progress::{Milestone, Progress, ProgressEvent};
use crate::{Error, Result};

/// Capacity of the progress broadcast channel.
pub const EVENT_CAPACITY: usize = 256;

/// Runs the work behind queued jobs.
#[async_trait]
pub trait ProbeExecutor: Send + Sync + 'static {
    /// Probes one address.
    async fn execute_single(&self, email: &str, progress: &Progress) -> ProbeResult;

    /// Probes a batch.
    async fn execute_batch(&self, emails: &[String], progress: &Progress) -> BatchResult;
}

#[async_trait]
impl<T: Transport> ProbeExecutor for Prober<T> {
    async fn execute_single(&self, email: &str, progress: &Progress) -> ProbeResult {
        self.probe_email_with_progress(email, progress).await
    }

    async fn execute_batch(&self, emails: &[String], progress: &Progress) -> BatchResult {
        self.probe_batch_with_progress(emails, progress).await
    }
}

#[derive(Debug)]
enum Job {
    Single(ProbeJob),
    Batch(BatchJob),
}

impl Job {
    fn id(&self) -> &str {
        match self {
            Self::Single(job) => &job.request_id,
            Self::Batch(job) => &job.batch_id,
        }
    }
}

#[derive(Debug)]
struct Shared {
    jobs: Mutex<HashMap<String, JobResult>>,
    events: broadcast::Sender<ProgressEvent>,
    paused: watch::Sender<bool>,
    keep_completed: usize,
    keep_failed: usize,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobResult>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self, request_id: &str) -> Progress {
        Progress::new(request_id, Arc::new(self.events.clone()))
    }

    /// Moves a waiting job to active. Returns false if it was cancelled.
    fn activate(&self, request_id: &str) -> bool {
        let mut jobs = self.jobs();
        match jobs.get_mut(request_id) {
            Some(job) if job.status == JobStatus::Waiting => {
                job.status = JobStatus::Active;
                job.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    fn finish(&self, request_id: &str, outcome: std::result::Result<JobOutcome, String>) {
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(request_id) else {
            return;
        };
        match outcome {
            Ok(result) => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
            }
            Err(error) => {
                job.status = JobStatus::Failed;
                job.error = Some(error);
            }
        }
        job.finished_at = Some(Utc::now());
        self.prune(&mut jobs);
    }

    /// Drops the oldest finished jobs beyond the retention limits.
    /// Cancelled jobs count against the failed limit.
    fn prune(&self, jobs: &mut HashMap<String, JobResult>) {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for job in jobs.values() {
            let entry = (job.finished_at, job.request_id.clone());
            match job.status {
                JobStatus::Completed => completed.push(entry),
                JobStatus::Failed | JobStatus::Cancelled => failed.push(entry),
                JobStatus::Waiting | JobStatus::Active => {}
            }
        }
        for (mut finished, keep) in [(completed, self.keep_completed), (failed, self.keep_failed)] {
            let excess = finished.len().saturating_sub(keep);
            if excess == 0 {
                continue;
            }
            finished.sort_unstable();
            for (_, request_id) in finished.drain(..excess) {
                jobs.remove(&request_id);
            }
            tracing::debug!(removed = excess, "pruned finished jobs");
        }
    }
}

/// Bounded pool of probe workers fed by a channel.
#[derive(Debug)]
pub struct JobQueue {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Starts `workers` workers (at least one) running jobs on `executor`,
    /// with the default retention limits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<E: ProbeExecutor>(executor: Arc<E>, workers: usize) -> Self {
        Self::with_settings(
            executor,
            &QueueSettings {
                workers,
                ..QueueSettings::default()
            },
        )
    }

    /// Starts a queue sized and bounded by `settings`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_settings<E: ProbeExecutor>(executor: Arc<E>, settings: &QueueSettings) -> Self {
        let workers = settings.workers;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (paused, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            jobs: Mutex::new(HashMap::new()),
            events,
            paused,
            keep_completed: settings.keep_completed,
            keep_failed: settings.keep_failed,
        });

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&executor),
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                ))
            })
            .collect();

        tracing::info!(workers = workers.max(1), "job queue started");
        Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    fn enqueue(&self, job: Job, client_id: Option<String>) -> Result<String> {
        let request_id = job.id().to_string();
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::QueueClosed)?;

        self.shared
            .jobs()
            .insert(request_id.clone(), JobResult::waiting(&request_id, client_id));

        if sender.send(job).is_err() {
            self.shared.jobs().remove(&request_id);
            return Err(Error::QueueClosed);
        }

        self.shared.progress(&request_id).reached(Milestone::Queued);
        tracing::debug!(%request_id, "job queued");
        Ok(request_id)
    }

    /// Queues a single-address job. Returns its request id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] after [`Self::shutdown`].
    pub fn submit(&self, job: ProbeJob) -> Result<String> {
        let client_id = job.client_id.clone();
        self.enqueue(Job::Single(job), client_id)
    }

    /// Queues a batch job. Returns its batch id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBatch`] for a batch without addresses and
    /// [`Error::QueueClosed`] after [`Self::shutdown`].
    pub fn submit_batch(&self, job: BatchJob) -> Result<String> {
        if job.emails.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let client_id = job.client_id.clone();
        self.enqueue(Job::Batch(job), client_id)
    }

    /// Current state of a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for an unknown id.
    pub fn status(&self, request_id: &str) -> Result<JobResult> {
        self.shared
            .jobs()
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(request_id.to_string()))
    }

    /// Cancels a job that has not started.
    ///
    /// Returns false if the job is already running or finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for an unknown id.
    pub fn cancel(&self, request_id: &str) -> Result<bool> {
        let cancelled = {
            let mut jobs = self.shared.jobs();
            let job = jobs
                .get_mut(request_id)
                .ok_or_else(|| Error::JobNotFound(request_id.to_string()))?;
            if job.status == JobStatus::Waiting {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                self.shared.prune(&mut jobs);
                true
            } else {
                false
            }
        };
        if cancelled {
            self.shared.progress(request_id).failed("Cancelled");
            tracing::debug!(request_id, "job cancelled");
        }
        Ok(cancelled)
    }

    /// Stops workers from starting new jobs. Running jobs continue.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
        tracing::info!("job queue paused");
    }

    /// Lets workers start jobs again.
    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
        tracing::info!("job queue resumed");
    }

    /// Returns true while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Job counts by state.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            paused: self.is_paused(),
            ..QueueStats::default()
        };
        for job in self.shared.jobs().values() {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Progress events for every job.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    /// Refuses new jobs, cancels waiting ones and waits for running jobs
    /// to finish.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let waiting: Vec<String> = self
            .shared
            .jobs()
            .values()
            .filter(|job| job.status == JobStatus::Waiting)
            .map(|job| job.request_id.clone())
            .collect();
        for request_id in &waiting {
            let _ = self.cancel(request_id);
        }
        self.shared.paused.send_replace(false);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "worker ended abnormally");
            }
        }
        tracing::info!(cancelled = waiting.len(), "job queue shut down");
    }
}

async fn worker<E: ProbeExecutor>(
    id: usize,
    executor: Arc<E>,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
) {
    let mut paused = shared.paused.subscribe();
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else { break };

        let open = paused.wait_for(|paused| !*paused).await.is_ok();
        if !open {
            break;
        }

        let request_id = job.id().to_string();
        if !shared.activate(&request_id) {
            tracing::debug!(worker = id, %request_id, "skipping cancelled job");
            continue;
        }
        tracing::debug!(worker = id, %request_id, "job started");

        let progress = shared.progress(&request_id);
        let task_progress = progress.clone();
        let executor = Arc::clone(&executor);
        let task = tokio::spawn(async move {
            match job {
                Job::Single(job) => {
                    JobOutcome::Single(executor.execute_single(&job.email, &task_progress).await)
                }
                Job::Batch(job) => {
                    JobOutcome::Batch(executor.execute_batch(&job.emails, &task_progress).await)
                }
            }
        });

        match task.await {
            Ok(outcome) => shared.finish(&request_id, Ok(outcome)),
            Err(e) => {
                tracing::error!(worker = id, %request_id, error = %e, "job failed");
                progress.failed(e.to_string());
                shared.finish(&request_id, Err(e.to_string()));
            }
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::probe::ProbeStatus;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    fn valid(email: &str) -> ProbeResult {
        ProbeResult {
            email: email.to_string(),
            status: ProbeStatus::Valid,
            response_code: Some(250),
            response_message: Some("OK".into()),
            mx_host: Some("mx.test".into()),
            mx_priority: Some(10),
            probe_time_ms: 1,
            error: None,
            cached: false,
            checked_at: Utc::now(),
        }
    }

    #[async_trait]
    impl ProbeExecutor for Recorder {
        async fn execute_single(&self, email: &str, progress: &Progress) -> ProbeResult {
            self.seen.lock().unwrap().push(email.to_string());
            assert!(!email.starts_with("panic"), "executor crashed");
            progress.reached(Milestone::Done);
            valid(email)
        }

        async fn execute_batch(&self, emails: &[String], _progress: &Progress) -> BatchResult {
            self.seen.lock().unwrap().extend(emails.iter().cloned());
            BatchResult::from_results(
                emails.iter().map(String::as_str).map(valid).collect(),
                Duration::from_millis(5),
            )
        }
    }

    async fn wait_until_finished(queue: &JobQueue, request_id: &str) -> JobResult {
        for _ in 0..200 {
            let job = queue.status(request_id).unwrap();
            if job.status.is_finished() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {request_id} did not finish");
    }

    #[tokio::test]
    async fn runs_single_and_batch_jobs() {
        let executor = Arc::new(Recorder::default());
        let queue = JobQueue::start(Arc::clone(&executor), 2);

        let single = queue
            .submit(ProbeJob::new("user@example.com", Some("c1".into())).unwrap())
            .unwrap();
        let batch = queue
            .submit_batch(BatchJob::new(vec!["a@x.com".into(), "b@y.com".into()], None).unwrap())
            .unwrap();

        let single = wait_until_finished(&queue, &single).await;
        assert_eq!(single.status, JobStatus::Completed);
        assert_eq!(single.client_id.as_deref(), Some("c1"));
        assert!(single.started_at.is_some());
        assert!(matches!(single.result, Some(JobOutcome::Single(ref r)) if r.email == "user@example.com"));

        let batch = wait_until_finished(&queue, &batch).await;
        match batch.result {
            Some(JobOutcome::Batch(result)) => assert_eq!(result.total_valid, 2),
            other => panic!("unexpected outcome {other:?}"),
        }

        let stats = queue.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.waiting + stats.active, 0);
        assert_eq!(executor.seen().len(), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn pause_cancel_resume() {
        let executor = Arc::new(Recorder::default());
        let queue = JobQueue::start(Arc::clone(&executor), 1);
        queue.pause();
        assert!(queue.stats().paused);

        let first = queue.submit(ProbeJob::new("first@example.com", None).unwrap()).unwrap();
        let second = queue.submit(ProbeJob::new("second@example.com", None).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.status(&first).unwrap().status, JobStatus::Waiting);

        assert!(queue.cancel(&first).unwrap());
        assert!(!queue.cancel(&first).unwrap());
        queue.resume();

        let second = wait_until_finished(&queue, &second).await;
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(queue.status(&first).unwrap().status, JobStatus::Cancelled);
        assert_eq!(executor.seen(), vec!["second@example.com"]);
        assert_eq!(queue.stats().cancelled, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_job_is_failed() {
        let queue = JobQueue::start(Arc::new(Recorder::default()), 1);
        let id = queue.submit(ProbeJob::new("panic@example.com", None).unwrap()).unwrap();
        let job = wait_until_finished(&queue, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());

        let next = queue.submit(ProbeJob::new("ok@example.com", None).unwrap()).unwrap();
        assert_eq!(wait_until_finished(&queue, &next).await.status, JobStatus::Completed);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn finished_jobs_are_pruned_oldest_first() {
        let settings = QueueSettings {
            workers: 1,
            keep_completed: 2,
            keep_failed: 1,
        };
        let queue = JobQueue::with_settings(Arc::new(Recorder::default()), &settings);

        let mut ids = Vec::new();
        for n in 0..5 {
            let id = queue
                .submit(ProbeJob::new(format!("user{n}@example.com"), None).unwrap())
                .unwrap();
            wait_until_finished(&queue, &id).await;
            ids.push(id);
        }
        let stats = queue.stats();
        assert_eq!(stats.completed, 2);
        assert!(matches!(queue.status(&ids[0]), Err(Error::JobNotFound(_))));
        assert!(matches!(queue.status(&ids[2]), Err(Error::JobNotFound(_))));
        assert_eq!(queue.status(&ids[3]).unwrap().status, JobStatus::Completed);
        assert_eq!(queue.status(&ids[4]).unwrap().status, JobStatus::Completed);

        let crashed = queue.submit(ProbeJob::new("panic@example.com", None).unwrap()).unwrap();
        wait_until_finished(&queue, &crashed).await;
        queue.pause();
        let waiting = queue.submit(ProbeJob::new("later@example.com", None).unwrap()).unwrap();
        assert!(queue.cancel(&waiting).unwrap());

        let stats = queue.stats();
        assert_eq!(stats.failed + stats.cancelled, 1);
        assert_eq!(stats.cancelled, 1);
        assert!(matches!(queue.status(&crashed), Err(Error::JobNotFound(_))));
        assert_eq!(stats.completed, 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn progress_is_broadcast() {
        let queue = JobQueue::start(Arc::new(Recorder::default()), 1);
        let mut events = queue.subscribe();
        let id = queue.submit(ProbeJob::new("user@example.com", None).unwrap()).unwrap();

        let queued = events.recv().await.unwrap();
        assert_eq!(queued.request_id, id);
        assert_eq!(queued.progress_percent, 0);
        let done = events.recv().await.unwrap();
        assert_eq!(done.progress_percent, 100);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_after_shutdown_and_unknown_ids() {
        let queue = JobQueue::start(Arc::new(Recorder::default()), 1);
        assert!(matches!(queue.status("nope"), Err(Error::JobNotFound(_))));
        assert!(matches!(queue.cancel("nope"), Err(Error::JobNotFound(_))));
        assert!(matches!(
            queue.submit_batch(BatchJob {
                batch_id: "b".into(),
                emails: Vec::new(),
                client_id: None,
            }),
            Err(Error::EmptyBatch)
        ));

        queue.shutdown().await;
        assert!(matches!(
            queue.submit(ProbeJob::new("late@example.com", None).unwrap()),
            Err(Error::QueueClosed)
        ));
    }
}
