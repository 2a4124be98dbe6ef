//! Structured progress updates for an external notification layer.
//!
//! The engine reports fixed milestones per request; relaying them (push,
//! websocket, log) is up to whoever owns the [`ProgressSink`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Coarse state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Accepted, not started.
    Queued,
    /// Work in progress.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished without a result.
    Failed,
}

/// Fixed checkpoints a probe passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// Waiting for a worker.
    Queued,
    /// Looking up cached results.
    CacheCheck,
    /// Resolving mail exchangers.
    Dns,
    /// Talking SMTP.
    SmtpProbe,
    /// Aggregating and caching.
    Finalizing,
    /// Result available.
    Done,
}

impl Milestone {
    /// Percentage reported for this milestone.
    #[must_use]
    pub const fn percent(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::CacheCheck => 10,
            Self::Dns => 30,
            Self::SmtpProbe => 50,
            Self::Finalizing => 90,
            Self::Done => 100,
        }
    }

    const fn status(self) -> ProgressStatus {
        match self {
            Self::Queued => ProgressStatus::Queued,
            Self::Done => ProgressStatus::Completed,
            _ => ProgressStatus::Processing,
        }
    }

    const fn message(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::CacheCheck => "Checking cache",
            Self::Dns => "Resolving mail exchangers",
            Self::SmtpProbe => "Probing mail exchangers",
            Self::Finalizing => "Finalizing results",
            Self::Done => "Completed",
        }
    }
}

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Request this update belongs to.
    pub request_id: String,
    /// Coarse state.
    pub status: ProgressStatus,
    /// 0 to 100.
    pub progress_percent: u8,
    /// Human-readable detail.
    pub message: String,
    /// When the update was produced.
    pub timestamp: DateTime<Utc>,
}

/// Receives progress updates.
///
/// Emitting never blocks and never fails; a sink that cannot deliver
/// drops the update.
pub trait ProgressSink: Send + Sync {
    /// Delivers one update.
    fn emit(&self, event: ProgressEvent);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

impl ProgressSink for mpsc::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.try_send(event) {
            tracing::trace!(error = %e, "progress update dropped");
        }
    }
}

impl ProgressSink for broadcast::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

/// Progress reporter bound to one request.
#[derive(Clone)]
pub struct Progress {
    request_id: String,
    sink: Arc<dyn ProgressSink>,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl Progress {
    /// Reports `request_id` updates to `sink`.
    #[must_use]
    pub fn new(request_id: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            request_id: request_id.into(),
            sink,
        }
    }

    /// A reporter that reports nothing.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(String::new(), Arc::new(NoopSink))
    }

    /// Request id updates are tagged with.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn send(&self, status: ProgressStatus, percent: u8, message: String) {
        self.sink.emit(ProgressEvent {
            request_id: self.request_id.clone(),
            status,
            progress_percent: percent,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Reports reaching `milestone`.
    pub fn reached(&self, milestone: Milestone) {
        self.send(
            milestone.status(),
            milestone.percent(),
            milestone.message().to_string(),
        );
    }

    /// Reports completion with a custom message.
    pub fn completed(&self, message: impl Into<String>) {
        self.send(
            ProgressStatus::Completed,
            Milestone::Done.percent(),
            message.into(),
        );
    }

    /// Reports failure.
    pub fn failed(&self, message: impl Into<String>) {
        self.send(
            ProgressStatus::Failed,
            Milestone::Done.percent(),
            message.into(),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn milestones_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = Progress::new("req-1", Arc::new(tx));
        for milestone in [
            Milestone::Queued,
            Milestone::CacheCheck,
            Milestone::Dns,
            Milestone::SmtpProbe,
            Milestone::Finalizing,
            Milestone::Done,
        ] {
            progress.reached(milestone);
        }
        drop(progress);

        let mut percents = Vec::new();
        while let Some(event) = rx.recv().await {
            assert_eq!(event.request_id, "req-1");
            percents.push(event.progress_percent);
        }
        assert_eq!(percents, vec![0, 10, 30, 50, 90, 100]);
    }

    #[tokio::test]
    async fn statuses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = Progress::new("req-2", Arc::new(tx));
        progress.reached(Milestone::Queued);
        progress.reached(Milestone::Dns);
        progress.failed("boom");

        assert_eq!(rx.recv().await.unwrap().status, ProgressStatus::Queued);
        assert_eq!(rx.recv().await.unwrap().status, ProgressStatus::Processing);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.status, ProgressStatus::Failed);
        assert_eq!(last.message, "boom");
    }

    #[test]
    fn full_bounded_channel_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let progress = Progress::new("req-3", Arc::new(tx));
        progress.reached(Milestone::Queued);
        progress.reached(Milestone::Done);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ProgressStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
