/// Live Log Hub
///
/// Maps a job id to at most one attached viewer. Delivery is best effort:
/// with no viewer attached, messages are dropped rather than buffered, so a
/// viewer that connects late misses earlier lines.
///
/// The hub is constructed once per process and handed to both the
/// orchestrator and the HTTP layer.

use crate::metrics;
use futures_util::Stream;
use stagerun_common::types::LogMessage;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

pub const CONNECTED_MESSAGE: &str = "Connected to test runner...";
pub const COMPLETED_MESSAGE: &str = "Test run completed";

/// Write half of a viewer stream
pub type LogSink = mpsc::UnboundedSender<LogMessage>;

/// Identifies one attachment so a late disconnect cannot evict a newer viewer
pub type ViewerId = u64;

struct Viewer {
    id: ViewerId,
    sink: LogSink,
}

#[derive(Default)]
struct HubInner {
    viewers: Mutex<HashMap<String, Viewer>>,
    attached: Notify,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct LogHub {
    inner: Arc<HubInner>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn viewers(&self) -> MutexGuard<'_, HashMap<String, Viewer>> {
        // A poisoned map is still structurally valid
        self.inner
            .viewers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `sink` as the viewer for `job_id`.
    ///
    /// Returns `None` when a viewer is already attached; the existing viewer
    /// stays authoritative.
    pub fn attach(&self, job_id: &str, sink: LogSink) -> Option<ViewerId> {
        let id = {
            let mut viewers = self.viewers();
            if viewers.contains_key(job_id) {
                warn!(commit_sha = job_id, "Viewer already attached, rejecting new connection");
                return None;
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if sink.send(LogMessage::new(CONNECTED_MESSAGE)).is_err() {
                debug!(commit_sha = job_id, "Viewer went away before attaching");
                return None;
            }
            viewers.insert(job_id.to_string(), Viewer { id, sink });
            id
        };

        metrics::VIEWERS_ATTACHED.inc();
        info!(commit_sha = job_id, viewer = id, "Viewer attached");
        self.inner.attached.notify_waiters();
        Some(id)
    }

    pub fn is_attached(&self, job_id: &str) -> bool {
        self.viewers().contains_key(job_id)
    }

    /// Wait until a viewer is attached for `job_id` or `timeout` elapses.
    /// Returns whether a viewer is present.
    pub async fn await_attachment(&self, job_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking so an attach in between is not missed
            let notified = self.inner.attached.notified();
            if self.is_attached(job_id) {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_attached(job_id);
            }
        }
    }

    /// Deliver `message` to the attached viewer, if any.
    /// A viewer whose stream has gone away is deregistered.
    pub fn send(&self, job_id: &str, message: impl Into<String>) {
        let message = message.into();
        let mut viewers = self.viewers();

        let Some(viewer) = viewers.get(job_id) else {
            debug!(commit_sha = job_id, "No viewer attached, dropping message");
            return;
        };

        if viewer.sink.send(LogMessage::new(message)).is_err() {
            viewers.remove(job_id);
            metrics::VIEWERS_ATTACHED.dec();
            debug!(commit_sha = job_id, "Viewer stream closed, deregistered");
        }
    }

    /// Send the final message and end the viewer stream. Safe to call
    /// repeatedly and when no viewer exists.
    pub fn close(&self, job_id: &str) {
        let removed = self.viewers().remove(job_id);

        if let Some(viewer) = removed {
            let _ = viewer.sink.send(LogMessage::new(COMPLETED_MESSAGE));
            metrics::VIEWERS_ATTACHED.dec();
            info!(commit_sha = job_id, viewer = viewer.id, "Closed viewer stream");
            // Dropping the sink ends the stream on the HTTP side
        }
    }

    /// Remove the viewer after its connection went away.
    /// A no-op if the slot now belongs to a different viewer.
    pub fn detach(&self, job_id: &str, viewer_id: ViewerId) {
        let mut viewers = self.viewers();
        if viewers.get(job_id).map(|v| v.id) == Some(viewer_id) {
            viewers.remove(job_id);
            metrics::VIEWERS_ATTACHED.dec();
            info!(commit_sha = job_id, viewer = viewer_id, "Viewer disconnected");
        }
    }

    /// Attach a fresh channel and wrap its read half as a stream that
    /// detaches itself when dropped.
    pub fn subscribe(&self, job_id: &str) -> Option<ViewerStream> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let viewer_id = self.attach(job_id, sink)?;

        Some(ViewerStream {
            hub: self.clone(),
            job_id: job_id.to_string(),
            viewer_id,
            receiver,
        })
    }
}

/// Read half of an attached viewer
pub struct ViewerStream {
    hub: LogHub,
    job_id: String,
    viewer_id: ViewerId,
    receiver: mpsc::UnboundedReceiver<LogMessage>,
}

impl Stream for ViewerStream {
    type Item = LogMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ViewerStream {
    fn drop(&mut self) {
        self.hub.detach(&self.job_id, self.viewer_id);
    }
}
