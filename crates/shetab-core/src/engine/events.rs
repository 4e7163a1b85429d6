//! Event fan-out to subscribers and the caller's progress callback

use shetab_types::{CoreEvent, Download, DownloadSnapshot, HistoryRecord};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Callback invoked with a fresh snapshot on every progress or status update
pub type ProgressCallback = Arc<dyn Fn(&DownloadSnapshot) + Send + Sync>;

/// Delivers engine events; cheap to clone into every task
#[derive(Clone)]
pub struct EventSink {
    event_tx: broadcast::Sender<CoreEvent>,
    callback: Option<ProgressCallback>,
}

impl EventSink {
    pub fn new(capacity: usize, callback: Option<ProgressCallback>) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx, callback }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    fn notify(&self, snapshot: &DownloadSnapshot) {
        if let Some(callback) = &self.callback {
            callback(snapshot);
        }
    }

    pub fn added(&self, download: &Download) {
        let _ = self.event_tx.send(CoreEvent::DownloadAdded {
            download: download.clone(),
        });
    }

    pub fn progress(&self, snapshot: DownloadSnapshot) {
        self.notify(&snapshot);
        let _ = self.event_tx.send(CoreEvent::DownloadProgress { snapshot });
    }

    pub fn status_changed(&self, snapshot: DownloadSnapshot) {
        self.notify(&snapshot);
        let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
            id: snapshot.id,
            status: snapshot.status,
            error: snapshot.error,
        });
    }

    pub fn finished(&self, record: HistoryRecord) {
        let _ = self.event_tx.send(CoreEvent::DownloadFinished { record });
    }

    pub fn removed(&self, id: Uuid) {
        let _ = self.event_tx.send(CoreEvent::DownloadRemoved { id });
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.event_tx.receiver_count())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
