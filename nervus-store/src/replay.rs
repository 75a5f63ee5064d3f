//! Replay driver state: a handle callers poll for progress while a replay
//! runs on the store's background task (§4.D).

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayProgress {
    pub position: usize,
    pub total: usize,
    pub last_event_id: Option<String>,
    pub error: Option<String>,
}

pub struct ReplayHandle {
    status: Mutex<ReplayStatus>,
    progress: Mutex<ReplayProgress>,
}

impl ReplayHandle {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            status: Mutex::new(ReplayStatus::Pending),
            progress: Mutex::new(ReplayProgress {
                position: 0,
                total,
                last_event_id: None,
                error: None,
            }),
        }
    }

    pub(crate) fn set_status(&self, status: ReplayStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn set_progress(&self, position: usize, event_id: String) {
        let mut progress = self.progress.lock();
        progress.position = position;
        progress.last_event_id = Some(event_id);
    }

    pub(crate) fn complete(&self) {
        *self.status.lock() = ReplayStatus::Completed;
    }

    pub(crate) fn fail(&self, reason: String) {
        *self.status.lock() = ReplayStatus::Failed;
        self.progress.lock().error = Some(reason);
    }

    pub fn cancel(&self) {
        *self.status.lock() = ReplayStatus::Cancelled;
    }

    pub fn status(&self) -> ReplayStatus {
        *self.status.lock()
    }

    pub fn progress(&self) -> ReplayProgress {
        self.progress.lock().clone()
    }
}
