use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::session::{SessionId, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshProgressEvent {
    /// The first session became active; the VFS is refreshing.
    Started,
    SessionStarted { session: SessionId },
    SessionFinished { session: SessionId, state: SessionState },
    /// The last active session finished.
    Finished,
}

pub type RefreshProgressReceiver = broadcast::Receiver<RefreshProgressEvent>;

/// Broadcasts refresh activity to any number of observers.
///
/// Sending never blocks and never fails the refresh; slow receivers observe `Lagged` instead.
#[derive(Debug)]
pub struct RefreshProgress {
    tx: broadcast::Sender<RefreshProgressEvent>,
    active: AtomicUsize,
}

impl RefreshProgress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            active: AtomicUsize::new(0),
        }
    }

    pub fn subscribe(&self) -> RefreshProgressReceiver {
        self.tx.subscribe()
    }

    /// Whether any session is currently scanning or firing.
    pub fn is_refreshing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn enter(self: &Arc<Self>, session: SessionId) -> SessionActivity {
        if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.tx.send(RefreshProgressEvent::Started);
        }
        let _ = self.tx.send(RefreshProgressEvent::SessionStarted { session });
        SessionActivity {
            progress: Arc::clone(self),
            session,
            state: SessionState::Done,
        }
    }
}

/// Marks one session as active until dropped.
pub(crate) struct SessionActivity {
    progress: Arc<RefreshProgress>,
    session: SessionId,
    state: SessionState,
}

impl SessionActivity {
    pub(crate) fn set_final_state(&mut self, state: SessionState) {
        self.state = state;
    }
}

impl Drop for SessionActivity {
    fn drop(&mut self) {
        let _ = self.progress.tx.send(RefreshProgressEvent::SessionFinished {
            session: self.session,
            state: self.state,
        });
        if self.progress.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.progress.tx.send(RefreshProgressEvent::Finished);
        }
    }
}
