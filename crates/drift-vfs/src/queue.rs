use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use drift_config::{IgnoredNames, RefreshConfig};
use drift_core::ModelLock;
use parking_lot::Mutex;

use crate::cache::VfsCache;
use crate::dispatch::EventDispatcher;
use crate::error::{Result, VfsError};
use crate::fs::FileSystem;
use crate::progress::{RefreshProgress, RefreshProgressReceiver};
use crate::session::{FinishCallback, RefreshSession, SessionId};

/// Everything a session needs to scan and fire.
pub(crate) struct RefreshContext {
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) cache: Arc<VfsCache>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) lock: Arc<ModelLock>,
    pub(crate) ignored: IgnoredNames,
    pub(crate) progress: Arc<RefreshProgress>,
}

type SessionMap = Arc<Mutex<HashMap<SessionId, Arc<RefreshSession>>>>;

/// Runs refresh sessions.
///
/// Asynchronous sessions are processed one at a time, in submission order, on a dedicated named
/// worker thread fed by a bounded channel. Synchronous sessions run inline on the caller.
pub struct RefreshQueue {
    ctx: Arc<RefreshContext>,
    tx: Mutex<Option<Sender<Arc<RefreshSession>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: ThreadId,
    sessions: SessionMap,
    next_id: AtomicU64,
}

impl RefreshQueue {
    pub(crate) fn new(ctx: Arc<RefreshContext>, config: &RefreshConfig) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        let sessions: SessionMap = Arc::default();

        let worker = std::thread::Builder::new()
            .name(config.worker_thread_name.clone())
            .spawn({
                let ctx = Arc::clone(&ctx);
                let sessions = Arc::clone(&sessions);
                move || worker_loop(&ctx, &sessions, rx)
            })
            .map_err(VfsError::Spawn)?;

        Ok(Self {
            ctx,
            tx: Mutex::new(Some(tx)),
            worker_thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            sessions,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn create_session(
        &self,
        is_async: bool,
        recursive: bool,
        on_finish: Option<FinishCallback>,
    ) -> Arc<RefreshSession> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(RefreshSession::new(id, is_async, recursive, on_finish))
    }

    /// Runs `session`: inline if it is synchronous, on the worker thread otherwise.
    ///
    /// A synchronous refresh needs the write lock to fire, so requesting one while the calling
    /// thread holds only the read lock fails with [`VfsError::ReadLockHeld`]. Holding the write
    /// lock is fine; that is how listeners refresh from inside an event.
    ///
    /// The worker never waits on its own queue: an asynchronous refresh requested from a listener
    /// running on the worker fails with [`VfsError::QueueFull`] when the queue has no room.
    pub fn execute(&self, session: &Arc<RefreshSession>) -> Result<()> {
        if !session.is_async()
            && self.ctx.lock.is_read_locked_by_current_thread()
            && !self.ctx.lock.is_write_locked_by_current_thread()
        {
            tracing::error!(
                target: "drift.vfs",
                session = %session.id(),
                "synchronous refresh requested while holding the read lock"
            );
            return Err(VfsError::ReadLockHeld);
        }
        if !session.mark_submitted() {
            return Err(VfsError::AlreadyExecuted(session.id()));
        }

        self.sessions
            .lock()
            .insert(session.id(), Arc::clone(session));

        if session.is_async() {
            let tx = self.tx.lock().clone();
            let sent = match tx {
                None => Err(VfsError::QueueClosed),
                Some(tx) if std::thread::current().id() == self.worker_thread => {
                    match tx.try_send(Arc::clone(session)) {
                        Ok(()) => Ok(()),
                        Err(TrySendError::Full(_)) => Err(VfsError::QueueFull),
                        Err(TrySendError::Disconnected(_)) => Err(VfsError::QueueClosed),
                    }
                }
                Some(tx) => tx
                    .send(Arc::clone(session))
                    .map_err(|_| VfsError::QueueClosed),
            };
            if let Err(err) = sent {
                self.sessions.lock().remove(&session.id());
                session.cancel();
                tracing::warn!(
                    target: "drift.vfs",
                    session = %session.id(),
                    error = %err,
                    "async refresh not queued"
                );
                return Err(err);
            }
            return Ok(());
        }

        let result = session.run(&self.ctx);
        self.sessions.lock().remove(&session.id());
        result
    }

    /// Cancels one session. Returns `false` if it is unknown or already firing.
    pub fn cancel(&self, id: SessionId) -> bool {
        let session = self.sessions.lock().get(&id).cloned();
        session.is_some_and(|session| session.cancel())
    }

    /// Cancels every session that has not started firing yet.
    pub fn cancel_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.cancel();
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<RefreshSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Ids of the sessions that were submitted and did not finish yet.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_refreshing(&self) -> bool {
        self.ctx.progress.is_refreshing()
    }

    pub fn subscribe_progress(&self) -> RefreshProgressReceiver {
        self.ctx.progress.subscribe()
    }

    /// Cancels pending work, closes the queue, and joins the worker thread.
    ///
    /// A session that is already firing completes first.
    pub fn shutdown(&self) {
        self.cancel_all();
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                // Shutdown requested from a listener running on the worker itself.
                return;
            }
            if worker.join().is_err() {
                tracing::error!(target: "drift.vfs", "refresh worker thread panicked");
            }
        }
    }
}

impl Drop for RefreshQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(ctx: &RefreshContext, sessions: &SessionMap, rx: Receiver<Arc<RefreshSession>>) {
    tracing::debug!(target: "drift.vfs", "refresh worker started");
    for session in rx.iter() {
        let id = session.id();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| session.run(ctx)));
        sessions.lock().remove(&id);
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => session.record_failure(err),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_owned());
                tracing::error!(target: "drift.vfs", session = %id, panic = %message, "async refresh panicked");
            }
        }
    }
    tracing::debug!(target: "drift.vfs", "refresh worker stopped");
}
