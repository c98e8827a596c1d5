use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drift_core::{CancellationToken, FileId};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, VfsError};
use crate::event::ChangeEvent;
use crate::queue::RefreshContext;
use crate::worker::RefreshWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a [`RefreshSession`].
///
/// `Queued → Scanning → EventsPending → Firing → Done`, with `Cancelled` reachable from every
/// state before `Firing`. A session that started firing always ends in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Queued,
    Scanning,
    EventsPending,
    Firing,
    Done,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Cancelled)
    }
}

pub type FinishCallback = Box<dyn FnOnce() + Send + 'static>;

/// One unit of refresh work: a set of roots to scan plus an optional completion callback.
///
/// Roots may be added while the session is running. Roots added before the session fires are
/// scanned in the same pass; roots added by a listener while it fires trigger another scan pass
/// once the current batch has been delivered.
pub struct RefreshSession {
    id: SessionId,
    is_async: bool,
    recursive: bool,
    roots: Mutex<VecDeque<FileId>>,
    events: Mutex<Vec<ChangeEvent>>,
    on_finish: Mutex<Option<FinishCallback>>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    submitted: AtomicBool,
    fired: AtomicBool,
    token: CancellationToken,
    failure: Mutex<Option<VfsError>>,
}

impl fmt::Debug for RefreshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshSession")
            .field("id", &self.id)
            .field("is_async", &self.is_async)
            .field("recursive", &self.recursive)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl RefreshSession {
    pub(crate) fn new(
        id: SessionId,
        is_async: bool,
        recursive: bool,
        on_finish: Option<FinishCallback>,
    ) -> Self {
        Self {
            id,
            is_async,
            recursive,
            roots: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            on_finish: Mutex::new(on_finish),
            state: Mutex::new(SessionState::Queued),
            state_changed: Condvar::new(),
            submitted: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            token: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == SessionState::Cancelled
    }

    /// Queues another root. Has no effect once the session finished.
    pub fn add_file(&self, file: FileId) {
        self.roots.lock().push_back(file);
    }

    pub fn add_files(&self, files: impl IntoIterator<Item = FileId>) {
        self.roots.lock().extend(files);
    }

    /// Requests cancellation.
    ///
    /// Returns `false` if the session already started firing or finished; such a session runs
    /// to completion. A cancelled session never delivers its partial events.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock();
        if self.fired.load(Ordering::SeqCst) || state.is_terminal() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Blocks until the session reaches a terminal state or `timeout` elapses, returning the
    /// state observed last.
    pub fn wait(&self, timeout: Duration) -> SessionState {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_terminal() {
            if self.state_changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }

    /// Events collected by the current scan pass that were not fired yet.
    pub fn pending_events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    /// Takes the error an asynchronous run finished with, if any.
    pub fn take_error(&self) -> Option<VfsError> {
        self.failure.lock().take()
    }

    pub(crate) fn mark_submitted(&self) -> bool {
        !self.submitted.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn record_failure(&self, err: VfsError) {
        self.failure.lock().get_or_insert(err);
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return;
        }
        tracing::trace!(target: "drift.vfs", session = %self.id, from = ?*state, to = ?next, "refresh session state");
        *state = next;
        drop(state);
        self.state_changed.notify_all();
    }

    /// Moves to `Firing` unless cancellation won the race.
    fn begin_firing(&self) -> bool {
        let mut state = self.state.lock();
        if self.token.is_cancelled() {
            return false;
        }
        *state = SessionState::Firing;
        self.fired.store(true, Ordering::SeqCst);
        true
    }

    fn has_pending_roots(&self) -> bool {
        !self.roots.lock().is_empty()
    }

    fn pop_root(&self) -> Option<FileId> {
        self.roots.lock().pop_front()
    }

    fn has_finish_callback(&self) -> bool {
        self.on_finish.lock().is_some()
    }

    /// Drives the session to a terminal state.
    ///
    /// The finish callback runs exactly once, after the last batch was delivered and the write
    /// lock was released, even if a listener failed or panicked.
    pub(crate) fn run(self: &Arc<Self>, ctx: &RefreshContext) -> Result<()> {
        let mut completion = Completion {
            session: self,
            activity: Some(ctx.progress.enter(self.id)),
            outcome: SessionState::Done,
        };
        let worker = RefreshWorker::new(&*ctx.fs, &ctx.cache, &ctx.ignored);
        let mut failure: Option<VfsError> = None;

        loop {
            self.set_state(SessionState::Scanning);
            while let Some(root) = self.pop_root() {
                if self.token.is_cancelled() {
                    break;
                }
                let outcome = worker.scan(root, self.recursive, &self.token);
                self.events.lock().extend(outcome.events);
                if outcome.cancelled {
                    break;
                }
            }
            if self.token.is_cancelled() {
                tracing::debug!(target: "drift.vfs", session = %self.id, "refresh session cancelled");
                self.events.lock().clear();
                completion.outcome = SessionState::Cancelled;
                break;
            }

            // Sessions with a finish callback pass through firing even without events.
            if self.events.lock().is_empty() && !self.has_finish_callback() {
                break;
            }

            self.set_state(SessionState::EventsPending);
            let write = ctx.lock.write();
            if self.has_pending_roots() {
                drop(write);
                continue;
            }
            if !self.begin_firing() {
                drop(write);
                self.events.lock().clear();
                completion.outcome = SessionState::Cancelled;
                break;
            }
            self.state_changed.notify_all();

            let events = std::mem::take(&mut *self.events.lock());
            if let Err(err) = ctx.dispatcher.fire(events) {
                failure.get_or_insert(err);
            }
            drop(write);

            if !self.has_pending_roots() {
                break;
            }
        }

        // Recorded before the terminal state becomes observable to waiters.
        let result = match failure {
            Some(err) if self.is_async => {
                tracing::error!(target: "drift.vfs", session = %self.id, error = %err, "async refresh failed");
                self.record_failure(err);
                Ok(())
            }
            Some(err) => Err(err),
            None => Ok(()),
        };
        drop(completion);
        result
    }
}

/// Runs the finish callback and publishes the terminal state on every exit path out of
/// [`RefreshSession::run`], unwinding included.
struct Completion<'a> {
    session: &'a RefreshSession,
    activity: Option<crate::progress::SessionActivity>,
    outcome: SessionState,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        let callback = self.session.on_finish.lock().take();
        if let Some(callback) = callback {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
                tracing::error!(target: "drift.vfs", session = %self.session.id, "refresh finish callback panicked");
            }
        }
        if let Some(mut activity) = self.activity.take() {
            activity.set_final_state(self.outcome);
        }
        self.session.set_state(self.outcome);
    }
}
