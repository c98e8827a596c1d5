use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Process-wide read/write lock over the file and document model.
///
/// Event firing and document mutation happen under the write lock; anything that inspects the
/// model from another thread takes the read lock. Unlike a plain `RwLock`, this lock knows which
/// thread holds it:
///
/// - the write lock is re-entrant for the owning thread (listeners may refresh or edit while
///   events are being fired),
/// - a read request from the writer thread is granted immediately,
/// - asking for the write lock while holding only a read lock is refused with a panic, because
///   it can never succeed,
/// - a writer that still holds reads when its last write guard drops keeps excluding other
///   writers until those reads are released.
///
/// Ownership is tracked per thread in one state table; waiters park on a condition variable.
#[derive(Default)]
pub struct ModelLock {
    state: Mutex<HolderState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct HolderState {
    writer: Option<ThreadId>,
    write_depth: usize,
    readers: HashMap<ThreadId, usize>,
}

impl ModelLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires shared read access, blocking while another thread writes.
    ///
    /// Reads never queue behind a waiting writer, so nested reads cannot deadlock.
    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.writer.is_some_and(|writer| writer != me) {
            self.released.wait(&mut state);
        }
        *state.readers.entry(me).or_insert(0) += 1;
        ReadGuard { lock: self }
    }

    /// Acquires exclusive write access.
    ///
    /// # Panics
    ///
    /// Panics if the current thread holds a read lock but not the write lock.
    pub fn write(&self) -> WriteGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return WriteGuard { lock: self };
        }
        assert!(
            !state.readers.contains_key(&me),
            "write lock requested while the current thread holds a read lock"
        );
        while state.writer.is_some() || !state.readers.is_empty() {
            self.released.wait(&mut state);
        }
        state.writer = Some(me);
        state.write_depth = 1;
        WriteGuard { lock: self }
    }

    /// Returns `true` if the current thread may read the model (it holds either lock).
    pub fn is_read_locked_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        let state = self.state.lock();
        state.writer == Some(me) || state.readers.contains_key(&me)
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Panics unless the current thread holds the write lock.
    #[track_caller]
    pub fn assert_write_access(&self) {
        if !self.is_write_locked_by_current_thread() {
            let loc = std::panic::Location::caller();
            tracing::error!(
                target: "drift.lock",
                file = loc.file(),
                line = loc.line(),
                "model mutation outside of the write lock"
            );
            panic!("write access is required ({}:{})", loc.file(), loc.line());
        }
    }
}

impl fmt::Debug for ModelLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ModelLock")
            .field("writer", &state.writer)
            .field("write_depth", &state.write_depth)
            .field("readers", &state.readers.len())
            .finish()
    }
}

/// Shared access to the model; released on drop.
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ModelLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.lock.state.lock();
        if let Some(count) = state.readers.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&me);
                self.lock.released.notify_all();
            }
        }
    }
}

/// Exclusive access to the model; released when the outermost guard drops.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ModelLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.write_depth = state.write_depth.saturating_sub(1);
        if state.write_depth == 0 {
            // Reads taken under the write lock stay registered and keep writers out.
            state.writer = None;
            self.lock.released.notify_all();
        }
    }
}
