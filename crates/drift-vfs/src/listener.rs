use std::sync::Arc;

use crate::event::ChangeEvent;

/// Receives batches of file changes.
///
/// Both halves run under the model write lock on the firing thread. `before` sees the cache in
/// its old state, `after` sees it with the batch applied. Returning an error does not stop other
/// listeners from being notified; the first error is reported to whoever fired the batch.
pub trait BulkFileListener: Send + Sync {
    fn before(&self, _events: &[ChangeEvent]) -> anyhow::Result<()> {
        Ok(())
    }

    fn after(&self, _events: &[ChangeEvent]) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<L: ?Sized + BulkFileListener> BulkFileListener for Arc<L> {
    fn before(&self, events: &[ChangeEvent]) -> anyhow::Result<()> {
        self.as_ref().before(events)
    }

    fn after(&self, events: &[ChangeEvent]) -> anyhow::Result<()> {
        self.as_ref().after(events)
    }
}

/// Handle returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
