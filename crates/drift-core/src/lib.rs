//! Core shared types for drift.
//!
//! This crate is intentionally small: identities, text primitives, cancellation, and the
//! process-wide model lock that both the VFS and the smart pointer layer synchronize on.

mod lock;

use std::fmt;

pub use lock::{ModelLock, ReadGuard, WriteGuard};
pub use text_size::{TextRange, TextSize};
pub use tokio_util::sync::CancellationToken;

/// Stable identity of a cached file record.
///
/// Ids are allocated monotonically and never reused within a process, so a stale id can be
/// detected instead of silently aliasing a newer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned by cooperative work that observed a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Returns `Err(Cancelled)` if `token` has been cancelled.
#[inline]
pub fn check_cancelled(token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// Shifts `range` by a signed `delta`, saturating at zero.
pub fn shift_range(range: TextRange, delta: i64) -> TextRange {
    let start = shift_offset(range.start(), delta);
    let end = shift_offset(range.end(), delta);
    TextRange::new(start, end.max(start))
}

fn shift_offset(offset: TextSize, delta: i64) -> TextSize {
    let shifted = (u32::from(offset) as i64).saturating_add(delta).max(0);
    TextSize::from(u32::try_from(shifted).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_range_saturates_at_zero() {
        let range = TextRange::new(TextSize::from(2), TextSize::from(5));
        assert_eq!(
            shift_range(range, -4),
            TextRange::new(TextSize::from(0), TextSize::from(1))
        );
        assert_eq!(
            shift_range(range, 3),
            TextRange::new(TextSize::from(5), TextSize::from(8))
        );
    }

    #[test]
    fn check_cancelled_reports_token_state() {
        let token = CancellationToken::new();
        assert_eq!(check_cancelled(&token), Ok(()));
        token.cancel();
        assert_eq!(check_cancelled(&token), Err(Cancelled));
    }
}
