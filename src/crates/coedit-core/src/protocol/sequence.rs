//! Thread-safe sequence index counter.
//!
//! Every logical message a session sends is stamped with a *sequence index*.
//! The receiver uses it to tell the fragments of one message apart from the
//! fragments of the next: a fragment whose index differs from the sequence
//! being assembled is a protocol violation.
//!
//! # Ownership
//!
//! One counter belongs to one sending identity and lives inside that
//! identity's [`crate::protocol::PacketSequencer`].  Several threads may send
//! through the same sequencer at once (for example a poll loop and a metadata
//! push), so the counter must hand out unique values without a lock.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64` internally.  `fetch_add` reads, increments,
//! and writes the value as one indivisible step, so two threads calling
//! [`SequenceCounter::next`] at the same moment always receive different
//! indices.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free source of sequence indices for one sending identity.
///
/// Hands out 0, 1, 2, ... and wraps from `u64::MAX` to 0.
///
/// # Examples
///
/// ```rust
/// use coedit_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first index is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            inner: AtomicU64::new(first),
        }
    }

    /// Returns the next sequence index and atomically increments the counter.
    ///
    /// `Ordering::Relaxed` is sufficient: the index only has to be unique,
    /// it does not publish any other memory to the receiving thread.
    pub fn next(&self) -> u64 {
        // Previous value; wraps on overflow.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the index the next call to [`next`](Self::next) would hand out.
    ///
    /// Only useful for logging: another thread may advance the counter
    /// before the caller reads the result.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
