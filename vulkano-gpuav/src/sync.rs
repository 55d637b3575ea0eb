//! Synchronization between the host and submissions.
//!
//! The host must not read what a submission wrote until the submission is known to be complete.
//! Every submission of a command buffer returns a [`Fence`] that becomes signaled once the
//! submission has finished executing, and reading the violations of the submission requires
//! waiting on that fence.

use crate::macros::impl_id_counter;
use std::{
    num::NonZero,
    sync::atomic::{AtomicBool, Ordering},
};

/// Signals the completion of one submission.
#[derive(Debug)]
pub struct Fence {
    id: NonZero<u64>,
    signaled: AtomicBool,
}

impl Fence {
    pub(crate) fn new() -> Self {
        Fence {
            id: Self::next_id(),
            signaled: AtomicBool::new(false),
        }
    }

    /// Returns whether the submission that the fence belongs to has completed.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    pub(crate) fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }
}

impl_id_counter!(Fence);

#[cfg(test)]
mod tests {
    use super::Fence;

    #[test]
    fn signal() {
        let fence = Fence::new();
        assert!(!fence.is_signaled());

        fence.signal();
        assert!(fence.is_signaled());
        assert_ne!(fence.id(), Fence::new().id());
    }
}
