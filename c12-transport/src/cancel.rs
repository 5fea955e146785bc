//! Cooperative cancellation and the uninterruptible window

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Handle to request cancellation of the operation running on a channel
///
/// Cloned handles share state, so the handle can be given to another task
/// while the channel is busy. A cancellation is observed once: after the
/// channel has reported [`OperationCancelled`](c12_core::C12Error::OperationCancelled)
/// it resets the handle and later operations run normally.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if let Ok(token) = self.token.lock() {
            token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.lock().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// Current token, to be awaited at a cancellation point
    pub fn token(&self) -> CancellationToken {
        self.token
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Replace a cancelled token by a fresh one
    pub fn reset(&self) {
        if let Ok(mut token) = self.token.lock() {
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
    }
}

/// Depth counter of nested uninterruptible windows
#[derive(Debug, Clone, Default)]
pub struct Uninterruptible {
    depth: Arc<AtomicUsize>,
}

impl Uninterruptible {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Enter a window, left when the guard is dropped
    pub fn enter(&self) -> UninterruptibleGuard {
        self.depth.fetch_add(1, Ordering::AcqRel);
        UninterruptibleGuard {
            depth: self.depth.clone(),
        }
    }
}

/// While alive, cancellation requests are not honored by the channel
#[derive(Debug)]
#[must_use = "the window closes as soon as the guard is dropped"]
pub struct UninterruptibleGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for UninterruptibleGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_and_reset() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        let token = handle.token();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(token.is_cancelled());

        handle.reset();
        assert!(!handle.is_cancelled());
        assert!(!handle.token().is_cancelled());
    }

    #[test]
    fn test_guard_nesting_released_on_drop() {
        let window = Uninterruptible::new();
        assert!(!window.is_active());
        {
            let _outer = window.enter();
            {
                let _inner = window.enter();
                assert!(window.is_active());
            }
            assert!(window.is_active());
        }
        assert!(!window.is_active());
    }

    #[test]
    fn test_guard_released_on_error_path() {
        fn failing(window: &Uninterruptible) -> Result<(), ()> {
            let _guard = window.enter();
            Err(())
        }
        let window = Uninterruptible::new();
        assert!(failing(&window).is_err());
        assert!(!window.is_active());
    }
}
