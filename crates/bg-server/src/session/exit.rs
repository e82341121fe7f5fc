//! Transport exit notification

use parking_lot::Mutex;

/// Called with the exit status once the session is over
pub type ExitCallback = Box<dyn FnOnce(i32) + Send>;

/// Exit code of a session that ended normally
pub const EXIT_NORMAL: i32 = 0;
/// Exit code of a session stopped by the server
pub const EXIT_STOPPED: i32 = 1;
/// Exit code of a session closed before it started
pub const EXIT_REJECTED: i32 = 2;

/// Fires an [`ExitCallback`] at most once, whichever exit path gets there first
pub struct ExitHook {
    callback: Mutex<Option<ExitCallback>>,
}

impl ExitHook {
    pub fn new(callback: ExitCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// A hook with nothing to call
    pub fn noop() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    /// Invoke the callback if it has not been invoked yet.
    /// Returns whether this call fired it.
    pub fn fire(&self, code: i32) -> bool {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                callback(code);
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.callback.lock().is_none()
    }
}

impl std::fmt::Debug for ExitHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitHook")
            .field("fired", &self.has_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fires_once_under_concurrency() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook = Arc::new(ExitHook::new(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let hook = Arc::clone(&hook);
                std::thread::spawn(move || hook.fire(i % 3))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fired| *fired)
            .count();

        assert_eq!(fired, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(hook.has_fired());
    }

    #[test]
    fn test_noop_hook() {
        let hook = ExitHook::noop();
        assert!(!hook.fire(EXIT_NORMAL));
    }
}
