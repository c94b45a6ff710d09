//! Engine lifecycle shared between an engine task and its handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::{watch, Notify};

use crate::error::{ClientError, Result};

/// Observable state of a Reader or Writer engine.
#[derive(Debug, Clone)]
pub enum EngineState {
    /// Opening a stream and waiting for the init response.
    Initializing,
    /// Init handshake finished on the current stream.
    Active,
    /// The previous stream failed, a new one is being opened.
    Reconnecting,
    /// A fatal error stopped the engine.
    Failed(ClientError),
    /// Disposal finished or the engine was dropped.
    Disposed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Failed(_) | EngineState::Disposed)
    }
}

pub(crate) struct Lifecycle {
    state: Mutex<EngineState>,
    disposing: AtomicBool,
    done: watch::Sender<bool>,
    changed: Notify,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Mutex::new(EngineState::Initializing),
            disposing: AtomicBool::new(false),
            done,
            changed: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        self.lock().clone()
    }

    /// Move to `next` unless the engine already reached a terminal state.
    pub(crate) fn set(&self, next: EngineState) {
        {
            let mut state = self.lock();
            if state.is_terminal() {
                return;
            }
            *state = next;
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn fail(&self, error: ClientError) {
        self.set(EngineState::Failed(error));
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn begin_dispose(&self) -> bool {
        let first = !self.disposing.swap(true, Ordering::SeqCst);
        if first {
            self.changed.notify_waiters();
        }
        first
    }

    pub(crate) fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// Error for an operation that starts now, if it must not start.
    pub(crate) fn check_accepting(&self) -> Result<()> {
        if let EngineState::Failed(e) = &*self.lock() {
            return Err(e.clone());
        }
        if self.is_disposing() {
            return Err(ClientError::Disposed);
        }
        if matches!(*self.lock(), EngineState::Disposed) {
            return Err(ClientError::Disposed);
        }
        Ok(())
    }

    /// Wakes on every state change and at the start of disposal.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Called once by the engine task when it exits.
    pub(crate) fn finish(&self) {
        self.set(EngineState::Disposed);
        self.done.send_replace(true);
        self.changed.notify_waiters();
    }

    pub(crate) fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) async fn wait_finished(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_state_is_sticky() {
        let lifecycle = Lifecycle::new();
        lifecycle.set(EngineState::Active);
        lifecycle.fail(ClientError::Internal("boom".to_string()));
        lifecycle.set(EngineState::Reconnecting);
        lifecycle.finish();
        assert!(matches!(lifecycle.state(), EngineState::Failed(_)));
        assert!(matches!(
            lifecycle.check_accepting(),
            Err(ClientError::Internal(_))
        ));
    }

    #[test]
    fn test_dispose_is_reported_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.check_accepting().is_ok());
        assert!(lifecycle.begin_dispose());
        assert!(!lifecycle.begin_dispose());
        assert!(matches!(
            lifecycle.check_accepting(),
            Err(ClientError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_wait_finished_after_finish() {
        let lifecycle = Lifecycle::new();
        lifecycle.finish();
        assert!(lifecycle.is_finished());
        lifecycle.wait_finished().await;
        assert!(matches!(lifecycle.state(), EngineState::Disposed));
    }
}
