//! Cooperative cancellation.
//!
//! An [`AbortSignal`] is monotonic: once aborted it stays aborted and keeps
//! the first reason it was given. Steps observe it at checkpoints; nothing
//! is interrupted mid-handler.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio_util::sync::CancellationToken;

struct SignalState {
    token: CancellationToken,
    reason: OnceLock<String>,
    /// Derived signals to abort when this one fires.
    listeners: Mutex<Vec<Weak<SignalState>>>,
    /// Signals this one is listening to.
    sources: Mutex<Vec<Weak<SignalState>>>,
}

impl SignalState {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
        }
    }

    fn abort(self: &Arc<Self>, reason: &str) {
        if self.reason.set(reason.to_string()).is_err() {
            return;
        }
        self.token.cancel();

        // Stop listening to the signals this one was derived from.
        let sources =
            std::mem::take(&mut *self.sources.lock().unwrap_or_else(PoisonError::into_inner));
        for source in sources.iter().filter_map(Weak::upgrade) {
            source.remove_listener(self);
        }

        let listeners =
            std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner));
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.abort(reason);
        }
    }

    fn add_listener(&self, listener: &Arc<SignalState>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(Arc::downgrade(listener));
    }

    fn remove_listener(&self, listener: &Arc<SignalState>) {
        let target = Arc::downgrade(listener);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| l.strong_count() > 0 && !l.ptr_eq(&target));
    }

    fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}

/// A cancellation signal with a reason.
///
/// Clones observe and control the same signal.
///
/// # Examples
///
/// ```
/// use tsuzuri_core::AbortSignal;
///
/// let signal = AbortSignal::new();
/// assert!(!signal.is_aborted());
///
/// signal.abort("user cancelled");
/// signal.abort("ignored, already aborted");
///
/// assert_eq!(signal.reason().as_deref(), Some("user cancelled"));
/// ```
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.state.reason.get())
            .finish()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// Creates a signal that has already fired with `reason`.
    pub fn aborted(reason: impl Into<String>) -> Self {
        let signal = Self::new();
        signal.abort(&reason.into());
        signal
    }

    /// Fires the signal. Only the first reason is kept.
    pub fn abort(&self, reason: &str) {
        self.state.abort(reason);
    }

    /// Returns `true` once the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.state.reason.get().is_some()
    }

    /// Returns the reason the signal fired with.
    pub fn reason(&self) -> Option<String> {
        self.state.reason.get().cloned()
    }

    /// Returns an abort error if the signal has fired.
    ///
    /// This is the checkpoint the engine calls between steps.
    pub fn check(&self) -> Result<(), crate::error::WorkflowError> {
        match self.state.reason.get() {
            Some(reason) => Err(crate::error::WorkflowError::aborted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Completes when the signal fires.
    pub async fn cancelled(&self) {
        self.state.token.cancelled().await
    }

    /// Returns a token that is cancelled when this signal fires, for use
    /// with `tokio::select!` or APIs that accept a token.
    pub fn token(&self) -> CancellationToken {
        self.state.token.clone()
    }

    /// Number of live derived signals still listening to this one.
    pub fn listener_count(&self) -> usize {
        self.state.listener_count()
    }
}

/// Combines signals into one that fires as soon as any of them does.
///
/// The derived signal carries the reason of the first input observed to fire;
/// if an input has already fired, that is the first such input in slice
/// order. Once the derived signal fires it detaches from every input, so no
/// listener outlives the trigger.
///
/// ```
/// use tsuzuri_core::{merge_signals, AbortSignal};
///
/// let run = AbortSignal::new();
/// let caller = AbortSignal::new();
/// let merged = merge_signals(&[run.clone(), caller.clone()]);
///
/// caller.abort("timeout");
/// assert_eq!(merged.reason().as_deref(), Some("timeout"));
/// assert!(!run.is_aborted());
/// ```
pub fn merge_signals(signals: &[AbortSignal]) -> AbortSignal {
    let merged = AbortSignal::new();

    if let Some(reason) = signals.iter().find_map(AbortSignal::reason) {
        merged.abort(&reason);
        return merged;
    }

    for signal in signals {
        merged
            .state
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&signal.state));
        signal.state.add_listener(&merged.state);

        // The source may have fired between the check above and registration.
        if let Some(reason) = signal.reason() {
            merged.abort(&reason);
            break;
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_merge_already_aborted() {
        let first = AbortSignal::aborted("first");
        let fresh = AbortSignal::new();

        let merged = merge_signals(&[first, fresh.clone()]);

        assert!(merged.is_aborted());
        assert_eq!(merged.reason().as_deref(), Some("first"));
        assert_eq!(fresh.listener_count(), 0);
    }

    #[test]
    fn test_merge_keeps_first_reason() {
        let a = AbortSignal::new();
        let b = AbortSignal::new();
        let merged = merge_signals(&[a.clone(), b.clone()]);

        b.abort("b");
        a.abort("a");

        assert_eq!(merged.reason().as_deref(), Some("b"));
    }

    #[test]
    fn test_listeners_released_on_trigger() {
        let a = AbortSignal::new();
        let b = AbortSignal::new();
        let merged = merge_signals(&[a.clone(), b.clone()]);
        assert_eq!(a.listener_count(), 1);
        assert_eq!(b.listener_count(), 1);

        a.abort("done");

        assert!(merged.is_aborted());
        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_dropped_merge_is_not_counted() {
        let a = AbortSignal::new();
        drop(merge_signals(&[a.clone()]));
        assert_eq!(a.listener_count(), 0);
        a.abort("late");
        assert!(a.is_aborted());
    }

    #[test]
    fn test_merge_is_monotonic() {
        let merged = merge_signals(&[]);
        assert!(!merged.is_aborted());
        merged.abort("x");
        merged.abort("y");
        assert_eq!(merged.reason().as_deref(), Some("x"));
        assert!(merged.check().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_completes() {
        let signal = AbortSignal::new();
        let remote = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.abort("later");
        });

        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("signal fired");
        assert!(signal.token().is_cancelled());
    }
}
