//! Cancellation signals and their aggregation.
//!
//! A merged upstream call is governed by every constituent's cancellation
//! source at once: client disconnects, per-field timeouts, and the dispose of
//! a parent delegation all need to abort the same in-flight request.
//! [`combine`] aggregates any number of [`AbortSignal`]s into one signal that
//! aborts as soon as any source does, carrying the reason of whichever source
//! aborted first.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct SignalState {
    aborted: AtomicBool,
    reason: Mutex<Option<Arc<str>>>,
    notify: Notify,
    // Leaf sources tracked by a combined signal. Empty for plain signals, so
    // flattening a combined signal never nests combinators.
    sources: Mutex<Vec<AbortSignal>>,
}

/// A cancellation signal, observed by whoever holds a clone of it.
///
/// Signals are aborted through their [`AbortController`], or transitively by
/// the sources a combined signal tracks. The first abort wins; later aborts
/// are ignored.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl AbortSignal {
    /// Whether this signal has been aborted.
    pub fn aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// The abort reason, if the signal has been aborted.
    pub fn reason(&self) -> Option<Arc<str>> {
        self.state.reason.lock().clone()
    }

    /// Resolves once the signal is aborted. Resolves immediately if it
    /// already has been.
    pub async fn wait(&self) {
        if self.aborted() {
            return;
        }
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register for the next notification before re-checking, so an abort
        // racing with this call cannot be missed.
        notified.as_mut().enable();
        if self.aborted() {
            return;
        }
        notified.await;
    }

    /// Grow the set of sources whose abort also aborts this signal.
    ///
    /// Combined signals are flattened into their leaf sources first, and
    /// sources already tracked are skipped. A source that is already aborted
    /// aborts this signal immediately rather than being silently dropped.
    pub fn add_signals(&self, signals: impl IntoIterator<Item = AbortSignal>) {
        for signal in signals {
            for leaf in signal.leaves() {
                if leaf.same(self) {
                    continue;
                }
                let tracked = {
                    let mut sources = self.state.sources.lock();
                    if sources.iter().any(|source| source.same(&leaf)) {
                        true
                    } else {
                        sources.push(leaf.clone());
                        false
                    }
                };
                if !tracked {
                    watch(leaf, self.clone());
                }
            }
        }
    }

    fn abort_with(&self, reason: Option<Arc<str>>) {
        // The lock serializes racing aborts so the stored reason is always
        // the one whose abort won.
        let mut guard = self.state.reason.lock();
        if self.state.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        *guard = reason;
        drop(guard);
        self.state.notify.notify_waiters();
    }

    fn same(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    // The original, non-combinator signals behind this one.
    fn leaves(&self) -> Vec<AbortSignal> {
        let sources = self.state.sources.lock();
        if sources.is_empty() {
            vec![self.clone()]
        } else {
            sources.clone()
        }
    }

    #[cfg(test)]
    fn source_count(&self) -> usize {
        self.state.sources.lock().len()
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Owns an [`AbortSignal`] and decides when it aborts.
#[derive(Clone, Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// Create a controller with a fresh, un-aborted signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the controlled signal.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort the controlled signal. The first abort sets the reason; later
    /// calls are no-ops.
    pub fn abort(&self, reason: impl Into<Arc<str>>) {
        self.signal.abort_with(Some(reason.into()));
    }
}

/// Combine cancellation signals into one signal that aborts as soon as any
/// source aborts, with the reason of whichever source aborted first.
///
/// Previously combined signals are unwrapped into their leaf sources, and
/// duplicate sources are tracked once. With zero distinct sources this
/// returns `None`; with exactly one it returns that source unchanged, so no
/// aggregation cost is paid when there is nothing to aggregate.
pub fn combine(signals: Vec<AbortSignal>) -> Option<AbortSignal> {
    let mut leaves: Vec<AbortSignal> = Vec::new();
    for signal in &signals {
        for leaf in signal.leaves() {
            if !leaves.iter().any(|source| source.same(&leaf)) {
                leaves.push(leaf);
            }
        }
    }

    match leaves.len() {
        0 => None,
        1 => leaves.pop(),
        _ => {
            let combined = AbortSignal::default();
            *combined.state.sources.lock() = leaves.clone();
            for leaf in leaves {
                watch(leaf, combined.clone());
            }
            Some(combined)
        }
    }
}

// Aborts `target` once `source` aborts. The watcher deregisters itself (the
// task exits) as soon as either side aborts.
fn watch(source: AbortSignal, target: AbortSignal) {
    if source.aborted() {
        target.abort_with(source.reason());
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = source.wait() => target.abort_with(source.reason()),
            _ = target.wait() => {}
        }
    });
}

/// A timeout behind a scoped-acquisition contract: dropping the
/// [`TimeoutSignal`] cancels the timer task whether or not it has fired, so
/// no timer outlives the call it was guarding.
#[derive(Debug)]
pub struct TimeoutSignal {
    signal: AbortSignal,
    handle: JoinHandle<()>,
}

impl TimeoutSignal {
    /// Start a timer that aborts the signal with a timeout reason once
    /// `duration` elapses.
    pub fn spawn(duration: Duration) -> Self {
        let controller = AbortController::new();
        let signal = controller.signal();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            controller.abort("timeout elapsed");
        });
        Self { signal, handle }
    }

    /// The signal aborted when the timeout fires.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }
}

impl Drop for TimeoutSignal {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
