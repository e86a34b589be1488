//! Observer lists for socket state-change and message events.
//!
//! Each public event source (socket-opened, socket-closed, socket-errored,
//! socket-received-message) is a list of callbacks. Every subscription gets a
//! numeric ref so listeners can be cancelled independently; the list never
//! retains a listener past an explicit removal.

use std::sync::Arc;

use parking_lot::Mutex;

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// A cancellable list of callbacks for one event stream.
pub(crate) struct CallbackList<A> {
    items: Mutex<Vec<(u64, Callback<A>)>>,
}

impl<A> CallbackList<A> {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback under the given ref.
    pub(crate) fn add(&self, cb_ref: u64, callback: Callback<A>) {
        self.items.lock().push((cb_ref, callback));
    }

    /// Remove the callback registered under `cb_ref`, if any.
    pub(crate) fn remove(&self, cb_ref: u64) {
        self.items.lock().retain(|(r, _)| *r != cb_ref);
    }

    /// Invoke every registered callback with `arg`.
    ///
    /// Callbacks are cloned out of the lock first, so a callback may
    /// re-enter the list (e.g. to unsubscribe itself) without deadlocking.
    pub(crate) fn emit(&self, arg: &A) {
        let callbacks: Vec<Callback<A>> = self
            .items
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(arg);
        }
    }
}
