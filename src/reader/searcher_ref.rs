use std::sync::Arc;
use parking_lot::Mutex;
use tantivy::Searcher;

struct RefState {
    searcher: Option<Searcher>,
    ref_count: usize,
    detached: bool,
}

/// A reference-counted view of one key index at one generation.
///
/// The key's slot in the data source holds the canonical `Arc`. Once a newer
/// generation replaces it the reference is detached, and the underlying
/// searcher is dropped when the last checkout is released.
pub struct SearcherRef {
    key: String,
    generation: u64,
    state: Mutex<RefState>,
}

impl SearcherRef {
    pub fn new(key: impl Into<String>, generation: u64, searcher: Searcher) -> Arc<Self> {
        Arc::new(SearcherRef {
            key: key.into(),
            generation,
            state: Mutex::new(RefState {
                searcher: Some(searcher),
                ref_count: 0,
                detached: false,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Checks the searcher out; `None` once it has been disposed.
    pub fn acquire(self: &Arc<Self>) -> Option<SearcherCheckout> {
        let mut state = self.state.lock();
        let searcher = state.searcher.clone()?;
        state.ref_count += 1;
        Some(SearcherCheckout {
            owner: Arc::clone(self),
            searcher,
            released: false,
        })
    }

    /// Gives back one checkout.
    ///
    /// Returns `true` only for the call that actually disposed the searcher;
    /// a release at zero is ignored.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        if state.ref_count == 0 {
            return false;
        }
        state.ref_count -= 1;
        if state.ref_count == 0 && state.detached {
            return dispose(&mut state);
        }
        false
    }

    /// Called when a newer generation supersedes this one.
    ///
    /// Disposes at once if nobody holds a checkout, otherwise leaves that to
    /// the last `release`. Returns whether it disposed now.
    pub fn detach_or_close(&self) -> bool {
        let mut state = self.state.lock();
        state.detached = true;
        if state.ref_count == 0 {
            return dispose(&mut state);
        }
        false
    }

    /// Unconditional dispose at data source shutdown.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        state.detached = true;
        dispose(&mut state)
    }

    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().searcher.is_none()
    }
}

fn dispose(state: &mut RefState) -> bool {
    state.searcher.take().is_some()
}

/// A live hold on a `SearcherRef`; released on drop if not released before.
pub struct SearcherCheckout {
    owner: Arc<SearcherRef>,
    searcher: Searcher,
    released: bool,
}

impl SearcherCheckout {
    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn generation(&self) -> u64 {
        self.owner.generation
    }

    pub fn owner(&self) -> &Arc<SearcherRef> {
        &self.owner
    }

    /// Releases now and reports whether this closed the reference.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.owner.release()
    }
}

impl Drop for SearcherCheckout {
    fn drop(&mut self) {
        if !self.released {
            self.owner.release();
        }
    }
}
