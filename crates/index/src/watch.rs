use fxhash::FxHashMap;
use std::sync::Mutex;

/// Events the indexer reports to registered watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    IndexStart { t: i64 },
    IndexEnd { t: i64 },
    Close,
}

type WatchFn = Box<dyn Fn(&WatchEvent) -> Result<(), String> + Send + Sync>;

/// A registry of watcher callbacks keyed by watch id. A callback that
/// fails is removed and its error logged; the remaining watchers still
/// receive the event.
#[derive(Default)]
pub struct Watchers {
    inner: Mutex<FxHashMap<String, WatchFn>>,
}

impl std::fmt::Debug for Watchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Watchers").field("count", &count).finish()
    }
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: impl Into<String>,
        callback: impl Fn(&WatchEvent) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .expect("watcher registry poisoned")
            .insert(id.into(), Box::new(callback));
    }

    pub fn unregister(&self, id: &str) {
        self.inner
            .lock()
            .expect("watcher registry poisoned")
            .remove(id);
    }

    pub fn emit(&self, event: &WatchEvent) {
        let mut registry = self.inner.lock().expect("watcher registry poisoned");
        let mut failed: Vec<String> = Vec::new();
        for (id, callback) in registry.iter() {
            if let Err(error) = callback(event) {
                tracing::warn!(watch_id = %id, %error, "removing failed watcher");
                failed.push(id.clone());
            }
        }
        for id in failed {
            registry.remove(&id);
        }
    }

    /// Emit the terminal event and drop every registration.
    pub fn close(&self) {
        self.emit(&WatchEvent::Close);
        self.inner
            .lock()
            .expect("watcher registry poisoned")
            .clear();
    }
}

/// The indexer's single-slot lock. The first caller acquires the slot and
/// runs the job; a caller finding the slot occupied replaces the pending
/// continuation instead of starting a second job, so the newest committed
/// state is re-indexed on top of the in-flight outcome.
#[derive(Debug)]
pub struct StatusLock<C> {
    slot: Mutex<Slot<C>>,
}

#[derive(Debug)]
struct Slot<C> {
    held: bool,
    pending: Option<C>,
}

impl<C> Default for StatusLock<C> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                held: false,
                pending: None,
            }),
        }
    }
}

impl<C> StatusLock<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock, carrying a continuation to run after the job.
    /// Returns whether this caller acquired it; when false, the caller's
    /// continuation supersedes the one already pending.
    pub fn try_acquire(&self, continuation: C) -> bool {
        let mut slot = self.slot.lock().expect("status lock poisoned");
        let acquired = !slot.held;
        slot.held = true;
        slot.pending = Some(continuation);
        acquired
    }

    /// Take the pending continuation without releasing the lock; the job
    /// runs it once indexing completes.
    pub fn take_pending(&self) -> Option<C> {
        self.slot
            .lock()
            .expect("status lock poisoned")
            .pending
            .take()
    }

    pub fn release(&self) {
        let mut slot = self.slot.lock().expect("status lock poisoned");
        slot.held = false;
        slot.pending = None;
    }

    pub fn is_held(&self) -> bool {
        self.slot.lock().expect("status lock poisoned").held
    }
}
