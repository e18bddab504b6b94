//! Callback registries with explicit unsubscribe handles.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Handle returned by every `subscribe`-style call.
///
/// Calling [`Subscription::unsubscribe`] (or dropping the handle) removes the
/// callback; it will not fire afterwards.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to release.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

thread_local! {
    /// Listeners whose callback is running on this thread, innermost last.
    static DISPATCHING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Listener<T> {
    id: u64,
    callback: Box<dyn Fn(T) + Send + Sync>,
    active: AtomicBool,
    /// Held for the duration of each invocation.
    running: Mutex<()>,
}

impl<T> Listener<T> {
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn is_dispatching_here(&self) -> bool {
        let key = self.key();
        DISPATCHING.with(|stack| stack.borrow().contains(&key))
    }

    /// Mark the listener dead and wait out any invocation on another thread.
    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if !self.is_dispatching_here() {
            drop(self.running.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn invoke(&self, value: T) {
        if self.is_dispatching_here() {
            return;
        }
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let _frame = DispatchFrame::enter(self.key());
        (self.callback)(value);
    }
}

/// Pops the dispatch stack even if the callback panics.
struct DispatchFrame;

impl DispatchFrame {
    fn enter(key: usize) -> Self {
        DISPATCHING.with(|stack| stack.borrow_mut().push(key));
        DispatchFrame
    }
}

impl Drop for DispatchFrame {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct Entries<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Arc<Listener<T>>>>,
}

/// A list of listeners for values of type `T`.
pub struct Subscribers<T> {
    entries: Arc<Entries<T>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Entries {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<T: Clone + 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let listener = Arc::new(Listener {
            id: self.entries.next_id.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
            active: AtomicBool::new(true),
            running: Mutex::new(()),
        });
        if let Ok(mut listeners) = self.entries.listeners.lock() {
            listeners.push(listener.clone());
        }

        let entries: Weak<Entries<T>> = Arc::downgrade(&self.entries);
        let listener: Weak<Listener<T>> = Arc::downgrade(&listener);
        Subscription::new(move || {
            let Some(listener) = listener.upgrade() else {
                return;
            };
            listener.deactivate();
            if let Some(entries) = entries.upgrade() {
                if let Ok(mut listeners) = entries.listeners.lock() {
                    listeners.retain(|existing| existing.id != listener.id);
                }
            }
        })
    }

    /// Deliver `value` to every current listener.
    ///
    /// Callbacks run outside the registry lock, so a listener may subscribe or
    /// unsubscribe from inside its own callback. Once `unsubscribe` returns on
    /// any thread the callback is not running and will not run again. A
    /// nested `notify` skips listeners already running on this thread.
    pub fn notify(&self, value: T) {
        let snapshot: Vec<Arc<Listener<T>>> = match self.entries.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener.invoke(value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .listeners
            .lock()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let sub = subscribers.subscribe(move |v| {
            counter.fetch_add(v as usize, Ordering::SeqCst);
        });

        subscribers.notify(2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        assert!(subscribers.is_empty());

        subscribers.notify(5);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let subscribers: Subscribers<()> = Subscribers::new();
        {
            let _sub = subscribers.subscribe(|_| {});
            assert_eq!(subscribers.len(), 1);
        }
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let subscribers: Subscribers<()> = Subscribers::new();
        let sub = subscribers.subscribe(|_| {});
        drop(subscribers);
        sub.unsubscribe();
    }

    #[test]
    fn test_unsubscribe_from_own_callback() {
        let subscribers: Subscribers<()> = Subscribers::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let sub = {
            let seen = seen.clone();
            let slot = slot.clone();
            subscribers.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().unwrap().take() {
                    own.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(sub);

        subscribers.notify(());
        subscribers.notify(());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_listener_removed_mid_notify_does_not_fire() {
        let subscribers: Subscribers<()> = Subscribers::new();
        let second_calls = Arc::new(AtomicUsize::new(0));
        let second: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let _first = {
            let second = second.clone();
            subscribers.subscribe(move |_| {
                if let Some(sub) = second.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            })
        };
        let counter = second_calls.clone();
        *second.lock().unwrap() = Some(subscribers.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        subscribers.notify(());
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_unsubscribe_waits_for_callback_running_elsewhere() {
        let subscribers: Subscribers<()> = Subscribers::new();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicUsize::new(0));

        let sub = {
            let started = started.clone();
            let finished = finished.clone();
            subscribers.subscribe(move |_| {
                started.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(50));
                finished.fetch_add(1, Ordering::SeqCst);
            })
        };

        let notifier = {
            let subscribers = subscribers.clone();
            std::thread::spawn(move || subscribers.notify(()))
        };
        while !started.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        sub.unsubscribe();
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        notifier.join().unwrap();
        subscribers.notify(());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
