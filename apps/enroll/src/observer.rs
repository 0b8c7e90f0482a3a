use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Single-slot subscription point for one kind of event.
///
/// At most one handler is registered at a time; subscribing again replaces the
/// previous handler. Publishing with no subscriber is a no-op and reports
/// `false` so callers can log dropped notifications when that matters.
pub struct Observer<T> {
    slot: Mutex<Option<Handler<T>>>,
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        *self.slot.lock() = Some(Arc::new(handler));
    }

    pub fn unsubscribe(&self) {
        self.slot.lock().take();
    }

    pub fn is_subscribed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Delivers `value` to the current subscriber.
    ///
    /// The handler runs outside the slot lock, so it may resubscribe or
    /// unsubscribe without deadlocking.
    pub fn publish(&self, value: T) -> bool {
        let handler = self.slot.lock().clone();
        match handler {
            Some(handler) => {
                handler(value);
                true
            }
            None => false,
        }
    }
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_without_subscriber_is_a_noop() {
        let observer: Observer<u32> = Observer::new();
        assert!(!observer.publish(7));
    }

    #[test]
    fn subscribing_again_replaces_the_handler() {
        let observer = Observer::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let sink = first.clone();
        observer.subscribe(move |value: usize| {
            sink.fetch_add(value, Ordering::SeqCst);
        });
        let sink = second.clone();
        observer.subscribe(move |value: usize| {
            sink.fetch_add(value, Ordering::SeqCst);
        });

        assert!(observer.publish(3));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let observer = Arc::new(Observer::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = observer.clone();
        let sink = hits.clone();
        observer.subscribe(move |_: ()| {
            sink.fetch_add(1, Ordering::SeqCst);
            inner.unsubscribe();
        });

        assert!(observer.publish(()));
        assert!(!observer.publish(()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
