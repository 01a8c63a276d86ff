//! Single-slot latest-value mailbox.
//!
//! A background task publishes into the slot; readers see only the most
//! recent value. Publishing replaces whatever was there, so the slot never
//! grows and slow readers simply miss intermediate values. This replaces
//! the "shared mutable latest result" pattern with explicit ownership.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A thread-safe single-slot mailbox holding the latest published value.
///
/// Cheap to clone; all clones share the same slot.
#[derive(Debug)]
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    slot: Mutex<Option<T>>,
    published: Notify,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                published: Notify::new(),
            }),
        }
    }

    /// Publish a value, replacing the previous one.
    pub fn publish(&self, value: T) {
        *self.inner.slot.lock() = Some(value);
        self.inner.published.notify_waiters();
    }

    /// Remove and return the latest value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.inner.slot.lock().take()
    }
}

impl<T: Clone> Mailbox<T> {
    /// Read the latest value without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.inner.slot.lock().clone()
    }

    /// Wait up to `timeout` for a value to be present.
    ///
    /// Returns the latest value as soon as one is available, or `None` when
    /// the deadline passes with the slot still empty.
    pub async fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking, so a publish between the
            // check and the await is not missed.
            let published = self.inner.published.notified();
            if let Some(value) = self.peek() {
                return Some(value);
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return self.peek();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_replaces() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.peek(), None);

        mailbox.publish(1u32);
        mailbox.publish(2u32);
        assert_eq!(mailbox.peek(), Some(2));

        assert_eq!(mailbox.take(), Some(2));
        assert_eq!(mailbox.peek(), None);
    }

    #[test]
    fn test_clones_share_slot() {
        let a = Mailbox::new();
        let b = a.clone();
        a.publish("hello");
        assert_eq!(b.peek(), Some("hello"));
    }

    #[tokio::test]
    async fn test_wait_returns_published_value() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let waiter = mailbox.clone();

        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });

        // Give the waiter a chance to park before publishing.
        tokio::task::yield_now().await;
        mailbox.publish(42);

        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_wait_times_out_when_empty() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let got = mailbox.wait(Duration::from_millis(20)).await;
        assert_eq!(got, None);
    }
}
