//! Online/offline tracking.
//!
//! The runtime feeds reachability into [`ConnectivityMonitor::set_online`]
//! (or lets [`ConnectivityMonitor::probe`] find out). Subscribers hear about
//! transitions only, never about repeated reports of the same state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Subscriber {
    id: u64,
    on_online: Callback,
    on_offline: Callback,
}

struct Inner {
    online: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Inner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared connectivity state. Clones observe the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                online: AtomicBool::new(initially_online),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Records the current reachability. Returns true when this was a
    /// transition, in which case subscribers have been notified.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.inner.online.swap(online, Ordering::AcqRel);
        if previous == online {
            return false;
        }

        tracing::info!(online, "Connectivity changed");

        // Call outside the lock so callbacks may (un)subscribe.
        let callbacks: Vec<(u64, Callback)> = self
            .inner
            .subscribers()
            .iter()
            .map(|s| {
                let callback = if online { &s.on_online } else { &s.on_offline };
                (s.id, Arc::clone(callback))
            })
            .collect();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| (callback.as_ref())())).is_err() {
                tracing::error!(subscriber = id, online, "Connectivity callback panicked");
            }
        }
        true
    }

    /// Registers transition callbacks. They stay registered until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F, G>(&self, on_online: F, on_offline: G) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
        G: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push(Subscriber {
            id,
            on_online: Arc::new(on_online),
            on_offline: Arc::new(on_offline),
        });
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Checks whether `url` answers at all and records the result.
    ///
    /// Any HTTP response counts as reachable; only transport failures and
    /// timeouts count as offline.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        let online = check_server(url, timeout).await;
        self.set_online(online);
        online
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Returns true if the server at `url` responds within `timeout`.
pub async fn check_server(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build probe client");
            return false;
        }
    };

    match client.get(url).send().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(%url, error = %e, "Server unreachable");
            false
        }
    }
}

/// Handle to a registered pair of callbacks.
#[must_use = "dropping a subscription unregisters its callbacks"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers().retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_callbacks_fire_on_edges_only() {
        let monitor = ConnectivityMonitor::new(false);
        let (online_count, on_online) = counter();
        let (offline_count, on_offline) = counter();
        let _sub = monitor.subscribe(on_online, on_offline);

        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));

        assert_eq!(online_count.load(Ordering::SeqCst), 1);
        assert_eq!(offline_count.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let monitor = ConnectivityMonitor::new(false);
        let _bad = monitor.subscribe(|| panic!("boom"), || {});
        let (count, on_online) = counter();
        let _good = monitor.subscribe(on_online, || {});

        assert!(monitor.set_online(true));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let monitor = ConnectivityMonitor::new(true);
        let (count, on_offline) = counter();
        let sub = monitor.subscribe(|| {}, on_offline);
        assert_eq!(monitor.subscriber_count(), 1);

        sub.unsubscribe();
        monitor.set_online(false);

        assert_eq!(monitor.subscriber_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::new(false);
        let clone = monitor.clone();
        clone.set_online(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_probe_unreachable_goes_offline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let monitor = ConnectivityMonitor::new(true);
        let online = monitor
            .probe(&format!("http://{}/", addr), Duration::from_secs(2))
            .await;

        assert!(!online);
        assert!(!monitor.is_online());
    }
}
