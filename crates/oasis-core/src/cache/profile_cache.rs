//! Profile cache
//!
//! Keeps one live subscription per user id for as long as at least one
//! [`ProfileLease`] for that user is alive. The first lease subscribes through
//! the injected [`ProfileFeed`], later leases share the same snapshot channel,
//! and dropping the last lease drops the feed subscription.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Display data for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub user_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Write side handed to a feed subscription
#[derive(Clone)]
pub struct ProfileSink {
    sender: Arc<watch::Sender<Option<ProfileSnapshot>>>,
}

impl ProfileSink {
    pub fn publish(&self, snapshot: ProfileSnapshot) {
        self.sender.send_replace(Some(snapshot));
    }
}

/// Runs its callback once when dropped
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_drop)))
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self(None)
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(on_drop) = self.0.take() {
            on_drop();
        }
    }
}

/// Store-side change feed for profile documents.
///
/// `subscribe` must not call back into the [`ProfileCache`] that invoked it.
pub trait ProfileFeed: Send + Sync {
    fn subscribe(&self, user_id: &str, sink: ProfileSink) -> Unsubscribe;
}

struct Entry {
    sender: Arc<watch::Sender<Option<ProfileSnapshot>>>,
    leases: usize,
    _subscription: Unsubscribe,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reference-counted profile subscriptions keyed by user id
#[derive(Clone)]
pub struct ProfileCache {
    feed: Arc<dyn ProfileFeed>,
    entries: Entries,
}

impl ProfileCache {
    pub fn new(feed: Arc<dyn ProfileFeed>) -> Self {
        Self {
            feed,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register interest in a user's profile
    pub fn acquire(&self, user_id: &str) -> ProfileLease {
        let mut entries = lock(&self.entries);
        let receiver = match entries.get_mut(user_id) {
            Some(entry) => {
                entry.leases += 1;
                entry.sender.subscribe()
            }
            None => {
                let (sender, receiver) = watch::channel(None);
                let sender = Arc::new(sender);
                let subscription = self.feed.subscribe(
                    user_id,
                    ProfileSink {
                        sender: sender.clone(),
                    },
                );
                debug!(user_id = %user_id, "Profile subscription opened");
                entries.insert(
                    user_id.to_string(),
                    Entry {
                        sender,
                        leases: 1,
                        _subscription: subscription,
                    },
                );
                receiver
            }
        };

        ProfileLease {
            user_id: user_id.to_string(),
            receiver,
            entries: self.entries.clone(),
        }
    }

    /// Latest snapshot without registering interest
    pub fn snapshot(&self, user_id: &str) -> Option<ProfileSnapshot> {
        lock(&self.entries)
            .get(user_id)
            .and_then(|entry| entry.sender.borrow().clone())
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        lock(&self.entries).get(user_id).map_or(0, |entry| entry.leases)
    }
}

/// Live view of one user's profile; releases its share of the subscription on drop
pub struct ProfileLease {
    user_id: String,
    receiver: watch::Receiver<Option<ProfileSnapshot>>,
    entries: Entries,
}

impl ProfileLease {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn current(&self) -> Option<ProfileSnapshot> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next published snapshot
    pub async fn changed(&mut self) -> Option<ProfileSnapshot> {
        self.receiver.changed().await.ok()?;
        self.receiver.borrow_and_update().clone()
    }
}

impl Drop for ProfileLease {
    fn drop(&mut self) {
        let released = {
            let mut entries = lock(&self.entries);
            let last = match entries.get_mut(&self.user_id) {
                Some(entry) => {
                    entry.leases -= 1;
                    entry.leases == 0
                }
                None => false,
            };
            if last {
                entries.remove(&self.user_id)
            } else {
                None
            }
        };
        // unsubscribe outside the lock
        if released.is_some() {
            debug!(user_id = %self.user_id, "Profile subscription closed");
        }
        drop(released);
    }
}
