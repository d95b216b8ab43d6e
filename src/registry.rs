use crate::handler::MessageHandler;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide counter so ids stay unique across registries.
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Opaque subscription identifier, unique for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn generate() -> Self {
        let counter = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(format!("sub-{}-{}", counter, millis))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry {
    topics: Vec<String>,
    handler: Arc<dyn MessageHandler>,
}

/// A handler selected for delivery, detached from the registry lock
pub(crate) type Recipient = (SubscriptionId, Arc<dyn MessageHandler>);

/// All live subscriptions. Entries are immutable once added.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<SubscriptionId, Entry>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topics` and return its fresh id
    pub fn add(&mut self, topics: Vec<String>, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let id = SubscriptionId::generate();
        self.entries.insert(id.clone(), Entry { topics, handler });
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&mut self, id: &SubscriptionId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Union of every subscription's topics
    pub fn active_topics(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|e| e.topics.iter().cloned())
            .collect()
    }

    /// Topics a subscription was registered with
    pub fn topics_of(&self, id: &SubscriptionId) -> Option<&[String]> {
        self.entries.get(id).map(|e| e.topics.as_slice())
    }

    /// Handlers that should receive a message for `topic`.
    ///
    /// A message without a topic goes to every subscription.
    pub(crate) fn recipients(&self, topic: Option<&str>) -> Vec<Recipient> {
        self.entries
            .iter()
            .filter(|(_, e)| match topic {
                None => true,
                Some(t) => e.topics.iter().any(|s| s == t),
            })
            .map(|(id, e)| (id.clone(), e.handler.clone()))
            .collect()
    }

    /// Number of subscriptions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no subscriptions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, e)| (id, &e.topics)))
            .finish()
    }
}
