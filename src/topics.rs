use std::collections::BTreeSet;

/// Canonical form of a topic set: sorted names joined with `,`.
pub fn topic_signature(topics: &BTreeSet<String>) -> String {
    topics.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Outcome of applying a freshly computed topic set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicChange {
    /// Same set as last applied; nothing to do
    Unchanged,
    /// The set became empty; the connection should be torn down
    Cleared,
    /// The set changed to a non-empty value
    Changed(BTreeSet<String>),
}

/// Tracks the last topic set acted upon so redundant reconnects are skipped.
#[derive(Debug, Default)]
pub struct TopicAggregator {
    applied: String,
}

impl TopicAggregator {
    /// Create an aggregator with nothing applied yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `topics` with the last applied set and record it as applied.
    pub fn apply(&mut self, topics: BTreeSet<String>) -> TopicChange {
        let signature = topic_signature(&topics);
        if signature == self.applied {
            return TopicChange::Unchanged;
        }
        self.applied = signature;

        if topics.is_empty() {
            TopicChange::Cleared
        } else {
            TopicChange::Changed(topics)
        }
    }

    /// Signature of the last applied set (empty when nothing is applied)
    pub fn applied_signature(&self) -> &str {
        &self.applied
    }
}
