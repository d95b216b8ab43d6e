use std::collections::BTreeMap;

/// Last observed sequence number per topic.
///
/// Sent back to the server on every (re)connect so messages published while
/// the socket was down can be replayed. Cursors only move forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayCursors {
    cursors: BTreeMap<String, u64>,
}

impl ReplayCursors {
    /// Create an empty cursor map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` for `topic`.
    ///
    /// Returns `true` if the cursor advanced. Duplicate and out-of-order
    /// sequence numbers leave the cursor unchanged.
    pub fn observe(&mut self, topic: &str, seq: u64) -> bool {
        match self.cursors.get_mut(topic) {
            Some(current) if *current >= seq => false,
            Some(current) => {
                *current = seq;
                true
            }
            None => {
                self.cursors.insert(topic.to_string(), seq);
                true
            }
        }
    }

    /// Cursor for a topic, if any frame carrying a sequence number was seen
    pub fn get(&self, topic: &str) -> Option<u64> {
        self.cursors.get(topic).copied()
    }

    /// Iterate `(topic, seq)` pairs sorted by topic
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.cursors.iter().map(|(topic, seq)| (topic.as_str(), *seq))
    }

    /// Number of topics with a cursor
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// Whether no cursor has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
