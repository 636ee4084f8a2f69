use std::fmt;

use serde::{Deserialize, Serialize};

/// Subscription selector: zero in any position is a wildcard.
///
/// Hashing and equality use all three components, so distinct wildcard
/// patterns are distinct index keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub client_type: u32,
    pub client_id: u32,
    pub topic: u32,
}

impl SubscriptionKey {
    pub fn new(client_type: u32, client_id: u32, topic: u32) -> Self {
        Self { client_type, client_id, topic }
    }

    /// True when a publication by `(client_type, client_id)` tagged `topic`
    /// falls under this key.
    #[inline]
    pub fn matches(&self, client_type: u32, client_id: u32, topic: u32) -> bool {
        (self.client_type == 0 || self.client_type == client_type)
            && (self.client_id == 0 || self.client_id == client_id)
            && (self.topic == 0 || self.topic == topic)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.client_type, self.client_id, self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_a_wildcard_in_every_position() {
        let any = SubscriptionKey::new(0, 0, 0);
        assert!(any.matches(1, 100, 7));
        assert!(any.matches(9, 0, 0));

        let by_type = SubscriptionKey::new(2, 0, 0);
        assert!(by_type.matches(2, 200, 3));
        assert!(!by_type.matches(1, 200, 3));

        let exact = SubscriptionKey::new(2, 200, 3);
        assert!(exact.matches(2, 200, 3));
        assert!(!exact.matches(2, 200, 4));
        assert!(!exact.matches(2, 201, 3));
    }

    #[test]
    fn topic_zero_on_the_message_only_matches_wildcard_topic_keys() {
        let topical = SubscriptionKey::new(1, 0, 5);
        assert!(!topical.matches(1, 100, 0));
        assert!(SubscriptionKey::new(1, 0, 0).matches(1, 100, 0));
    }

    #[test]
    fn distinct_patterns_are_distinct_keys() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SubscriptionKey::new(1, 0, 0));
        set.insert(SubscriptionKey::new(0, 1, 0));
        set.insert(SubscriptionKey::new(0, 0, 1));
        assert_eq!(set.len(), 3);
    }
}
