use std::collections::HashMap;

use indexmap::IndexSet;
use relay_net::Token;
use relay_wire::SubscriptionKey;

pub(crate) type SessionId = Token;

/// Subscription key → subscriber set.
///
/// Holds session ids only, never sessions; a lookup that resolves to a dead
/// id is the caller's cue to sweep. Keys whose last subscriber leaves are
/// dropped.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionIndex {
    entries: HashMap<SubscriptionKey, IndexSet<SessionId>>,
}

impl SubscriptionIndex {
    /// Idempotent insert; true when the subscriber was not yet present.
    pub(crate) fn add(&mut self, key: SubscriptionKey, id: SessionId) -> bool {
        self.entries.entry(key).or_default().insert(id)
    }

    /// True when the subscriber was present under `key`.
    pub(crate) fn remove(&mut self, key: SubscriptionKey, id: SessionId) -> bool {
        let Some(set) = self.entries.get_mut(&key) else { return false };
        let removed = set.shift_remove(&id);
        if set.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Cascade when a session ends. Returns how many entries went away.
    pub(crate) fn remove_all_for(&mut self, id: SessionId) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, set| {
            if set.shift_remove(&id) {
                removed += 1;
            }
            !set.is_empty()
        });
        removed
    }

    /// Sessions subscribed to a publication by `(client_type, client_id)`
    /// tagged `topic`, the publisher itself excluded, each yielded once.
    pub(crate) fn matching(
        &self,
        client_type: u32,
        client_id: u32,
        topic: u32,
        exclude: SessionId,
    ) -> Vec<SessionId> {
        let mut out: IndexSet<SessionId> = IndexSet::new();
        for (key, set) in &self.entries {
            if key.matches(client_type, client_id, topic) {
                out.extend(set.iter().copied());
            }
        }
        out.shift_remove(&exclude);
        out.into_iter().collect()
    }

    /// Subscribers whose key names exactly `(client_type, client_id)`, with
    /// the key's topic. Diagnostics only.
    pub(crate) fn subscribers_to(&self, client_type: u32, client_id: u32) -> Vec<(SessionId, u32)> {
        let mut out = Vec::new();
        for (key, set) in &self.entries {
            if key.client_type == client_type && key.client_id == client_id {
                out.extend(set.iter().map(|id| (*id, key.topic)));
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.entries.values().any(|set| set.contains(&id))
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SessionId = Token(1);
    const B: SessionId = Token(2);
    const C: SessionId = Token(3);

    fn key(ct: u32, cid: u32, topic: u32) -> SubscriptionKey {
        SubscriptionKey::new(ct, cid, topic)
    }

    #[test]
    fn add_is_idempotent() {
        let mut index = SubscriptionIndex::default();
        assert!(index.add(key(1, 0, 0), A));
        assert!(!index.add(key(1, 0, 0), A));
        assert_eq!(index.matching(1, 100, 0, B), vec![A]);
    }

    #[test]
    fn remove_reports_presence_and_drops_empty_keys() {
        let mut index = SubscriptionIndex::default();
        index.add(key(1, 0, 0), A);
        assert!(index.remove(key(1, 0, 0), A));
        assert!(!index.remove(key(1, 0, 0), A));
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn wildcard_positions_match_independently() {
        let mut index = SubscriptionIndex::default();
        index.add(key(0, 0, 0), A);
        index.add(key(2, 0, 0), B);
        index.add(key(2, 200, 7), C);

        // Publication from (2, 200) on topic 7 reaches everyone.
        let mut hit = index.matching(2, 200, 7, Token(99));
        hit.sort_unstable_by_key(|t| t.0);
        assert_eq!(hit, vec![A, B, C]);

        // Different id: the exact key drops out.
        let mut hit = index.matching(2, 201, 7, Token(99));
        hit.sort_unstable_by_key(|t| t.0);
        assert_eq!(hit, vec![A, B]);

        // Different type: only the full wildcard remains.
        assert_eq!(index.matching(1, 100, 7, Token(99)), vec![A]);
    }

    #[test]
    fn publisher_is_never_yielded() {
        let mut index = SubscriptionIndex::default();
        index.add(key(0, 0, 0), A);
        assert!(index.matching(1, 100, 0, A).is_empty());
    }

    #[test]
    fn session_under_two_matching_keys_is_yielded_once() {
        let mut index = SubscriptionIndex::default();
        index.add(key(2, 0, 0), A);
        index.add(key(0, 200, 0), A);
        assert_eq!(index.matching(2, 200, 1, B), vec![A]);
    }

    #[test]
    fn remove_all_for_cascades_and_counts() {
        let mut index = SubscriptionIndex::default();
        index.add(key(1, 0, 0), A);
        index.add(key(2, 0, 0), A);
        index.add(key(2, 0, 0), B);

        assert_eq!(index.remove_all_for(A), 2);
        assert!(!index.contains(A));
        assert_eq!(index.key_count(), 1);
        assert_eq!(index.matching(2, 200, 0, C), vec![B]);
    }

    #[test]
    fn subscribers_to_uses_exact_key_equality() {
        let mut index = SubscriptionIndex::default();
        index.add(key(1, 100, 0), A);
        index.add(key(1, 100, 9), B);
        index.add(key(1, 0, 0), C);

        let mut subs = index.subscribers_to(1, 100);
        subs.sort_unstable_by_key(|(t, _)| t.0);
        assert_eq!(subs, vec![(A, 0), (B, 9)]);
    }
}
