use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Peer liveness as far as ack bookkeeping can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStatus {
    /// No traffic from this peer yet.
    Unknown,
    Online,
    Offline,
}

#[derive(Debug)]
struct SentEntry {
    key: u32,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct PeerLists {
    /// Keys received from this peer that we owe an acknowledgement for;
    /// carried out on the next directed message as piggyback acks.
    need_to_ack: Vec<u32>,
    /// Our sent keys this peer has not acknowledged yet.
    sent_unacked: Vec<SentEntry>,
    online: bool,
}

/// Per-peer ack bookkeeping, keyed by `(client_type, client_id)`.
///
/// Written by both the caller threads (outbound path) and the worker thread
/// (inbound path); one coarse mutex is plenty, every operation is short.
#[derive(Debug, Default)]
pub(crate) struct AckLists {
    inner: Mutex<HashMap<(u32, u32), PeerLists>>,
}

impl AckLists {
    pub(crate) fn add_sent(&self, peer: (u32, u32), key: u32) {
        let mut inner = self.inner.lock().expect("ack lists poisoned");
        let lists = inner.entry(peer).or_default();
        if !lists.sent_unacked.iter().any(|e| e.key == key) {
            lists.sent_unacked.push(SentEntry { key, sent_at: Instant::now() });
        }
    }

    pub(crate) fn remove_sent(&self, peer: (u32, u32), key: u32) -> bool {
        let mut inner = self.inner.lock().expect("ack lists poisoned");
        let Some(lists) = inner.get_mut(&peer) else { return false };
        let before = lists.sent_unacked.len();
        lists.sent_unacked.retain(|e| e.key != key);
        lists.sent_unacked.len() != before
    }

    pub(crate) fn remove_sent_many(&self, peer: (u32, u32), keys: &[u32]) {
        if keys.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("ack lists poisoned");
        if let Some(lists) = inner.get_mut(&peer) {
            lists.sent_unacked.retain(|e| !keys.contains(&e.key));
        }
    }

    /// Our sent keys the peer has not acknowledged, oldest first.
    pub(crate) fn sent_unacked(&self, peer: (u32, u32)) -> Vec<u32> {
        let inner = self.inner.lock().expect("ack lists poisoned");
        inner.get(&peer).map_or_else(Vec::new, |l| l.sent_unacked.iter().map(|e| e.key).collect())
    }

    /// Sent keys that have been waiting longer than `age`.
    pub(crate) fn sent_unacked_older_than(&self, peer: (u32, u32), age: Duration) -> Vec<u32> {
        let inner = self.inner.lock().expect("ack lists poisoned");
        inner.get(&peer).map_or_else(Vec::new, |l| {
            l.sent_unacked.iter().filter(|e| e.sent_at.elapsed() >= age).map(|e| e.key).collect()
        })
    }

    pub(crate) fn add_need_to_ack(&self, peer: (u32, u32), key: u32) {
        let mut inner = self.inner.lock().expect("ack lists poisoned");
        let lists = inner.entry(peer).or_default();
        if !lists.need_to_ack.contains(&key) {
            lists.need_to_ack.push(key);
        }
    }

    /// The keys that would piggyback on the next directed message to `peer`.
    pub(crate) fn need_to_ack(&self, peer: (u32, u32)) -> Vec<u32> {
        let inner = self.inner.lock().expect("ack lists poisoned");
        inner.get(&peer).map_or_else(Vec::new, |l| l.need_to_ack.clone())
    }

    /// Called after the carrying message was enqueued.
    pub(crate) fn remove_need_to_ack(&self, peer: (u32, u32), keys: &[u32]) {
        if keys.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("ack lists poisoned");
        if let Some(lists) = inner.get_mut(&peer) {
            lists.need_to_ack.retain(|k| !keys.contains(k));
        }
    }

    pub(crate) fn set_online(&self, peer: (u32, u32), online: bool) {
        let mut inner = self.inner.lock().expect("ack lists poisoned");
        inner.entry(peer).or_default().online = online;
    }

    pub(crate) fn online_status(&self, peer: (u32, u32)) -> OnlineStatus {
        let inner = self.inner.lock().expect("ack lists poisoned");
        inner.get(&peer).map_or(OnlineStatus::Unknown, |l| {
            if l.online { OnlineStatus::Online } else { OnlineStatus::Offline }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: (u32, u32) = (2, 200);

    #[test]
    fn sent_keys_clear_on_ack() {
        let lists = AckLists::default();
        lists.add_sent(PEER, 9);
        lists.add_sent(PEER, 10);
        assert_eq!(lists.sent_unacked(PEER), vec![9, 10]);

        assert!(lists.remove_sent(PEER, 9));
        assert!(!lists.remove_sent(PEER, 9));
        lists.remove_sent_many(PEER, &[10, 99]);
        assert!(lists.sent_unacked(PEER).is_empty());
    }

    #[test]
    fn need_to_ack_dedupes_and_clears_only_carried_keys() {
        let lists = AckLists::default();
        lists.add_need_to_ack(PEER, 5);
        lists.add_need_to_ack(PEER, 5);
        lists.add_need_to_ack(PEER, 6);
        assert_eq!(lists.need_to_ack(PEER), vec![5, 6]);

        lists.add_need_to_ack(PEER, 7);
        lists.remove_need_to_ack(PEER, &[5, 6]);
        assert_eq!(lists.need_to_ack(PEER), vec![7]);
    }

    #[test]
    fn online_tracking_distinguishes_never_seen_from_offline() {
        let lists = AckLists::default();
        assert_eq!(lists.online_status(PEER), OnlineStatus::Unknown);
        lists.set_online(PEER, true);
        assert_eq!(lists.online_status(PEER), OnlineStatus::Online);
        lists.set_online(PEER, false);
        assert_eq!(lists.online_status(PEER), OnlineStatus::Offline);
    }

    #[test]
    fn aging_filter_only_returns_old_keys() {
        let lists = AckLists::default();
        lists.add_sent(PEER, 1);
        assert!(lists.sent_unacked_older_than(PEER, Duration::from_secs(60)).is_empty());
        assert_eq!(lists.sent_unacked_older_than(PEER, Duration::ZERO), vec![1]);
    }
}
