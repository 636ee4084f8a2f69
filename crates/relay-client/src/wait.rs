use std::{collections::HashMap, sync::Mutex};

use crossbeam_channel::{Receiver, Sender, bounded};
use relay_wire::Record;

/// In-flight request/response waits, keyed by the outbound `msg_key`.
///
/// The caller inserts before sending and removes on every exit path; the
/// worker thread fulfils at most once, which also removes the entry. Either
/// way the table holds no key after resolution.
#[derive(Debug, Default)]
pub(crate) struct WaitTable {
    inner: Mutex<HashMap<u32, Sender<Record>>>,
}

impl WaitTable {
    pub(crate) fn insert(&self, msg_key: u32) -> Receiver<Record> {
        let (tx, rx) = bounded(1);
        self.inner.lock().expect("wait table poisoned").insert(msg_key, tx);
        rx
    }

    pub(crate) fn remove(&self, msg_key: u32) {
        self.inner.lock().expect("wait table poisoned").remove(&msg_key);
    }

    /// Hand `record` to the waiter for `msg_key`, if any.
    pub(crate) fn fulfill(&self, msg_key: u32, record: &Record) -> bool {
        let waiter = self.inner.lock().expect("wait table poisoned").remove(&msg_key);
        match waiter {
            Some(tx) => {
                // A timed-out caller may already be gone; that's fine.
                let _ = tx.try_send(record.clone());
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("wait table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relay_wire::MsgKind;

    use super::*;

    #[test]
    fn fulfill_delivers_and_clears_the_entry() {
        let table = WaitTable::default();
        let rx = table.insert(42);

        let reply = Record { msg_type: MsgKind::Custom, reply_msg_key: 42, ..Record::default() };
        assert!(table.fulfill(42, &reply));
        assert_eq!(table.len(), 0);
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)).unwrap(), reply);

        assert!(!table.fulfill(42, &reply), "second fulfil finds nothing");
    }

    #[test]
    fn remove_covers_the_timeout_path() {
        let table = WaitTable::default();
        let rx = table.insert(7);
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
        table.remove(7);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fulfilling_after_the_waiter_left_does_not_panic() {
        let table = WaitTable::default();
        let rx = table.insert(3);
        drop(rx);
        assert!(table.fulfill(3, &Record::default()));
    }
}
