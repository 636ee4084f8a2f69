use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use relay_net::{DisconnectReason, Driver, PollEvent, Repeater, SocketState, Token, pace};
use relay_wire::{LogonBody, MsgKind, Record, SubscribeBody, SubscriptionKey};
use tracing::{debug, info, trace, warn};

use crate::{
    acks::{AckLists, OnlineStatus},
    wait::WaitTable,
};

const LOOP_PACE: Duration = Duration::from_millis(1);

/// How to reach and identify against a broker.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub addr: SocketAddr,
    pub client_type: u32,
    pub client_id: u32,
    /// Name used in logs; defaults to `addr`.
    pub name: String,
    /// Reconnect interval after a lost connection; 0 disables reconnection.
    pub reconnect_retry_ms: u64,
    /// Idle heartbeat interval; 0 disables heartbeats.
    pub heartbeat_ms: u64,
    /// Maintain per-peer sent/ack bookkeeping and piggyback acks.
    pub track_sent_messages: bool,
    /// Overrides the LOGON sub-message; defaults to the identity body.
    pub logon_payload: Option<Vec<u8>>,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr, client_type: u32, client_id: u32) -> Self {
        Self {
            addr,
            client_type,
            client_id,
            name: addr.to_string(),
            reconnect_retry_ms: 0,
            heartbeat_ms: 0,
            track_sent_messages: false,
            logon_payload: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reconnect_retry(mut self, ms: u64) -> Self {
        self.reconnect_retry_ms = ms;
        self
    }

    pub fn with_heartbeat(mut self, ms: u64) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    pub fn with_sent_message_tracking(mut self) -> Self {
        self.track_sent_messages = true;
        self
    }

    pub fn with_logon_payload(mut self, payload: Vec<u8>) -> Self {
        self.logon_payload = Some(payload);
        self
    }
}

/// What the application observes, in worker-thread order.
///
/// Drain the receiver handed out by [`Client::events`]; the channel is
/// unbounded and buffers until read.
#[derive(Debug)]
pub enum ClientEvent {
    /// The connected-ness bit flipped.
    ConnectionChanged(bool),
    StateChanged {
        old: SocketState,
        new: SocketState,
        reason: DisconnectReason,
    },
    /// Every record received from the broker, acks included.
    Record(Record),
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    connected: AtomicBool,
    logged_on: AtomicBool,
    next_key: AtomicU32,
    socket_state: Mutex<(SocketState, DisconnectReason)>,
    /// Declared subscription keys, replayed after every logon.
    subscriptions: Mutex<Vec<SubscriptionKey>>,
    waits: WaitTable,
    acks: Option<AckLists>,
}

impl Shared {
    #[inline]
    fn alloc_key(&self) -> u32 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }
}

enum Cmd {
    Send(Record),
    Heartbeat,
    Connect,
    Disconnect,
}

/// Outbound counterpart of a broker session: dials, logs on, replays
/// subscriptions, and keeps message-key, wait and ack bookkeeping on top of
/// an asynchronous transport driven by a dedicated worker thread.
pub struct Client {
    cfg: ClientConfig,
    shared: Arc<Shared>,
    cmd_tx: Sender<Cmd>,
    events_rx: Receiver<ClientEvent>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Spawn the worker and start dialling.
    pub fn new(cfg: ClientConfig) -> Self {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            logged_on: AtomicBool::new(false),
            next_key: AtomicU32::new(1),
            socket_state: Mutex::new((SocketState::Disconnected, DisconnectReason::None)),
            subscriptions: Mutex::new(Vec::new()),
            waits: WaitTable::default(),
            acks: cfg.track_sent_messages.then(AckLists::default),
        });
        let (cmd_tx, cmd_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();

        let worker = Worker::new(cfg.clone(), Arc::clone(&shared), cmd_rx, events_tx);
        let handle = thread::Builder::new()
            .name(format!("relay-client-{}", cfg.name))
            .spawn(move || worker.run())
            .expect("failed to spawn client worker");

        Self { cfg, shared, cmd_tx, events_rx, worker: Some(handle) }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_logged_on(&self) -> bool {
        self.shared.logged_on.load(Ordering::Relaxed)
    }

    pub fn socket_state(&self) -> (SocketState, DisconnectReason) {
        *self.shared.socket_state.lock().expect("state poisoned")
    }

    /// A handle to the event stream. Cloneable; events go to whichever
    /// receiver takes them first.
    pub fn events(&self) -> Receiver<ClientEvent> {
        self.events_rx.clone()
    }

    /// Build and enqueue a record. Returns the allocated `msg_key`.
    pub fn send(
        &self,
        kind: MsgKind,
        payload: Vec<u8>,
        topic: u32,
        dest_client_type: u32,
        dest_client_id: u32,
        is_archived: bool,
    ) -> u32 {
        let msg_key = self.shared.alloc_key();
        let record =
            self.build(kind, payload, msg_key, topic, dest_client_type, dest_client_id, is_archived);
        self.dispatch(record);
        msg_key
    }

    /// Application message, optionally directed at one client.
    pub fn send_custom(
        &self,
        payload: Vec<u8>,
        topic: u32,
        dest_client_type: u32,
        dest_client_id: u32,
    ) -> u32 {
        self.send(MsgKind::Custom, payload, topic, dest_client_type, dest_client_id, false)
    }

    /// Acknowledge `msg` back to its origin, echoing its key.
    pub fn send_ack(&self, msg: &Record) -> bool {
        self.dispatch(Record::ack_for(msg))
    }

    /// Reply to `msg`: addressed to its origin, carrying its key in
    /// `reply_msg_key` so a peer waiting on it is released.
    pub fn send_reply(&self, msg: &Record, kind: MsgKind, payload: Vec<u8>, topic: u32) -> u32 {
        let msg_key = self.shared.alloc_key();
        let mut record = self.build(
            kind,
            payload,
            msg_key,
            topic,
            msg.orig_client_type,
            msg.orig_client_id,
            false,
        );
        record.reply_msg_key = msg.msg_key;
        self.dispatch(record);
        msg_key
    }

    /// Reject `msg` back to its origin with a reason code and detail text.
    pub fn send_nack(&self, msg: &Record, reason: u32, details: &str) -> bool {
        self.dispatch(Record::nack_for(msg, reason, details))
    }

    pub fn send_heartbeat(&self) -> bool {
        self.cmd_tx.send(Cmd::Heartbeat).is_ok()
    }

    /// Synchronous request/response: block until a record resolves the
    /// allocated key (an ACK with that `msg_key`, any record whose
    /// `reply_msg_key` names it, or any record carrying it in `ack_keys`),
    /// or until `timeout`. The wait entry is gone on every exit path.
    pub fn send_and_wait(
        &self,
        kind: MsgKind,
        payload: Vec<u8>,
        topic: u32,
        dest_client_type: u32,
        dest_client_id: u32,
        timeout: Duration,
    ) -> Option<Record> {
        let msg_key = self.shared.alloc_key();
        let record =
            self.build(kind, payload, msg_key, topic, dest_client_type, dest_client_id, false);
        let rx = self.shared.waits.insert(msg_key);
        self.dispatch(record);
        let reply = rx.recv_timeout(timeout).ok();
        self.shared.waits.remove(msg_key);
        if reply.is_none() {
            debug!(client = %self.cfg.name, msg_key, "wait timed out");
        }
        reply
    }

    /// Declare (or retract) a subscription. Returns whether the declared
    /// list changed; the broker is told immediately while logged on, and the
    /// whole list replays after every logon.
    pub fn subscribe(&self, client_type: u32, client_id: u32, topic: u32) -> bool {
        self.toggle_subscription(SubscriptionKey::new(client_type, client_id, topic), true)
    }

    pub fn unsubscribe(&self, client_type: u32, client_id: u32, topic: u32) -> bool {
        self.toggle_subscription(SubscriptionKey::new(client_type, client_id, topic), false)
    }

    /// Peer liveness, if sent-message tracking is enabled.
    pub fn is_client_online(&self, client_type: u32, client_id: u32) -> OnlineStatus {
        self.shared
            .acks
            .as_ref()
            .map_or(OnlineStatus::Unknown, |a| a.online_status((client_type, client_id)))
    }

    /// Our keys the peer has not acknowledged yet (tracking only).
    pub fn sent_unacked(&self, client_type: u32, client_id: u32) -> Vec<u32> {
        self.shared
            .acks
            .as_ref()
            .map_or_else(Vec::new, |a| a.sent_unacked((client_type, client_id)))
    }

    /// Unacknowledged keys older than `age` (tracking only).
    pub fn sent_unacked_older_than(&self, client_type: u32, client_id: u32, age: Duration) -> Vec<u32> {
        self.shared
            .acks
            .as_ref()
            .map_or_else(Vec::new, |a| a.sent_unacked_older_than((client_type, client_id), age))
    }

    /// Re-dial after a manual disconnect.
    pub fn connect(&self) -> bool {
        self.cmd_tx.send(Cmd::Connect).is_ok()
    }

    /// Drop the connection and cancel any scheduled reconnect.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Cmd::Disconnect);
    }

    /// Stop the worker and close the socket.
    pub fn shut_down(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn toggle_subscription(&self, key: SubscriptionKey, subscribe: bool) -> bool {
        let changed = {
            let mut subs = self.shared.subscriptions.lock().expect("subscriptions poisoned");
            if subscribe {
                if subs.contains(&key) {
                    false
                } else {
                    subs.push(key);
                    true
                }
            } else {
                let before = subs.len();
                subs.retain(|k| *k != key);
                subs.len() != before
            }
        };
        if self.is_logged_on() {
            let kind = if subscribe { MsgKind::Subscribe } else { MsgKind::Unsubscribe };
            let body = SubscribeBody {
                client_type: key.client_type,
                client_id: key.client_id,
                topic: key.topic,
            };
            self.send(kind, body.to_payload(), 0, 0, 0, false);
        }
        changed
    }

    fn build(
        &self,
        kind: MsgKind,
        payload: Vec<u8>,
        msg_key: u32,
        topic: u32,
        dest_client_type: u32,
        dest_client_id: u32,
        is_archived: bool,
    ) -> Record {
        let mut record = Record {
            msg_type: kind,
            msg_key,
            topic,
            dest_client_type,
            dest_client_id,
            is_archived,
            payload,
            ..Record::default()
        };
        if let Some(acks) = &self.shared.acks
            && kind == MsgKind::Custom
            && record.is_directed()
        {
            let peer = (dest_client_type, dest_client_id);
            acks.add_sent(peer, msg_key);
            record.ack_keys = acks.need_to_ack(peer);
        }
        record
    }

    fn dispatch(&self, record: Record) -> bool {
        let carried = record.ack_keys.clone();
        let peer = (record.dest_client_type, record.dest_client_id);
        let directed = record.is_directed();
        if self.cmd_tx.send(Cmd::Send(record)).is_err() {
            return false;
        }
        if directed && let Some(acks) = &self.shared.acks {
            acks.remove_need_to_ack(peer, &carried);
        }
        true
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shut_down();
    }
}

struct Worker {
    cfg: ClientConfig,
    shared: Arc<Shared>,
    cmd_rx: Receiver<Cmd>,
    events_tx: Sender<ClientEvent>,
    driver: Driver,
    token: Option<Token>,
    logon_key: u32,
    heartbeat: Option<Repeater>,
}

impl Worker {
    fn new(
        cfg: ClientConfig,
        shared: Arc<Shared>,
        cmd_rx: Receiver<Cmd>,
        events_tx: Sender<ClientEvent>,
    ) -> Self {
        let driver = if cfg.reconnect_retry_ms > 0 {
            Driver::new().with_reconnect(Duration::from_millis(cfg.reconnect_retry_ms))
        } else {
            Driver::new()
        };
        let heartbeat =
            (cfg.heartbeat_ms > 0).then(|| Repeater::every(Duration::from_millis(cfg.heartbeat_ms)));
        Self { cfg, shared, cmd_rx, events_tx, driver, token: None, logon_key: 0, heartbeat }
    }

    fn run(mut self) {
        // The logon consumes the first key of this runtime; it is reused
        // verbatim on every reconnect.
        self.logon_key = self.shared.alloc_key();
        self.token = Some(self.driver.connect(self.cfg.addr));

        while !self.shared.stop.load(Ordering::Relaxed) {
            pace(Some(LOOP_PACE), || {
                self.drain_commands();
                for ev in self.driver.poll() {
                    self.handle_io(ev);
                }
                self.maybe_heartbeat();
            });
        }
        self.driver.shut_down();
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Cmd::Send(record) => {
                    self.send(record);
                }
                Cmd::Heartbeat => {
                    if let Some(token) = self.token {
                        self.driver.send_heartbeat(token);
                    }
                }
                Cmd::Connect => {
                    if !self.token.is_some_and(|t| self.driver.is_connected(t)) {
                        info!(client = %self.cfg.name, "attempting to connect");
                        self.token = Some(self.driver.connect(self.cfg.addr));
                    }
                }
                Cmd::Disconnect => {
                    self.shared.logged_on.store(false, Ordering::Relaxed);
                    if let Some(token) = self.token.take() {
                        self.driver.disconnect(token);
                    }
                }
            }
        }
    }

    fn send(&mut self, record: Record) -> bool {
        let Some(token) = self.token else {
            trace!(client = %self.cfg.name, "dropping send, no connection");
            return false;
        };
        debug!(
            client = %self.cfg.name,
            kind = %record.msg_type,
            msg_key = record.msg_key,
            "sending"
        );
        self.driver.send_record(token, &record)
    }

    fn maybe_heartbeat(&mut self) {
        let Some(hb) = &mut self.heartbeat else { return };
        if !self.shared.connected.load(Ordering::Relaxed) {
            return;
        }
        if hb.fired()
            && let Some(token) = self.token
        {
            self.driver.send_heartbeat(token);
        }
    }

    fn handle_io(&mut self, ev: PollEvent) {
        match ev {
            PollEvent::Connected { peer, .. } => {
                info!(client = %self.cfg.name, %peer, "connected to server");
                self.shared.connected.store(true, Ordering::Relaxed);
                let _ = self.events_tx.send(ClientEvent::ConnectionChanged(true));
                self.send_logon();
            }
            PollEvent::Disconnected { reason, .. } => {
                debug!(client = %self.cfg.name, %reason, "disconnected");
                self.shared.logged_on.store(false, Ordering::Relaxed);
                if self.shared.connected.swap(false, Ordering::Relaxed) {
                    let _ = self.events_tx.send(ClientEvent::ConnectionChanged(false));
                }
            }
            PollEvent::StateChanged { old, new, reason, .. } => {
                *self.shared.socket_state.lock().expect("state poisoned") = (new, reason);
                let _ = self.events_tx.send(ClientEvent::StateChanged { old, new, reason });
            }
            PollEvent::Record { record, .. } => self.handle_record(record),
            PollEvent::Heartbeat { .. } => {
                trace!(client = %self.cfg.name, "heartbeat from server");
            }
            PollEvent::Accepted { .. } => {
                warn!(client = %self.cfg.name, "unexpected inbound connection event");
            }
        }
    }

    fn send_logon(&mut self) {
        let payload = self.cfg.logon_payload.clone().unwrap_or_else(|| {
            LogonBody { client_type: self.cfg.client_type, client_id: self.cfg.client_id }
                .to_payload()
        });
        let logon = Record {
            msg_type: MsgKind::Logon,
            msg_key: self.logon_key,
            orig_client_type: self.cfg.client_type,
            orig_client_id: self.cfg.client_id,
            payload,
            ..Record::default()
        };
        info!(client = %self.cfg.name, "logging on");
        self.send(logon);
    }

    fn handle_record(&mut self, record: Record) {
        debug!(
            client = %self.cfg.name,
            kind = %record.msg_type,
            msg_key = record.msg_key,
            orig = ?(record.orig_client_type, record.orig_client_id),
            "received"
        );

        if record.msg_type == MsgKind::Ack
            && record.msg_key == self.logon_key
            && !self.shared.logged_on.swap(true, Ordering::Relaxed)
        {
            info!(client = %self.cfg.name, "logged on");
            self.replay_subscriptions();
        }

        if let Some(acks) = &self.shared.acks {
            let peer = (record.orig_client_type, record.orig_client_id);
            if record.msg_type == MsgKind::Logoff {
                acks.set_online(peer, false);
            } else {
                acks.set_online(peer, true);
                let reply_key = if record.msg_type == MsgKind::Ack {
                    record.msg_key
                } else {
                    record.reply_msg_key
                };
                if reply_key > 0 {
                    acks.remove_sent(peer, reply_key);
                }
                acks.remove_sent_many(peer, &record.ack_keys);
                if record.msg_type == MsgKind::Custom && record.is_directed() {
                    acks.add_need_to_ack(peer, record.msg_key);
                }
            }
        }

        let _ = self.events_tx.send(ClientEvent::Record(record.clone()));

        // Without tracking, a message aimed straight at us is acknowledged
        // immediately; with tracking the ack piggybacks on later traffic.
        if self.shared.acks.is_none()
            && record.msg_type == MsgKind::Custom
            && record.is_directed()
        {
            self.send(Record::ack_for(&record));
        }

        let reply_key =
            if record.msg_type == MsgKind::Ack { record.msg_key } else { record.reply_msg_key };
        if reply_key > 0 && self.shared.waits.fulfill(reply_key, &record) {
            return;
        }
        for key in &record.ack_keys {
            if self.shared.waits.fulfill(*key, &record) {
                return;
            }
        }
    }

    fn replay_subscriptions(&mut self) {
        let declared = self.shared.subscriptions.lock().expect("subscriptions poisoned").clone();
        for key in declared {
            let body = SubscribeBody {
                client_type: key.client_type,
                client_id: key.client_id,
                topic: key.topic,
            };
            let record = Record {
                msg_type: MsgKind::Subscribe,
                msg_key: self.shared.alloc_key(),
                payload: body.to_payload(),
                ..Record::default()
            };
            self.send(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> Client {
        // Nothing listens here; the API surface works regardless.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        Client::new(ClientConfig::new(addr, 1, 100).with_name("unit"))
    }

    #[test]
    fn msg_keys_increase_monotonically_after_the_logon_key() {
        let client = offline_client();
        let k1 = client.send_custom(b"a".to_vec(), 0, 0, 0);
        let k2 = client.send_custom(b"b".to_vec(), 0, 0, 0);
        let k3 = client.send(MsgKind::Custom, b"c".to_vec(), 0, 0, 0, true);
        assert!(k1 > 1, "key 1 belongs to the logon");
        assert!(k2 > k1);
        assert!(k3 > k2);
    }

    #[test]
    fn subscription_toggle_is_idempotent() {
        let client = offline_client();
        assert!(client.subscribe(2, 0, 0));
        assert!(!client.subscribe(2, 0, 0));
        assert!(client.unsubscribe(2, 0, 0));
        assert!(!client.unsubscribe(2, 0, 0));
    }

    #[test]
    fn directed_sends_are_tracked_until_acked() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let client = Client::new(
            ClientConfig::new(addr, 1, 100).with_name("tracked").with_sent_message_tracking(),
        );
        let key = client.send_custom(b"x".to_vec(), 0, 3, 300);
        assert_eq!(client.sent_unacked(3, 300), vec![key]);
        // Fan-out (undirected) sends are not tracked.
        client.send_custom(b"y".to_vec(), 0, 0, 0);
        assert_eq!(client.sent_unacked(3, 300), vec![key]);
    }

    #[test]
    fn online_status_is_unknown_without_tracking() {
        let client = offline_client();
        assert_eq!(client.is_client_online(3, 300), OnlineStatus::Unknown);
    }
}
