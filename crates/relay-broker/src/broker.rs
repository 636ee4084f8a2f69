use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use relay_net::{Driver, PollEvent, Repeater, Token, pace};
use relay_wire::{LogonBody, MsgKind, Record, SubscribeBody, SubscriptionKey};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    auth::{AllowAll, Authenticator},
    index::SubscriptionIndex,
    manager::SessionManager,
    session::Session,
};

const LOOP_PACE: Duration = Duration::from_millis(1);
const SHUTDOWN_RETRIES: u32 = 40;
const SHUTDOWN_TICK: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}

pub struct BrokerConfig {
    pub port: u16,
    /// Dead-session reaper period, milliseconds.
    pub reap_freq_ms: u64,
    pub auth: Box<dyn Authenticator>,
}

impl BrokerConfig {
    pub fn new(port: u16) -> Self {
        Self { port, reap_freq_ms: 500, auth: Box::new(AllowAll) }
    }

    pub fn with_reap_freq(mut self, ms: u64) -> Self {
        self.reap_freq_ms = ms;
        self
    }

    pub fn with_authenticator(mut self, auth: Box<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }
}

enum BrokerCmd {
    Diagnostics,
}

/// Control handle to a broker running on its own thread.
pub struct BrokerHandle {
    stop: Arc<AtomicBool>,
    cmd_tx: Sender<BrokerCmd>,
    thread: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Ask the broker loop to log a per-session summary.
    pub fn diagnostics(&self) {
        let _ = self.cmd_tx.send(BrokerCmd::Diagnostics);
    }

    /// Stop the loop and wait for it to drain and exit.
    pub fn shut_down(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shut_down();
    }
}

/// Bind the listener, then run the broker loop on a dedicated thread.
/// Bind failures surface here, before anything is spawned.
pub fn spawn(cfg: BrokerConfig) -> Result<BrokerHandle, BrokerError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (cmd_tx, cmd_rx) = unbounded();
    let mut broker = Broker::bind(cfg, Arc::clone(&stop), cmd_rx)?;
    let thread = thread::Builder::new()
        .name("relay-broker".into())
        .spawn(move || broker.run())
        .expect("failed to spawn broker thread");
    Ok(BrokerHandle { stop, cmd_tx, thread: Some(thread) })
}

struct Broker {
    driver: Driver,
    index: SubscriptionIndex,
    sessions: SessionManager,
    auth: Box<dyn Authenticator>,
    reaper: Repeater,
    port: u16,
    stop: Arc<AtomicBool>,
    cmd_rx: Receiver<BrokerCmd>,
}

impl Broker {
    fn bind(
        cfg: BrokerConfig,
        stop: Arc<AtomicBool>,
        cmd_rx: Receiver<BrokerCmd>,
    ) -> Result<Self, BrokerError> {
        let mut driver = Driver::new();
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
        driver
            .listen(addr)
            .map_err(|source| BrokerError::Bind { port: cfg.port, source })?;
        Ok(Self {
            driver,
            index: SubscriptionIndex::default(),
            sessions: SessionManager::default(),
            auth: cfg.auth,
            reaper: Repeater::every(Duration::from_millis(cfg.reap_freq_ms.max(1))),
            port: cfg.port,
            stop,
            cmd_rx,
        })
    }

    fn run(&mut self) {
        info!(port = self.port, "server starting");
        while !self.stop.load(Ordering::Relaxed) {
            pace(Some(LOOP_PACE), || {
                self.drain_commands();
                for ev in self.driver.poll() {
                    self.handle_io(ev);
                }
                if self.reaper.fired() {
                    self.sessions.remove_dead();
                }
            });
        }
        self.clear_all();
        self.driver.shut_down();
        info!("server stopped");
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                BrokerCmd::Diagnostics => self.diagnostics(),
            }
        }
    }

    fn handle_io(&mut self, ev: PollEvent) {
        match ev {
            PollEvent::Accepted { token, peer, .. } => {
                debug!(%peer, "client connected, waiting for logon");
                self.sessions.add(Session::new(token, peer));
            }
            PollEvent::Record { token, record } => self.on_record(token, record),
            PollEvent::Heartbeat { token } => {
                trace!(token = token.0, "heartbeat");
                self.driver.send_heartbeat(token);
            }
            PollEvent::Disconnected { token, reason } => {
                if let Some(session) = self.sessions.get(token) {
                    info!(session = %session.name(), %reason, "client disconnected");
                }
                self.teardown(token);
            }
            PollEvent::StateChanged { token, old, new, reason } => {
                trace!(token = token.0, %old, %new, %reason, "socket state");
            }
            PollEvent::Connected { .. } => {}
        }
    }

    fn on_record(&mut self, token: Token, mut record: Record) {
        let Some(session) = self.sessions.get(token) else {
            trace!(token = token.0, "record for unknown session, dropping");
            return;
        };

        // Policy: nothing but LOGON is allowed before authentication.
        if !session.is_authenticated() && record.msg_type != MsgKind::Logon {
            warn!(
                session = %session.name(),
                kind = %record.msg_type,
                "record from unauthenticated client, shutting it down"
            );
            self.shutdown_session(token);
            return;
        }

        // Broker-side origin injection.
        if record.orig_client_type == 0 && session.client_type() != 0 {
            record.orig_client_type = session.client_type();
            record.orig_client_id = session.client_id();
        }

        match record.msg_type {
            MsgKind::Logon => self.on_logon(token, record),
            MsgKind::Logoff => self.on_logoff(token, record),
            MsgKind::Subscribe => self.on_subscribe(token, record),
            MsgKind::Unsubscribe => self.on_unsubscribe(token, record),
            MsgKind::Invalid => {
                warn!(token = token.0, "record with invalid kind, shutting session down");
                self.shutdown_session(token);
            }
            MsgKind::Ack | MsgKind::Nack | MsgKind::Custom => self.route(token, record),
        }
    }

    fn on_logon(&mut self, token: Token, mut record: Record) {
        let Some(body) = record.body::<LogonBody>() else {
            warn!(token = token.0, "undecodable logon payload, shutting session down");
            self.shutdown_session(token);
            return;
        };
        if !self.auth.authenticate(body.client_type, body.client_id, &record.payload) {
            warn!(
                client = ?(body.client_type, body.client_id),
                "authentication failed, shutting session down"
            );
            self.shutdown_session(token);
            return;
        }

        let Some(session) = self.sessions.get_mut(token) else { return };
        session.set_identity(body.client_type, body.client_id);
        info!(session = %session.name(), msg_key = record.msg_key, "logon");

        if record.orig_client_type == 0 {
            record.orig_client_type = body.client_type;
            record.orig_client_id = body.client_id;
        }
        self.send_ack(token, record.msg_key);
        self.fan_out(token, record);
    }

    fn on_logoff(&mut self, token: Token, record: Record) {
        if let Some(session) = self.sessions.get_mut(token) {
            info!(session = %session.name(), msg_key = record.msg_key, "logoff");
            session.clear_identity();
        }
        self.fan_out(token, record);
    }

    fn on_subscribe(&mut self, token: Token, record: Record) {
        let Some(body) = record.body::<SubscribeBody>() else {
            debug!(token = token.0, "undecodable subscribe payload");
            return;
        };
        let key = SubscriptionKey::new(body.client_type, body.client_id, body.topic);
        let inserted = self.index.add(key, token);
        debug!(token = token.0, %key, inserted, msg_key = record.msg_key, "subscribe");

        // Tell the new subscriber who is already live under that identity.
        if self.sessions.find_token(body.client_type, body.client_id).is_some() {
            let notice = Record {
                msg_type: MsgKind::Logon,
                orig_client_type: body.client_type,
                orig_client_id: body.client_id,
                payload: LogonBody { client_type: body.client_type, client_id: body.client_id }
                    .to_payload(),
                ..Record::default()
            };
            self.driver.send_record(token, &notice);
        }
        self.send_ack(token, record.msg_key);
    }

    fn on_unsubscribe(&mut self, token: Token, record: Record) {
        if let Some(body) = record.body::<SubscribeBody>() {
            let key = SubscriptionKey::new(body.client_type, body.client_id, body.topic);
            let removed = self.index.remove(key, token);
            debug!(token = token.0, %key, removed, msg_key = record.msg_key, "unsubscribe");
        } else {
            debug!(token = token.0, "undecodable unsubscribe payload");
        }
        self.send_ack(token, record.msg_key);
    }

    /// Directed records go to the named session; the rest fan out.
    fn route(&mut self, token: Token, record: Record) {
        if record.is_directed() {
            match self.sessions.find_token(record.dest_client_type, record.dest_client_id) {
                Some(dest) => {
                    trace!(
                        kind = %record.msg_type,
                        msg_key = record.msg_key,
                        dest = ?(record.dest_client_type, record.dest_client_id),
                        "directed delivery"
                    );
                    self.driver.send_record(dest, &record);
                }
                None => trace!(
                    dest = ?(record.dest_client_type, record.dest_client_id),
                    "destination client not connected, dropping"
                ),
            }
        } else {
            self.fan_out(token, record);
        }
    }

    /// Deliver to every matching subscriber except the publisher itself.
    fn fan_out(&mut self, from: Token, mut record: Record) {
        let (client_type, client_id) = self
            .sessions
            .get(from)
            .map_or((0, 0), |s| (s.client_type(), s.client_id()));

        if record.orig_client_type == 0 && client_type != 0 {
            record.orig_client_type = client_type;
            record.orig_client_id = client_id;
        }

        let targets = self.index.matching(client_type, client_id, record.topic, from);
        if targets.is_empty() {
            return;
        }
        trace!(kind = %record.msg_type, count = targets.len(), "fan-out");
        let mut stale = Vec::new();
        for id in targets {
            if self.sessions.get(id).is_some_and(|s| !s.is_shutdown_complete()) {
                self.driver.send_record(id, &record);
            } else {
                stale.push(id);
            }
        }
        // Ids the manager no longer knows are swept lazily, here.
        for id in stale {
            let removed = self.index.remove_all_for(id);
            debug!(id = id.0, removed, "swept stale subscriber");
        }
    }

    fn send_ack(&mut self, token: Token, msg_key: u32) {
        let ack = Record { msg_type: MsgKind::Ack, msg_key, ..Record::default() };
        self.driver.send_record(token, &ack);
    }

    /// Policy shutdown: tear state down, then drop the socket.
    fn shutdown_session(&mut self, token: Token) {
        self.teardown(token);
        self.driver.disconnect(token);
    }

    /// End-of-session cascade: drop subscriptions, announce the logoff,
    /// mark the carcass for the reaper. Runs exactly once per session.
    fn teardown(&mut self, token: Token) {
        let Some(session) = self.sessions.get(token) else { return };
        if session.is_shutdown_complete() {
            return;
        }
        let client_type = session.client_type();
        let client_id = session.client_id();
        let name = session.name();

        let removed = self.index.remove_all_for(token);
        if removed > 0 {
            debug!(removed, session = %name, "removed subscriptions");
        }
        if client_type != 0 {
            let logoff = Record {
                msg_type: MsgKind::Logoff,
                orig_client_type: client_type,
                orig_client_id: client_id,
                payload: LogonBody { client_type, client_id }.to_payload(),
                ..Record::default()
            };
            self.fan_out(token, logoff);
        }
        if let Some(session) = self.sessions.get_mut(token) {
            session.mark_shutdown_complete();
        }
    }

    /// Shut every session down and give their sockets a bounded budget to
    /// flush queued frames before the driver closes.
    fn clear_all(&mut self) {
        let tokens = self.sessions.tokens();
        info!(count = tokens.len(), "closing all clients");
        for token in tokens {
            self.teardown(token);
        }
        let mut retries = 0;
        while self.driver.has_pending_writes() && retries < SHUTDOWN_RETRIES {
            self.driver.poll();
            thread::sleep(SHUTDOWN_TICK);
            retries += 1;
        }
        self.sessions.remove_dead();
    }

    fn diagnostics(&self) {
        info!("=========== DIAGNOSTICS ===========");
        if self.sessions.len() == 0 {
            info!("no clients connected");
        }
        for session in self.sessions.iter() {
            let token = session.token();
            let (rx, tx) = self.driver.counters(token).unwrap_or((0, 0));
            info!(
                "client {}: connected={}; rx count: {}; send count: {}",
                session.name(),
                self.driver.is_connected(token),
                rx,
                tx
            );
            for (id, topic) in self.index.subscribers_to(session.client_type(), session.client_id())
            {
                if let Some(sub) = self.sessions.get(id) {
                    info!("  subscriber {} (topic {})", sub.name(), topic);
                }
            }
        }
        info!("===================================");
    }
}
