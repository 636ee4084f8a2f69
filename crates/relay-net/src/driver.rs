use std::{io, net::SocketAddr, time::Duration};

use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use relay_wire::{Decoded, Record};
use tracing::{debug, info, trace, warn};

use crate::{
    conn::{Conn, ConnState, ReadOutcome},
    safe_panic,
    state::{DisconnectReason, SocketState},
    timing::Repeater,
};

const DEFAULT_REDIAL_INTERVAL: Duration = Duration::from_secs(2);

/// Event emitted by [`Driver::poll`] for each notable IO occurrence.
///
/// Events for one token are delivered in occurrence order; the driver is
/// driven by a single thread, so no two events for the same connection are
/// ever handled concurrently.
#[derive(Debug)]
pub enum PollEvent {
    /// A listener accepted a new inbound connection.
    Accepted { listener: Token, token: Token, peer: SocketAddr },
    /// A dialled (outbound) connection completed.
    Connected { token: Token, peer: SocketAddr },
    /// The socket state machine moved.
    StateChanged {
        token: Token,
        old: SocketState,
        new: SocketState,
        reason: DisconnectReason,
    },
    /// A complete record frame was received and decoded.
    Record { token: Token, record: Record },
    /// A zero-length frame was received.
    Heartbeat { token: Token },
    /// The connection is gone; the token is dead unless it is rescheduled
    /// for redial.
    Disconnected { token: Token, reason: DisconnectReason },
}

enum Slot {
    Listener(TcpListener),
    Stream { conn: Conn, outbound: bool },
}

struct ConnSet {
    poll: Poll,
    conns: Vec<(Token, Slot)>,
    pending: Vec<PollEvent>,

    reconnect: bool,
    redial_timer: Repeater,
    /// Outbound connections awaiting a redial attempt.
    to_redial: Vec<(Token, SocketAddr)>,

    next_token: usize,
    stopped: bool,
}

impl Default for ConnSet {
    fn default() -> Self {
        Self {
            poll: Poll::new().expect("couldn't set up a poll for the driver"),
            conns: Vec::with_capacity(8),
            pending: Vec::new(),
            reconnect: false,
            redial_timer: Repeater::every(DEFAULT_REDIAL_INTERVAL),
            to_redial: Vec::new(),
            next_token: 0,
            stopped: false,
        }
    }
}

impl ConnSet {
    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    fn position(&self, token: Token) -> Option<usize> {
        self.conns.iter().position(|(t, _)| *t == token)
    }

    fn listen(&mut self, addr: SocketAddr) -> io::Result<Token> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.conns.push((token, Slot::Listener(listener)));
        Ok(token)
    }

    fn connect(&mut self, addr: SocketAddr) -> Token {
        let token = self.alloc_token();
        self.push_transition(token, SocketState::Disconnected, SocketState::Connecting, DisconnectReason::None);
        if !self.try_dial(token, addr, true) {
            if self.reconnect {
                self.to_redial.push((token, addr));
                self.redial_timer.reset();
                self.push_transition(
                    token,
                    SocketState::Connecting,
                    SocketState::RetryConnect,
                    DisconnectReason::CouldNotConnect,
                );
            } else {
                self.push_transition(
                    token,
                    SocketState::Connecting,
                    SocketState::Disconnected,
                    DisconnectReason::CouldNotConnect,
                );
                self.pending.push(PollEvent::Disconnected {
                    token,
                    reason: DisconnectReason::CouldNotConnect,
                });
            }
        }
        token
    }

    /// One dial attempt. On success the stream is registered and live.
    fn try_dial(&mut self, token: Token, addr: SocketAddr, first: bool) -> bool {
        let failed = |err: &dyn std::fmt::Debug| {
            // First failures are worth a warning; retries only trace.
            if first {
                warn!(?addr, ?err, "could not connect");
            } else {
                trace!(?addr, ?err, "redial attempt failed");
            }
        };

        let mut stream = match mio::net::TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                failed(&e);
                return false;
            }
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                failed(&e);
                return false;
            }
            Err(e) => {
                failed(&e);
                return false;
            }
        }
        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            failed(&e);
            return false;
        }
        match Conn::new(stream, token, addr) {
            Ok(conn) => {
                self.conns.push((token, Slot::Stream { conn, outbound: true }));
                self.push_transition(
                    token,
                    SocketState::Connecting,
                    SocketState::Connected,
                    DisconnectReason::None,
                );
                self.pending.push(PollEvent::Connected { token, peer: addr });
                debug!(?addr, "connected");
                true
            }
            Err(e) => {
                failed(&e);
                false
            }
        }
    }

    fn attempt_dials(&mut self) {
        if self.to_redial.is_empty() || !self.redial_timer.fired() {
            return;
        }
        let mut i = self.to_redial.len();
        while i != 0 {
            i -= 1;
            let (token, addr) = self.to_redial[i];
            self.push_transition(token, SocketState::RetryConnect, SocketState::Connecting, DisconnectReason::None);
            if self.try_dial(token, addr, false) {
                self.to_redial.swap_remove(i);
            } else {
                self.push_transition(
                    token,
                    SocketState::Connecting,
                    SocketState::RetryConnect,
                    DisconnectReason::CouldNotConnect,
                );
            }
        }
    }

    fn push_transition(
        &mut self,
        token: Token,
        old: SocketState,
        new: SocketState,
        reason: DisconnectReason,
    ) {
        self.pending.push(PollEvent::StateChanged { token, old, new, reason });
    }

    fn handle_event(&mut self, e: &Event) {
        let token = e.token();
        let Some(i) = self.position(token) else {
            // The connection may have been dropped earlier in this batch.
            trace!(token = token.0, "event for unknown token, ignoring");
            return;
        };
        if matches!(self.conns[i].1, Slot::Listener(_)) {
            self.accept_loop(i);
        } else {
            self.stream_io(i, e);
        }
    }

    fn accept_loop(&mut self, i: usize) {
        loop {
            let accepted = {
                let Slot::Listener(listener) = &mut self.conns[i].1 else { return };
                listener.accept()
            };
            match accepted {
                Ok((mut stream, peer)) => {
                    let token = self.alloc_token();
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(?err, "couldn't register accepted client");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    match Conn::new(stream, token, peer) {
                        Ok(conn) => {
                            info!(?peer, "client connected");
                            let listener_token = self.conns[i].0;
                            self.pending.push(PollEvent::Accepted {
                                listener: listener_token,
                                token,
                                peer,
                            });
                            self.push_transition(
                                token,
                                SocketState::Disconnected,
                                SocketState::Connected,
                                DisconnectReason::None,
                            );
                            self.conns.push((token, Slot::Stream { conn, outbound: false }));
                        }
                        Err(err) => warn!(?err, "couldn't set up accepted stream"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    // Transient accept failure; the listener stays armed.
                    warn!(?err, "accept error");
                    return;
                }
            }
        }
    }

    fn stream_io(&mut self, i: usize, e: &Event) {
        let mut gone = None;
        {
            let Self { poll, conns, pending, .. } = self;
            let (token, slot) = &mut conns[i];
            let token = *token;
            let Slot::Stream { conn, .. } = slot else { return };

            if e.is_readable() {
                loop {
                    match conn.read_frame() {
                        ReadOutcome::Frame(frame) => match relay_wire::decode(frame) {
                            Ok(Decoded::Heartbeat) => pending.push(PollEvent::Heartbeat { token }),
                            Ok(Decoded::Record { record, .. }) => {
                                pending.push(PollEvent::Record { token, record });
                            }
                            // Intact framing but an undecodable record: drop
                            // it and keep reading.
                            Err(err) => warn!(token = token.0, ?err, "dropping undecodable record"),
                        },
                        ReadOutcome::WouldBlock => break,
                        ReadOutcome::Closed(reason) => {
                            gone = Some(reason);
                            break;
                        }
                    }
                }
            }

            if gone.is_none()
                && e.is_writable()
                && let ConnState::Gone(reason) = conn.drain_backlog(poll.registry())
            {
                gone = Some(reason);
            }
        }
        if let Some(reason) = gone {
            self.drop_conn_at(i, reason);
        }
    }

    /// Tear one connection down, emitting the Disconnecting/terminal state
    /// transitions and scheduling a redial when applicable.
    fn drop_conn_at(&mut self, i: usize, reason: DisconnectReason) {
        let (token, slot) = self.conns.swap_remove(i);
        match slot {
            Slot::Listener(mut listener) => {
                let _ = self.poll.registry().deregister(&mut listener);
            }
            Slot::Stream { mut conn, outbound } => {
                if let Some((old, new)) = conn.transition(SocketState::Disconnecting, reason) {
                    self.push_transition(token, old, new, reason);
                }
                let peer = conn.close(self.poll.registry());
                let redial =
                    outbound && self.reconnect && reason != DisconnectReason::Manual && !self.stopped;
                let terminal =
                    if redial { SocketState::RetryConnect } else { SocketState::Disconnected };
                self.push_transition(token, SocketState::Disconnecting, terminal, reason);
                self.pending.push(PollEvent::Disconnected { token, reason });
                if redial {
                    self.to_redial.push((token, peer));
                }
            }
        }
    }

    fn disconnect(&mut self, token: Token) {
        if let Some(i) = self.position(token) {
            self.drop_conn_at(i, DisconnectReason::Manual);
        } else if let Some(i) = self.to_redial.iter().position(|(t, _)| *t == token) {
            // Cancel a scheduled redial.
            self.to_redial.swap_remove(i);
            self.push_transition(
                token,
                SocketState::RetryConnect,
                SocketState::Disconnected,
                DisconnectReason::Manual,
            );
            self.pending.push(PollEvent::Disconnected { token, reason: DisconnectReason::Manual });
        }
    }

    fn send_bytes(&mut self, token: Token, frame: Vec<u8>, count_tx: bool) -> bool {
        let Some(i) = self.position(token) else {
            return false;
        };
        let outcome = {
            let Self { poll, conns, .. } = self;
            let Slot::Stream { conn, .. } = &mut conns[i].1 else {
                safe_panic!("cannot write to a listener token");
                return false;
            };
            let outcome = conn.send_frame(poll.registry(), frame);
            if count_tx && outcome == ConnState::Alive {
                conn.tx_count += 1;
            }
            outcome
        };
        match outcome {
            ConnState::Alive => true,
            ConnState::Gone(reason) => {
                self.drop_conn_at(i, reason);
                false
            }
        }
    }

    fn shut_down(&mut self) {
        self.stopped = true;
        self.to_redial.clear();
        for (_, slot) in &mut self.conns {
            match slot {
                Slot::Listener(listener) => {
                    let _ = self.poll.registry().deregister(listener);
                }
                Slot::Stream { conn, .. } => {
                    conn.close(self.poll.registry());
                }
            }
        }
        self.conns.clear();
    }
}

/// Non-blocking TCP reactor over `mio`.
///
/// Owns listeners, accepted (inbound) streams, and dialled (outbound)
/// streams, each addressed by a token. Drive it by calling [`Driver::poll`]
/// from a single thread; the returned events preserve per-connection order,
/// which is the serialization guarantee everything above relies on.
///
/// Outbound connections are automatically redialled on failure or disconnect
/// when reconnection is enabled via [`Driver::with_reconnect`]; a manual
/// [`Driver::disconnect`] always cancels the redial.
pub struct Driver {
    events: Events,
    set: ConnSet,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub fn new() -> Self {
        Self { events: Events::with_capacity(128), set: ConnSet::default() }
    }

    /// Enable automatic redial of outbound connections at `interval`.
    pub fn with_reconnect(mut self, interval: Duration) -> Self {
        self.set.reconnect = true;
        self.set.redial_timer = Repeater::every(interval);
        self
    }

    /// Bind a listener. Bind or registration failure is returned to the
    /// caller; it is fatal for a server.
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<Token> {
        self.set.listen(addr)
    }

    /// Dial `addr`. The returned token identifies the connection for its
    /// whole lifetime, across redials.
    pub fn connect(&mut self, addr: SocketAddr) -> Token {
        self.set.connect(addr)
    }

    /// Manually close a connection (or cancel its scheduled redial).
    pub fn disconnect(&mut self, token: Token) {
        self.set.disconnect(token);
    }

    /// Encode and enqueue one record. Returns false when the connection is
    /// stopped or encoding fails.
    pub fn send_record(&mut self, token: Token, record: &Record) -> bool {
        if self.set.stopped {
            return false;
        }
        match relay_wire::encode(record) {
            Ok(frame) => self.set.send_bytes(token, frame, true),
            Err(err) => {
                warn!(?err, "record encode failed");
                false
            }
        }
    }

    /// Enqueue a zero-length heartbeat frame.
    pub fn send_heartbeat(&mut self, token: Token) -> bool {
        if self.set.stopped {
            return false;
        }
        self.set.send_bytes(token, relay_wire::encode_heartbeat().to_vec(), false)
    }

    /// Poll sockets once (non-blocking) and return the accumulated events.
    ///
    /// Also performs due redial attempts. The caller is expected to pace the
    /// loop (see [`crate::pace`]).
    pub fn poll(&mut self) -> Vec<PollEvent> {
        if self.set.stopped {
            return std::mem::take(&mut self.set.pending);
        }
        self.set.attempt_dials();
        match self.set.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => safe_panic!("poll failure: {e}"),
        }
        for e in self.events.iter() {
            self.set.handle_event(e);
        }
        std::mem::take(&mut self.set.pending)
    }

    #[inline]
    pub fn is_connected(&self, token: Token) -> bool {
        matches!(
            self.set.position(token).map(|i| &self.set.conns[i].1),
            Some(Slot::Stream { conn, .. }) if conn.state.is_connected()
        )
    }

    /// `(rx_count, tx_count)` for a live connection.
    pub fn counters(&self, token: Token) -> Option<(u64, u64)> {
        match self.set.position(token).map(|i| &self.set.conns[i].1) {
            Some(Slot::Stream { conn, .. }) => Some((conn.rx_count, conn.tx_count)),
            _ => None,
        }
    }

    /// True while any connection still has queued outbound bytes.
    pub fn has_pending_writes(&self) -> bool {
        self.set.conns.iter().any(|(_, slot)| match slot {
            Slot::Stream { conn, .. } => conn.has_pending_writes(),
            Slot::Listener(_) => false,
        })
    }

    /// Stop polling and close every socket. Queued writes that have not
    /// reached the kernel are discarded.
    pub fn shut_down(&mut self) {
        self.set.shut_down();
    }
}
