use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token, net::TcpStream};
use relay_wire::{HDR_SIZE, MAX_FRAME};
use tracing::{debug, warn};

use crate::state::{DisconnectReason, SocketState};

const RX_BUF_SIZE: usize = HDR_SIZE + MAX_FRAME;

/// Whether the connection survived the last operation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    Alive,
    Gone(DisconnectReason),
}

pub(crate) enum ReadOutcome<'a> {
    /// One complete frame, length prefix included. Valid only until the next
    /// read call.
    Frame(&'a [u8]),
    WouldBlock,
    Closed(DisconnectReason),
}

#[derive(Clone, Copy)]
enum RxState {
    /// Accumulating the 4-byte length prefix into the front of `rx_buf`.
    Prefix { have: usize },
    /// Reading `msg_len` payload bytes behind the prefix.
    Payload { msg_len: usize, offset: usize },
}

/// Single mio-backed connection: incremental length-prefixed framing on the
/// read side, immediate write with an overflow backlog on the write side.
///
/// Invariant: `writable_armed == !send_backlog.is_empty()` — WRITABLE
/// interest is held only while there are queued bytes to flush.
pub(crate) struct Conn {
    stream: TcpStream,
    token: Token,
    peer_addr: SocketAddr,
    pub(crate) state: SocketState,
    pub(crate) reason: DisconnectReason,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,

    pub(crate) rx_count: u64,
    pub(crate) tx_count: u64,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream, token: Token, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            token,
            peer_addr,
            state: SocketState::Connected,
            reason: DisconnectReason::None,
            rx_state: RxState::Prefix { have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(16),
            writable_armed: false,
            rx_count: 0,
            tx_count: 0,
        })
    }

    /// Record a state change; returns `(old, new)` when it actually changed.
    pub(crate) fn transition(
        &mut self,
        new: SocketState,
        reason: DisconnectReason,
    ) -> Option<(SocketState, SocketState)> {
        if self.state == new {
            return None;
        }
        let old = self.state;
        self.state = new;
        self.reason = reason;
        Some((old, new))
    }

    /// Read a single complete frame if present. Loops until a frame is
    /// assembled or the socket would block.
    pub(crate) fn read_frame(&mut self) -> ReadOutcome<'_> {
        loop {
            match self.rx_state {
                RxState::Prefix { mut have } => {
                    while have < HDR_SIZE {
                        match self.stream.read(&mut self.rx_buf[have..HDR_SIZE]) {
                            Ok(0) => return ReadOutcome::Closed(DisconnectReason::ServerDisconnected),
                            Ok(n) => have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Prefix { have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref e) if is_peer_gone(e.kind()) => {
                                debug!(?e, "tcp: peer closed during prefix read");
                                return ReadOutcome::Closed(DisconnectReason::ServerDisconnected);
                            }
                            Err(err) => {
                                warn!(?err, "tcp: read prefix");
                                return ReadOutcome::Closed(DisconnectReason::Exception);
                            }
                        }
                    }
                    let msg_len = u32::from_le_bytes(
                        self.rx_buf[..HDR_SIZE].try_into().expect("prefix is 4 bytes"),
                    ) as usize;
                    if msg_len > MAX_FRAME {
                        // The framing cannot resync past a bogus prefix, so a
                        // single oversize frame takes the connection down.
                        warn!(len = msg_len, "tcp: oversize frame, closing");
                        return ReadOutcome::Closed(DisconnectReason::Exception);
                    }
                    if msg_len == 0 {
                        self.rx_state = RxState::Prefix { have: 0 };
                        self.rx_count += 1;
                        return ReadOutcome::Frame(&self.rx_buf[..HDR_SIZE]);
                    }
                    self.rx_state = RxState::Payload { msg_len, offset: 0 };
                }

                RxState::Payload { msg_len, mut offset } => {
                    while offset < msg_len {
                        match self.stream.read(&mut self.rx_buf[HDR_SIZE + offset..HDR_SIZE + msg_len]) {
                            Ok(0) => return ReadOutcome::Closed(DisconnectReason::ServerDisconnected),
                            Ok(n) => offset += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Payload { msg_len, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref e) if is_peer_gone(e.kind()) => {
                                debug!(?e, "tcp: peer closed during payload read");
                                return ReadOutcome::Closed(DisconnectReason::ServerDisconnected);
                            }
                            Err(err) => {
                                warn!(?err, "tcp: read payload");
                                return ReadOutcome::Closed(DisconnectReason::Exception);
                            }
                        }
                    }
                    self.rx_state = RxState::Prefix { have: 0 };
                    self.rx_count += 1;
                    return ReadOutcome::Frame(&self.rx_buf[..HDR_SIZE + msg_len]);
                }
            }
        }
    }

    /// Happy path: write the frame now. If the kernel blocks or earlier
    /// bytes are still queued, the remainder goes to the backlog and is
    /// flushed on the next writable event.
    pub(crate) fn send_frame(&mut self, registry: &Registry, frame: Vec<u8>) -> ConnState {
        if !self.state.is_connected() {
            return ConnState::Gone(self.reason);
        }
        if !self.send_backlog.is_empty() {
            return self.enqueue(registry, frame);
        }

        match self.stream.write(&frame) {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Gone(DisconnectReason::ServerDisconnected)
            }
            Ok(n) if n == frame.len() => ConnState::Alive,
            Ok(n) => self.enqueue(registry, frame[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.enqueue(registry, frame),
            Err(ref e) if is_peer_gone(e.kind()) => {
                debug!(?e, "tcp: peer closed on write");
                ConnState::Gone(DisconnectReason::ServerDisconnected)
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Gone(DisconnectReason::Exception)
            }
        }
    }

    /// Flush queued frames until the kernel blocks or the queue is empty.
    pub(crate) fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Gone(DisconnectReason::ServerDisconnected),
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if is_peer_gone(e.kind()) => {
                    debug!(?e, "tcp: peer closed draining backlog");
                    return ConnState::Gone(DisconnectReason::ServerDisconnected);
                }
                Err(err) => {
                    warn!(?err, "tcp: write from backlog");
                    return ConnState::Gone(DisconnectReason::Exception);
                }
            }
        }

        // Drop WRITABLE interest only when fully drained.
        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Gone(DisconnectReason::Exception);
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    #[inline]
    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.send_backlog.is_empty()
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: arm writable");
                return ConnState::Gone(DisconnectReason::Exception);
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub(crate) fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!(peer = %self.peer_addr, "terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }
}

/// Errors that mean the peer went away rather than a local fault.
#[inline]
fn is_peer_gone(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
