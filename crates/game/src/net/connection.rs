use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::packet::{
    CTRLMSG_CLOSE, CTRLMSG_CONNECT, CTRLMSG_CONNECTACCEPT, CTRLMSG_KEEPALIVE, ChunkFlags,
    ChunkHeader, MAX_CHUNK_HEADER_SIZE, MAX_CHUNK_SIZE, MAX_PAYLOAD, MAX_SEQUENCE, PacketConstruct,
    PacketFlags, SEQUENCE_MASK, send_control, send_packet,
};

/// Total bytes of unacknowledged vital chunks a connection may hold before
/// it is considered broken.
pub const RESEND_BUFFER_CAPACITY: usize = 32 * 1024;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Offline,
    Connecting,
    Online,
    Error,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("chunk of {0} bytes exceeds the maximum chunk size")]
    ChunkTooLarge(usize),
    #[error("resend buffer overflow")]
    BufferOverflow,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a received packet did to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    /// Dropped: wrong peer, bad token, or not parseable in this state.
    Dropped,
    /// A control message was consumed; there are no chunks to walk.
    Control,
    /// A data packet; the caller should walk its chunks.
    Chunks,
    /// The peer closed the connection.
    Closed(String),
}

/// Verdict for one vital chunk's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqAction {
    Accept,
    Duplicate,
    OutOfOrder,
}

/// The backroom is the half-window of sequence numbers at or below `ack`;
/// anything inside it has been seen by the peer, anything outside is still
/// in flight (or from the future).
pub fn is_seq_in_backroom(seq: u32, ack: u32) -> bool {
    let seq = seq as i64;
    let ack = ack as i64;
    let bottom = ack - (MAX_SEQUENCE / 2) as i64;
    if bottom < 0 {
        seq <= ack || seq >= bottom + MAX_SEQUENCE as i64
    } else {
        seq <= ack && seq >= bottom
    }
}

#[derive(Debug, Clone)]
struct ResendEntry {
    sequence: u32,
    flags: ChunkFlags,
    data: Vec<u8>,
    first_send: Instant,
    last_send: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
}

/// One reliable-delivery peer. Owns no socket; the endpoint hands one in
/// for every operation that transmits, together with the current time, so
/// the machine itself stays deterministic.
#[derive(Debug)]
pub struct Connection {
    state: ConnState,
    sequence: u32,
    ack: u32,
    peer_ack: u32,
    peer_addr: Option<SocketAddr>,
    token: Option<u32>,
    resend_queue: VecDeque<ResendEntry>,
    buffered_bytes: usize,
    construct: PacketConstruct,
    last_recv_time: Instant,
    last_send_time: Instant,
    timeout: Duration,
    resend_interval: Duration,
    error: Option<String>,
    remote_closed: bool,
    stats: ConnStats,
}

impl Connection {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            state: ConnState::Offline,
            sequence: 0,
            ack: 0,
            peer_ack: 0,
            peer_addr: None,
            token: None,
            resend_queue: VecDeque::new(),
            buffered_bytes: 0,
            construct: PacketConstruct::default(),
            last_recv_time: now,
            last_send_time: now,
            timeout,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            error: None,
            remote_closed: false,
            stats: ConnStats::default(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn token(&self) -> Option<u32> {
        self.token
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn stats(&self) -> ConnStats {
        self.stats
    }

    pub fn error_string(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn last_recv_time(&self) -> Instant {
        self.last_recv_time
    }

    /// Bytes of vital chunks waiting for acknowledgement.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn set_resend_interval(&mut self, interval: Duration) {
        self.resend_interval = interval;
    }

    fn reset(&mut self, now: Instant) {
        self.sequence = 0;
        self.ack = 0;
        self.peer_ack = 0;
        self.token = None;
        self.resend_queue.clear();
        self.buffered_bytes = 0;
        self.construct.clear();
        self.last_recv_time = now;
        self.last_send_time = now;
        self.error = None;
        self.remote_closed = false;
    }

    fn set_error(&mut self, reason: &str) {
        self.state = ConnState::Error;
        self.error = Some(reason.to_string());
    }

    /// Client side: begin the handshake against `addr`.
    pub fn connect(
        &mut self,
        socket: &UdpSocket,
        addr: SocketAddr,
        now: Instant,
    ) -> io::Result<()> {
        self.reset(now);
        self.peer_addr = Some(addr);
        self.state = ConnState::Connecting;
        self.send_ctrl(socket, CTRLMSG_CONNECT, &[], now)
    }

    /// Server side: adopt a peer that sent a valid connect message.
    pub fn accept(&mut self, addr: SocketAddr, token: u32, now: Instant) {
        self.reset(now);
        self.peer_addr = Some(addr);
        self.token = Some(token);
        self.state = ConnState::Online;
    }

    pub fn disconnect(&mut self, socket: &UdpSocket, reason: &str, now: Instant) {
        if self.state == ConnState::Offline {
            return;
        }
        if !self.remote_closed {
            let mut extra = Vec::with_capacity(reason.len() + 1);
            if !reason.is_empty() {
                extra.extend_from_slice(reason.as_bytes());
                extra.push(0);
            }
            let _ = self.send_ctrl(socket, CTRLMSG_CLOSE, &extra, now);
        }
        self.state = ConnState::Offline;
        self.reset(now);
    }

    fn send_ctrl(
        &mut self,
        socket: &UdpSocket,
        ctrl: u8,
        extra: &[u8],
        now: Instant,
    ) -> io::Result<()> {
        self.last_send_time = now;
        if let Some(addr) = self.peer_addr {
            let sent = send_control(socket, addr, self.ack, self.token, ctrl, extra)?;
            self.stats.sent_packets += 1;
            self.stats.sent_bytes += sent as u64;
        }
        Ok(())
    }

    /// Server side: answer a connect (or a retransmitted one) with the
    /// accept message carrying the session token.
    pub fn send_connect_accept(&mut self, socket: &UdpSocket, now: Instant) -> io::Result<()> {
        let token = self.token.unwrap_or(0);
        self.send_ctrl(socket, CTRLMSG_CONNECTACCEPT, &token.to_be_bytes(), now)
    }

    /// Appends a chunk to the packet under construction, flushing first if
    /// it would not fit. Vital chunks get the next sequence number and a
    /// copy in the resend queue; overflowing that queue is fatal for the
    /// connection.
    pub fn queue_chunk(
        &mut self,
        socket: &UdpSocket,
        flags: ChunkFlags,
        data: &[u8],
        now: Instant,
    ) -> Result<(), ConnError> {
        if self.state != ConnState::Online {
            return Ok(());
        }
        let mut sequence = 0;
        if flags.contains(ChunkFlags::VITAL) {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            sequence = self.sequence;
        }
        self.queue_chunk_ex(socket, flags, data, sequence, now)
    }

    fn queue_chunk_ex(
        &mut self,
        socket: &UdpSocket,
        flags: ChunkFlags,
        data: &[u8],
        sequence: u32,
        now: Instant,
    ) -> Result<(), ConnError> {
        if data.len() > MAX_CHUNK_SIZE {
            return Err(ConnError::ChunkTooLarge(data.len()));
        }
        if self.construct.data.len() + data.len() + MAX_CHUNK_HEADER_SIZE > MAX_PAYLOAD
            || self.construct.num_chunks == u8::MAX
        {
            self.flush(socket, now)?;
        }

        ChunkHeader {
            flags,
            size: data.len(),
            sequence,
        }
        .pack(&mut self.construct.data);
        self.construct.data.extend_from_slice(data);
        self.construct.num_chunks += 1;

        if flags.contains(ChunkFlags::VITAL) && !flags.contains(ChunkFlags::RESEND) {
            self.buffered_bytes += data.len() + MAX_CHUNK_HEADER_SIZE;
            if self.buffered_bytes > RESEND_BUFFER_CAPACITY {
                self.set_error("too weak connection (out of buffer)");
                return Err(ConnError::BufferOverflow);
            }
            self.resend_queue.push_back(ResendEntry {
                sequence,
                flags,
                data: data.to_vec(),
                first_send: now,
                last_send: now,
            });
        }
        Ok(())
    }

    /// Frames everything queued so far into one packet and transmits it.
    pub fn flush(&mut self, socket: &UdpSocket, now: Instant) -> io::Result<usize> {
        if self.construct.num_chunks == 0 && self.construct.flags.is_empty() {
            return Ok(0);
        }
        let Some(addr) = self.peer_addr else {
            return Ok(0);
        };
        self.construct.ack = self.ack;
        self.construct.token = self.token;
        let sent = send_packet(socket, addr, &self.construct)?;
        self.stats.sent_packets += 1;
        self.stats.sent_bytes += sent as u64;
        self.last_send_time = now;
        self.construct.clear();
        Ok(sent)
    }

    /// Validates and books a received packet. Control messages are handled
    /// here; for data packets the caller walks the chunks afterwards,
    /// passing each vital sequence through [`Connection::accept_sequence`].
    pub fn feed(
        &mut self,
        socket: &UdpSocket,
        packet: &PacketConstruct,
        addr: SocketAddr,
        now: Instant,
    ) -> FeedResult {
        if matches!(self.state, ConnState::Offline | ConnState::Error) {
            return FeedResult::Dropped;
        }
        if self.peer_addr != Some(addr) {
            log::debug!("packet from {addr} does not match peer, dropped");
            return FeedResult::Dropped;
        }
        if let Some(expected) = self.token {
            if packet.token != Some(expected) {
                log::debug!("token mismatch from {addr}, dropped");
                return FeedResult::Dropped;
            }
        }

        // the peer can only ack what we actually sent; anything outside
        // [peer_ack, sequence] is a protocol violation and the packet is
        // dropped without touching state
        if !self.ack_in_valid_window(packet.ack) {
            log::debug!(
                "ack {} outside window (peer_ack {}, sequence {}), dropped",
                packet.ack,
                self.peer_ack,
                self.sequence
            );
            return FeedResult::Dropped;
        }

        self.last_recv_time = now;
        self.stats.recv_packets += 1;
        self.stats.recv_bytes += packet.data.len() as u64;
        self.peer_ack = packet.ack;
        self.ack_resend_queue(packet.ack);

        if packet.flags.contains(PacketFlags::RESEND) {
            if let Err(err) = self.resend_all(socket, now) {
                log::debug!("resend on request failed: {err}");
            }
        }

        if packet.flags.contains(PacketFlags::CONTROL) {
            let Some(&ctrl) = packet.data.first() else {
                return FeedResult::Dropped;
            };
            match ctrl {
                CTRLMSG_CLOSE => {
                    let reason = close_reason(&packet.data[1..]);
                    self.remote_closed = true;
                    self.state = ConnState::Offline;
                    return FeedResult::Closed(reason);
                }
                CTRLMSG_CONNECTACCEPT if self.state == ConnState::Connecting => {
                    if let Some(bytes) = packet.data.get(1..5) {
                        self.token = Some(u32::from_be_bytes(bytes.try_into().unwrap()));
                    }
                    self.state = ConnState::Online;
                    log::info!("connection online");
                }
                CTRLMSG_KEEPALIVE | CTRLMSG_CONNECT => {}
                _ => {}
            }
            return FeedResult::Control;
        }

        FeedResult::Chunks
    }

    fn ack_in_valid_window(&self, ack: u32) -> bool {
        if self.sequence >= self.peer_ack {
            ack >= self.peer_ack && ack <= self.sequence
        } else {
            // our sequence counter wrapped past the window edge
            ack >= self.peer_ack || ack <= self.sequence
        }
    }

    fn ack_resend_queue(&mut self, ack: u32) {
        while let Some(front) = self.resend_queue.front() {
            if front.sequence == ack || is_seq_in_backroom(front.sequence, ack) {
                self.buffered_bytes -= front.data.len() + MAX_CHUNK_HEADER_SIZE;
                self.resend_queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Books one vital chunk's sequence number against the receive window.
    pub fn accept_sequence(&mut self, sequence: u32) -> SeqAction {
        if sequence == (self.ack + 1) & SEQUENCE_MASK {
            self.ack = sequence;
            SeqAction::Accept
        } else if is_seq_in_backroom(sequence, self.ack) {
            SeqAction::Duplicate
        } else {
            SeqAction::OutOfOrder
        }
    }

    /// Asks the peer to retransmit; called when a vital chunk arrived ahead
    /// of a gap.
    pub fn signal_resend(&mut self, socket: &UdpSocket, now: Instant) -> io::Result<usize> {
        self.construct.flags |= PacketFlags::RESEND;
        self.flush(socket, now)
    }

    fn resend_all(&mut self, socket: &UdpSocket, now: Instant) -> Result<(), ConnError> {
        let due: Vec<(u32, ChunkFlags, Vec<u8>)> = self
            .resend_queue
            .iter_mut()
            .map(|entry| {
                entry.last_send = now;
                (entry.sequence, entry.flags, entry.data.clone())
            })
            .collect();
        for (sequence, flags, data) in due {
            self.queue_chunk_ex(socket, flags | ChunkFlags::RESEND, &data, sequence, now)?;
        }
        Ok(())
    }

    /// Once-per-tick housekeeping: timeout detection, retransmission of
    /// overdue vital chunks, keepalives, connect retries.
    pub fn update(&mut self, socket: &UdpSocket, now: Instant) {
        if matches!(self.state, ConnState::Offline | ConnState::Error) {
            return;
        }

        if now.duration_since(self.last_recv_time) > self.timeout {
            self.set_error(&format!(
                "Timeout ({} seconds without packets)",
                self.timeout.as_secs()
            ));
            return;
        }

        match self.state {
            ConnState::Online => {
                let due: Vec<(u32, ChunkFlags, Vec<u8>)> = self
                    .resend_queue
                    .iter_mut()
                    .filter(|entry| now.duration_since(entry.last_send) >= self.resend_interval)
                    .map(|entry| {
                        entry.last_send = now;
                        (entry.sequence, entry.flags, entry.data.clone())
                    })
                    .collect();
                for (sequence, flags, data) in due {
                    log::debug!("resending chunk seq={sequence}");
                    if let Err(err) =
                        self.queue_chunk_ex(socket, flags | ChunkFlags::RESEND, &data, sequence, now)
                    {
                        log::debug!("resend failed: {err}");
                        return;
                    }
                }
                if self.construct.num_chunks == 0
                    && now.duration_since(self.last_send_time) > KEEPALIVE_INTERVAL
                {
                    let _ = self.send_ctrl(socket, CTRLMSG_KEEPALIVE, &[], now);
                }
            }
            ConnState::Connecting => {
                if now.duration_since(self.last_send_time) > CONNECT_RETRY_INTERVAL {
                    let _ = self.send_ctrl(socket, CTRLMSG_CONNECT, &[], now);
                }
            }
            _ => {}
        }
    }

    /// True when no packet arrived for a while; the owner should treat the
    /// link as in trouble well before the hard timeout fires.
    pub fn got_problems(&self, now: Instant) -> bool {
        now.duration_since(self.last_recv_time) > Duration::from_secs(1)
    }
}

fn close_reason(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}
