use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::connection::{ConnError, ConnState, Connection, FeedResult, SeqAction};
use super::packet::{
    CTRLMSG_CLOSE, CTRLMSG_CONNECT, ChunkFlags, MAX_PACKET_SIZE, PacketFlags, send_connless,
    send_control, unpack_packet,
};
use super::{packet, rand_u64};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A new peer completed the connect handshake and occupies `client`.
    Connected { client: usize },
    /// One re-assembled chunk from an online peer, in sequence order for
    /// vital chunks.
    Chunk {
        client: usize,
        flags: ChunkFlags,
        data: Vec<u8>,
    },
    /// A datagram outside any connection (server browser queries etc).
    Connless { addr: SocketAddr, data: Vec<u8> },
    /// The connection ended; `remote` tells whether the peer closed it or
    /// it died locally (timeout, buffer overflow).
    Disconnected {
        client: usize,
        reason: String,
        remote: bool,
    },
}

/// The server-side endpoint: one UDP socket and a fixed slot table of
/// connections. Slot indices double as client ids everywhere above this
/// layer.
#[derive(Debug)]
pub struct NetServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    conns: Vec<Connection>,
    secret: u64,
}

impl NetServer {
    pub fn open<A: ToSocketAddrs>(
        addr: A,
        max_clients: usize,
        timeout: Duration,
        now: Instant,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            conns: (0..max_clients).map(|_| Connection::new(now, timeout)).collect(),
            secret: rand_u64(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_clients(&self) -> usize {
        self.conns.len()
    }

    pub fn is_online(&self, client: usize) -> bool {
        self.conns
            .get(client)
            .is_some_and(|conn| conn.state() == ConnState::Online)
    }

    pub fn client_addr(&self, client: usize) -> Option<SocketAddr> {
        self.conns.get(client).and_then(|conn| conn.peer_addr())
    }

    pub fn online_count(&self) -> usize {
        self.conns
            .iter()
            .filter(|conn| conn.state() == ConnState::Online)
            .count()
    }

    fn slot_of(&self, addr: SocketAddr) -> Option<usize> {
        self.conns.iter().position(|conn| {
            conn.peer_addr() == Some(addr)
                && matches!(conn.state(), ConnState::Online | ConnState::Error)
        })
    }

    fn free_slot(&self) -> Option<usize> {
        self.conns
            .iter()
            .position(|conn| conn.state() == ConnState::Offline)
    }

    /// Stateless per-address session token; survives server restarts only
    /// as long as the secret does, which is all the protocol needs.
    fn token_for(&self, addr: SocketAddr) -> u32 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.secret.hash(&mut hasher);
        addr.hash(&mut hasher);
        hasher.finish() as u32
    }

    /// Drains the socket, feeding packets to their connections and
    /// returning what the tick loop has to react to. Malformed datagrams
    /// are dropped without touching any state.
    pub fn recv(&mut self, now: Instant) -> Vec<NetEvent> {
        let mut events = Vec::new();
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            let (size, addr) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    log::error!("recv error: {err}");
                    break;
                }
            };
            let packet = match unpack_packet(&buf[..size]) {
                Ok(packet) => packet,
                Err(err) => {
                    log::debug!("dropping malformed packet from {addr}: {err}");
                    continue;
                }
            };

            if packet.flags.contains(PacketFlags::CONNLESS) {
                events.push(NetEvent::Connless {
                    addr,
                    data: packet.data,
                });
                continue;
            }

            let is_connect = packet.flags.contains(PacketFlags::CONTROL)
                && packet.data.first() == Some(&CTRLMSG_CONNECT);
            if is_connect {
                self.handle_connect(addr, now, &mut events);
                continue;
            }

            let Some(slot) = self.slot_of(addr) else {
                log::debug!("packet from unknown peer {addr}, dropped");
                continue;
            };

            match self.conns[slot].feed(&self.socket, &packet, addr, now) {
                FeedResult::Dropped | FeedResult::Control => {}
                FeedResult::Closed(reason) => {
                    log::info!("client {slot} ({addr}) closed: {reason}");
                    events.push(NetEvent::Disconnected {
                        client: slot,
                        reason,
                        remote: true,
                    });
                }
                FeedResult::Chunks => {
                    for chunk in packet::chunks(&packet) {
                        if chunk.flags.contains(ChunkFlags::VITAL) {
                            match self.conns[slot].accept_sequence(chunk.sequence) {
                                SeqAction::Accept => {}
                                SeqAction::Duplicate => continue,
                                SeqAction::OutOfOrder => {
                                    let _ = self.conns[slot].signal_resend(&self.socket, now);
                                    continue;
                                }
                            }
                        }
                        events.push(NetEvent::Chunk {
                            client: slot,
                            flags: chunk.flags,
                            data: chunk.data.to_vec(),
                        });
                    }
                }
            }
        }
        events
    }

    fn handle_connect(&mut self, addr: SocketAddr, now: Instant, events: &mut Vec<NetEvent>) {
        if let Some(slot) = self.slot_of(addr) {
            // retransmitted connect; the accept was lost
            let _ = self.conns[slot].send_connect_accept(&self.socket, now);
            return;
        }
        match self.free_slot() {
            Some(slot) => {
                let token = self.token_for(addr);
                self.conns[slot].accept(addr, token, now);
                let _ = self.conns[slot].send_connect_accept(&self.socket, now);
                log::info!("client {slot} connecting from {addr}");
                events.push(NetEvent::Connected { client: slot });
            }
            None => {
                let mut extra = b"This server is full".to_vec();
                extra.push(0);
                let _ = send_control(&self.socket, addr, 0, None, CTRLMSG_CLOSE, &extra);
                log::info!("refused {addr}: server is full");
            }
        }
    }

    pub fn send_chunk(
        &mut self,
        client: usize,
        vital: bool,
        data: &[u8],
        flush: bool,
        now: Instant,
    ) -> Result<(), ConnError> {
        let flags = if vital {
            ChunkFlags::VITAL
        } else {
            ChunkFlags::empty()
        };
        self.conns[client].queue_chunk(&self.socket, flags, data, now)?;
        if flush {
            self.conns[client].flush(&self.socket, now)?;
        }
        Ok(())
    }

    pub fn send_connless(&self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        send_connless(&self.socket, addr, data)
    }

    /// Per-tick maintenance over all slots: retransmissions, keepalives,
    /// timeout detection, and a flush of anything still queued. Returns
    /// disconnect events for slots that died.
    pub fn update(&mut self, now: Instant) -> Vec<NetEvent> {
        let mut events = Vec::new();
        for (slot, conn) in self.conns.iter_mut().enumerate() {
            if matches!(conn.state(), ConnState::Offline) {
                continue;
            }
            conn.update(&self.socket, now);
            if conn.state() == ConnState::Error {
                let reason = conn
                    .error_string()
                    .unwrap_or("connection error")
                    .to_string();
                log::info!(
                    "client {slot} ({}) dropped: {reason}",
                    conn.peer_addr()
                        .map_or_else(|| "?".to_string(), |a| a.to_string())
                );
                conn.disconnect(&self.socket, &reason, now);
                events.push(NetEvent::Disconnected {
                    client: slot,
                    reason,
                    remote: false,
                });
            } else {
                let _ = conn.flush(&self.socket, now);
            }
        }
        events
    }

    /// Tears one connection down, telling the peer why.
    pub fn drop_client(&mut self, client: usize, reason: &str, now: Instant) {
        if let Some(conn) = self.conns.get_mut(client) {
            conn.disconnect(&self.socket, reason, now);
        }
    }

    pub fn drop_all(&mut self, reason: &str, now: Instant) {
        for conn in &mut self.conns {
            conn.disconnect(&self.socket, reason, now);
        }
    }

    /// Blocks for at most `timeout` waiting for a datagram, without
    /// consuming it. This is the bounded wait at the bottom of the tick
    /// loop; everything else on the socket is non-blocking.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return true;
        }
        if self.socket.set_nonblocking(false).is_err() {
            return false;
        }
        let _ = self.socket.set_read_timeout(Some(timeout));
        let mut probe = [0u8; 1];
        let waiting = matches!(self.socket.peek_from(&mut probe), Ok(_));
        let _ = self.socket.set_nonblocking(true);
        waiting
    }
}
