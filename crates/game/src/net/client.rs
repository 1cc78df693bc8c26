use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::connection::{ConnError, ConnState, Connection, FeedResult, SeqAction};
use super::packet::{
    self, ChunkFlags, MAX_PACKET_SIZE, PacketFlags, send_connless, unpack_packet,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake completed; the connection is online.
    Connected,
    Chunk { flags: ChunkFlags, data: Vec<u8> },
    Connless { addr: SocketAddr, data: Vec<u8> },
    Closed(String),
}

/// The client-side endpoint: one socket, one connection to a server.
#[derive(Debug)]
pub struct NetClient {
    socket: UdpSocket,
    conn: Connection,
}

impl NetClient {
    pub fn open<A: ToSocketAddrs>(bind: A, timeout: Duration, now: Instant) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            conn: Connection::new(now, timeout),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    pub fn error_string(&self) -> Option<&str> {
        self.conn.error_string()
    }

    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> io::Result<()> {
        self.conn.connect(&self.socket, addr, now)
    }

    pub fn disconnect(&mut self, reason: &str, now: Instant) {
        self.conn.disconnect(&self.socket, reason, now);
    }

    pub fn recv(&mut self, now: Instant) -> Vec<ClientEvent> {
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
                events.push(ClientEvent::Connless {
                    addr,
                    data: packet.data,
                });
                continue;
            }

            let was_connecting = self.conn.state() == ConnState::Connecting;
            match self.conn.feed(&self.socket, &packet, addr, now) {
                FeedResult::Dropped => {}
                FeedResult::Control => {
                    if was_connecting && self.conn.state() == ConnState::Online {
                        events.push(ClientEvent::Connected);
                    }
                }
                FeedResult::Closed(reason) => events.push(ClientEvent::Closed(reason)),
                FeedResult::Chunks => {
                    for chunk in packet::chunks(&packet) {
                        if chunk.flags.contains(ChunkFlags::VITAL) {
                            match self.conn.accept_sequence(chunk.sequence) {
                                SeqAction::Accept => {}
                                SeqAction::Duplicate => continue,
                                SeqAction::OutOfOrder => {
                                    let _ = self.conn.signal_resend(&self.socket, now);
                                    continue;
                                }
                            }
                        }
                        events.push(ClientEvent::Chunk {
                            flags: chunk.flags,
                            data: chunk.data.to_vec(),
                        });
                    }
                }
            }
        }
        events
    }

    pub fn send_chunk(
        &mut self,
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
        self.conn.queue_chunk(&self.socket, flags, data, now)?;
        if flush {
            self.conn.flush(&self.socket, now)?;
        }
        Ok(())
    }

    pub fn send_connless(&self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        send_connless(&self.socket, addr, data)
    }

    pub fn flush(&mut self, now: Instant) -> io::Result<usize> {
        self.conn.flush(&self.socket, now)
    }

    /// Once-per-frame maintenance; mirrors the server-side update.
    pub fn update(&mut self, now: Instant) {
        self.conn.update(&self.socket, now);
        let _ = self.conn.flush(&self.socket, now);
    }

    /// True when the link has been silent long enough that the user should
    /// be warned, before the hard timeout kills it.
    pub fn got_problems(&self, now: Instant) -> bool {
        self.conn.state() == ConnState::Online && self.conn.got_problems(now)
    }
}
