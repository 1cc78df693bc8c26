use std::io;
use std::net::{SocketAddr, UdpSocket};

use bitflags::bitflags;

use super::NetError;
use super::huffman;

pub const MAX_PACKET_SIZE: usize = 1400;
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - 10;
pub const PACKET_HEADER_SIZE: usize = 3;
pub const TOKEN_SIZE: usize = 4;
pub const MAX_CHUNK_HEADER_SIZE: usize = 3;
pub const MAX_CHUNK_SIZE: usize = 1023;

pub const MAX_SEQUENCE: u32 = 1 << 10;
pub const SEQUENCE_MASK: u32 = MAX_SEQUENCE - 1;

pub const CTRLMSG_KEEPALIVE: u8 = 0;
pub const CTRLMSG_CONNECT: u8 = 1;
pub const CTRLMSG_CONNECTACCEPT: u8 = 2;
pub const CTRLMSG_CLOSE: u8 = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const CONTROL = 1 << 0;
        const CONNLESS = 1 << 1;
        const RESEND = 1 << 2;
        const COMPRESSION = 1 << 3;
        const TOKEN = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        const VITAL = 1 << 0;
        const RESEND = 1 << 1;
    }
}

/// Fixed packet header: flags:6/ack-high:2, ack-low:8, num-chunks:8, plus a
/// 4-byte token when the TOKEN flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub ack: u32,
    pub num_chunks: u8,
    pub token: Option<u32>,
}

impl PacketHeader {
    pub fn pack(&self, dst: &mut Vec<u8>) {
        let mut flags = self.flags;
        flags.set(PacketFlags::TOKEN, self.token.is_some());
        dst.push((flags.bits() << 2) | ((self.ack >> 8) as u8 & 0x03));
        dst.push((self.ack & 0xff) as u8);
        dst.push(self.num_chunks);
        if let Some(token) = self.token {
            dst.extend_from_slice(&token.to_be_bytes());
        }
    }

    pub fn unpack(src: &[u8]) -> Result<(Self, usize), NetError> {
        if src.len() < PACKET_HEADER_SIZE {
            return Err(NetError::TruncatedHeader);
        }
        let flags = PacketFlags::from_bits_truncate(src[0] >> 2);
        let ack = (((src[0] & 0x03) as u32) << 8) | src[1] as u32;
        let num_chunks = src[2];
        let mut used = PACKET_HEADER_SIZE;
        let token = if flags.contains(PacketFlags::TOKEN) {
            if src.len() < PACKET_HEADER_SIZE + TOKEN_SIZE {
                return Err(NetError::TruncatedHeader);
            }
            used += TOKEN_SIZE;
            Some(u32::from_be_bytes(src[3..7].try_into().unwrap()))
        } else {
            None
        };
        Ok((
            Self {
                flags,
                ack,
                num_chunks,
                token,
            },
            used,
        ))
    }
}

/// Chunk sub-header: flags:2/size-high:6, size-low:4/seq-high:4, plus a
/// seq-low byte when the VITAL flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: ChunkFlags,
    pub size: usize,
    pub sequence: u32,
}

impl ChunkHeader {
    pub fn pack(&self, dst: &mut Vec<u8>) {
        dst.push((self.flags.bits() << 6) | ((self.size >> 4) as u8 & 0x3f));
        if self.flags.contains(ChunkFlags::VITAL) {
            dst.push((((self.size & 0x0f) as u8) << 4) | ((self.sequence >> 8) as u8 & 0x0f));
            dst.push((self.sequence & 0xff) as u8);
        } else {
            dst.push(((self.size & 0x0f) as u8) << 4);
        }
    }

    pub fn unpack(src: &[u8]) -> Result<(Self, usize), NetError> {
        if src.len() < 2 {
            return Err(NetError::TruncatedChunk);
        }
        let flags = ChunkFlags::from_bits_truncate(src[0] >> 6);
        let size = (((src[0] & 0x3f) as usize) << 4) | ((src[1] >> 4) as usize);
        if flags.contains(ChunkFlags::VITAL) {
            if src.len() < 3 {
                return Err(NetError::TruncatedChunk);
            }
            let sequence = (((src[1] & 0x0f) as u32) << 8) | src[2] as u32;
            Ok((
                Self {
                    flags,
                    size,
                    sequence,
                },
                3,
            ))
        } else {
            Ok((
                Self {
                    flags,
                    size,
                    sequence: 0,
                },
                2,
            ))
        }
    }
}

/// Working buffer for one outgoing or incoming packet.
#[derive(Debug, Clone, Default)]
pub struct PacketConstruct {
    pub flags: PacketFlags,
    pub ack: u32,
    pub num_chunks: u8,
    pub token: Option<u32>,
    pub data: Vec<u8>,
}

impl PacketConstruct {
    pub fn clear(&mut self) {
        self.flags = PacketFlags::empty();
        self.ack = 0;
        self.num_chunks = 0;
        self.token = None;
        self.data.clear();
    }
}

/// Serializes a packet to its on-wire form. The chunk area is compressed
/// with the shared Huffman table when that actually shrinks it; control
/// packets always go out uncompressed so a peer can parse them before any
/// shared state exists.
pub fn pack_packet(packet: &PacketConstruct) -> Vec<u8> {
    let mut flags = packet.flags;
    let compressed;
    let payload: &[u8] = if flags.contains(PacketFlags::CONTROL) {
        &packet.data
    } else {
        compressed = huffman::compress(&packet.data);
        if compressed.len() < packet.data.len() {
            flags |= PacketFlags::COMPRESSION;
            &compressed
        } else {
            &packet.data
        }
    };

    let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + TOKEN_SIZE + payload.len());
    PacketHeader {
        flags,
        ack: packet.ack & SEQUENCE_MASK,
        num_chunks: packet.num_chunks,
        token: packet.token,
    }
    .pack(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

pub fn send_packet(
    socket: &UdpSocket,
    addr: SocketAddr,
    packet: &PacketConstruct,
) -> io::Result<usize> {
    socket.send_to(&pack_packet(packet), addr)
}

/// Parses a received datagram into a [`PacketConstruct`], undoing payload
/// compression. Malformed input is an error for the caller to drop.
pub fn unpack_packet(buf: &[u8]) -> Result<PacketConstruct, NetError> {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(NetError::Oversize);
    }
    let (header, used) = PacketHeader::unpack(buf)?;
    let rest = &buf[used..];

    if header.flags.contains(PacketFlags::CONNLESS) {
        return Ok(PacketConstruct {
            flags: PacketFlags::CONNLESS,
            ack: 0,
            num_chunks: 0,
            token: None,
            data: rest.to_vec(),
        });
    }

    let data = if header.flags.contains(PacketFlags::COMPRESSION) {
        if header.flags.contains(PacketFlags::CONTROL) {
            return Err(NetError::CorruptData);
        }
        huffman::decompress(rest, MAX_PAYLOAD).map_err(|_| NetError::CorruptData)?
    } else {
        rest.to_vec()
    };

    Ok(PacketConstruct {
        flags: header.flags,
        ack: header.ack,
        num_chunks: header.num_chunks,
        token: header.token,
        data,
    })
}

pub fn send_control(
    socket: &UdpSocket,
    addr: SocketAddr,
    ack: u32,
    token: Option<u32>,
    ctrl: u8,
    extra: &[u8],
) -> io::Result<usize> {
    let mut data = Vec::with_capacity(1 + extra.len());
    data.push(ctrl);
    data.extend_from_slice(extra);
    send_packet(
        socket,
        addr,
        &PacketConstruct {
            flags: PacketFlags::CONTROL,
            ack,
            num_chunks: 0,
            token,
            data,
        },
    )
}

pub fn send_connless(socket: &UdpSocket, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
    send_packet(
        socket,
        addr,
        &PacketConstruct {
            flags: PacketFlags::CONNLESS,
            ack: 0,
            num_chunks: 0,
            token: None,
            data: data.to_vec(),
        },
    )
}

/// One chunk as sliced out of a received packet's chunk area.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub flags: ChunkFlags,
    pub sequence: u32,
    pub data: &'a [u8],
}

/// Walks the chunk area of a received packet. Stops at the first malformed
/// chunk header; the remainder of the packet is dropped.
pub struct ChunkIter<'a> {
    data: &'a [u8],
    remaining: u8,
}

pub fn chunks(packet: &PacketConstruct) -> ChunkIter<'_> {
    ChunkIter {
        data: &packet.data,
        remaining: packet.num_chunks,
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.remaining == 0 {
            return None;
        }
        let (header, used) = match ChunkHeader::unpack(self.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("dropping malformed chunk area: {err}");
                self.remaining = 0;
                return None;
            }
        };
        if used + header.size > self.data.len() {
            log::debug!("chunk size exceeds packet payload, dropping rest");
            self.remaining = 0;
            return None;
        }
        let chunk = Chunk {
            flags: header.flags,
            sequence: header.sequence,
            data: &self.data[used..used + header.size],
        };
        self.data = &self.data[used + header.size..];
        self.remaining -= 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        for ack in [0u32, 1, 511, 512, 1023] {
            for num_chunks in [0u8, 1, 17, 255] {
                for token in [None, Some(0xdead_beef)] {
                    let mut flags = PacketFlags::RESEND;
                    flags.set(PacketFlags::TOKEN, token.is_some());
                    let header = PacketHeader {
                        flags,
                        ack,
                        num_chunks,
                        token,
                    };
                    let mut buf = Vec::new();
                    header.pack(&mut buf);
                    let (parsed, used) = PacketHeader::unpack(&buf).unwrap();
                    assert_eq!(used, buf.len());
                    assert_eq!(parsed, header);
                }
            }
        }
    }

    #[test]
    fn test_packet_header_truncated() {
        assert!(PacketHeader::unpack(&[0x00, 0x01]).is_err());
        // token flag set but no token bytes
        let mut buf = Vec::new();
        PacketHeader {
            flags: PacketFlags::TOKEN,
            ack: 0,
            num_chunks: 0,
            token: Some(1),
        }
        .pack(&mut buf);
        assert!(PacketHeader::unpack(&buf[..4]).is_err());
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        for size in [0usize, 1, 15, 16, 63, 64, 1023] {
            for (flags, sequence) in [
                (ChunkFlags::empty(), 0u32),
                (ChunkFlags::VITAL, 0),
                (ChunkFlags::VITAL, 1023),
                (ChunkFlags::VITAL | ChunkFlags::RESEND, 512),
            ] {
                let header = ChunkHeader {
                    flags,
                    size,
                    sequence,
                };
                let mut buf = Vec::new();
                header.pack(&mut buf);
                let (parsed, used) = ChunkHeader::unpack(&buf).unwrap();
                assert_eq!(used, buf.len());
                assert_eq!(parsed, header);
            }
        }
    }

    #[test]
    fn test_pack_unpack_with_compression() {
        let mut construct = PacketConstruct {
            flags: PacketFlags::empty(),
            ack: 77,
            num_chunks: 1,
            token: Some(0x1234_5678),
            data: Vec::new(),
        };
        ChunkHeader {
            flags: ChunkFlags::empty(),
            size: 500,
            sequence: 0,
        }
        .pack(&mut construct.data);
        construct.data.extend(std::iter::repeat_n(0u8, 500));

        let wire = pack_packet(&construct);
        assert!(wire.len() < construct.data.len());

        let parsed = unpack_packet(&wire).unwrap();
        assert_eq!(parsed.ack, 77);
        assert_eq!(parsed.num_chunks, 1);
        assert_eq!(parsed.token, Some(0x1234_5678));
        assert_eq!(parsed.data, construct.data);

        let chunk = chunks(&parsed).next().unwrap();
        assert_eq!(chunk.data.len(), 500);
    }

    #[test]
    fn test_unpack_connless() {
        let mut construct = PacketConstruct::default();
        construct.flags = PacketFlags::CONNLESS;
        construct.data = b"\xff\xff\xff\xffinfo".to_vec();
        let wire = pack_packet(&construct);
        let parsed = unpack_packet(&wire).unwrap();
        assert!(parsed.flags.contains(PacketFlags::CONNLESS));
        assert_eq!(parsed.data, construct.data);
    }

    #[test]
    fn test_chunk_iter_stops_on_garbage() {
        let parsed = PacketConstruct {
            flags: PacketFlags::empty(),
            ack: 0,
            num_chunks: 3,
            token: None,
            // claims three chunks but holds half a header
            data: vec![0xc0],
        };
        assert_eq!(chunks(&parsed).count(), 0);
    }

    #[test]
    fn test_control_never_compressed() {
        let construct = PacketConstruct {
            flags: PacketFlags::CONTROL,
            ack: 3,
            num_chunks: 0,
            token: None,
            data: vec![CTRLMSG_KEEPALIVE; 200],
        };
        let wire = pack_packet(&construct);
        let (header, _) = PacketHeader::unpack(&wire).unwrap();
        assert!(!header.flags.contains(PacketFlags::COMPRESSION));
    }
}
