pub mod client;
pub mod connection;
pub mod huffman;
pub mod msg;
pub mod packet;
pub mod server;
pub mod varint;

use thiserror::Error;

pub use client::{ClientEvent, NetClient};
pub use connection::{
    ConnError, ConnState, Connection, FeedResult, RESEND_BUFFER_CAPACITY, SeqAction,
    is_seq_in_backroom,
};
pub use msg::{SystemMsg, pack_msg_id, unpack_msg_id};
pub use packet::{
    ChunkFlags, MAX_PACKET_SIZE, MAX_PAYLOAD, MAX_SEQUENCE, PacketFlags, SEQUENCE_MASK,
};
pub use server::{NetEvent, NetServer};
pub use varint::{Packer, Unpacker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("buffer too short for packet header")]
    TruncatedHeader,
    #[error("buffer too short for chunk header")]
    TruncatedChunk,
    #[error("packet exceeds maximum size")]
    Oversize,
    #[error("corrupt compressed payload")]
    CorruptData,
}

/// Process-local randomness without a dependency: hash the current time
/// through a randomly seeded hasher. Good enough for session tokens, not
/// for anything cryptographic.
pub(crate) fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64,
    );
    hasher.finish()
}
