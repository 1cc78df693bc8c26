pub mod net;
pub mod snapshot;
pub mod world;

pub use net::{
    ChunkFlags, ClientEvent, ConnError, ConnState, Connection, FeedResult, MAX_PACKET_SIZE,
    MAX_PAYLOAD, MAX_SEQUENCE, NetClient, NetError, NetEvent, NetServer, PacketFlags, Packer,
    SystemMsg, Unpacker,
};
pub use snapshot::{
    MAX_SNAPSHOT_PACK, MAX_SNAPSHOT_SIZE, SnapError, SnapIdPool, SnapItem, Snapshot,
    SnapshotBuilder, SnapshotDelta, SnapshotStorage, item_key, key_id, key_type,
};
pub use world::{ArenaWorld, ITEM_PLAYER, ITEM_PROJECTILE, Simulation, SnapWriter, TickContext};
