use std::thread;
use std::time::{Duration, Instant};

use ricochet::net::msg::SystemMsg;
use ricochet::net::varint;
use ricochet::net::{ClientEvent, ConnState, NetClient, NetServer, Packer, Unpacker, unpack_msg_id};
use ricochet::snapshot::{
    MAX_SNAPSHOT_PACK, MAX_SNAPSHOT_SIZE, Snapshot, SnapshotBuilder, SnapshotDelta,
    SnapshotStorage,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn establish(server: &mut NetServer, client: &mut NetClient) {
    client.connect(server.local_addr(), Instant::now()).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        let now = Instant::now();
        let _ = server.recv(now);
        let _ = server.update(now);
        let _ = client.recv(now);
        client.update(now);
        if client.state() == ConnState::Online && server.online_count() == 1 {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("handshake did not complete");
}

fn big_snapshot(builder: &mut SnapshotBuilder, items: i32, salt: i32) -> Snapshot {
    builder.init(Some(0));
    for id in 0..items {
        let words = builder.new_item(1, id, 2).unwrap();
        words[0] = id * 3 + salt;
        words[1] = -id;
    }
    builder.finish()
}

/// The full transmit pipeline: delta → varint words → fragmentation into
/// Snap messages → chunks over UDP → reassembly → decompression → apply.
#[test]
fn test_snapshot_delta_fragments_and_reassembles() {
    let now = Instant::now();
    let mut server = NetServer::open("127.0.0.1:0", 4, Duration::from_secs(10), now).unwrap();
    let mut client = NetClient::open("127.0.0.1:0", Duration::from_secs(10), now).unwrap();
    establish(&mut server, &mut client);

    let mut builder = SnapshotBuilder::new(MAX_SNAPSHOT_SIZE);
    let delta = SnapshotDelta::new();
    let target = big_snapshot(&mut builder, 400, 7);

    let words = delta.create_delta(Snapshot::empty(), &target);
    let payload = varint::compress_words(&words);
    assert!(payload.len() > MAX_SNAPSHOT_PACK, "need a multi-part delta");

    let tick = 120;
    let crc = target.crc();
    let num_parts = payload.len().div_ceil(MAX_SNAPSHOT_PACK);
    let now = Instant::now();
    for part in 0..num_parts {
        let end = ((part + 1) * MAX_SNAPSHOT_PACK).min(payload.len());
        let msg = SystemMsg::Snap {
            tick,
            delta_tick: tick + 1,
            num_parts: num_parts as i32,
            part: part as i32,
            crc,
            data: payload[part * MAX_SNAPSHOT_PACK..end].to_vec(),
        };
        let mut packer = Packer::new(1023);
        msg.pack(&mut packer).unwrap();
        server
            .send_chunk(0, false, packer.data(), true, now)
            .unwrap();
    }

    // reassemble on the client
    let mut parts: Vec<Option<Vec<u8>>> = vec![None; num_parts];
    let deadline = Instant::now() + TIMEOUT;
    while parts.iter().any(|p| p.is_none()) && Instant::now() < deadline {
        let now = Instant::now();
        let _ = server.recv(now);
        let _ = server.update(now);
        for event in client.recv(now) {
            let ClientEvent::Chunk { data, .. } = event else {
                continue;
            };
            let mut unpacker = Unpacker::new(&data);
            let (msg_id, system) = unpack_msg_id(unpacker.get_int().unwrap());
            assert!(system);
            match SystemMsg::unpack(msg_id, &mut unpacker).unwrap() {
                SystemMsg::Snap {
                    tick: got_tick,
                    num_parts: got_parts,
                    part,
                    crc: got_crc,
                    data,
                    ..
                } => {
                    assert_eq!(got_tick, tick);
                    assert_eq!(got_parts as usize, num_parts);
                    assert_eq!(got_crc, crc);
                    parts[part as usize] = Some(data);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    let mut reassembled = Vec::new();
    for part in parts {
        reassembled.extend(part.expect("missing snapshot part"));
    }
    let received_words = varint::decompress_words(&reassembled).unwrap();
    assert_eq!(received_words, words);

    let rebuilt = delta.apply_delta(Snapshot::empty(), &received_words).unwrap();
    assert_eq!(rebuilt, target);
    assert_eq!(rebuilt.crc(), crc);
}

/// A base acked long ago and since purged from the ring must force a full
/// empty-base delta, not a crash or a stale diff.
#[test]
fn test_purged_base_forces_full_delta() {
    let mut builder = SnapshotBuilder::new(MAX_SNAPSHOT_SIZE);
    let delta = SnapshotDelta::new();
    let mut storage = SnapshotStorage::new();

    let tick_rate = 50;
    let old = big_snapshot(&mut builder, 10, 1);
    storage.add(100, old);

    // three seconds pass; the ring only keeps the recent window
    let current_tick = 100 + tick_rate * 4;
    storage.purge_until(current_tick - tick_rate * 3);
    assert!(storage.get(100).is_none());

    let target = big_snapshot(&mut builder, 10, 2);
    let base = match storage.get(100) {
        Some(base) => base,
        None => Snapshot::empty(),
    };
    let words = delta.create_delta(base, &target);

    // identical to a from-scratch full snapshot
    assert_eq!(words, delta.create_delta(Snapshot::empty(), &target));
    let rebuilt = delta.apply_delta(Snapshot::empty(), &words).unwrap();
    assert_eq!(rebuilt, target);
}
