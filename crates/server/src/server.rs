use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use ricochet::net::msg::SystemMsg;
use ricochet::net::varint::{self, Packer, Unpacker};
use ricochet::net::{ConnError, NetEvent, NetServer, unpack_msg_id};
use ricochet::snapshot::{
    MAX_SNAPSHOT_PACK, SnapIdPool, Snapshot, SnapshotBuilder, SnapshotDelta, SnapshotStorage,
};
use ricochet::world::{Simulation, SnapWriter, TickContext};

use crate::config::ServerConfig;
use crate::demo::DemoRecorder;
use crate::events::{DisconnectReason, ServerEvent};
use crate::jobs::JobQueue;

pub const PROTOCOL_VERSION: &str = "0.1";

/// Headroom below the varint-friendly range; reaching it forces a world
/// re-init so the server can run forever under a bounded tick counter.
const TICK_WRAP_GUARD: i32 = 0x5FFF_FFFF;

/// Clients without a usable delta base get a snapshot once a second; fresh
/// clients every 10 ticks until their first ack.
const RECOVER_INTERVAL_TICKS: i32 = 50;
const INIT_INTERVAL_TICKS: i32 = 10;

const MAX_INPUT_BACKLOG: usize = 64;
const VISIBLE_IDS: usize = 64;
const MAX_MSG_SIZE: usize = 1023;

pub const SERVERBROWSE_GETINFO: &[u8] = b"\xff\xff\xff\xffinfo";
pub const SERVERBROWSE_GETINFO64: &[u8] = b"\xff\xff\xff\xffin64";
pub const SERVERBROWSE_GETINFO_EXT: &[u8] = b"\xff\xff\xff\xffiext";
pub const SERVERBROWSE_INFO: &[u8] = b"\xff\xff\xff\xffinf2";
pub const SERVERBROWSE_INFO64: &[u8] = b"\xff\xff\xff\xffin62";
pub const SERVERBROWSE_INFO_EXT: &[u8] = b"\xff\xff\xff\xffiex2";

/// Pure tick scheduling: tick N starts at `start + N / tick_rate`,
/// regardless of how raggedly the loop gets to run.
#[derive(Debug, Clone, Copy)]
pub struct TickPacer {
    start: Instant,
    tick_rate: u32,
}

impl TickPacer {
    pub fn new(start: Instant, tick_rate: u32) -> Self {
        Self { start, tick_rate }
    }

    pub fn start_of(&self, tick: i32) -> Instant {
        let nanos = tick.max(0) as u64 as u128 * 1_000_000_000u128 / self.tick_rate as u128;
        self.start + Duration::from_nanos(nanos as u64)
    }

    /// How many ticks past `current` have had their start time pass.
    pub fn ticks_due(&self, now: Instant, current: i32) -> i32 {
        let mut due = 0;
        while now > self.start_of(current + due + 1) {
            due += 1;
        }
        due
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Empty,
    /// Net-connected, Info not yet received.
    Connecting,
    /// Info accepted, ConReady sent, waiting for EnterGame.
    Ready,
    InGame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapRate {
    Init,
    Full,
    Recover,
}

#[derive(Debug)]
struct Client {
    state: ClientState,
    addr: Option<SocketAddr>,
    name: String,
    snap_rate: SnapRate,
    last_acked_snapshot: i32,
    snapshots: SnapshotStorage,
    inputs: VecDeque<(i32, Vec<i32>)>,
    id_map: Vec<i32>,
}

impl Client {
    fn new() -> Self {
        Self {
            state: ClientState::Empty,
            addr: None,
            name: String::new(),
            snap_rate: SnapRate::Init,
            last_acked_snapshot: 0,
            snapshots: SnapshotStorage::new(),
            inputs: VecDeque::new(),
            id_map: vec![-1; VISIBLE_IDS],
        }
    }

    fn reset(&mut self) {
        self.state = ClientState::Empty;
        self.addr = None;
        self.name.clear();
        self.snap_rate = SnapRate::Init;
        self.last_acked_snapshot = 0;
        self.snapshots.purge_all();
        self.inputs.clear();
        self.id_map.iter_mut().for_each(|id| *id = -1);
    }

    fn in_game(&self) -> bool {
        self.state == ClientState::InGame
    }
}

#[derive(Debug, Default)]
struct InfoCache {
    vanilla: Vec<u8>,
    legacy64: Vec<u8>,
    extended: Vec<u8>,
    dirty: bool,
}

/// The dedicated server: wall-clock-paced simulation, per-client snapshot
/// deltas, and the network pump, all on one thread.
pub struct GameServer<S: Simulation> {
    net: NetServer,
    sim: S,
    config: ServerConfig,
    clients: Vec<Client>,
    builder: SnapshotBuilder,
    delta: SnapshotDelta,
    ids: SnapIdPool,
    jobs: JobQueue,
    demo: Option<DemoRecorder>,
    current_tick: i32,
    game_start: Instant,
    info: InfoCache,
    info_window_start: Instant,
    info_window_count: u32,
    running: Arc<AtomicBool>,
    pending_events: VecDeque<ServerEvent>,
}

impl<S: Simulation> GameServer<S> {
    pub fn new(config: ServerConfig, sim: S) -> anyhow::Result<Self> {
        let now = Instant::now();
        let net = NetServer::open(
            config.bind_addr(),
            config.max_clients,
            Duration::from_secs(config.conn_timeout_secs),
            now,
        )
        .with_context(|| format!("binding {}", config.bind_addr()))?;

        let demo = match &config.demo_path {
            Some(path) => Some(DemoRecorder::create(path.as_ref())?),
            None => None,
        };

        Ok(Self {
            net,
            sim,
            clients: (0..config.max_clients).map(|_| Client::new()).collect(),
            builder: SnapshotBuilder::new(config.snapshot_budget),
            delta: SnapshotDelta::new(),
            ids: SnapIdPool::new(
                config.snap_id_capacity,
                Duration::from_secs(config.snap_id_reuse_delay_secs),
                now,
            ),
            jobs: JobQueue::new(),
            demo,
            current_tick: 0,
            game_start: now,
            info: InfoCache {
                dirty: true,
                ..InfoCache::default()
            },
            info_window_start: now,
            info_window_count: 0,
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.net.local_addr()
    }

    pub fn tick(&self) -> i32 {
        self.current_tick
    }

    pub fn tick_rate(&self) -> i32 {
        self.config.tick_rate as i32
    }

    /// Handle for stopping the loop from a signal handler or a test.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn pacer(&self) -> TickPacer {
        TickPacer::new(self.game_start, self.config.tick_rate)
    }

    /// Maps a client-visible object id back to a global id, for games that
    /// window the set of visible players.
    pub fn translate_id(&self, client: usize, visible: usize) -> Option<i32> {
        let id = *self.clients.get(client)?.id_map.get(visible)?;
        (id >= 0).then_some(id)
    }

    pub fn clear_id_map(&mut self, client: usize) {
        let map = &mut self.clients[client].id_map;
        map.iter_mut().for_each(|id| *id = -1);
        map[0] = client as i32;
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        self.game_start = now;
        let mut ctx = TickContext {
            tick: 0,
            tick_rate: self.config.tick_rate as i32,
            now,
            ids: &mut self.ids,
        };
        self.sim.on_init(&mut ctx);

        log::info!(
            "server '{}' listening on {} ({} slots, {} ticks/s)",
            self.config.name,
            self.net.local_addr(),
            self.config.max_clients,
            self.config.tick_rate
        );

        while self.running.load(Ordering::SeqCst) {
            self.tick_once();

            let now = Instant::now();
            let next = self.pacer().start_of(self.current_tick + 1);
            if let Some(wait) = next.checked_duration_since(now) {
                self.net.wait_for_data(wait);
            }
        }

        self.shutdown();
        Ok(())
    }

    /// One pass of the loop body: catch up on due ticks, snapshot, pump.
    /// Split out from [`GameServer::run`] so tests can drive it.
    pub fn tick_once(&mut self) {
        let now = Instant::now();

        if self.current_tick >= TICK_WRAP_GUARD {
            self.reinit_world(now);
        }

        let mut new_ticks = 0;
        while now > self.pacer().start_of(self.current_tick + 1) {
            self.current_tick += 1;
            new_ticks += 1;
            self.apply_inputs(now);
            let mut ctx = TickContext {
                tick: self.current_tick,
                tick_rate: self.config.tick_rate as i32,
                now,
                ids: &mut self.ids,
            };
            self.sim.on_tick(&mut ctx);
        }

        if new_ticks > 0 && (self.config.high_bandwidth || self.current_tick % 2 == 0) {
            self.do_snapshot(now);
        }

        if self.info.dirty {
            self.rebuild_info_cache();
        }

        self.pump_network(now);

        for outcome in self.jobs.drain() {
            if let Err(err) = outcome.result {
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("background job '{}' failed: {err:#}", outcome.label),
                });
            }
        }

        self.drain_events();
    }

    fn shutdown(&mut self) {
        let now = Instant::now();
        for client in 0..self.clients.len() {
            if self.clients[client].state != ClientState::Empty {
                self.drop_client(client, DisconnectReason::Shutdown, "Server shutdown", now);
            }
        }
        self.net.drop_all("Server shutdown", now);

        let mut ctx = TickContext {
            tick: self.current_tick,
            tick_rate: self.config.tick_rate as i32,
            now,
            ids: &mut self.ids,
        };
        self.sim.on_shutdown(&mut ctx);

        if let Some(demo) = &mut self.demo {
            demo.finish(&self.jobs);
        }
        self.drain_events();
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.pending_events.pop_front() {
            match event {
                ServerEvent::ClientConnecting { client, addr } => {
                    log::info!("client {client} connecting from {addr}");
                }
                ServerEvent::ClientEntered { client, name } => {
                    log::info!("client {client} entered the game as '{name}'");
                }
                ServerEvent::ClientDisconnected {
                    client,
                    kind,
                    detail,
                } => {
                    log::info!("client {client} {}: {detail}", kind.as_str());
                }
                ServerEvent::WorldReinit { at_tick } => {
                    log::warn!("tick counter reached {at_tick}, world re-initialized");
                }
                ServerEvent::Error { message } => log::error!("{message}"),
            }
        }
    }

    fn apply_inputs(&mut self, now: Instant) {
        for client_id in 0..self.clients.len() {
            if !self.clients[client_id].in_game() {
                continue;
            }
            while let Some((tick, _)) = self.clients[client_id].inputs.front() {
                if *tick < self.current_tick {
                    self.clients[client_id].inputs.pop_front();
                } else {
                    break;
                }
            }
            let input = self.clients[client_id]
                .inputs
                .iter()
                .find(|(tick, _)| *tick == self.current_tick)
                .cloned();
            if let Some((_, words)) = input {
                let mut ctx = TickContext {
                    tick: self.current_tick,
                    tick_rate: self.config.tick_rate as i32,
                    now,
                    ids: &mut self.ids,
                };
                self.sim.on_client_input(&mut ctx, client_id, &words);
            }
        }
    }

    fn pump_network(&mut self, now: Instant) {
        let events = self.net.recv(now);
        for event in events {
            match event {
                NetEvent::Connected { client } => {
                    self.clients[client].reset();
                    self.clients[client].state = ClientState::Connecting;
                    self.clients[client].addr = self.net.client_addr(client);
                    if let Some(addr) = self.clients[client].addr {
                        self.pending_events
                            .push_back(ServerEvent::ClientConnecting { client, addr });
                    }
                }
                NetEvent::Chunk { client, data, .. } => {
                    self.process_client_message(client, &data, now);
                }
                NetEvent::Connless { addr, data } => {
                    self.process_connless(addr, &data, now);
                }
                NetEvent::Disconnected {
                    client,
                    reason,
                    remote,
                } => {
                    let kind = if remote {
                        DisconnectReason::Graceful
                    } else {
                        DisconnectReason::Timeout
                    };
                    self.on_client_gone(client, kind, &reason, now);
                }
            }
        }

        for event in self.net.update(now) {
            if let NetEvent::Disconnected { client, reason, .. } = event {
                self.on_client_gone(client, DisconnectReason::Timeout, &reason, now);
            }
        }
    }

    fn process_client_message(&mut self, client: usize, data: &[u8], now: Instant) {
        let mut unpacker = Unpacker::new(data);
        let Ok(raw) = unpacker.get_int() else {
            return;
        };
        let (msg_id, system) = unpack_msg_id(raw);

        if !system {
            if self.clients[client].in_game() {
                let mut ctx = TickContext {
                    tick: self.current_tick,
                    tick_rate: self.config.tick_rate as i32,
                    now,
                    ids: &mut self.ids,
                };
                self.sim.on_message(&mut ctx, client, msg_id, &mut unpacker);
            }
            return;
        }

        let msg = match SystemMsg::unpack(msg_id, &mut unpacker) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("client {client} sent malformed system msg {msg_id}: {err}");
                return;
            }
        };

        match msg {
            SystemMsg::Info {
                version,
                name,
                password,
            } if self.clients[client].state == ClientState::Connecting => {
                if version != PROTOCOL_VERSION {
                    let reason = format!("Wrong version. Server is running '{PROTOCOL_VERSION}'");
                    self.kick(client, &reason, now);
                    return;
                }
                if !self.config.password.is_empty() && password != self.config.password {
                    self.kick(client, "Wrong password", now);
                    return;
                }
                let mut name = name.trim().to_string();
                name.truncate(24);
                if name.is_empty() {
                    name = format!("player {client}");
                }
                self.clients[client].name = name;
                self.clients[client].state = ClientState::Ready;
                self.send_system_msg(client, &SystemMsg::ConReady, true, true, now);
            }
            SystemMsg::EnterGame if self.clients[client].state == ClientState::Ready => {
                self.clients[client].state = ClientState::InGame;
                self.clients[client].snap_rate = SnapRate::Init;
                self.clear_id_map(client);
                self.info.dirty = true;
                let mut ctx = TickContext {
                    tick: self.current_tick,
                    tick_rate: self.config.tick_rate as i32,
                    now,
                    ids: &mut self.ids,
                };
                self.sim.on_client_enter(&mut ctx, client);
                self.pending_events.push_back(ServerEvent::ClientEntered {
                    client,
                    name: self.clients[client].name.clone(),
                });
            }
            SystemMsg::Input {
                acked_tick,
                intended_tick,
                data,
            } if self.clients[client].in_game() => {
                self.clients[client].last_acked_snapshot = acked_tick;
                if acked_tick > 0 {
                    self.clients[client].snap_rate = SnapRate::Full;
                }

                let mut intended = intended_tick;
                if intended <= self.current_tick {
                    intended = self.current_tick + 1;
                }

                let time_left = signed_micros_until(self.pacer().start_of(intended), now);
                self.send_system_msg(
                    client,
                    &SystemMsg::InputTiming {
                        intended_tick: intended,
                        time_left,
                    },
                    false,
                    false,
                    now,
                );

                let inputs = &mut self.clients[client].inputs;
                if inputs.len() >= MAX_INPUT_BACKLOG {
                    inputs.pop_front();
                }
                inputs.push_back((intended, data));
            }
            _ => {
                // valid message in the wrong state; drop without touching
                // the connection
                log::debug!("client {client} sent msg {msg_id} in wrong state");
            }
        }
    }

    fn send_system_msg(
        &mut self,
        client: usize,
        msg: &SystemMsg,
        vital: bool,
        flush: bool,
        now: Instant,
    ) {
        let mut packer = Packer::new(MAX_MSG_SIZE);
        if msg.pack(&mut packer).is_err() {
            log::error!("system msg {} too large for a chunk", msg.msg_id());
            return;
        }
        match self.net.send_chunk(client, vital, packer.data(), flush, now) {
            Ok(()) => {}
            Err(ConnError::BufferOverflow) => {
                // backpressure failure; this one peer has to go
                self.kick(client, "Connection too weak", now);
            }
            Err(err) => {
                log::debug!("send to client {client} failed: {err}");
            }
        }
    }

    fn kick(&mut self, client: usize, reason: &str, now: Instant) {
        self.net.drop_client(client, reason, now);
        self.on_client_gone(client, DisconnectReason::Kicked, reason, now);
    }

    fn drop_client(
        &mut self,
        client: usize,
        kind: DisconnectReason,
        reason: &str,
        now: Instant,
    ) {
        self.net.drop_client(client, reason, now);
        self.on_client_gone(client, kind, reason, now);
    }

    fn on_client_gone(
        &mut self,
        client: usize,
        kind: DisconnectReason,
        reason: &str,
        now: Instant,
    ) {
        if self.clients[client].state == ClientState::Empty {
            return;
        }
        if self.clients[client].in_game() {
            let mut ctx = TickContext {
                tick: self.current_tick,
                tick_rate: self.config.tick_rate as i32,
                now,
                ids: &mut self.ids,
            };
            self.sim.on_client_drop(&mut ctx, client, reason);
        }
        self.clients[client].reset();
        self.info.dirty = true;
        self.pending_events.push_back(ServerEvent::ClientDisconnected {
            client,
            kind,
            detail: reason.to_string(),
        });
    }

    fn do_snapshot(&mut self, now: Instant) {
        if self.demo.is_some() {
            self.builder.init(None);
            self.sim
                .on_snap(None, &mut SnapWriter::new(&mut self.builder));
            let snapshot = self.builder.finish();
            if let Some(demo) = &mut self.demo {
                demo.record_snapshot(&self.jobs, self.current_tick, &snapshot);
            }
        }

        for client_id in 0..self.clients.len() {
            if !self.clients[client_id].in_game() {
                continue;
            }
            match self.clients[client_id].snap_rate {
                SnapRate::Recover if self.current_tick % RECOVER_INTERVAL_TICKS != 0 => continue,
                SnapRate::Init if self.current_tick % INIT_INTERVAL_TICKS != 0 => continue,
                _ => {}
            }

            // the recipient's wire variant decides the static widths;
            // re-registered every time, last write wins
            for (item_type, words) in self.sim.wire_profile(Some(client_id)) {
                self.delta.set_static_size(item_type, words);
            }

            self.builder.init(Some(client_id));
            self.sim
                .on_snap(Some(client_id), &mut SnapWriter::new(&mut self.builder));
            let snapshot = self.builder.finish();
            let crc = snapshot.crc();

            let keep_from = self.current_tick - self.tick_rate() * 3;
            self.clients[client_id].snapshots.purge_until(keep_from);
            self.clients[client_id]
                .snapshots
                .add(self.current_tick, snapshot.clone());

            let acked = self.clients[client_id].last_acked_snapshot;
            if self.clients[client_id].snapshots.get(acked).is_none()
                && self.clients[client_id].snap_rate == SnapRate::Full
            {
                // acked base purged or never acked: fall back to a full
                // snapshot against the empty base and back off the rate
                self.clients[client_id].snap_rate = SnapRate::Recover;
            }
            let (base, delta_tick) = match self.clients[client_id].snapshots.get(acked) {
                Some(base) => (base, acked),
                None => (Snapshot::empty(), -1),
            };

            let words = self.delta.create_delta(base, &snapshot);
            let tick = self.current_tick;
            if words.is_empty() {
                self.send_system_msg(
                    client_id,
                    &SystemMsg::SnapEmpty {
                        tick,
                        delta_tick: tick - delta_tick,
                    },
                    false,
                    true,
                    now,
                );
                continue;
            }

            let payload = varint::compress_words(&words);
            let num_parts = payload.len().div_ceil(MAX_SNAPSHOT_PACK);
            for part in 0..num_parts {
                let chunk =
                    &payload[part * MAX_SNAPSHOT_PACK..(part * MAX_SNAPSHOT_PACK + MAX_SNAPSHOT_PACK).min(payload.len())];
                let msg = if num_parts == 1 {
                    SystemMsg::SnapSingle {
                        tick,
                        delta_tick: tick - delta_tick,
                        crc,
                        data: chunk.to_vec(),
                    }
                } else {
                    SystemMsg::Snap {
                        tick,
                        delta_tick: tick - delta_tick,
                        num_parts: num_parts as i32,
                        part: part as i32,
                        crc,
                        data: chunk.to_vec(),
                    }
                };
                self.send_system_msg(client_id, &msg, false, true, now);
            }
        }
    }

    fn reinit_world(&mut self, now: Instant) {
        let at_tick = self.current_tick;
        let mut ctx = TickContext {
            tick: self.current_tick,
            tick_rate: self.config.tick_rate as i32,
            now,
            ids: &mut self.ids,
        };
        self.sim.on_shutdown(&mut ctx);
        self.ids.timeout_ids();

        self.game_start = now;
        self.current_tick = 0;

        let mut ctx = TickContext {
            tick: 0,
            tick_rate: self.config.tick_rate as i32,
            now,
            ids: &mut self.ids,
        };
        self.sim.on_init(&mut ctx);

        // connected clients fall back to the ready handshake and reload
        // state through a fresh INIT-rate snapshot cycle
        for client_id in 0..self.clients.len() {
            let client = &mut self.clients[client_id];
            if !matches!(client.state, ClientState::Ready | ClientState::InGame) {
                continue;
            }
            client.state = ClientState::Ready;
            client.snap_rate = SnapRate::Init;
            client.last_acked_snapshot = 0;
            client.snapshots.purge_all();
            client.inputs.clear();
            self.send_system_msg(client_id, &SystemMsg::ConReady, true, true, now);
        }

        self.info.dirty = true;
        self.pending_events
            .push_back(ServerEvent::WorldReinit { at_tick });
    }

    fn rebuild_info_cache(&mut self) {
        self.info.vanilla = self.build_info(false, false);
        self.info.legacy64 = self.build_info(true, false);
        self.info.extended = self.build_info(true, true);
        self.info.dirty = false;
    }

    fn build_info(&self, with_players: bool, extended: bool) -> Vec<u8> {
        let mut packer = Packer::new(2048);
        let in_game: Vec<(usize, &Client)> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.in_game())
            .collect();

        let _ = packer.add_string(PROTOCOL_VERSION);
        let _ = packer.add_string(&self.config.name);
        let _ = packer.add_int((!self.config.password.is_empty()) as i32);
        let _ = packer.add_int(in_game.len() as i32);
        let _ = packer.add_int(self.config.max_clients as i32);
        if with_players {
            for (id, client) in &in_game {
                let _ = packer.add_string(&client.name);
                if extended {
                    let _ = packer.add_int(*id as i32);
                }
            }
        }
        packer.data().to_vec()
    }

    /// At most `info_replies_per_second` connless answers go out; the rest
    /// of the window's requests are dropped on the floor.
    fn info_rate_limited(&mut self, now: Instant) -> bool {
        if now.duration_since(self.info_window_start) >= Duration::from_secs(1) {
            self.info_window_start = now;
            self.info_window_count = 0;
        }
        self.info_window_count += 1;
        self.info_window_count > self.config.info_replies_per_second
    }

    fn process_connless(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        enum InfoKind {
            Vanilla,
            Legacy64,
            Extended,
        }
        let (request, reply_prefix, kind): (&[u8], &[u8], InfoKind) =
            if data.starts_with(SERVERBROWSE_GETINFO) {
                (SERVERBROWSE_GETINFO, SERVERBROWSE_INFO, InfoKind::Vanilla)
            } else if data.starts_with(SERVERBROWSE_GETINFO64) {
                (
                    SERVERBROWSE_GETINFO64,
                    SERVERBROWSE_INFO64,
                    InfoKind::Legacy64,
                )
            } else if data.starts_with(SERVERBROWSE_GETINFO_EXT) {
                (
                    SERVERBROWSE_GETINFO_EXT,
                    SERVERBROWSE_INFO_EXT,
                    InfoKind::Extended,
                )
            } else {
                return;
            };

        let Some(&challenge) = data.get(request.len()) else {
            return;
        };
        if self.info_rate_limited(now) {
            return;
        }

        let body = match kind {
            InfoKind::Vanilla => &self.info.vanilla,
            InfoKind::Legacy64 => &self.info.legacy64,
            InfoKind::Extended => &self.info.extended,
        };
        let mut reply = Vec::with_capacity(reply_prefix.len() + 1 + body.len());
        reply.extend_from_slice(reply_prefix);
        reply.push(challenge);
        reply.extend_from_slice(body);
        if let Err(err) = self.net.send_connless(addr, &reply) {
            log::debug!("server info reply to {addr} failed: {err}");
        }
    }
}

fn signed_micros_until(target: Instant, now: Instant) -> i32 {
    match target.checked_duration_since(now) {
        Some(ahead) => ahead.as_micros() as i32,
        None => -(now.duration_since(target).as_micros() as i32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_exact_tick_count_under_jitter() {
        let start = Instant::now();
        let pacer = TickPacer::new(start, 50);

        // poll at irregular offsets over a simulated 3 seconds
        let jitter_ms: [u64; 12] = [13, 110, 7, 340, 95, 260, 41, 530, 220, 388, 710, 291];
        let mut now = start;
        let mut current = 0;
        for step in jitter_ms {
            now += Duration::from_millis(step);
            current += pacer.ticks_due(now, current);
        }
        // jitter sums to 3005 ms; ticks 1..=150 have started, 151 has not
        assert_eq!(now, start + Duration::from_millis(3005));
        assert_eq!(current, 150);
    }

    #[test]
    fn test_pacer_never_skips_ticks() {
        let start = Instant::now();
        let pacer = TickPacer::new(start, 50);
        // a single long stall still yields every tick
        assert_eq!(pacer.ticks_due(start + Duration::from_secs(2), 0), 100);
    }

    #[test]
    fn test_pacer_strictly_after_deadline() {
        let start = Instant::now();
        let pacer = TickPacer::new(start, 50);
        // exactly at a tick's start time, the tick has not begun
        assert_eq!(pacer.ticks_due(start + Duration::from_millis(20), 0), 0);
        assert_eq!(
            pacer.ticks_due(start + Duration::from_millis(21), 0),
            1
        );
    }

    #[test]
    fn test_signed_micros() {
        let now = Instant::now();
        assert!(signed_micros_until(now + Duration::from_millis(2), now) > 0);
        assert!(signed_micros_until(now, now + Duration::from_millis(2)) < 0);
    }

    #[test]
    fn test_client_full_protocol_flow() {
        use ricochet::net::{ClientEvent, NetClient};
        use ricochet::{ITEM_PROJECTILE, Snapshot};
        use std::collections::HashMap;

        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            max_clients: 2,
            high_bandwidth: true,
            ..ServerConfig::default()
        };
        let world = ricochet::ArenaWorld::new(config.max_clients);
        let mut server = GameServer::new(config, world).unwrap();

        let mut client =
            NetClient::open("127.0.0.1:0", Duration::from_secs(10), Instant::now()).unwrap();
        client.connect(server.local_addr(), Instant::now()).unwrap();

        let mut delta = SnapshotDelta::new();
        delta.set_static_size(ITEM_PROJECTILE, 5);
        let mut stored: HashMap<i32, Snapshot> = HashMap::new();
        let mut sent_info = false;
        let mut entered = false;
        let mut applied_deltas = 0;
        let mut applied_incremental = false;

        let deadline = Instant::now() + Duration::from_secs(10);
        while applied_deltas < 5 && Instant::now() < deadline {
            server.tick_once();

            let now = Instant::now();
            for event in client.recv(now) {
                match event {
                    ClientEvent::Connected => {
                        let mut packer = Packer::new(256);
                        SystemMsg::Info {
                            version: PROTOCOL_VERSION.to_string(),
                            name: "tester".to_string(),
                            password: String::new(),
                        }
                        .pack(&mut packer)
                        .unwrap();
                        client.send_chunk(true, packer.data(), true, now).unwrap();
                        sent_info = true;
                    }
                    ClientEvent::Chunk { data, .. } => {
                        let mut unpacker = Unpacker::new(&data);
                        let (msg_id, system) = unpack_msg_id(unpacker.get_int().unwrap());
                        if !system {
                            continue;
                        }
                        match SystemMsg::unpack(msg_id, &mut unpacker).unwrap() {
                            SystemMsg::ConReady => {
                                let mut packer = Packer::new(64);
                                SystemMsg::EnterGame.pack(&mut packer).unwrap();
                                client.send_chunk(true, packer.data(), true, now).unwrap();
                                entered = true;
                            }
                            SystemMsg::SnapSingle {
                                tick,
                                delta_tick,
                                crc,
                                data,
                            } => {
                                let base_tick = tick - delta_tick;
                                let base = stored
                                    .get(&base_tick)
                                    .cloned()
                                    .unwrap_or_default();
                                let words =
                                    varint::decompress_words(&data).unwrap();
                                let snapshot = delta.apply_delta(&base, &words).unwrap();
                                assert_eq!(snapshot.crc(), crc);
                                stored.insert(tick, snapshot);
                                if base_tick >= 0 {
                                    applied_incremental = true;
                                }
                                applied_deltas += 1;

                                // ack the snapshot and steer the player so
                                // the next delta is non-empty
                                let mut packer = Packer::new(128);
                                SystemMsg::Input {
                                    acked_tick: tick,
                                    intended_tick: tick + 2,
                                    data: vec![1, 0],
                                }
                                .pack(&mut packer)
                                .unwrap();
                                client.send_chunk(true, packer.data(), true, now).unwrap();
                            }
                            SystemMsg::SnapEmpty { tick, delta_tick } => {
                                let base_tick = tick - delta_tick;
                                if let Some(base) = stored.get(&base_tick).cloned() {
                                    stored.insert(tick, base);
                                }
                            }
                            _ => {}
                        }
                    }
                    ClientEvent::Closed(reason) => panic!("server closed us: {reason}"),
                    ClientEvent::Connless { .. } => {}
                }
            }
            client.update(Instant::now());
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(sent_info, "never reached online");
        assert!(entered, "never received ConReady");
        assert!(applied_deltas >= 5, "received too few snapshots");
        assert!(applied_incremental, "no delta against an acked base seen");
    }

    #[test]
    fn test_server_info_reply() {
        use ricochet::net::{ClientEvent, NetClient};

        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            max_clients: 2,
            ..ServerConfig::default()
        };
        let world = ricochet::ArenaWorld::new(config.max_clients);
        let mut server = GameServer::new(config, world).unwrap();

        let mut client =
            NetClient::open("127.0.0.1:0", Duration::from_secs(10), Instant::now()).unwrap();
        let mut request = SERVERBROWSE_GETINFO.to_vec();
        request.push(0x5c);
        client.send_connless(server.local_addr(), &request).unwrap();

        let mut reply = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while reply.is_none() && Instant::now() < deadline {
            server.tick_once();
            for event in client.recv(Instant::now()) {
                if let ClientEvent::Connless { data, .. } = event {
                    reply = Some(data);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let reply = reply.expect("no server info reply");
        assert!(reply.starts_with(SERVERBROWSE_INFO));
        assert_eq!(reply[SERVERBROWSE_INFO.len()], 0x5c);
        let mut unpacker = Unpacker::new(&reply[SERVERBROWSE_INFO.len() + 1..]);
        assert_eq!(unpacker.get_string().unwrap(), PROTOCOL_VERSION);
        assert_eq!(unpacker.get_string().unwrap(), "unnamed server");
    }

    #[test]
    fn test_id_map_translate() {
        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            max_clients: 4,
            ..ServerConfig::default()
        };
        let world = ricochet::ArenaWorld::new(config.max_clients);
        let mut server = GameServer::new(config, world).unwrap();

        server.clear_id_map(2);
        assert_eq!(server.translate_id(2, 0), Some(2));
        assert_eq!(server.translate_id(2, 5), None);
        server.clients[2].id_map[5] = 9;
        assert_eq!(server.translate_id(2, 5), Some(9));
    }
}
