use std::time::Instant;

use glam::Vec2;

use crate::net::varint::Unpacker;
use crate::snapshot::{SnapIdPool, SnapshotBuilder};

/// Per-tick view the engine hands to the simulation: where we are in time
/// and the shared id pool for transient networked objects.
pub struct TickContext<'a> {
    pub tick: i32,
    pub tick_rate: i32,
    pub now: Instant,
    pub ids: &'a mut SnapIdPool,
}

/// The simulation's window into the snapshot being built for one
/// recipient. A `None` return from [`SnapWriter::item`] means the tick's
/// byte budget is spent and the object is skipped for this tick.
pub struct SnapWriter<'a> {
    builder: &'a mut SnapshotBuilder,
}

impl<'a> SnapWriter<'a> {
    pub fn new(builder: &'a mut SnapshotBuilder) -> Self {
        Self { builder }
    }

    pub fn recipient(&self) -> Option<usize> {
        self.builder.recipient()
    }

    pub fn item(&mut self, item_type: i32, id: i32, words: usize) -> Option<&mut [i32]> {
        self.builder.new_item(item_type, id, words)
    }
}

/// The game world as the engine sees it. The tick loop drives these hooks;
/// everything else about the game is its own business.
pub trait Simulation {
    fn on_init(&mut self, ctx: &mut TickContext<'_>);
    fn on_shutdown(&mut self, ctx: &mut TickContext<'_>);
    fn on_tick(&mut self, ctx: &mut TickContext<'_>);

    /// Called once per recipient per snapshot tick; `None` is the demo/all
    /// recipient. The implementation calls [`SnapWriter::item`] zero or
    /// more times.
    fn on_snap(&mut self, recipient: Option<usize>, writer: &mut SnapWriter<'_>);

    /// Static payload widths to register with the delta engine for this
    /// recipient's wire variant. Re-registered before every delta; last
    /// write wins.
    fn wire_profile(&self, recipient: Option<usize>) -> Vec<(i32, usize)> {
        let _ = recipient;
        Vec::new()
    }

    fn on_client_enter(&mut self, ctx: &mut TickContext<'_>, client: usize);
    fn on_client_drop(&mut self, ctx: &mut TickContext<'_>, client: usize, reason: &str);

    /// Direct input words from the client's Input message, applied at the
    /// tick the client intended.
    fn on_client_input(&mut self, ctx: &mut TickContext<'_>, client: usize, input: &[i32]);

    /// A non-system message; the engine does not interpret these.
    fn on_message(
        &mut self,
        ctx: &mut TickContext<'_>,
        client: usize,
        msg_id: i32,
        unpacker: &mut Unpacker<'_>,
    ) {
        let _ = (ctx, client, msg_id, unpacker);
    }
}

pub const ITEM_PLAYER: i32 = 1;
pub const ITEM_PROJECTILE: i32 = 2;

const PLAYER_WORDS: usize = 5;
const PROJECTILE_WORDS: usize = 5;

const FIELD_SIZE: f32 = 4096.0;
const PLAYER_SPEED: f32 = 12.0;
const PROJECTILE_LIFETIME: i32 = 250;
const PROJECTILE_SPAWN_INTERVAL: i32 = 50;

fn to_net(v: f32) -> i32 {
    (v * 32.0).round() as i32
}

#[derive(Debug, Clone)]
struct Player {
    pos: Vec2,
    vel: Vec2,
}

#[derive(Debug, Clone)]
struct Projectile {
    snap_id: i32,
    pos: Vec2,
    vel: Vec2,
    spawn_tick: i32,
}

/// Reference game: players steered by input plus projectiles bouncing
/// around a square field. Small on purpose, but it exercises every engine
/// hook, both id styles (client-indexed and pooled) and the wire-profile
/// registration path.
#[derive(Debug, Default)]
pub struct ArenaWorld {
    players: Vec<Option<Player>>,
    projectiles: Vec<Projectile>,
}

impl ArenaWorld {
    pub fn new(max_clients: usize) -> Self {
        Self {
            players: vec![None; max_clients],
            projectiles: Vec::new(),
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_some()).count()
    }

    pub fn projectile_count(&self) -> usize {
        self.projectiles.len()
    }

    fn spawn_point(client: usize) -> Vec2 {
        let step = FIELD_SIZE / 8.0;
        Vec2::new(
            step + (client as f32 * step * 1.7) % (FIELD_SIZE - 2.0 * step),
            step + (client as f32 * step * 2.3) % (FIELD_SIZE - 2.0 * step),
        )
    }
}

fn bounce(pos: &mut f32, vel: &mut f32) {
    if *pos < 0.0 {
        *pos = -*pos;
        *vel = -*vel;
    } else if *pos > FIELD_SIZE {
        *pos = 2.0 * FIELD_SIZE - *pos;
        *vel = -*vel;
    }
}

impl Simulation for ArenaWorld {
    fn on_init(&mut self, _ctx: &mut TickContext<'_>) {
        // a re-init is a fresh world; clients re-enter and respawn
        for player in &mut self.players {
            *player = None;
        }
        self.projectiles.clear();
    }

    fn on_shutdown(&mut self, ctx: &mut TickContext<'_>) {
        for projectile in self.projectiles.drain(..) {
            ctx.ids.free_id(projectile.snap_id, ctx.now);
        }
    }

    fn on_tick(&mut self, ctx: &mut TickContext<'_>) {
        for player in self.players.iter_mut().flatten() {
            player.pos += player.vel;
            bounce(&mut player.pos.x, &mut player.vel.x);
            bounce(&mut player.pos.y, &mut player.vel.y);
        }

        for projectile in &mut self.projectiles {
            projectile.pos += projectile.vel;
            bounce(&mut projectile.pos.x, &mut projectile.vel.x);
            bounce(&mut projectile.pos.y, &mut projectile.vel.y);
        }

        let expired_before = ctx.tick - PROJECTILE_LIFETIME;
        let ids = &mut *ctx.ids;
        let now = ctx.now;
        self.projectiles.retain(|projectile| {
            if projectile.spawn_tick < expired_before {
                ids.free_id(projectile.snap_id, now);
                false
            } else {
                true
            }
        });

        if ctx.tick % PROJECTILE_SPAWN_INTERVAL == 0 {
            // spin the launch direction with the tick so runs are
            // reproducible without any randomness
            let angle = (ctx.tick / PROJECTILE_SPAWN_INTERVAL) as f32 * 0.7;
            self.projectiles.push(Projectile {
                snap_id: ctx.ids.new_id(ctx.now),
                pos: Vec2::splat(FIELD_SIZE / 2.0),
                vel: Vec2::from_angle(angle) * 24.0,
                spawn_tick: ctx.tick,
            });
        }
    }

    fn on_snap(&mut self, _recipient: Option<usize>, writer: &mut SnapWriter<'_>) {
        for (client, player) in self.players.iter().enumerate() {
            let Some(player) = player else { continue };
            let Some(words) = writer.item(ITEM_PLAYER, client as i32, PLAYER_WORDS) else {
                continue;
            };
            words[0] = to_net(player.pos.x);
            words[1] = to_net(player.pos.y);
            words[2] = to_net(player.vel.x);
            words[3] = to_net(player.vel.y);
            words[4] = client as i32;
        }
        for projectile in &self.projectiles {
            let Some(words) = writer.item(ITEM_PROJECTILE, projectile.snap_id, PROJECTILE_WORDS)
            else {
                continue;
            };
            words[0] = to_net(projectile.pos.x);
            words[1] = to_net(projectile.pos.y);
            words[2] = to_net(projectile.vel.x);
            words[3] = to_net(projectile.vel.y);
            words[4] = projectile.spawn_tick;
        }
    }

    fn wire_profile(&self, _recipient: Option<usize>) -> Vec<(i32, usize)> {
        vec![(ITEM_PROJECTILE, PROJECTILE_WORDS)]
    }

    fn on_client_enter(&mut self, _ctx: &mut TickContext<'_>, client: usize) {
        if client < self.players.len() {
            self.players[client] = Some(Player {
                pos: Self::spawn_point(client),
                vel: Vec2::ZERO,
            });
        }
    }

    fn on_client_drop(&mut self, _ctx: &mut TickContext<'_>, client: usize, _reason: &str) {
        if client < self.players.len() {
            self.players[client] = None;
        }
    }

    fn on_client_input(&mut self, _ctx: &mut TickContext<'_>, client: usize, input: &[i32]) {
        let Some(Some(player)) = self.players.get_mut(client) else {
            return;
        };
        let dir_x = input.first().copied().unwrap_or(0).clamp(-1, 1) as f32;
        let dir_y = input.get(1).copied().unwrap_or(0).clamp(-1, 1) as f32;
        player.vel = Vec2::new(dir_x, dir_y) * PLAYER_SPEED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{MAX_SNAPSHOT_SIZE, SnapIdPool, SnapshotBuilder};
    use std::time::Duration;

    fn ctx_parts() -> (SnapIdPool, Instant) {
        let now = Instant::now();
        (SnapIdPool::new(64, Duration::from_secs(5), now), now)
    }

    #[test]
    fn test_projectiles_recycle_pool_ids() {
        let (mut ids, now) = ctx_parts();
        let mut world = ArenaWorld::new(4);

        for tick in 0..400 {
            let mut ctx = TickContext {
                tick,
                tick_rate: 50,
                now,
                ids: &mut ids,
            };
            world.on_tick(&mut ctx);
        }
        // lifetime < spawn interval * pool size, so the pool never runs dry
        assert!(world.projectile_count() <= 6);
        assert!(ids.in_usage() == world.projectile_count());
    }

    #[test]
    fn test_snap_writes_players_and_projectiles() {
        let (mut ids, now) = ctx_parts();
        let mut world = ArenaWorld::new(4);
        let mut ctx = TickContext {
            tick: 0,
            tick_rate: 50,
            now,
            ids: &mut ids,
        };
        world.on_client_enter(&mut ctx, 1);
        world.on_tick(&mut ctx);

        let mut builder = SnapshotBuilder::new(MAX_SNAPSHOT_SIZE);
        builder.init(Some(1));
        let mut writer = SnapWriter::new(&mut builder);
        world.on_snap(Some(1), &mut writer);
        let snap = builder.finish();

        assert_eq!(snap.len(), 2);
        assert!(snap.contains(crate::snapshot::item_key(ITEM_PLAYER, 1)));
    }

    #[test]
    fn test_input_moves_player() {
        let (mut ids, now) = ctx_parts();
        let mut world = ArenaWorld::new(2);
        let mut ctx = TickContext {
            tick: 1,
            tick_rate: 50,
            now,
            ids: &mut ids,
        };
        world.on_client_enter(&mut ctx, 0);
        world.on_client_input(&mut ctx, 0, &[1, 0]);
        let before = world.players[0].as_ref().unwrap().pos;
        world.on_tick(&mut ctx);
        let after = world.players[0].as_ref().unwrap().pos;
        assert!(after.x > before.x);
        assert_eq!(after.y, before.y);
    }
}
