//! The per-node runtime: a cooperative scheduler driving every component
//! from one monotonic loop counter.
//!
//! Each microcontroller runs exactly one [`Scheduler`]. On every iteration
//! it walks the dispatch table in order, runs each component whose interval
//! divides the loop counter, bumps the counter, and sleeps one tick period.
//! Nothing is preemptive: a component that blocks stalls the whole node,
//! including its own heartbeat cadence hints, so components must stay short.
//!
//! The one concession to concurrency is the mesh. Heartbeats and the peer
//! liveness sweep run from the platform's timer service ([`MeshTimer`] on
//! hosts), so the [`MeshSync`] state is shared between two logical executors
//! and lives behind a short-held mutex in [`NodeContext`]. The rest of the
//! node state is touched only from the scheduler thread.
//!
//! A component that panics takes the node down. That is deliberate: one
//! stack, one core, no supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use animus_mesh::{MeshConfig, MeshError, MeshSync, Transport};
use animus_mood::MoodStore;
use animus_render::{FrameCache, PaletteEngine, RenderError};
use serde::{Deserialize, Serialize};

pub mod components;

/// Dispatch table capacity; registration past this is an error.
pub const MAX_COMPONENTS: usize = 16;

pub type DynTransport = Box<dyn Transport + Send>;

/// The mesh handle shared between the scheduler thread and the timer thread.
pub type SharedMesh = Arc<Mutex<MeshSync<DynTransport>>>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("dispatch table is full ({MAX_COMPONENTS} entries)")]
    DispatchTableFull,
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Milliseconds since node boot. On hardware this is the SoC millis counter;
/// on hosts, [`WallClock`]. Wraps every ~49 days, which every consumer
/// handles with wrapping arithmetic.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u32;
}

pub struct WallClock {
    start: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock {
            start: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        WallClock::new()
    }
}

impl Clock for WallClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Where rendered eye frames go. The buffer is valid only until the next
/// mutation of the same frame slot, so implementations must blit, not keep.
pub trait FrameSink: Send {
    fn push_frame(&mut self, rgb565: &[u16], width: u16, height: u16);
}

/// Distance sensor collaborator. 255 means "no detection", never "very far".
pub trait DistanceSensor: Send {
    fn read_distance(&mut self) -> u8;
}

/// Everything fixed about a node before boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub mesh: MeshConfig,
    pub tick_period_ms: u32,
}

/// The state every component works against: one per node, owned by the
/// scheduler, passed by reference. Keeping it a value (rather than process
/// globals) is what lets a test or the simulator run a whole mesh of nodes
/// in one process.
pub struct NodeContext {
    pub config: NodeConfig,
    pub store: MoodStore,
    pub palette: PaletteEngine,
    pub frames: FrameCache,
    pub mesh: SharedMesh,
    pub clock: Arc<dyn Clock>,
    pub loop_count: u64,
}

impl NodeContext {
    pub fn new(config: NodeConfig, transport: DynTransport, clock: Arc<dyn Clock>) -> Self {
        let mesh = Arc::new(Mutex::new(MeshSync::new(transport, config.mesh)));
        NodeContext {
            config,
            store: MoodStore::new(),
            palette: PaletteEngine::new(),
            frames: FrameCache::new(),
            mesh,
            clock,
            loop_count: 0,
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Short-held lock on the mesh. A poisoned lock means another executor
    /// panicked, which is fatal to the node anyway.
    pub fn mesh(&self) -> MutexGuard<'_, MeshSync<DynTransport>> {
        self.mesh.lock().expect("mesh lock poisoned")
    }
}

/// One schedulable unit of behavior.
pub trait Component: Send {
    fn name(&self) -> &'static str;

    /// Runs once before the loop starts. A failure is logged and skipped;
    /// it never blocks the rest of bring-up.
    fn init(&mut self, _ctx: &mut NodeContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Runs on every tick where the entry's interval divides the loop
    /// counter. Reads and writes the node state directly.
    fn act(&mut self, ctx: &mut NodeContext);
}

struct DispatchEntry {
    interval: u64,
    component: Box<dyn Component>,
}

pub struct Scheduler {
    ctx: NodeContext,
    entries: Vec<DispatchEntry>,
}

impl Scheduler {
    pub fn new(ctx: NodeContext) -> Self {
        Scheduler {
            ctx,
            entries: Vec::new(),
        }
    }

    /// Appends an entry to the dispatch table. Table order is execution
    /// order. Registering the same component twice is legal (it runs twice);
    /// interval 0 is legal and never fires.
    pub fn register(
        &mut self,
        interval: u64,
        component: Box<dyn Component>,
    ) -> Result<(), RuntimeError> {
        if self.entries.len() >= MAX_COMPONENTS {
            return Err(RuntimeError::DispatchTableFull);
        }
        self.entries.push(DispatchEntry {
            interval,
            component,
        });
        Ok(())
    }

    pub fn ctx(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut NodeContext {
        &mut self.ctx
    }

    /// Boot sequence: bring the mesh up, run every component init once in
    /// table order (best effort; a failed peripheral is logged, not fatal),
    /// then start announcing on the mesh.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        let now = self.ctx.now_ms();
        self.ctx.mesh().init(now)?;
        for entry in &mut self.entries {
            if let Err(e) = entry.component.init(&mut self.ctx) {
                log::warn!("init of {} failed: {e}", entry.component.name());
            }
        }
        let now = self.ctx.now_ms();
        self.ctx.mesh().start(now)?;
        Ok(())
    }

    /// One pass over the dispatch table, then the counter bump. The sleep
    /// belongs to the caller ([`run`](Self::run) or a simulator driving
    /// several nodes).
    pub fn tick(&mut self) {
        for entry in &mut self.entries {
            if entry.interval > 0 && self.ctx.loop_count % entry.interval == 0 {
                entry.component.act(&mut self.ctx);
            }
        }
        self.ctx
            .mesh()
            .set_loop_count(self.ctx.loop_count as u16);
        self.ctx.loop_count += 1;
    }

    pub fn run_for(&mut self, ticks: u64) {
        let period = Duration::from_millis(self.ctx.config.tick_period_ms as u64);
        for _ in 0..ticks {
            self.tick();
            std::thread::sleep(period);
        }
    }

    /// The firmware main loop: tick, sleep, forever.
    pub fn run(&mut self) -> ! {
        let period = Duration::from_millis(self.ctx.config.tick_period_ms as u64);
        loop {
            self.tick();
            std::thread::sleep(period);
        }
    }
}

/// Host-side stand-in for the platform timer service: a thread that
/// periodically takes the mesh lock and runs the heartbeat/liveness pass.
pub struct MeshTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MeshTimer {
    pub fn spawn(mesh: SharedMesh, clock: Arc<dyn Clock>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                mesh.lock().expect("mesh lock poisoned").on_timer(clock.now_ms());
                std::thread::sleep(period);
            }
        });
        MeshTimer {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MeshTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use animus_mesh::{Addr, Role, TransportError, BROADCAST_ADDR};
    use animus_mood::{MoodAxis, MoodVector};
    use animus_render::blend_palette;
    use crate::components::{MoodReplicator, MOOD_BLOCK};
    use std::sync::atomic::AtomicU32;

    struct ManualClock(AtomicU32);

    impl ManualClock {
        fn advance(&self, ms: u32) {
            self.0.fetch_add(ms, Ordering::Relaxed);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u32 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct Counting {
        fires: Arc<AtomicU32>,
    }

    impl Component for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn act(&mut self, _ctx: &mut NodeContext) {
            self.fires.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct FailingInit;

    impl Component for FailingInit {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn init(&mut self, _ctx: &mut NodeContext) -> Result<(), RuntimeError> {
            Err(RuntimeError::DispatchTableFull)
        }
        fn act(&mut self, _ctx: &mut NodeContext) {}
    }

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&mut self, _dest: Addr, _frame: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// All frames every node sends, tagged with the sender's address.
    type BusQueue = Arc<Mutex<Vec<(Addr, Addr, Vec<u8>)>>>;

    struct QueueTransport {
        src: Addr,
        queue: BusQueue,
    }

    impl Transport for QueueTransport {
        fn send(&mut self, dest: Addr, frame: &[u8]) -> Result<(), TransportError> {
            self.queue
                .lock()
                .unwrap()
                .push((self.src, dest, frame.to_vec()));
            Ok(())
        }
    }

    fn node_config(role: Role, last_octet: u8) -> NodeConfig {
        NodeConfig {
            mesh: MeshConfig {
                role,
                addr: [0x42, 0, 0, 0, 0, last_octet],
                node_id: last_octet as u32,
                fw_version: 1,
                cfg_version: 1,
                heartbeat_interval_ms: 1000,
            },
            tick_period_ms: 100,
        }
    }

    fn lone_node(role: Role) -> Scheduler {
        let clock = Arc::new(ManualClock(AtomicU32::new(0)));
        Scheduler::new(NodeContext::new(
            node_config(role, 1),
            Box::new(NullTransport),
            clock,
        ))
    }

    /// Delivers every queued frame to every scheduler it is addressed to.
    fn pump(queue: &BusQueue, nodes: &mut [&mut Scheduler], now_ms: u32) {
        let frames: Vec<_> = queue.lock().unwrap().drain(..).collect();
        for (src, dest, frame) in frames {
            for node in nodes.iter_mut() {
                let addr = node.ctx().config.mesh.addr;
                if addr != src && (dest == BROADCAST_ADDR || dest == addr) {
                    node.ctx().mesh().handle_frame(src, &frame, now_ms);
                }
            }
        }
    }

    #[test]
    fn entries_fire_exactly_on_their_multiples() {
        let mut node = lone_node(Role::Master);
        let counters: Vec<Arc<AtomicU32>> =
            (0..4).map(|_| Arc::new(AtomicU32::new(0))).collect();
        for (interval, fires) in [1u64, 50, 1000, 0].into_iter().zip(&counters) {
            node.register(
                interval,
                Box::new(Counting {
                    fires: Arc::clone(fires),
                }),
            )
            .unwrap();
        }
        node.start().unwrap();

        // Loop counters 0..=2000 inclusive.
        for _ in 0..=2000 {
            node.tick();
        }

        // floor(2000 / I) + 1 firings, counting the one at L = 0.
        assert_eq!(counters[0].load(Ordering::Relaxed), 2001);
        assert_eq!(counters[1].load(Ordering::Relaxed), 41);
        assert_eq!(counters[2].load(Ordering::Relaxed), 3);
        // Interval 0 never fires.
        assert_eq!(counters[3].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn duplicate_registration_runs_twice() {
        let mut node = lone_node(Role::Master);
        let fires = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            node.register(
                1,
                Box::new(Counting {
                    fires: Arc::clone(&fires),
                }),
            )
            .unwrap();
        }
        node.start().unwrap();
        node.tick();
        assert_eq!(fires.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn table_capacity_is_enforced() {
        let mut node = lone_node(Role::Master);
        let fires = Arc::new(AtomicU32::new(0));
        for _ in 0..MAX_COMPONENTS {
            node.register(
                1,
                Box::new(Counting {
                    fires: Arc::clone(&fires),
                }),
            )
            .unwrap();
        }
        assert!(matches!(
            node.register(
                1,
                Box::new(Counting {
                    fires: Arc::clone(&fires)
                })
            ),
            Err(RuntimeError::DispatchTableFull)
        ));
    }

    #[test]
    fn one_failed_init_does_not_block_the_rest() {
        let mut node = lone_node(Role::Master);
        node.register(1, Box::new(FailingInit)).unwrap();
        node.register(1, Box::new(MoodReplicator::new())).unwrap();
        node.start().unwrap();
        // The replicator after the failing component still allocated its
        // block.
        let mut buf = [0u8; animus_mood::MOOD_BYTES];
        node.ctx().mesh().read_block(MOOD_BLOCK, &mut buf).unwrap();
    }

    #[test]
    fn anger_propagates_node_to_node() {
        let queue: BusQueue = Arc::new(Mutex::new(Vec::new()));
        let clock = Arc::new(ManualClock(AtomicU32::new(0)));

        let mut make = |role, octet| {
            let config = node_config(role, octet);
            let transport = Box::new(QueueTransport {
                src: config.mesh.addr,
                queue: Arc::clone(&queue),
            });
            let mut node = Scheduler::new(NodeContext::new(
                config,
                transport,
                Arc::clone(&clock) as Arc<dyn Clock>,
            ));
            node.register(1, Box::new(MoodReplicator::new())).unwrap();
            node.start().unwrap();
            node
        };
        let mut a = make(Role::Master, 1);
        let mut b = make(Role::Head, 2);

        // Announce heartbeats cross over; both nodes see one peer.
        pump(&queue, &mut [&mut a, &mut b], 0);

        // B caches a frame under its neutral mood.
        let anim = b.ctx_mut().frames.register_animation("idle").unwrap();
        let card: Vec<u8> = (0u8..16).collect();
        b.ctx_mut().frames.add_frame(anim, 0, &card, 4, 4).unwrap();
        let neutral = b.ctx().store.snapshot();
        let palette_before = *b.ctx_mut().palette.active(&neutral);
        {
            let ctx = b.ctx_mut();
            let mood = ctx.store.snapshot();
            ctx.frames
                .frame_rgb565(anim, 0, &mut ctx.palette, &mood)
                .unwrap();
        }
        assert_eq!(b.ctx().frames.frame_repaints(anim, 0).unwrap(), 1);

        // A gets angry; its replicator dirties the block; the timer pass
        // broadcasts it.
        a.ctx_mut().store.adjust(MoodAxis::Anger, 80);
        a.tick();
        clock.advance(100);
        a.ctx().mesh().on_timer(clock.now_ms());
        pump(&queue, &mut [&mut a, &mut b], clock.now_ms());

        // B's next tick lands the replicated vector in its store.
        b.tick();
        assert_eq!(b.ctx().store.mood().get(MoodAxis::Anger), 80);

        // Palette and frame both notice on their next request.
        let mood = b.ctx().store.snapshot();
        let palette_after = *b.ctx_mut().palette.active(&mood);
        assert_ne!(palette_before, palette_after);
        let mut expected = MoodVector::neutral();
        expected.set(MoodAxis::Anger, 80);
        assert_eq!(palette_after, blend_palette(&expected));

        {
            let ctx = b.ctx_mut();
            let mood = ctx.store.snapshot();
            ctx.frames
                .frame_rgb565(anim, 0, &mut ctx.palette, &mood)
                .unwrap();
        }
        assert_eq!(b.ctx().frames.frame_repaints(anim, 0).unwrap(), 2);

        // And the update does not echo back to A as a fresh write.
        clock.advance(1100);
        b.ctx().mesh().on_timer(clock.now_ms());
        let frames: Vec<_> = queue.lock().unwrap().drain(..).collect();
        for (_, _, frame) in frames {
            let msg = animus_mesh::Message::decode(&frame).unwrap();
            assert!(!matches!(msg.payload, animus_mesh::Payload::State(_)));
        }
    }
}
