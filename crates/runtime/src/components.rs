//! The components every node registers, in the order they usually sit in
//! the dispatch table.
//!
//! Behavior-specific components (personalities, gesture sequencers) live
//! with their boards; what's here is the plumbing that makes a node a mesh
//! citizen and keeps its eyes drawn.

use animus_mesh::MeshEvent;
use animus_mood::{MoodVector, StatusUpdate, MOOD_BYTES};
use animus_render::AnimationId;

use crate::{Component, DistanceSensor, FrameSink, NodeContext, RuntimeError};

/// Name of the shared block carrying the mood vector. Every node allocates
/// it at the same 16 bytes; the encoding is `MoodVector::to_le_bytes`.
pub const MOOD_BLOCK: &str = "mood";

/// Emergency-stop code carried by `MeshEvent::Emergency` for a full halt.
pub const EMERGENCY_HALT: u8 = 0x01;

/// Keeps the local mood store and the replicated `"mood"` block in
/// agreement, in both directions.
///
/// The shadow copy (`last_seen`) is what tells local edits apart from
/// replicated ones: if the block moved, a peer wrote it and the store
/// follows; otherwise, if the store moved, the block is rewritten (which
/// dirties it for broadcast). Last writer wins on both sides, matching the
/// mesh's replication model.
pub struct MoodReplicator {
    last_seen: MoodVector,
}

impl MoodReplicator {
    pub fn new() -> Self {
        MoodReplicator {
            last_seen: MoodVector::neutral(),
        }
    }
}

impl Default for MoodReplicator {
    fn default() -> Self {
        MoodReplicator::new()
    }
}

impl Component for MoodReplicator {
    fn name(&self) -> &'static str {
        "mood-replicator"
    }

    fn init(&mut self, ctx: &mut NodeContext) -> Result<(), RuntimeError> {
        ctx.mesh().alloc_block(MOOD_BLOCK, MOOD_BYTES)?;
        self.last_seen = ctx.store.snapshot();
        Ok(())
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        let mut mesh = ctx.mesh.lock().expect("mesh lock poisoned");
        let mut buf = [0u8; MOOD_BYTES];
        if mesh.read_block(MOOD_BLOCK, &mut buf).is_err() {
            // Init failed earlier; nothing to reconcile.
            return;
        }
        let block_mood = MoodVector::from_le_bytes(&buf);
        if block_mood != self.last_seen {
            ctx.store.set_mood(block_mood);
            self.last_seen = block_mood;
        } else {
            let live = ctx.store.snapshot();
            if live != self.last_seen {
                if let Err(e) = mesh.write_block(MOOD_BLOCK, &live.to_le_bytes()) {
                    log::warn!("mood block write failed: {e}");
                    return;
                }
                self.last_seen = live;
            }
        }
    }
}

/// Drains the mesh event queue into node state.
///
/// Emergencies halt motion and speech immediately, whatever else the node
/// was doing. Commands are logged; dispatching them to behaviors is the
/// board's business.
pub struct MeshEventPump;

impl Component for MeshEventPump {
    fn name(&self) -> &'static str {
        "mesh-events"
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        let mut mesh = ctx.mesh.lock().expect("mesh lock poisoned");
        while let Some(event) = mesh.poll_event() {
            match event {
                MeshEvent::NodeOnline { role, .. } => {
                    log::info!("{} joined the mesh", role.name());
                    let online = mesh.nodes().online_count() as u8;
                    ctx.store.set_status(StatusUpdate::PeersOnline(online));
                }
                MeshEvent::NodeOffline { role, .. } => {
                    log::info!("{} left the mesh", role.name());
                    let online = mesh.nodes().online_count() as u8;
                    ctx.store.set_status(StatusUpdate::PeersOnline(online));
                }
                MeshEvent::Emergency { from, code } => {
                    log::warn!("emergency {code:#04x} from {}", from.name());
                    ctx.store.set_status(StatusUpdate::Moving(false));
                    ctx.store.set_status(StatusUpdate::Speaking(false));
                }
                MeshEvent::Command {
                    from,
                    command_id,
                    priority,
                    ..
                } => {
                    log::info!(
                        "command {command_id:#04x} (priority {priority}) from {}",
                        from.name()
                    );
                }
                MeshEvent::Status { from, report } => {
                    log::debug!(
                        "status from {}: battery {}%, {} errors",
                        from.name(),
                        report.battery_pct,
                        report.error_count
                    );
                }
            }
        }
    }
}

/// Polls the distance sensor into the status fields.
pub struct DistancePoll {
    sensor: Box<dyn DistanceSensor>,
}

impl DistancePoll {
    pub fn new(sensor: Box<dyn DistanceSensor>) -> Self {
        DistancePoll { sensor }
    }
}

impl Component for DistancePoll {
    fn name(&self) -> &'static str {
        "distance-poll"
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        let distance = self.sensor.read_distance();
        ctx.store.set_status(StatusUpdate::Distance(distance));
    }
}

/// Broadcasts a status report on its cadence.
pub struct StatusBroadcaster {
    component_mask: u16,
}

impl StatusBroadcaster {
    pub fn new(component_mask: u16) -> Self {
        StatusBroadcaster { component_mask }
    }
}

impl Component for StatusBroadcaster {
    fn name(&self) -> &'static str {
        "status-broadcast"
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        let status = ctx.store.status();
        let report = animus_mesh::StatusReport {
            node_status: 0,
            battery_pct: status.battery_pct,
            cpu_load: 0,
            temp_offset40: 25 + 40,
            uptime_sec: 0, // filled by the mesh layer
            error_count: 0,
            component_mask: self.component_mask,
        };
        let now = ctx.now_ms();
        if let Err(e) = ctx.mesh().send_status(report, now) {
            log::debug!("status broadcast failed: {e}");
        }
    }
}

const EYE_SIZE: u16 = 64;
const IDLE_FRAMES: usize = 4;

/// Builds one frame of the built-in idle animation: concentric pupil, iris
/// and sclera bands with a highlight dot, pupil breathing with `phase`.
fn idle_frame(phase: usize) -> Vec<u8> {
    let size = EYE_SIZE as i32;
    let c = size / 2;
    let pupil_r = 6 + (phase as i32 % IDLE_FRAMES as i32);
    let mut pixels = vec![0u8; (size * size) as usize];
    for y in 0..size {
        for x in 0..size {
            let d2 = (x - c).pow(2) + (y - c).pow(2);
            let slot = if d2 <= pupil_r.pow(2) {
                9
            } else if d2 <= 15 * 15 {
                // Striated iris.
                5 + ((x + y + phase as i32).rem_euclid(4)) as u8
            } else if d2 <= 27 * 27 {
                2
            } else if d2 <= 29 * 29 {
                1
            } else {
                0
            };
            pixels[(y * size + x) as usize] = slot;
        }
    }
    // Specular highlight, upper left of the pupil.
    for y in 0..size {
        for x in 0..size {
            let d2 = (x - (c - 8)).pow(2) + (y - (c - 8)).pow(2);
            if d2 <= 9 {
                pixels[(y * size + x) as usize] = 11;
            }
        }
    }
    pixels
}

/// Renders the idle animation through the frame cache and pushes it at a
/// display. Frames cycle on the component's cadence; pixels are only
/// recomputed when the mood moved since a frame was last painted.
pub struct EyeRenderer {
    sink: Box<dyn FrameSink>,
    animation: Option<AnimationId>,
    cursor: usize,
}

impl EyeRenderer {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        EyeRenderer {
            sink,
            animation: None,
            cursor: 0,
        }
    }
}

impl Component for EyeRenderer {
    fn name(&self) -> &'static str {
        "eye-renderer"
    }

    fn init(&mut self, ctx: &mut NodeContext) -> Result<(), RuntimeError> {
        let anim = ctx.frames.register_animation("idle")?;
        for phase in 0..IDLE_FRAMES {
            ctx.frames
                .add_frame(anim, phase, &idle_frame(phase), EYE_SIZE, EYE_SIZE)?;
        }
        self.animation = Some(anim);
        Ok(())
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        let Some(anim) = self.animation else {
            return;
        };
        let mood = ctx.store.snapshot();
        match ctx
            .frames
            .frame_rgb565(anim, self.cursor, &mut ctx.palette, &mood)
        {
            Ok((buffer, width, height)) => self.sink.push_frame(buffer, width, height),
            Err(e) => log::warn!("eye frame {} failed: {e}", self.cursor),
        }
        self.cursor = (self.cursor + 1) % IDLE_FRAMES;
    }
}

/// Small idle drift so a node left alone settles back toward neutral.
/// The real personalities live elsewhere; this keeps displays moving when
/// nothing else is driving the mood.
pub struct MoodDecay {
    step: i16,
}

impl MoodDecay {
    pub fn new(step: i16) -> Self {
        MoodDecay { step }
    }
}

impl Component for MoodDecay {
    fn name(&self) -> &'static str {
        "mood-decay"
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        for axis in animus_mood::MoodAxis::ALL {
            let value = ctx.store.mood().get(axis);
            if value > 0 {
                ctx.store.adjust(axis, -self.step.min(value as i16));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeConfig, NodeContext, Scheduler, WallClock};
    use animus_mesh::{Addr, MeshConfig, Role, Transport, TransportError};
    use animus_mood::{MoodAxis, DISTANCE_NONE};
    use std::sync::{Arc, Mutex};

    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&mut self, _dest: Addr, _frame: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn lone_scheduler() -> Scheduler {
        let config = NodeConfig {
            mesh: MeshConfig {
                role: Role::Head,
                addr: [0x42, 0, 0, 0, 0, 7],
                node_id: 7,
                fw_version: 1,
                cfg_version: 1,
                heartbeat_interval_ms: 1000,
            },
            tick_period_ms: 100,
        };
        Scheduler::new(NodeContext::new(
            config,
            Box::new(NullTransport),
            Arc::new(WallClock::new()),
        ))
    }

    struct FixedSensor(u8);

    impl DistanceSensor for FixedSensor {
        fn read_distance(&mut self) -> u8 {
            self.0
        }
    }

    #[derive(Clone, Default)]
    struct CapturingSink {
        frames: Arc<Mutex<Vec<(usize, u16, u16)>>>,
    }

    impl FrameSink for CapturingSink {
        fn push_frame(&mut self, rgb565: &[u16], width: u16, height: u16) {
            self.frames
                .lock()
                .unwrap()
                .push((rgb565.len(), width, height));
        }
    }

    #[test]
    fn distance_poll_writes_status() {
        let mut node = lone_scheduler();
        node.register(1, Box::new(DistancePoll::new(Box::new(FixedSensor(42)))))
            .unwrap();
        node.start().unwrap();
        assert_eq!(node.ctx().store.status().distance, DISTANCE_NONE);
        node.tick();
        assert_eq!(node.ctx().store.status().distance, 42);
    }

    #[test]
    fn eye_renderer_pushes_full_frames_and_caches() {
        let sink = CapturingSink::default();
        let mut node = lone_scheduler();
        node.register(1, Box::new(EyeRenderer::new(Box::new(sink.clone()))))
            .unwrap();
        node.start().unwrap();

        // One full cycle paints each of the four frames once.
        for _ in 0..IDLE_FRAMES {
            node.tick();
        }
        let pushed = sink.frames.lock().unwrap();
        assert_eq!(pushed.len(), IDLE_FRAMES);
        let pixels = EYE_SIZE as usize * EYE_SIZE as usize;
        assert!(pushed.iter().all(|&f| f == (pixels, EYE_SIZE, EYE_SIZE)));
        drop(pushed);

        // A second cycle under an unchanged mood is all cache hits: the
        // neutral palette never needed a blend, and each frame was painted
        // exactly once.
        for _ in 0..IDLE_FRAMES {
            node.tick();
        }
        assert_eq!(node.ctx().palette.recomputes(), 0);
        let anim = node.ctx().frames.find_animation("idle").unwrap();
        for phase in 0..IDLE_FRAMES {
            assert_eq!(node.ctx().frames.frame_repaints(anim, phase).unwrap(), 1);
        }
    }

    #[test]
    fn mood_decay_settles_to_neutral() {
        let mut node = lone_scheduler();
        node.register(1, Box::new(MoodDecay::new(5))).unwrap();
        node.start().unwrap();
        node.ctx_mut().store.adjust(MoodAxis::Irritation, 12);
        for _ in 0..4 {
            node.tick();
        }
        assert_eq!(node.ctx().store.mood().get(MoodAxis::Irritation), 0);
        assert!(node.ctx().store.mood().is_neutral());
    }
}
