//! Host-side mesh simulator: a whole robot's worth of nodes in one process.
//!
//! Each node runs the same scheduler and components the firmware does, wired
//! to a shared in-process bus instead of the radio. Useful for watching mood
//! replication behave (and misbehave, with `--loss`) without flashing eight
//! boards.
//!
//! `--state-file` persists each node's config and last mood the same way the
//! firmware persists calibration to flash: a 4-byte magic, then postcard.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use animus_mesh::{MeshConfig, Role};
use animus_mood::{MoodAxis, MoodVector, DISTANCE_NONE};
use animus_runtime::components::{
    DistancePoll, EyeRenderer, MeshEventPump, MoodDecay, MoodReplicator, StatusBroadcaster,
};
use animus_runtime::{
    Clock, Component, DistanceSensor, FrameSink, MeshTimer, NodeConfig, NodeContext, Scheduler,
    WallClock,
};
use anyhow::Context as _;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::bus::{addressed_to, Bus};

mod bus;

const FW_VERSION: u8 = 2;
const FLASH_MAGIC: &[u8; 4] = b"anim";

#[derive(Parser)]
struct Args {
    /// How many nodes to run; roles are assigned in mesh order, the first
    /// is the torso master.
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Scheduler iterations to run before reporting.
    #[arg(long, default_value_t = 200)]
    ticks: u64,

    /// Scheduler tick period, in milliseconds.
    #[arg(long, default_value_t = 50)]
    tick_ms: u32,

    /// Mesh heartbeat interval, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u32,

    /// Percent of frames the simulated medium eats.
    #[arg(long, default_value_t = 0)]
    loss: u8,

    #[arg(long, default_value_t = 0x00C0_FFEE)]
    seed: u64,

    /// Persist node moods across runs, flash-style.
    #[arg(long)]
    state_file: Option<PathBuf>,
}

/// Scripted mood activity on the master, so there is something to replicate.
struct MoodScript;

impl Component for MoodScript {
    fn name(&self) -> &'static str {
        "mood-script"
    }

    fn act(&mut self, ctx: &mut NodeContext) {
        let bump = match ctx.loop_count {
            20 => Some((MoodAxis::Anger, 300)),
            60 => Some((MoodAxis::Anger, -250)),
            61 => Some((MoodAxis::Happiness, 400)),
            120 => Some((MoodAxis::Curiosity, 350)),
            180 => Some((MoodAxis::Contentment, 500)),
            _ => None,
        };
        if let Some((axis, delta)) = bump {
            log::info!("script: {} {delta:+}", axis.name());
            ctx.store.adjust(axis, delta);
        }
    }
}

/// A wandering ultrasonic target that sometimes walks out of range.
struct SimSensor {
    rng: u64,
}

impl DistanceSensor for SimSensor {
    fn read_distance(&mut self) -> u8 {
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        match self.rng % 4 {
            0 => DISTANCE_NONE,
            _ => (30 + self.rng % 170) as u8,
        }
    }
}

/// Display stand-in: logs a digest of each pushed frame.
struct ConsoleSink;

impl FrameSink for ConsoleSink {
    fn push_frame(&mut self, rgb565: &[u16], width: u16, height: u16) {
        let digest = rgb565
            .iter()
            .fold(0u32, |acc, &px| acc.rotate_left(5).wrapping_add(px as u32));
        log::debug!("eye frame {width}x{height}, digest {digest:08x}");
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SavedNode {
    config: NodeConfig,
    mood: MoodVector,
}

fn encode_state(saved: &[SavedNode]) -> anyhow::Result<Vec<u8>> {
    let mut bytes = FLASH_MAGIC.to_vec();
    bytes.extend(postcard::to_stdvec(&saved)?);
    Ok(bytes)
}

fn decode_state(bytes: &[u8]) -> anyhow::Result<Vec<SavedNode>> {
    let body = bytes
        .strip_prefix(FLASH_MAGIC)
        .context("state file has the wrong magic")?;
    Ok(postcard::from_bytes(body)?)
}

fn load_state(path: &Path) -> anyhow::Result<Vec<SavedNode>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_state(&bytes)
}

fn save_state(path: &Path, nodes: &[Scheduler]) -> anyhow::Result<()> {
    let saved: Vec<SavedNode> = nodes
        .iter()
        .map(|n| SavedNode {
            config: n.ctx().config,
            mood: n.ctx().store.snapshot(),
        })
        .collect();
    std::fs::write(path, encode_state(&saved)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn build_nodes(
    args: &Args,
    bus: &Bus,
    clock: Arc<dyn Clock>,
    saved: &[SavedNode],
) -> anyhow::Result<Vec<Scheduler>> {
    let mut nodes = Vec::new();
    for (i, role) in Role::ALL[..args.nodes].iter().copied().enumerate() {
        let addr = [0x42, 0x4E, 0, 0, 0, i as u8 + 1];
        let config = NodeConfig {
            mesh: MeshConfig {
                role,
                addr,
                node_id: i as u32 + 1,
                fw_version: FW_VERSION,
                cfg_version: 1,
                heartbeat_interval_ms: args.heartbeat_ms,
            },
            tick_period_ms: args.tick_ms,
        };
        let mut node = Scheduler::new(NodeContext::new(
            config,
            Box::new(bus.endpoint(addr)),
            Arc::clone(&clock),
        ));

        node.register(1, Box::new(MoodReplicator::new()))?;
        node.register(1, Box::new(MeshEventPump))?;
        match role {
            Role::Master => {
                node.register(1, Box::new(MoodScript))?;
                node.register(
                    5,
                    Box::new(DistancePoll::new(Box::new(SimSensor {
                        rng: args.seed | 1,
                    }))),
                )?;
                node.register(50, Box::new(StatusBroadcaster::new(0b0111)))?;
                node.register(25, Box::new(MoodDecay::new(3)))?;
            }
            Role::Head => {
                node.register(2, Box::new(EyeRenderer::new(Box::new(ConsoleSink))))?;
            }
            _ => {}
        }

        if let Some(saved) = saved
            .iter()
            .find(|s| s.config.mesh.node_id == config.mesh.node_id)
        {
            log::info!("restoring saved mood for {}", role.name());
            node.ctx_mut().store.set_mood(saved.mood);
        }

        node.start()?;
        nodes.push(node);
    }
    Ok(nodes)
}

/// Carries every in-flight frame to the nodes it addresses. Senders never
/// hear their own broadcasts, same as the radio.
fn deliver(bus: &Bus, nodes: &mut [Scheduler], now_ms: u32) {
    for (src, dest, frame) in bus.drain() {
        for node in nodes.iter_mut() {
            let addr = node.ctx().config.mesh.addr;
            if addr != src && addressed_to(&dest, &addr) {
                node.ctx().mesh().handle_frame(src, &frame, now_ms);
            }
        }
    }
}

fn print_summary(nodes: &[Scheduler]) {
    print!("{:<12}", "role");
    for axis in MoodAxis::ALL {
        print!("{:>7}", &axis.name()[..axis.name().len().min(5)]);
    }
    println!("{:>7}{:>7}{:>7}", "peers", "rx_ok", "drops");
    for node in nodes {
        let ctx = node.ctx();
        print!("{:<12}", ctx.config.mesh.role.name());
        for axis in MoodAxis::ALL {
            print!("{:>7}", ctx.store.mood().get(axis));
        }
        let mesh = ctx.mesh();
        println!(
            "{:>7}{:>7}{:>7}",
            mesh.nodes().online_count(),
            mesh.counters().rx_ok,
            mesh.counters().rx_dropped()
        );
    }
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(
        (1..=Role::ALL.len()).contains(&args.nodes),
        "between 1 and {} nodes",
        Role::ALL.len()
    );

    let bus = Bus::new(args.loss, args.seed);
    let clock: Arc<dyn Clock> = Arc::new(WallClock::new());
    let saved = match &args.state_file {
        Some(path) => load_state(path)?,
        None => Vec::new(),
    };

    let mut nodes = build_nodes(&args, &bus, Arc::clone(&clock), &saved)?;

    // The platform timer service, one per node: heartbeats and liveness
    // sweeps run concurrently with the schedulers below.
    let timer_period = Duration::from_millis((args.heartbeat_ms / 4).max(10) as u64);
    let timers: Vec<MeshTimer> = nodes
        .iter()
        .map(|n| MeshTimer::spawn(Arc::clone(&n.ctx().mesh), Arc::clone(&clock), timer_period))
        .collect();

    let tick = Duration::from_millis(args.tick_ms as u64);
    for _ in 0..args.ticks {
        for node in &mut nodes {
            node.tick();
        }
        deliver(&bus, &mut nodes, clock.now_ms());
        std::thread::sleep(tick);
    }
    // Late frames from the final tick.
    deliver(&bus, &mut nodes, clock.now_ms());

    for timer in timers {
        timer.stop();
    }
    for node in &nodes {
        let _ = node.ctx().mesh().stop();
    }

    print_summary(&nodes);
    let (sent, dropped) = bus.stats();
    println!("medium: {sent} frames offered, {dropped} eaten");

    if let Some(path) = &args.state_file {
        save_state(path, &nodes)?;
        println!("state saved to {}", path.display());
    }
    Ok(())
}
