//! The per-node replication state machine.
//!
//! One [`MeshSync`] per node. The scheduler thread calls the block and
//! command operations, the platform timer service calls
//! [`MeshSync::on_timer`] for the periodic protocol work, and the radio
//! receive callback calls [`MeshSync::handle_frame`]. Those are different
//! execution contexts on the reference platform, so the owner is expected to
//! wrap the whole struct in a short-held mutex; nothing in here assumes
//! single-threaded access beyond `&mut self`.
//!
//! Inbound happenings (peer transitions, commands, emergencies) are queued
//! as [`MeshEvent`]s and drained by the scheduler at its own pace.

use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::blocks::BlockPool;
use crate::node::{NodeTable, OFFLINE_AFTER_BEATS};
use crate::wire::{
    Command, Dest, Emergency, Heartbeat, Message, Payload, StateUpdate, StatusReport, WireError,
    MAX_COMMAND_PARAMS,
};
use crate::{Addr, MeshError, Role, BROADCAST_ADDR};

/// Pending inbound events before the oldest is dropped.
pub const EVENT_QUEUE_DEPTH: usize = 16;

pub trait Transport {
    /// Hands one assembled frame to the radio. Best effort: no ordering, no
    /// retry, no fragmentation (the frame already fits the MTU).
    fn send(&mut self, dest: Addr, frame: &[u8]) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, dest: Addr, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(dest, frame)
    }
}

#[cfg(feature = "std")]
impl<T: Transport + ?Sized> Transport for std::boxed::Box<T> {
    fn send(&mut self, dest: Addr, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send(dest, frame)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is down")]
    Down,
    #[error("frame exceeds the transport MTU")]
    TooLong,
}

/// Protocol lifecycle. Strictly forward:
/// `Uninitialized → Initialized → Running → Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// What the scheduler finds when it drains the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeshEvent {
    NodeOnline {
        addr: Addr,
        role: Role,
    },
    NodeOffline {
        addr: Addr,
        role: Role,
    },
    Command {
        from: Role,
        command_id: u8,
        priority: u8,
        params: heapless::Vec<u8, MAX_COMMAND_PARAMS>,
    },
    /// Handled by every receiver regardless of addressing.
    Emergency {
        from: Role,
        code: u8,
    },
    Status {
        from: Role,
        report: StatusReport,
    },
}

/// Drop/accept accounting at the ingestion boundary. Protocol garbage is
/// invisible to the application except through these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx_ok: u32,
    pub rx_bad_magic: u32,
    pub rx_bad_checksum: u32,
    pub rx_bad_length: u32,
    pub rx_malformed: u32,
    pub rx_other_dest: u32,
    pub tx: u32,
    pub tx_failed: u32,
    pub events_dropped: u32,
    pub blocks_rejected: u32,
    pub peers_dropped: u32,
}

impl Counters {
    /// Total inbound frames dropped for protocol reasons.
    pub fn rx_dropped(&self) -> u32 {
        self.rx_bad_magic + self.rx_bad_checksum + self.rx_bad_length + self.rx_malformed
    }
}

/// Identity and cadence, fixed at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    pub role: Role,
    pub addr: Addr,
    pub node_id: u32,
    pub fw_version: u8,
    pub cfg_version: u8,
    pub heartbeat_interval_ms: u32,
}

pub struct MeshSync<T> {
    transport: T,
    config: MeshConfig,
    phase: Phase,
    seq: u8,
    last_heartbeat_ms: u32,
    started_ms: u32,
    /// Low bits of the scheduler's loop counter, refreshed each tick for
    /// heartbeat payloads.
    loop_count: u16,
    nodes: NodeTable,
    blocks: BlockPool,
    events: Deque<MeshEvent, EVENT_QUEUE_DEPTH>,
    counters: Counters,
}

impl<T: Transport> MeshSync<T> {
    pub fn new(transport: T, config: MeshConfig) -> Self {
        MeshSync {
            transport,
            config,
            phase: Phase::Uninitialized,
            seq: 0,
            last_heartbeat_ms: 0,
            started_ms: 0,
            loop_count: 0,
            nodes: NodeTable::new(),
            blocks: BlockPool::new(),
            events: Deque::new(),
            counters: Counters::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Brings the transport-facing state up: seeds the sequence counter from
    /// the node id so two nodes rebooting together don't emit identical
    /// streams.
    pub fn init(&mut self, _now_ms: u32) -> Result<(), MeshError> {
        if self.phase != Phase::Uninitialized {
            return Err(MeshError::BadPhase);
        }
        self.seq = (self.config.node_id & 0xFF) as u8;
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Starts the protocol proper and announces this node immediately rather
    /// than waiting out the first heartbeat interval.
    pub fn start(&mut self, now_ms: u32) -> Result<(), MeshError> {
        if self.phase != Phase::Initialized {
            return Err(MeshError::BadPhase);
        }
        self.phase = Phase::Running;
        self.started_ms = now_ms;
        self.send_heartbeat(now_ms);
        Ok(())
    }

    /// Tears the protocol down. The node table is retained but frozen.
    pub fn stop(&mut self) -> Result<(), MeshError> {
        if self.phase != Phase::Running {
            return Err(MeshError::BadPhase);
        }
        self.phase = Phase::Stopped;
        Ok(())
    }

    pub fn set_loop_count(&mut self, loop_count: u16) {
        self.loop_count = loop_count;
    }

    // ---- shared-state blocks ----------------------------------------------

    pub fn alloc_block(&mut self, name: &str, size: usize) -> Result<(), MeshError> {
        match self.phase {
            Phase::Initialized | Phase::Running => self.blocks.alloc(name, size),
            _ => Err(MeshError::BadPhase),
        }
    }

    pub fn write_block(&mut self, name: &str, bytes: &[u8]) -> Result<(), MeshError> {
        match self.phase {
            Phase::Initialized | Phase::Running => self.blocks.write(name, bytes),
            _ => Err(MeshError::BadPhase),
        }
    }

    pub fn read_block(&self, name: &str, out: &mut [u8]) -> Result<(), MeshError> {
        self.blocks.read(name, out)
    }

    // ---- timer path -------------------------------------------------------

    /// One pass of the periodic work: heartbeat if due, broadcast dirty
    /// blocks, sweep for silent peers. Called from the platform timer; a
    /// no-op outside `Running`.
    pub fn on_timer(&mut self, now_ms: u32) {
        if self.phase != Phase::Running {
            return;
        }
        if now_ms.wrapping_sub(self.last_heartbeat_ms) >= self.config.heartbeat_interval_ms {
            self.send_heartbeat(now_ms);
        }
        self.flush_dirty(now_ms);
        self.sweep(now_ms);
    }

    /// Broadcasts every dirty block and clears its flag. The flag stays set
    /// if the transport refuses the frame, so the block is retried on the
    /// next pass.
    pub fn flush_dirty(&mut self, now_ms: u32) {
        for i in 0..self.blocks.blocks.len() {
            if !self.blocks.blocks[i].dirty {
                continue;
            }
            let update = {
                let block = &self.blocks.blocks[i];
                StateUpdate {
                    name: block.name.clone(),
                    data: block.data.clone(),
                }
            };
            if self
                .send_message(BROADCAST_ADDR, Dest::Broadcast, Payload::State(update), now_ms)
                .is_ok()
            {
                self.blocks.blocks[i].dirty = false;
            }
        }
    }

    fn send_heartbeat(&mut self, now_ms: u32) {
        let heartbeat = Heartbeat {
            node_id: self.config.node_id,
            fw_version: self.config.fw_version,
            cfg_version: self.config.cfg_version,
            loop_count: self.loop_count,
        };
        let _ = self.send_message(
            BROADCAST_ADDR,
            Dest::Broadcast,
            Payload::Heartbeat(heartbeat),
            now_ms,
        );
        self.last_heartbeat_ms = now_ms;
    }

    fn sweep(&mut self, now_ms: u32) {
        let timeout = self
            .config
            .heartbeat_interval_ms
            .saturating_mul(OFFLINE_AFTER_BEATS);
        for (addr, role) in self.nodes.sweep(now_ms, timeout) {
            log::info!("peer {} went offline", role.name());
            self.push_event(MeshEvent::NodeOffline { addr, role });
        }
    }

    // ---- receive path -----------------------------------------------------

    /// Ingests one raw frame from the radio. Invalid frames are dropped and
    /// counted; valid ones refresh the sender's liveness and are dispatched.
    pub fn handle_frame(&mut self, src: Addr, bytes: &[u8], now_ms: u32) {
        if self.phase != Phase::Running || src == self.config.addr {
            return;
        }
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                match e {
                    WireError::BadMagic => self.counters.rx_bad_magic += 1,
                    WireError::ChecksumMismatch => self.counters.rx_bad_checksum += 1,
                    WireError::Truncated
                    | WireError::LengthMismatch
                    | WireError::PayloadTooLong => self.counters.rx_bad_length += 1,
                    WireError::UnknownType(_)
                    | WireError::UnknownRole(_)
                    | WireError::MalformedPayload => self.counters.rx_malformed += 1,
                }
                log::debug!("dropped frame from {src:02x?}: {e}");
                return;
            }
        };
        self.counters.rx_ok += 1;

        match self.nodes.observe(src, message.source, message.seq, now_ms) {
            Ok(true) => {
                log::info!("peer {} is online", message.source.name());
                self.push_event(MeshEvent::NodeOnline {
                    addr: src,
                    role: message.source,
                });
            }
            Ok(false) => {}
            Err(_) => {
                // Degraded mode: keep processing, just don't track the peer.
                self.counters.peers_dropped += 1;
            }
        }

        // Emergencies bypass destination filtering entirely.
        if let Payload::Emergency(Emergency { code }) = message.payload {
            self.push_event(MeshEvent::Emergency {
                from: message.source,
                code,
            });
            return;
        }

        if let Dest::Role(role) = message.dest {
            if role != self.config.role {
                self.counters.rx_other_dest += 1;
                return;
            }
        }

        match message.payload {
            Payload::Heartbeat(heartbeat) => {
                self.nodes.note_heartbeat(&src, heartbeat);
            }
            Payload::Command(Command {
                command_id,
                priority,
                params,
            }) => {
                self.push_event(MeshEvent::Command {
                    from: message.source,
                    command_id,
                    priority,
                    params,
                });
            }
            Payload::Status(report) => {
                self.push_event(MeshEvent::Status {
                    from: message.source,
                    report,
                });
            }
            Payload::State(update) => {
                // Last writer wins, no merge. A block we never allocated or
                // whose size disagrees is dropped whole.
                if self.blocks.apply_remote(&update.name, &update.data).is_err() {
                    self.counters.blocks_rejected += 1;
                }
            }
            Payload::Emergency(_) => unreachable!("handled above"),
        }
    }

    /// Next queued inbound event, oldest first.
    pub fn poll_event(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    // ---- application sends ------------------------------------------------

    /// Point-to-point command. Fails fast when the destination role is not
    /// currently known-online; there is no store-and-forward.
    pub fn send_command(
        &mut self,
        dest: Role,
        command_id: u8,
        priority: u8,
        params: &[u8],
        now_ms: u32,
    ) -> Result<(), MeshError> {
        if self.phase != Phase::Running {
            return Err(MeshError::BadPhase);
        }
        let record = self.nodes.by_role(dest).ok_or(MeshError::PeerOffline)?;
        if !record.online {
            return Err(MeshError::PeerOffline);
        }
        let addr = record.addr;
        let params = heapless::Vec::from_slice(params).map_err(|_| MeshError::ParamsTooLong)?;
        self.send_message(
            addr,
            Dest::Role(dest),
            Payload::Command(Command {
                command_id,
                priority,
                params,
            }),
            now_ms,
        )
    }

    /// Emergency stop: broadcast, handled by every receiver regardless of
    /// role.
    pub fn broadcast_emergency(&mut self, code: u8, now_ms: u32) -> Result<(), MeshError> {
        if self.phase != Phase::Running {
            return Err(MeshError::BadPhase);
        }
        self.send_message(
            BROADCAST_ADDR,
            Dest::Broadcast,
            Payload::Emergency(Emergency { code }),
            now_ms,
        )
    }

    /// Broadcasts a status report; uptime and the error count are filled in
    /// from protocol state.
    pub fn send_status(&mut self, mut report: StatusReport, now_ms: u32) -> Result<(), MeshError> {
        if self.phase != Phase::Running {
            return Err(MeshError::BadPhase);
        }
        report.uptime_sec = now_ms.wrapping_sub(self.started_ms) / 1000;
        report.error_count = self.counters.rx_dropped().min(u16::MAX as u32) as u16;
        self.send_message(BROADCAST_ADDR, Dest::Broadcast, Payload::Status(report), now_ms)
    }

    // ---- internals --------------------------------------------------------

    fn send_message(
        &mut self,
        dest_addr: Addr,
        dest: Dest,
        payload: Payload,
        now_ms: u32,
    ) -> Result<(), MeshError> {
        let message = Message {
            source: self.config.role,
            dest,
            seq: self.seq,
            timestamp_ms: now_ms,
            payload,
        };
        self.seq = self.seq.wrapping_add(1);
        let frame = message.encode()?;
        match self.transport.send(dest_addr, &frame) {
            Ok(()) => {
                self.counters.tx += 1;
                Ok(())
            }
            Err(e) => {
                self.counters.tx_failed += 1;
                Err(e.into())
            }
        }
    }

    fn push_event(&mut self, event: MeshEvent) {
        if self.events.is_full() {
            self.events.pop_front();
            self.counters.events_dropped += 1;
        }
        // Just made room, cannot fail.
        let _ = self.events.push_back(event);
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
