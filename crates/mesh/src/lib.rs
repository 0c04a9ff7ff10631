//! Best-effort state replication between the robot's microcontrollers.
//!
//! Every node broadcasts its named shared-state blocks (the mood vector,
//! mostly) over an unreliable radio and applies whatever it hears from its
//! peers, last writer wins. There is no delivery guarantee, no ordering
//! across blocks, and no conflict resolution beyond "most recent message
//! overwrites". A node that hears nothing keeps running on stale state
//! indefinitely; that is degraded mode, not failure.
//!
//! Layers, bottom up: [`wire`] is the bit-exact frame format and CRC,
//! [`node`] tracks peer liveness, [`blocks`] is the fixed pool of named
//! byte blocks, and [`sync`] ties them into the per-node protocol state
//! machine.
//!
//! Supports `no_std`; all containers are fixed-capacity `heapless` types.

#![cfg_attr(not(feature = "std"), no_std)]

use serde::{Deserialize, Serialize};

pub mod blocks;
pub mod node;
pub mod sync;
pub mod wire;

pub use blocks::{BlockPool, MAX_BLOCKS, MAX_BLOCK_NAME, MAX_BLOCK_SIZE};
pub use node::{NodeRecord, NodeTable, MAX_NODES, OFFLINE_AFTER_BEATS};
pub use sync::{
    Counters, MeshConfig, MeshEvent, MeshSync, Phase, Transport, TransportError,
    EVENT_QUEUE_DEPTH,
};
pub use wire::{
    Command, Dest, Emergency, Heartbeat, Message, Payload, StateUpdate, StatusReport, WireError,
    HEADER_LEN, MAGIC, MAX_COMMAND_PARAMS, MAX_FRAME, MAX_PAYLOAD,
};

/// Physical (MAC-style) address of a node on the transport.
pub type Addr = [u8; 6];

/// Address every node receives on.
pub const BROADCAST_ADDR: Addr = [0xFF; 6];

/// A node's fixed logical identity in the mesh.
///
/// The discriminants are wire values; `0xFF` on the wire is the broadcast
/// destination marker, not a role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Master = 1,
    Head = 2,
    LeftArm = 3,
    RightArm = 4,
    LeftLeg = 5,
    RightLeg = 6,
    LeftHand = 7,
    RightHand = 8,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::Master,
        Role::Head,
        Role::LeftArm,
        Role::RightArm,
        Role::LeftLeg,
        Role::RightLeg,
        Role::LeftHand,
        Role::RightHand,
    ];

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(value: u8) -> Option<Role> {
        match value {
            1 => Some(Role::Master),
            2 => Some(Role::Head),
            3 => Some(Role::LeftArm),
            4 => Some(Role::RightArm),
            5 => Some(Role::LeftLeg),
            6 => Some(Role::RightLeg),
            7 => Some(Role::LeftHand),
            8 => Some(Role::RightHand),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Head => "head",
            Role::LeftArm => "left-arm",
            Role::RightArm => "right-arm",
            Role::LeftLeg => "left-leg",
            Role::RightLeg => "right-leg",
            Role::LeftHand => "left-hand",
            Role::RightHand => "right-hand",
        }
    }
}

/// Errors surfaced to callers of the mesh layer. Protocol-level garbage
/// (bad magic, bad checksum) never reaches here; it is dropped and counted
/// at the ingestion boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("operation not valid in the current protocol phase")]
    BadPhase,
    #[error("destination role is not currently online")]
    PeerOffline,
    #[error("node table is full ({MAX_NODES} peers)")]
    NodeTableFull,
    #[error("shared block pool is full ({MAX_BLOCKS} slots)")]
    PoolFull,
    #[error("block name exceeds {MAX_BLOCK_NAME} bytes")]
    NameTooLong,
    #[error("block size {0} exceeds {MAX_BLOCK_SIZE} bytes or is zero")]
    BadBlockSize(usize),
    #[error("no shared block with that name")]
    UnknownBlock,
    #[error("block size mismatch: block holds {expected} bytes, caller passed {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("command parameters exceed {MAX_COMMAND_PARAMS} bytes")]
    ParamsTooLong,
    #[error("frame error: {0}")]
    Wire(#[from] WireError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
