//! The emotional state of a single node, and the store that owns it.
//!
//! Every node carries one [`MoodStore`]: the canonical [`MoodVector`] plus a
//! few status scalars (distance reading, battery, speaking/moving flags).
//! Behavior components nudge the vector with [`MoodStore::adjust`].
//! Everything downstream decides staleness by comparing [`MoodVector`]
//! snapshots for exact equality, so a single-unit change on any axis
//! registers as "changed".
//!
//! This crate supports `no_std` so the same types can run on the
//! microcontrollers and in the host simulator.
//!
//! Axis intensities are unsigned, `0..=MOOD_MAX`. The firmware historically
//! also had a signed -128..127 convention; the unsigned one won because the
//! palette blend factor falls straight out of it.

#![cfg_attr(not(feature = "std"), no_std)]

use serde::{Deserialize, Serialize};

/// Largest intensity an axis can hold. An axis at `MOOD_MAX` blends its
/// palette at full weight.
pub const MOOD_MAX: u16 = 999;

/// Number of mood axes. Fixed; the mesh encoding depends on it.
pub const AXIS_COUNT: usize = 8;

/// Size of the little-endian encoding of a [`MoodVector`].
pub const MOOD_BYTES: usize = AXIS_COUNT * 2;

/// Distance-sensor sentinel for "no detection". Never "very far".
pub const DISTANCE_NONE: u8 = 255;

/// One dimension of the emotional state.
///
/// The discriminants are stable: they are array indices here and slot
/// positions in the 16-byte mesh encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoodAxis {
    Anger = 0,
    Fear = 1,
    Happiness = 2,
    Irritation = 3,
    Curiosity = 4,
    Affection = 5,
    Contentment = 6,
    Excitement = 7,
}

impl MoodAxis {
    pub const ALL: [MoodAxis; AXIS_COUNT] = [
        MoodAxis::Anger,
        MoodAxis::Fear,
        MoodAxis::Happiness,
        MoodAxis::Irritation,
        MoodAxis::Curiosity,
        MoodAxis::Affection,
        MoodAxis::Contentment,
        MoodAxis::Excitement,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MoodAxis::Anger => "anger",
            MoodAxis::Fear => "fear",
            MoodAxis::Happiness => "happiness",
            MoodAxis::Irritation => "irritation",
            MoodAxis::Curiosity => "curiosity",
            MoodAxis::Affection => "affection",
            MoodAxis::Contentment => "contentment",
            MoodAxis::Excitement => "excitement",
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// A full emotional state: one intensity per axis, each in `0..=MOOD_MAX`.
///
/// Equality is exact, field for field. That is the contract every cache in
/// the system relies on, so no approximate comparisons here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoodVector {
    axes: [u16; AXIS_COUNT],
}

impl MoodVector {
    /// The boot-time state: every axis at zero.
    pub const fn neutral() -> Self {
        MoodVector {
            axes: [0; AXIS_COUNT],
        }
    }

    pub fn get(&self, axis: MoodAxis) -> u16 {
        self.axes[axis.index()]
    }

    /// Overwrites one axis, clamping to `MOOD_MAX`. Out-of-range values are
    /// clamped, never wrapped.
    pub fn set(&mut self, axis: MoodAxis, value: u16) {
        self.axes[axis.index()] = value.min(MOOD_MAX);
    }

    /// Adds `delta` to one axis and clamps the result into `0..=MOOD_MAX`.
    /// Always succeeds, whatever the magnitude or sign of `delta`.
    pub fn adjust(&mut self, axis: MoodAxis, delta: i16) {
        let next = (self.axes[axis.index()] as i32 + delta as i32).clamp(0, MOOD_MAX as i32);
        self.axes[axis.index()] = next as u16;
    }

    pub fn is_neutral(&self) -> bool {
        self.axes.iter().all(|&v| v == 0)
    }

    /// Fixed 16-byte little-endian encoding, for carrying the vector in a
    /// shared-state block. The length never varies, which is what lets the
    /// block pool enforce exact sizes.
    pub fn to_le_bytes(&self) -> [u8; MOOD_BYTES] {
        let mut out = [0u8; MOOD_BYTES];
        for (i, v) in self.axes.iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Values above `MOOD_MAX`
    /// (a peer running different firmware, say) are clamped on the way in.
    pub fn from_le_bytes(bytes: &[u8; MOOD_BYTES]) -> Self {
        let mut axes = [0u16; AXIS_COUNT];
        for (i, a) in axes.iter_mut().enumerate() {
            *a = u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]).min(MOOD_MAX);
        }
        MoodVector { axes }
    }
}

impl Default for MoodVector {
    fn default() -> Self {
        MoodVector::neutral()
    }
}

/// Status scalars that live next to the mood but aren't part of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Last ultrasonic reading, `DISTANCE_NONE` when nothing echoed back.
    pub distance: u8,
    pub battery_pct: u8,
    /// How many mesh peers are currently online.
    pub peers_online: u8,
    pub speaking: bool,
    pub moving: bool,
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus {
            distance: DISTANCE_NONE,
            battery_pct: 100,
            peers_online: 0,
            speaking: false,
            moving: false,
        }
    }
}

/// A single named status write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusUpdate {
    Distance(u8),
    BatteryPct(u8),
    PeersOnline(u8),
    Speaking(bool),
    Moving(bool),
}

/// The single source of truth for one node's emotional and status state.
///
/// Created once at boot and never destroyed. All normal mutation happens on
/// the node's scheduler thread; replicated updates land here via the mood
/// replication component, not via the mesh receive path directly.
#[derive(Clone, Debug, Default)]
pub struct MoodStore {
    mood: MoodVector,
    status: NodeStatus,
}

impl MoodStore {
    pub fn new() -> Self {
        MoodStore::default()
    }

    pub fn mood(&self) -> &MoodVector {
        &self.mood
    }

    /// Cheap copy for later equality comparison.
    pub fn snapshot(&self) -> MoodVector {
        self.mood
    }

    /// Replaces the whole vector. Used when a replicated value arrives from
    /// a peer; last writer wins.
    pub fn set_mood(&mut self, mood: MoodVector) {
        self.mood = mood;
    }

    pub fn adjust(&mut self, axis: MoodAxis, delta: i16) {
        self.mood.adjust(axis, delta);
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub fn set_status(&mut self, update: StatusUpdate) {
        match update {
            StatusUpdate::Distance(d) => self.status.distance = d,
            StatusUpdate::BatteryPct(p) => self.status.battery_pct = p.min(100),
            StatusUpdate::PeersOnline(n) => self.status.peers_online = n,
            StatusUpdate::Speaking(s) => self.status.speaking = s,
            StatusUpdate::Moving(m) => self.status.moving = m,
        }
    }
}
