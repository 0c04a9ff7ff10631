//! The table of known peers and their liveness.
//!
//! One record per physical address, allocated on first contact and reused
//! forever; going quiet marks a peer offline but never frees its slot. A
//! peer is offline once it has been silent for more than
//! [`OFFLINE_AFTER_BEATS`] heartbeat intervals (at exactly five intervals it
//! is still online), and comes back the moment any valid message arrives.

use heapless::Vec;

use crate::wire::Heartbeat;
use crate::{Addr, MeshError, Role};

/// Peer slots. The robot has eight roles; the headroom absorbs re-flashed
/// boards showing up under a new address.
pub const MAX_NODES: usize = 16;

/// Missed-heartbeat multiplier before a peer is declared offline.
pub const OFFLINE_AFTER_BEATS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub addr: Addr,
    pub role: Role,
    pub last_seen_ms: u32,
    pub online: bool,
    /// Valid messages received from this peer.
    pub rx_count: u32,
    pub last_seq: u8,
    pub last_heartbeat: Option<Heartbeat>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeTable {
    nodes: Vec<NodeRecord, MAX_NODES>,
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable::default()
    }

    pub fn get(&self, addr: &Addr) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.addr == *addr)
    }

    /// The record currently claiming `role`, if any.
    pub fn by_role(&self, role: Role) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.role == role)
    }

    /// Records a valid message from `addr`. Returns `true` when this
    /// transitioned the peer offline→online (including first contact).
    pub fn observe(
        &mut self,
        addr: Addr,
        role: Role,
        seq: u8,
        now_ms: u32,
    ) -> Result<bool, MeshError> {
        if let Some(record) = self.nodes.iter_mut().find(|n| n.addr == addr) {
            let came_online = !record.online;
            record.role = role;
            record.last_seen_ms = now_ms;
            record.online = true;
            record.rx_count = record.rx_count.wrapping_add(1);
            record.last_seq = seq;
            return Ok(came_online);
        }
        self.nodes
            .push(NodeRecord {
                addr,
                role,
                last_seen_ms: now_ms,
                online: true,
                rx_count: 1,
                last_seq: seq,
                last_heartbeat: None,
            })
            .map_err(|_| MeshError::NodeTableFull)?;
        Ok(true)
    }

    pub fn note_heartbeat(&mut self, addr: &Addr, heartbeat: Heartbeat) {
        if let Some(record) = self.nodes.iter_mut().find(|n| n.addr == *addr) {
            record.last_heartbeat = Some(heartbeat);
        }
    }

    /// Marks every peer silent for longer than `timeout_ms` offline and
    /// returns the peers that just transitioned.
    pub fn sweep(&mut self, now_ms: u32, timeout_ms: u32) -> Vec<(Addr, Role), MAX_NODES> {
        let mut went_offline = Vec::new();
        for record in self.nodes.iter_mut() {
            if record.online && now_ms.wrapping_sub(record.last_seen_ms) > timeout_ms {
                record.online = false;
                // Capacity matches the table, the push cannot fail.
                let _ = went_offline.push((record.addr, record.role));
            }
        }
        went_offline
    }

    pub fn online_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.online).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_A: Addr = [1, 2, 3, 4, 5, 6];

    #[test]
    fn observe_creates_then_reuses_one_record() {
        let mut table = NodeTable::new();
        assert!(table.observe(ADDR_A, Role::Head, 0, 100).unwrap());
        assert!(!table.observe(ADDR_A, Role::Head, 1, 200).unwrap());
        assert_eq!(table.iter().count(), 1);
        let record = table.get(&ADDR_A).unwrap();
        assert_eq!(record.rx_count, 2);
        assert_eq!(record.last_seen_ms, 200);
    }

    #[test]
    fn offline_at_five_beats_strictly() {
        // Heartbeat interval H = 1000 ms, last heard at t = 0.
        let mut table = NodeTable::new();
        table.observe(ADDR_A, Role::Head, 0, 0).unwrap();
        let timeout = OFFLINE_AFTER_BEATS * 1000;

        assert!(table.sweep(4_000, timeout).is_empty());
        assert!(table.get(&ADDR_A).unwrap().online);

        // Exactly 5H: still online (the comparison is strict).
        assert!(table.sweep(5_000, timeout).is_empty());

        let offline = table.sweep(6_000, timeout);
        assert_eq!(offline.as_slice(), &[(ADDR_A, Role::Head)][..]);
        assert!(!table.get(&ADDR_A).unwrap().online);

        // A second sweep does not re-report it.
        assert!(table.sweep(7_000, timeout).is_empty());
    }

    #[test]
    fn message_revives_an_offline_peer() {
        let mut table = NodeTable::new();
        table.observe(ADDR_A, Role::Head, 0, 0).unwrap();
        table.sweep(60_000, 5_000);
        assert!(!table.get(&ADDR_A).unwrap().online);
        assert!(table.observe(ADDR_A, Role::Head, 1, 61_000).unwrap());
        assert!(table.get(&ADDR_A).unwrap().online);
    }

    #[test]
    fn table_capacity_is_reported() {
        let mut table = NodeTable::new();
        for i in 0..MAX_NODES {
            let addr = [i as u8; 6];
            table.observe(addr, Role::Head, 0, 0).unwrap();
        }
        assert_eq!(
            table.observe([0xAA; 6], Role::Head, 0, 0),
            Err(MeshError::NodeTableFull)
        );
    }
}
