//! An in-process stand-in for the radio: every node hangs an endpoint off
//! one shared bus, sends land in a queue, and the driver loop delivers them.
//!
//! The medium is deliberately imperfect. A seeded xorshift decides which
//! frames the air eats, so a lossy run is reproducible down to the frame.
//! Like the real radio, the sender never learns about a drop.

use std::sync::{Arc, Mutex};

use animus_mesh::{Addr, Transport, TransportError, BROADCAST_ADDR};

fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// One frame in flight: sender, destination, bytes.
pub type InFlight = (Addr, Addr, Vec<u8>);

struct BusInner {
    frames: Vec<InFlight>,
    loss_pct: u8,
    rng: u64,
    sent: u64,
    dropped: u64,
}

#[derive(Clone)]
pub struct Bus {
    inner: Arc<Mutex<BusInner>>,
}

impl Bus {
    pub fn new(loss_pct: u8, seed: u64) -> Self {
        Bus {
            inner: Arc::new(Mutex::new(BusInner {
                frames: Vec::new(),
                loss_pct: loss_pct.min(100),
                // Xorshift must not start at zero.
                rng: seed | 1,
                sent: 0,
                dropped: 0,
            })),
        }
    }

    /// A transport handle for the node at `addr`.
    pub fn endpoint(&self, addr: Addr) -> BusEndpoint {
        BusEndpoint {
            addr,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Takes every frame currently in flight. The caller delivers each to
    /// the nodes it addresses (everyone but the sender for broadcasts).
    pub fn drain(&self) -> Vec<InFlight> {
        std::mem::take(&mut self.inner.lock().unwrap().frames)
    }

    /// (frames offered, frames the medium ate).
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.sent, inner.dropped)
    }
}

pub struct BusEndpoint {
    addr: Addr,
    inner: Arc<Mutex<BusInner>>,
}

impl Transport for BusEndpoint {
    fn send(&mut self, dest: Addr, frame: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sent += 1;
        if inner.loss_pct > 0 && xorshift64(&mut inner.rng) % 100 < inner.loss_pct as u64 {
            // The air ate it; the sender still sees success.
            inner.dropped += 1;
            return Ok(());
        }
        inner.frames.push((self.addr, dest, frame.to_vec()));
        Ok(())
    }
}

/// True when a frame sent to `dest` should reach the node at `addr`.
pub fn addressed_to(dest: &Addr, addr: &Addr) -> bool {
    *dest == BROADCAST_ADDR || *dest == *addr
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Addr = [1; 6];
    const B: Addr = [2; 6];

    #[test]
    fn lossless_bus_carries_everything() {
        let bus = Bus::new(0, 7);
        let mut a = bus.endpoint(A);
        a.send(BROADCAST_ADDR, &[1, 2, 3]).unwrap();
        a.send(B, &[4]).unwrap();

        let frames = bus.drain();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (A, BROADCAST_ADDR, vec![1, 2, 3]));
        assert!(addressed_to(&frames[0].1, &B));
        assert!(addressed_to(&frames[1].1, &B));
        assert!(!addressed_to(&frames[1].1, &A));
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn loss_is_deterministic_for_a_seed() {
        let survivors = |seed: u64| {
            let bus = Bus::new(40, seed);
            let mut a = bus.endpoint(A);
            for i in 0..100u8 {
                a.send(BROADCAST_ADDR, &[i]).unwrap();
            }
            bus.drain()
                .into_iter()
                .map(|(_, _, f)| f[0])
                .collect::<Vec<_>>()
        };
        let first = survivors(0xC0FFEE);
        assert_eq!(first, survivors(0xC0FFEE));
        assert_ne!(first, survivors(0xBEEF));

        let bus = Bus::new(40, 0xC0FFEE);
        let mut a = bus.endpoint(A);
        for i in 0..100u8 {
            a.send(BROADCAST_ADDR, &[i]).unwrap();
        }
        let (sent, dropped) = bus.stats();
        assert_eq!(sent, 100);
        assert_eq!(dropped as usize, 100 - bus.drain().len());
        // Somewhere near the configured 40%.
        assert!((20..60).contains(&dropped));
    }
}
