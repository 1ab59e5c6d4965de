//! Neighbour table and per-neighbour packet queues

use heapless::{Deque, Vec};

use crate::mac::LinkAddr;
use crate::packet::Packet;

use super::config::{QUEUE_LEN, MAX_NEIGHBOURS};

/// Estimated wake-up phase of a neighbour, relative to our own last wake-up
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// No phase known, Wake-Requests are sent immediately
    Unknown,
    /// Always reachable
    Always,
    /// Offset in microseconds from our own last wake-up
    Known(u32),
}

impl Phase {
    /// Rotate a known phase for a shift of our own wake-up schedule
    pub fn shifted(self, by: u32, interval: u32) -> Self {
        match self {
            Phase::Known(p) => Phase::Known(((p % interval) + interval - (by % interval)) % interval),
            p => p,
        }
    }
}

/// Packet queue type
pub type PacketQueue = Deque<Packet, QUEUE_LEN>;

/// Neighbour record
pub struct Neighbour {
    pub addr: LinkAddr,
    pub phase: Phase,
    pub(crate) queue: PacketQueue,
    /// Failed attempts charged to the frame at the head of the queue
    pub(crate) attempts: u8,
}

impl core::fmt::Debug for Neighbour {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Neighbour")
            .field("addr", &self.addr)
            .field("phase", &self.phase)
            .field("queued", &self.queue.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Neighbour {
    pub fn new(addr: LinkAddr, phase: Phase) -> Self {
        Self { addr, phase, queue: Deque::new(), attempts: 0 }
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }
}

/// Neighbour handle, indexes are stable while a neighbour is current
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NeighbourId {
    Broadcast,
    Unicast(usize),
}

/// Bounded neighbour table with a dedicated broadcast queue
#[derive(Debug)]
pub struct Neighbours {
    broadcast: Neighbour,
    table: Vec<Neighbour, MAX_NEIGHBOURS>,
    cursor: usize,
}

impl Default for Neighbours {
    fn default() -> Self {
        Self::new()
    }
}

impl Neighbours {
    pub fn new() -> Self {
        Self {
            broadcast: Neighbour::new(LinkAddr::BROADCAST, Phase::Always),
            table: Vec::new(),
            cursor: 0,
        }
    }

    pub fn find(&self, addr: &LinkAddr) -> Option<NeighbourId> {
        if addr.is_broadcast() {
            return Some(NeighbourId::Broadcast);
        }
        self.table.iter().position(|n| &n.addr == addr).map(NeighbourId::Unicast)
    }

    /// Find a neighbour, creating an entry if required.
    /// Returns `None` if the table is full.
    pub fn find_or_insert(&mut self, addr: LinkAddr) -> Option<NeighbourId> {
        if let Some(id) = self.find(&addr) {
            return Some(id);
        }

        self.table.push(Neighbour::new(addr, Phase::Unknown)).ok()?;

        Some(NeighbourId::Unicast(self.table.len() - 1))
    }

    pub fn get(&self, id: NeighbourId) -> Option<&Neighbour> {
        match id {
            NeighbourId::Broadcast => Some(&self.broadcast),
            NeighbourId::Unicast(i) => self.table.get(i),
        }
    }

    pub fn get_mut(&mut self, id: NeighbourId) -> Option<&mut Neighbour> {
        match id {
            NeighbourId::Broadcast => Some(&mut self.broadcast),
            NeighbourId::Unicast(i) => self.table.get_mut(i),
        }
    }

    /// Select the next neighbour with queued packets,
    /// broadcast first then unicast neighbours round-robin
    pub fn next_ready(&mut self) -> Option<NeighbourId> {
        if !self.broadcast.queue.is_empty() {
            return Some(NeighbourId::Broadcast);
        }

        let n = self.table.len();
        for i in 0..n {
            let idx = (self.cursor + 1 + i) % n;
            if !self.table[idx].queue.is_empty() {
                self.cursor = idx;
                return Some(NeighbourId::Unicast(idx));
            }
        }

        None
    }

    /// Check whether any neighbour has queued packets
    pub fn has_pending(&self) -> bool {
        !self.broadcast.queue.is_empty() || self.table.iter().any(|n| !n.queue.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item=&Neighbour> {
        self.table.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item=&mut Neighbour> {
        self.table.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Remove a neighbour, returning the evicted record with its queue
    pub fn remove(&mut self, addr: &LinkAddr) -> Option<Neighbour> {
        let idx = self.table.iter().position(|n| &n.addr == addr)?;
        self.cursor = 0;
        Some(self.table.swap_remove(idx))
    }

    /// Evict neighbours with empty queues, returning the number evicted.
    /// Invalidates all [`NeighbourId`]s.
    pub fn collect(&mut self) -> usize {
        let before = self.table.len();

        let mut i = 0;
        while i < self.table.len() {
            if self.table[i].queue.is_empty() {
                self.table.swap_remove(i);
            } else {
                i += 1;
            }
        }

        self.cursor = 0;
        before - self.table.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(v: u8) -> Packet {
        Packet::from_slice(&[v]).unwrap()
    }

    #[test]
    fn insert_and_lookup() {
        let mut n = Neighbours::new();

        let a = n.find_or_insert(LinkAddr::short(2)).unwrap();
        let b = n.find_or_insert(LinkAddr::short(3)).unwrap();
        assert_ne!(a, b);
        assert_eq!(n.find_or_insert(LinkAddr::short(2)), Some(a));
        assert_eq!(n.find(&LinkAddr::BROADCAST), Some(NeighbourId::Broadcast));
        assert_eq!(n.get(a).unwrap().phase, Phase::Unknown);
        assert_eq!(n.get(NeighbourId::Broadcast).unwrap().phase, Phase::Always);
    }

    #[test]
    fn table_full() {
        let mut n = Neighbours::new();
        for i in 0..MAX_NEIGHBOURS {
            assert!(n.find_or_insert(LinkAddr::short(i as u16)).is_some());
        }
        assert_eq!(n.find_or_insert(LinkAddr::short(0x100)), None);
        // Broadcast never takes a table slot
        assert_eq!(n.find_or_insert(LinkAddr::BROADCAST), Some(NeighbourId::Broadcast));
    }

    #[test]
    fn round_robin_selection() {
        let mut n = Neighbours::new();
        let a = n.find_or_insert(LinkAddr::short(2)).unwrap();
        let b = n.find_or_insert(LinkAddr::short(3)).unwrap();

        assert_eq!(n.next_ready(), None);

        n.get_mut(a).unwrap().queue.push_back(packet(1)).unwrap();
        n.get_mut(b).unwrap().queue.push_back(packet(2)).unwrap();

        let first = n.next_ready().unwrap();
        let second = n.next_ready().unwrap();
        assert_ne!(first, second);

        // Broadcast takes priority
        n.get_mut(NeighbourId::Broadcast).unwrap().queue.push_back(packet(3)).unwrap();
        assert_eq!(n.next_ready(), Some(NeighbourId::Broadcast));
    }

    #[test]
    fn collect_idle() {
        let mut n = Neighbours::new();
        let a = n.find_or_insert(LinkAddr::short(2)).unwrap();
        n.find_or_insert(LinkAddr::short(3)).unwrap();
        n.find_or_insert(LinkAddr::short(4)).unwrap();
        n.get_mut(a).unwrap().queue.push_back(packet(1)).unwrap();

        assert_eq!(n.collect(), 2);
        assert_eq!(n.len(), 1);
        assert!(n.find(&LinkAddr::short(2)).is_some());

        let evicted = n.remove(&LinkAddr::short(2)).unwrap();
        assert_eq!(evicted.queue().len(), 1);
        assert!(n.is_empty());
    }

    #[test]
    fn phase_shift() {
        assert_eq!(Phase::Known(30).shifted(50, 100), Phase::Known(80));
        assert_eq!(Phase::Known(80).shifted(50, 100), Phase::Known(30));
        assert_eq!(Phase::Unknown.shifted(50, 100), Phase::Unknown);
    }
}
