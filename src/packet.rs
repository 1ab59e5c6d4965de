//! Owned payload buffer for frames moving through the MAC

use heapless::Vec;

pub const MAX_PAYLOAD_LEN: usize = 128;

/// Packet object represents an upper layer payload with owned storage.
///
/// Packets are moved (never copied) between the submit path, neighbour
/// queues, the in-flight transmission and the dispatch buffer.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Packet {
    payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl Packet {
    /// Create a packet from a payload slice, returns `None` if the
    /// payload exceeds [`MAX_PAYLOAD_LEN`]
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let payload = Vec::from_slice(data).ok()?;
        Some(Self{ payload })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, body: &[u8]) -> Result<(), ()> {
        self.payload = Vec::from_slice(body)?;

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Packet {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Packet {{ len: {} }}", self.payload.len())
    }
}
