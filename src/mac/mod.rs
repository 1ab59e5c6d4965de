//! Medium Access Control (MAC) layer module.
//! Contains MAC and radio driver traits shared by MAC implementations.

use byteorder::{ByteOrder, LittleEndian};
use ieee802154::mac::{ShortAddress, ExtendedAddress};

use crate::{RawPacket, packet::Packet};

/// Generic MAC trait, implemented by all MACs
pub trait Mac {
    type Error;

    /// Queue a packet for transmission to the provided destination
    fn transmit(&mut self, dest: LinkAddr, packet: Packet) -> Result<(), Self::Error>;

    /// Fetch a received packet and sender address (if available)
    fn receive(&mut self) -> Result<Option<(LinkAddr, Packet)>, Self::Error>;

    /// Check whether the MAC is busy
    fn busy(&mut self) -> Result<bool, Self::Error>;

    /// Update the MAC state
    fn tick(&mut self) -> Result<(), Self::Error>;
}

/// Link layer address
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkAddr {
    Short(ShortAddress),
    Extended(ExtendedAddress),
}

impl LinkAddr {
    /// Link layer broadcast address
    pub const BROADCAST: LinkAddr = LinkAddr::Short(ShortAddress(0xffff));

    pub fn short(a: u16) -> Self {
        LinkAddr::Short(ShortAddress(a))
    }

    pub fn extended(a: u64) -> Self {
        LinkAddr::Extended(ExtendedAddress(a))
    }

    pub fn is_broadcast(&self) -> bool {
        match self {
            LinkAddr::Short(s) => s.0 == 0xffff,
            LinkAddr::Extended(e) => e.0 == u64::MAX,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, LinkAddr::Extended(_))
    }

    /// Encoded address length in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            LinkAddr::Short(_) => 2,
            LinkAddr::Extended(_) => 8,
        }
    }

    /// Write the address to the provided buffer, returning the encoded length.
    /// The caller must ensure `buf` holds at least [`LinkAddr::encoded_len`] bytes
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        match self {
            LinkAddr::Short(s) => LittleEndian::write_u16(&mut buf[..2], s.0),
            LinkAddr::Extended(e) => LittleEndian::write_u64(&mut buf[..8], e.0),
        }
        self.encoded_len()
    }

    /// Read an address of the provided kind, returning `None` on short input
    pub fn decode(buf: &[u8], extended: bool) -> Option<(Self, usize)> {
        match extended {
            false if buf.len() >= 2 => Some((Self::short(LittleEndian::read_u16(&buf[..2])), 2)),
            true if buf.len() >= 8 => Some((Self::extended(LittleEndian::read_u64(&buf[..8])), 8)),
            _ => None,
        }
    }
}

/// Link layer transmission feedback from the driver
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxFeedback {
    /// Frame left the radio (and was acknowledged where applicable)
    Success,
    /// Frame was not acknowledged
    NoAck,
    /// Channel was busy
    Busy,
}

/// Events emitted by a driver
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverEvent {
    /// Transmission complete
    TxDone(TxFeedback),
    /// Reception started (preamble / sync detected)
    RxStarted,
    /// Frame received
    Received(RawPacket),
}

/// Radio driver collaborator consumed by duty-cycled MACs.
///
/// Sends are asynchronous, completion is reported via [`DriverEvent::TxDone`]
/// from [`Driver::poll`].
pub trait Driver {
    type Error;

    /// Start transmitting a frame
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Enable (listen) or disable (sleep) the receiver
    fn set_rx_mode(&mut self, on: bool) -> Result<(), Self::Error>;

    /// Best-effort clear channel check
    fn channel_idle(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Poll for the next driver event
    fn poll(&mut self) -> Result<Option<DriverEvent>, Self::Error>;
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::vec::Vec;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Mock driver error
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct MockDriverError;

    #[derive(Debug, Default)]
    struct Inner {
        sent: Vec<Vec<u8>>,
        events: VecDeque<DriverEvent>,
        rx_on: bool,
        feedback: Option<TxFeedback>,
        fail_send: bool,
    }

    /// Mock driver, records sent frames and replays injected events.
    /// Clones share state so tests can inspect a driver owned by a MAC.
    #[derive(Clone, Debug)]
    pub struct MockDriver(Arc<Mutex<Inner>>);

    impl Default for MockDriver {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockDriver {
        /// Create a mock driver which completes every send with [`TxFeedback::Success`]
        pub fn new() -> Self {
            let inner = Inner{ feedback: Some(TxFeedback::Success), ..Default::default() };
            Self(Arc::new(Mutex::new(inner)))
        }

        /// Set the feedback generated for subsequent sends (`None` for no completion)
        pub fn set_feedback(&mut self, fb: Option<TxFeedback>) {
            self.0.lock().unwrap().feedback = fb;
        }

        /// Cause subsequent sends to fail with a driver error
        pub fn set_fail_send(&mut self, fail: bool) {
            self.0.lock().unwrap().fail_send = fail;
        }

        /// Inject a driver event
        pub fn push_event(&mut self, ev: DriverEvent) {
            self.0.lock().unwrap().events.push_back(ev);
        }

        /// Inject a received frame
        pub fn push_frame(&mut self, data: &[u8]) {
            self.push_event(DriverEvent::Received(RawPacket::new(data, -60)));
        }

        /// Fetch all frames sent so far
        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().sent.clone()
        }

        /// Fetch and clear sent frames
        pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.0.lock().unwrap().sent)
        }

        /// Check for events not yet polled
        pub fn has_events(&self) -> bool {
            !self.0.lock().unwrap().events.is_empty()
        }

        pub fn rx_on(&self) -> bool {
            self.0.lock().unwrap().rx_on
        }
    }

    impl Driver for MockDriver {
        type Error = MockDriverError;

        fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
            let mut i = self.0.lock().unwrap();
            if i.fail_send {
                return Err(MockDriverError);
            }

            i.sent.push(data.to_vec());
            if let Some(fb) = i.feedback {
                i.events.push_back(DriverEvent::TxDone(fb));
            }

            Ok(())
        }

        fn set_rx_mode(&mut self, on: bool) -> Result<(), Self::Error> {
            self.0.lock().unwrap().rx_on = on;
            Ok(())
        }

        fn poll(&mut self) -> Result<Option<DriverEvent>, Self::Error> {
            Ok(self.0.lock().unwrap().events.pop_front())
        }
    }
}
