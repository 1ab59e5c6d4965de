//! LWMAC, a duty-cycled wireless MAC with wake-up phase learning
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

#![no_std]

use core::fmt::Debug;

use radio::{State, Busy, Transmit, Receive, Rssi, ReceiveInfo};

#[cfg(any(test, feature="std"))]
extern crate std;

pub mod log;

pub mod timer;

pub mod packet;

pub mod base;

pub mod mac;

pub mod lwmac;

pub mod error;

pub mod prelude;

pub use mac::Mac;

/// Timestamps are 64-bit in microseconds
pub type Ts = u64;

/// Maximum raw frame length handled by the MAC
pub const MAX_FRAME_LEN: usize = 256;

/// Statically sized received packet buffer
#[derive(Clone, Debug)]
pub struct RawPacket {
    data: [u8; MAX_FRAME_LEN],
    len: usize,
    rssi: i16,
}

impl Default for RawPacket {
    fn default() -> Self {
        Self {
            data: [0u8; MAX_FRAME_LEN],
            len: 0,
            rssi: 0,
        }
    }
}

impl PartialEq for RawPacket {
    fn eq(&self, o: &Self) -> bool {
        self.data() == o.data() && self.rssi == o.rssi
    }
}

impl RawPacket {
    /// Create a raw packet from received bytes, truncated to [`MAX_FRAME_LEN`]
    pub fn new(data: &[u8], rssi: i16) -> Self {
        let mut p = Self::default();
        let n = data.len().min(MAX_FRAME_LEN);
        p.data[..n].copy_from_slice(&data[..n]);
        p.len = n;
        p.rssi = rssi;
        p
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for RawPacket {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "RawPacket {{ len: {}, rssi: {} }}", self.len, self.rssi)
    }
}

/// Radio interface combines `radio` traits
pub trait Radio<S: radio::RadioState, I: radio::ReceiveInfo, E: Debug>: radio::State<State=S, Error=E> + radio::Busy<Error=E> + radio::Transmit<Error=E> + radio::Receive<Info=I, Error=E> + radio::Rssi<Error=E> {}

/// Default Radio impl for radio devices
impl <T, S: radio::RadioState, I: ReceiveInfo, E: Debug> Radio<S, I, E> for T where
    T: State<State=S, Error=E> + Busy<Error=E> + Transmit<Error=E> + Receive<Info=I, Error=E> + Rssi<Error=E>,
{}
