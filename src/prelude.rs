//! LWMAC crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::{Radio, RawPacket, Ts};

pub use crate::mac::{Mac, Driver, DriverEvent, LinkAddr, TxFeedback};

pub use crate::error::CoreError;
pub use crate::packet::Packet;
pub use crate::timer::{Timer as MacTimer};

pub use crate::base::{Base as MacBase, BaseConfig as MacBaseConfig, BaseState as MacBaseState};

pub use crate::lwmac::{Lwmac, Config as LwmacConfig, LinkState, MacStats, TxReport, TxResult, TxFailure};
pub use crate::lwmac::channel::{Request, RequestQueue, EventQueue, Submitter};

pub use ieee802154::mac::{ShortAddress, ExtendedAddress};
