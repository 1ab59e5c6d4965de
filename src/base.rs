//! Base radio adaptor, exposes a `radio` HAL device as a MAC [`Driver`]
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::{fmt::Debug, marker::PhantomData};

use radio::{RadioState, ReceiveInfo, State, Transmit, Receive, Rssi};

use crate::log::{trace, debug};
use crate::{Radio, RawPacket, MAX_FRAME_LEN};
use crate::mac::{Driver, DriverEvent, TxFeedback};

/// Base radio configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BaseConfig {
    /// RSSI below which the channel is considered clear (dBm)
    pub channel_clear_threshold: i16,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            channel_clear_threshold: -90,
        }
    }
}

/// Base radio states
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BaseState {
    Idle,
    Listening,
    Transmitting,
    Sleeping,
}

/// Base radio adaptor, generic over radio (R), radio state (S),
/// receive info (I) and error (E) types
pub struct Base<R, S, I, E> {
    radio: R,
    config: BaseConfig,
    state: BaseState,
    /// Receiver mode requested by the MAC, applied after transmissions complete
    rx_on: bool,
    buff: [u8; MAX_FRAME_LEN],
    _radio: PhantomData<(S, I, E)>,
}

impl <R, S, I, E> Base<R, S, I, E>
where
    R: Radio<S, I, E>,
    S: RadioState,
    I: ReceiveInfo,
    E: Debug,
{
    pub fn new(radio: R, config: BaseConfig) -> Self {
        Self {
            radio,
            config,
            state: BaseState::Idle,
            rx_on: false,
            buff: [0u8; MAX_FRAME_LEN],
            _radio: PhantomData,
        }
    }

    pub fn state(&self) -> BaseState {
        self.state
    }

    pub fn radio(&mut self) -> &mut R {
        &mut self.radio
    }

    fn apply_rx_mode(&mut self) -> Result<(), E> {
        if self.rx_on {
            self.radio.start_receive()?;
            self.state = BaseState::Listening;
        } else {
            self.radio.set_state(S::sleep())?;
            self.state = BaseState::Sleeping;
        }
        Ok(())
    }
}

impl <R, S, I, E> Driver for Base<R, S, I, E>
where
    R: Radio<S, I, E>,
    S: RadioState,
    I: ReceiveInfo,
    E: Debug,
{
    type Error = E;

    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        trace!("Transmit {} bytes", data.len());

        self.radio.start_transmit(data)?;
        self.state = BaseState::Transmitting;

        Ok(())
    }

    fn set_rx_mode(&mut self, on: bool) -> Result<(), Self::Error> {
        self.rx_on = on;

        // Applied on completion
        if self.state == BaseState::Transmitting {
            return Ok(());
        }

        self.apply_rx_mode()
    }

    fn channel_idle(&mut self) -> Result<bool, Self::Error> {
        let rssi = self.radio.poll_rssi()?;
        Ok(rssi < self.config.channel_clear_threshold)
    }

    fn poll(&mut self) -> Result<Option<DriverEvent>, Self::Error> {
        match self.state {
            BaseState::Transmitting => {
                if self.radio.check_transmit()? {
                    trace!("Transmit complete");
                    self.apply_rx_mode()?;
                    return Ok(Some(DriverEvent::TxDone(TxFeedback::Success)));
                }
            },
            BaseState::Listening => {
                if self.radio.check_receive(true)? {
                    let (n, info) = self.radio.get_received(&mut self.buff)?;
                    debug!("Received {} bytes (rssi: {})", n, info.rssi());

                    self.radio.start_receive()?;

                    return Ok(Some(DriverEvent::Received(RawPacket::new(&self.buff[..n], info.rssi()))));
                }
            },
            _ => (),
        }

        Ok(None)
    }
}
