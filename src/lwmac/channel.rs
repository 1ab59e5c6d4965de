//! Cross-context hand-off queues.
//!
//! Producers in other contexts (the network stack, radio interrupts) never touch
//! MAC state directly, they enqueue into lock-free single-producer queues which
//! the MAC task drains on each tick. Enqueues never block and fail when full.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use heapless::spsc::{Queue, Producer, Consumer};
use rand_core::RngCore;

use crate::log::{debug, warn, FmtError};
use crate::error::CoreError;
use crate::mac::{Driver, LinkAddr};
use crate::packet::Packet;
use crate::timer::Timer;

use super::{Lwmac, Event};
use super::tx::{TxReport, TxResult, TxFailure};

/// Outbound frame request
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Request {
    pub dest: LinkAddr,
    pub packet: Packet,
}

/// Request queue, holds `N - 1` requests
pub type RequestQueue<const N: usize> = Queue<Request, N>;

/// Event queue for interrupt context, holds `N - 1` events
pub type EventQueue<const N: usize> = Queue<Event, N>;

/// Producer handle for submitting frames from another context
pub struct Submitter<'a, const N: usize> {
    producer: Producer<'a, Request, N>,
}

impl <'a, const N: usize> Submitter<'a, N> {
    pub fn new(producer: Producer<'a, Request, N>) -> Self {
        Self { producer }
    }

    /// Submit a frame, handing the request back if the queue is full
    pub fn submit(&mut self, dest: LinkAddr, packet: Packet) -> Result<(), Request> {
        self.producer.enqueue(Request{ dest, packet })
    }

    /// Check whether a request can be accepted
    pub fn ready(&self) -> bool {
        self.producer.ready()
    }
}

impl <D, T, R> Lwmac<D, T, R>
where
    D: Driver,
    D::Error: FmtError,
    T: Timer,
    R: RngCore,
{
    /// Move pending requests into neighbour queues, returning the number accepted.
    /// Rejected requests are reported as `Failed(QueueFull)`.
    pub fn drain_requests<const N: usize>(&mut self, requests: &mut Consumer<'_, Request, N>) -> usize {
        let mut accepted = 0;

        while let Some(Request{ dest, packet }) = requests.dequeue() {
            match self.submit(dest, packet) {
                Ok(_) => accepted += 1,
                Err(_) => {
                    debug!("Rejected request for {:?}", dest);
                    self.report(TxReport{ dest, result: TxResult::Failed(TxFailure::QueueFull) });
                },
            }
        }

        accepted
    }

    /// Move pending events into the serialized event queue while space remains,
    /// returning the number moved
    pub fn drain_events<const N: usize>(&mut self, events: &mut Consumer<'_, Event, N>) -> Result<usize, CoreError<D::Error>> {
        let mut n = 0;

        while !self.events.is_full() {
            match events.dequeue() {
                Some(ev) => {
                    self.post(ev)?;
                    n += 1;
                },
                None => break,
            }
        }

        if events.ready() {
            warn!("Event queue full, {} events deferred", events.len());
        }

        Ok(n)
    }
}
