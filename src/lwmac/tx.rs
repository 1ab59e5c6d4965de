//! LWMAC transmit sub-machine
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use rand_core::RngCore;

use crate::log::{trace, debug, warn, FmtError};
use crate::Ts;
use crate::error::CoreError;
use crate::mac::{Driver, LinkAddr, TxFeedback};
use crate::packet::Packet;
use crate::timer::Timer;

use super::{Lwmac, LinkFlags};
use super::frame::{self, FrameKind, Header};
use super::neighbour::{Neighbours, NeighbourId, Phase};
use super::timeout::TimeoutKind;

/// Timeouts owned by the transmit sub-machine
const TX_TIMEOUTS: [TimeoutKind; 6] = [
    TimeoutKind::WakeRequest,
    TimeoutKind::NoResponse,
    TimeoutKind::Data,
    TimeoutKind::WaitForDestWakeup,
    TimeoutKind::NextBroadcast,
    TimeoutKind::BroadcastEnd,
];

/// Transmit sub-machine states
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxState {
    Stopped,
    Init,
    SendBroadcast,
    WaitBroadcastSent,
    WaitNextBroadcast,
    SendWr,
    WaitDestWakeup,
    WaitWrSent,
    WaitForWa,
    SendData,
    WaitFeedback,
    Successful,
    Failed,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Successful | TxState::Failed)
    }
}

/// Reasons for a failed transmission attempt
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxFailure {
    /// No Wake-Ack within the WR burst
    NoResponse,
    /// Data not acknowledged
    NoAck,
    /// Channel busy
    Busy,
    /// Too many unexpected frames during the handshake
    Protocol,
    /// Attempt abandoned to answer an incoming Wake-Request
    Deferred,
    /// Timeout or buffer resources exhausted
    Resource,
    /// Destination queue full at submission
    QueueFull,
    /// Neighbour evicted with the frame still queued
    Evicted,
}

impl From<TxFeedback> for TxFailure {
    fn from(fb: TxFeedback) -> Self {
        match fb {
            TxFeedback::Busy => TxFailure::Busy,
            _ => TxFailure::NoAck,
        }
    }
}

/// Terminal outcome of a frame
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxResult {
    Delivered,
    Failed(TxFailure),
}

/// Transmission outcome report for the upper layer
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxReport {
    pub dest: LinkAddr,
    pub result: TxResult,
}

/// Transmit sub-machine context
pub struct TxContext {
    pub state: TxState,
    pub neighbours: Neighbours,
    /// Wake-Requests sent in the current attempt
    pub wr_sent: u16,
    /// Frame in flight, taken from the head of the current neighbour's queue
    pub(crate) packet: Option<Packet>,
    pub current: Option<NeighbourId>,
    pub started_at: Ts,
    pub bcast_seqnr: u8,
    pub(crate) failure: Option<TxFailure>,
    violations: u8,
    /// Predicted destination wake-up already waited for
    dest_reached: bool,
}

impl Default for TxContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TxContext {
    pub fn new() -> Self {
        Self {
            state: TxState::Stopped,
            neighbours: Neighbours::new(),
            wr_sent: 0,
            packet: None,
            current: None,
            started_at: 0,
            bcast_seqnr: 0,
            failure: None,
            violations: 0,
            dest_reached: false,
        }
    }

    /// Number of frames in flight for the provided neighbour (0 or 1)
    pub fn in_flight(&self, id: NeighbourId) -> usize {
        (self.current == Some(id) && self.packet.is_some()) as usize
    }
}

impl <D, T, R> Lwmac<D, T, R>
where
    D: Driver,
    D::Error: FmtError,
    T: Timer,
    R: RngCore,
{
    /// A new attempt may be started
    pub(crate) fn tx_ready(&self) -> bool {
        self.ctx.tx.state == TxState::Stopped
            && !self.ctx.flags.contains(LinkFlags::TX_DEFERRED)
            && self.ctx.tx.neighbours.has_pending()
    }

    /// A parked attempt has reached its destination's predicted wake-up
    pub(crate) fn tx_resume_due(&self) -> bool {
        self.ctx.tx.state == TxState::WaitDestWakeup
            && self.ctx.timeouts.is_expired(TimeoutKind::WaitForDestWakeup)
    }

    pub(crate) fn tx_begin(&mut self) {
        self.tx_set_state(TxState::Init);
    }

    fn tx_set_state(&mut self, state: TxState) {
        trace!("TX state {} -> {}", self.ctx.tx.state, state);
        self.ctx.tx.state = state;
        self.reschedule();
    }

    fn tx_fail(&mut self, reason: TxFailure) {
        debug!("TX attempt failed: {}", reason);
        self.ctx.tx.failure = Some(reason);
        self.tx_set_state(TxState::Failed);
    }

    /// Arm a timeout, failing the attempt if it cannot be scheduled
    fn tx_arm(&mut self, kind: TimeoutKind, offset_us: u32) -> bool {
        match self.set_timeout(kind, offset_us) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to arm {} timeout: {:?}", kind, e);
                self.tx_fail(TxFailure::Resource);
                false
            }
        }
    }

    fn tx_dest(&self) -> Option<(NeighbourId, LinkAddr, Phase)> {
        let id = self.ctx.tx.current?;
        let n = self.ctx.tx.neighbours.get(id)?;
        Some((id, n.addr, n.phase))
    }

    /// Advance the transmit sub-machine by one step
    pub(crate) fn tx_update(&mut self) -> Result<(), CoreError<D::Error>> {
        let now = self.timer.ticks_us();

        if self.ctx.tx.state == TxState::Init {
            self.tx_init(now);
            return Ok(());
        }

        if matches!(self.ctx.tx.state, TxState::Stopped | TxState::Successful | TxState::Failed) {
            return Ok(());
        }

        let (_id, dest, phase) = match self.tx_dest() {
            Some(d) => d,
            None => {
                warn!("TX in state {} without a destination", self.ctx.tx.state);
                self.tx_fail(TxFailure::Resource);
                return Ok(());
            }
        };

        match self.ctx.tx.state {
            TxState::SendBroadcast => {
                let header = Header::new(FrameKind::Broadcast{ seq: self.ctx.tx.bcast_seqnr }, LinkAddr::BROADCAST, self.ctx.own_address);

                let n = match self.ctx.tx.packet.as_ref().map(|p| frame::encode_with(&header, p.payload(), &mut self.buff)) {
                    Some(Ok(n)) => n,
                    _ => {
                        self.tx_fail(TxFailure::Resource);
                        return Ok(());
                    }
                };

                self.send_buffered(n)?;
                self.stats.broadcast_sent = self.stats.broadcast_sent.saturating_add(1);

                // Guard against missing driver feedback
                if self.tx_arm(TimeoutKind::Data, self.config.data_delay_us) {
                    self.tx_set_state(TxState::WaitBroadcastSent);
                }
            },
            TxState::WaitBroadcastSent => {
                if let Some(fb) = self.take_feedback() {
                    self.ctx.timeouts.clear(TimeoutKind::Data);

                    if self.ctx.timeouts.is_running(TimeoutKind::BroadcastEnd) {
                        if self.tx_arm(TimeoutKind::NextBroadcast, self.config.time_between_broadcast_us) {
                            self.tx_set_state(TxState::WaitNextBroadcast);
                        }
                    } else if self.config.broadcast_duration_us > 0 || fb == TxFeedback::Success {
                        self.tx_set_state(TxState::Successful);
                    } else {
                        self.tx_fail(fb.into());
                    }

                } else if self.ctx.timeouts.is_expired(TimeoutKind::Data) {
                    self.tx_fail(TxFailure::NoAck);
                }
            },
            TxState::WaitNextBroadcast => {
                if !self.ctx.timeouts.is_running(TimeoutKind::BroadcastEnd) {
                    self.tx_set_state(TxState::Successful);
                } else if self.ctx.timeouts.is_expired(TimeoutKind::NextBroadcast) {
                    self.ctx.timeouts.clear(TimeoutKind::NextBroadcast);
                    self.tx_set_state(TxState::SendBroadcast);
                }
            },
            TxState::SendWr => self.tx_send_wr(now, dest, phase)?,
            TxState::WaitDestWakeup => {
                if self.ctx.timeouts.is_expired(TimeoutKind::WaitForDestWakeup) {
                    self.ctx.timeouts.clear(TimeoutKind::WaitForDestWakeup);
                    self.ctx.tx.dest_reached = true;
                    self.tx_set_state(TxState::SendWr);
                }
            },
            TxState::WaitWrSent => {
                if self.take_feedback().is_some() {
                    if self.tx_arm(TimeoutKind::WakeRequest, self.config.time_between_wr_us) {
                        self.tx_set_state(TxState::WaitForWa);
                    }
                } else if self.ctx.timeouts.is_expired(TimeoutKind::NoResponse) {
                    self.tx_fail(TxFailure::NoResponse);
                }
            },
            TxState::WaitForWa => self.tx_wait_for_wa(now, dest),
            TxState::SendData => {
                let id = self.ctx.tx.current;
                let pending = id.and_then(|id| self.ctx.tx.neighbours.get(id))
                    .map(|n| !n.queue.is_empty())
                    .unwrap_or(false);

                let mut header = Header::new(FrameKind::Data, dest, self.ctx.own_address);
                header.pending = pending;

                let n = match self.ctx.tx.packet.as_ref().map(|p| frame::encode_with(&header, p.payload(), &mut self.buff)) {
                    Some(Ok(n)) => n,
                    _ => {
                        self.tx_fail(TxFailure::Resource);
                        return Ok(());
                    }
                };

                self.send_buffered(n)?;

                if self.tx_arm(TimeoutKind::Data, self.config.data_delay_us) {
                    self.tx_set_state(TxState::WaitFeedback);
                }
            },
            TxState::WaitFeedback => {
                match self.take_feedback() {
                    Some(TxFeedback::Success) => {
                        self.ctx.timeouts.clear(TimeoutKind::Data);
                        self.tx_set_state(TxState::Successful);
                    },
                    Some(fb) => {
                        self.ctx.timeouts.clear(TimeoutKind::Data);
                        self.tx_fail(fb.into());
                    },
                    None if self.ctx.timeouts.is_expired(TimeoutKind::Data) => {
                        self.tx_fail(TxFailure::NoAck);
                    },
                    None => (),
                }
            },
            _ => (),
        }

        Ok(())
    }

    fn tx_init(&mut self, now: Ts) {
        let tx = &mut self.ctx.tx;

        let id = match tx.neighbours.next_ready() {
            Some(id) => id,
            None => {
                tx.state = TxState::Stopped;
                return;
            }
        };

        let packet = match tx.neighbours.get_mut(id).and_then(|n| n.queue.pop_front()) {
            Some(p) => p,
            None => {
                tx.state = TxState::Stopped;
                return;
            }
        };

        tx.packet = Some(packet);
        tx.current = Some(id);
        tx.started_at = now;
        tx.wr_sent = 0;
        tx.violations = 0;
        tx.dest_reached = false;
        tx.failure = None;

        for k in TX_TIMEOUTS {
            self.ctx.timeouts.clear(k);
        }

        match id {
            NeighbourId::Broadcast => {
                self.ctx.tx.bcast_seqnr = self.ctx.tx.bcast_seqnr.wrapping_add(1);
                debug!("Start broadcast (seq: {})", self.ctx.tx.bcast_seqnr);

                let duration = self.config.broadcast_duration_us;
                if duration > 0 && !self.tx_arm(TimeoutKind::BroadcastEnd, duration) {
                    return;
                }

                self.tx_set_state(TxState::SendBroadcast);
            },
            NeighbourId::Unicast(_) => {
                debug!("Start transmission to {:?}", self.tx_dest().map(|(_, a, _)| a));
                self.tx_set_state(TxState::SendWr);
            },
        }
    }

    fn tx_send_wr(&mut self, now: Ts, dest: LinkAddr, phase: Phase) -> Result<(), CoreError<D::Error>> {
        // Sleep until the destination's predicted wake-up
        if let (0, false, Phase::Known(p)) = (self.ctx.tx.wr_sent, self.ctx.tx.dest_reached, phase) {
            let phase_now = self.phase_now(now);

            if !self.config.phase_imminent(p, phase_now) {
                let until = self.config.time_until_phase(p, phase_now);
                let wait = until.saturating_sub(self.config.wr_preparation_us);

                debug!("Waiting {} us for {:?} to wake", wait, dest);

                if self.tx_arm(TimeoutKind::WaitForDestWakeup, wait) {
                    self.tx_set_state(TxState::WaitDestWakeup);
                }
                return Ok(());
            }
        }

        // Hold off while a reception is in progress, for at most one WR interval
        if self.ctx.rx_started() {
            if self.ctx.timeouts.is_expired(TimeoutKind::WakeRequest) {
                self.ctx.flags.remove(LinkFlags::RX_STARTED);
            } else {
                if !self.ctx.timeouts.is_running(TimeoutKind::WakeRequest) {
                    trace!("Reception in progress, deferring WR");
                    self.tx_arm(TimeoutKind::WakeRequest, self.config.time_between_wr_us);
                }
                return Ok(());
            }
        }

        let header = Header::new(FrameKind::WakeRequest, dest, self.ctx.own_address);
        self.send_header(&header)?;

        self.ctx.tx.wr_sent = self.ctx.tx.wr_sent.saturating_add(1);
        self.stats.wr_sent = self.stats.wr_sent.saturating_add(1);

        trace!("Sent WR {} to {:?}", self.ctx.tx.wr_sent, dest);

        self.ctx.timeouts.clear(TimeoutKind::WakeRequest);

        if self.ctx.tx.wr_sent == 1 && !self.tx_arm(TimeoutKind::NoResponse, self.config.no_response_us) {
            return Ok(());
        }

        self.tx_set_state(TxState::WaitWrSent);

        Ok(())
    }

    fn tx_wait_for_wa(&mut self, now: Ts, dest: LinkAddr) {
        let own = self.ctx.own_address;
        let mut wa_phase = None;
        let mut deferred = false;

        // Scan buffered frames, keeping those for the receive path
        for _ in 0..self.ctx.rx.queue.len() {
            let f = match self.ctx.rx.queue.pop_front() {
                Some(f) => f,
                None => break,
            };
            let h = f.header;

            match h.kind {
                FrameKind::WakeAck{ phase } if wa_phase.is_none() && h.dst == own && h.src == dest => {
                    wa_phase = Some(phase);
                    continue;
                },
                FrameKind::WakeRequest if h.dst == own => {
                    deferred = true;
                },
                FrameKind::Data | FrameKind::Broadcast{..} => (),
                _ if h.dst != own => {
                    trace!("Ignoring {:?} for {:?}", h.kind, h.dst);
                    continue;
                },
                _ => {
                    self.protocol_violation(&h);
                    self.ctx.tx.violations = self.ctx.tx.violations.saturating_add(1);
                    continue;
                },
            }

            let _ = self.ctx.rx.queue.push_back(f);
        }

        if let Some(phase) = wa_phase {
            debug!("Received WA from {:?} (phase: {} us)", dest, phase);

            self.ctx.timeouts.clear(TimeoutKind::WakeRequest);
            self.ctx.timeouts.clear(TimeoutKind::NoResponse);
            self.tx_learn_phase(now, phase);
            self.tx_set_state(TxState::SendData);

        } else if deferred {
            self.tx_fail(TxFailure::Deferred);

        } else if self.ctx.tx.violations > self.config.max_protocol_violations {
            self.tx_fail(TxFailure::Protocol);

        } else if self.ctx.timeouts.is_expired(TimeoutKind::NoResponse) {
            self.tx_fail(TxFailure::NoResponse);

        } else if self.ctx.timeouts.is_expired(TimeoutKind::WakeRequest) {
            self.ctx.timeouts.clear(TimeoutKind::WakeRequest);

            if self.ctx.tx.wr_sent >= self.config.max_wr_count {
                self.tx_fail(TxFailure::NoResponse);
            } else {
                self.tx_set_state(TxState::SendWr);
            }
        }
    }

    /// Store the destination's phase in our own reference frame, scheduling
    /// a backoff of our own wake-up if the two collide
    fn tx_learn_phase(&mut self, now: Ts, wa_phase: u32) {
        let interval = self.config.wakeup_interval_us;
        let own_phase = self.phase_now(now);
        let phase = ((own_phase % interval) + interval - (wa_phase % interval)) % interval;

        if let Some(n) = self.ctx.tx.current.and_then(|id| self.ctx.tx.neighbours.get_mut(id)) {
            n.phase = Phase::Known(phase);
        }

        if self.config.phase_collides(phase) && self.ctx.phase_backoff.is_none() && self.ctx.phase_shift.is_none() {
            let gap = self.config.min_phase_gap_us;
            let span = interval.saturating_sub(gap * 2).max(1);
            let backoff = gap + self.rng.next_u32() % span;

            debug!("Phase {} us collides with our own, backing off {} us", phase, backoff);

            self.ctx.phase_backoff = Some(backoff);
        }
    }

    /// Complete an attempt, settling the in-flight frame
    pub(crate) fn tx_end(&mut self) {
        let (id, packet) = match (self.ctx.tx.current, self.ctx.tx.packet.take()) {
            (Some(id), Some(p)) => (id, p),
            _ => {
                self.tx_reset();
                return;
            }
        };

        let max_attempts = self.config.max_tx_attempts;
        let state = self.ctx.tx.state;
        let failure = self.ctx.tx.failure.take().unwrap_or(TxFailure::Protocol);

        let n = match self.ctx.tx.neighbours.get_mut(id) {
            Some(n) => n,
            None => {
                self.tx_reset();
                return;
            }
        };
        let dest = n.addr;

        let report = match (state, failure) {
            (TxState::Successful, _) => {
                n.attempts = 0;
                self.stats.tx_success = self.stats.tx_success.saturating_add(1);
                debug!("Delivered {} bytes to {:?}", packet.len(), dest);
                Some(TxResult::Delivered)
            },
            (_, TxFailure::Deferred) => {
                if n.queue.push_front(packet).is_err() {
                    warn!("Failed to requeue deferred packet for {:?}", dest);
                }
                None
            },
            (_, reason) => {
                self.stats.tx_failed = self.stats.tx_failed.saturating_add(1);

                if reason == TxFailure::NoResponse && id != NeighbourId::Broadcast {
                    n.phase = Phase::Unknown;
                }

                n.attempts = n.attempts.saturating_add(1);

                let r = if n.attempts >= max_attempts {
                    warn!("Dropping packet for {:?} after {} attempts ({})", dest, n.attempts, reason);
                    n.attempts = 0;
                    self.stats.tx_dropped = self.stats.tx_dropped.saturating_add(1);
                    Some(TxResult::Failed(reason))
                } else {
                    if n.queue.push_front(packet).is_err() {
                        warn!("Failed to requeue packet for {:?}", dest);
                    }
                    None
                };

                self.ctx.flags.insert(LinkFlags::TX_DEFERRED);
                r
            },
        };

        if let Some(result) = report {
            self.report(TxReport{ dest, result });
        }

        self.tx_reset();
    }

    /// Abandon an attempt, returning the in-flight frame to its queue uncharged
    pub(crate) fn tx_abort(&mut self) {
        if let (Some(id), Some(p)) = (self.ctx.tx.current, self.ctx.tx.packet.take()) {
            if let Some(n) = self.ctx.tx.neighbours.get_mut(id) {
                if n.queue.push_front(p).is_err() {
                    warn!("Failed to requeue packet for {:?}", n.addr);
                }
            }
        }

        self.tx_reset();
    }

    fn tx_reset(&mut self) {
        for k in TX_TIMEOUTS {
            self.ctx.timeouts.clear(k);
        }

        let tx = &mut self.ctx.tx;
        tx.state = TxState::Stopped;
        tx.current = None;
        tx.packet = None;
        tx.failure = None;
        tx.wr_sent = 0;
        tx.violations = 0;
        tx.dest_reached = false;
    }
}
