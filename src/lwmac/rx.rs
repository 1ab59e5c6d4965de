//! LWMAC receive sub-machine
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use heapless::{Deque, Vec};
use rand_core::RngCore;

use crate::log::{trace, debug, warn, FmtError};
use crate::Ts;
use crate::error::CoreError;
use crate::mac::{Driver, LinkAddr};
use crate::packet::Packet;
use crate::timer::Timer;

use super::{Lwmac, LinkFlags};
use super::config::{RX_QUEUE_LEN, DUP_FILTER_LEN};
use super::frame::{Frame, FrameKind, Header};
use super::timeout::TimeoutKind;

/// Receive sub-machine states
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    Stopped,
    Init,
    WaitForWr,
    SendWa,
    WaitWaSent,
    WaitForData,
    Successful,
    Failed,
}

impl RxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RxState::Successful | RxState::Failed)
    }
}

/// Recently seen broadcasts, one entry per sender
#[derive(Clone, Debug, Default)]
pub struct DupFilter {
    entries: Vec<(LinkAddr, u8, Ts), DUP_FILTER_LEN>,
}

impl DupFilter {
    /// Check a broadcast against the filter, recording it if new.
    /// Returns true for duplicates.
    pub fn check(&mut self, src: LinkAddr, seq: u8, now: Ts, lifetime_us: u32) -> bool {
        let mut i = 0;
        while i < self.entries.len() {
            if now.saturating_sub(self.entries[i].2) >= lifetime_us as Ts {
                self.entries.swap_remove(i);
            } else {
                i += 1;
            }
        }

        if let Some(e) = self.entries.iter_mut().find(|e| e.0 == src) {
            if e.1 == seq {
                return true;
            }
            *e = (src, seq, now);
            return false;
        }

        // Replace the oldest entry when full
        if self.entries.len() == self.entries.capacity() {
            let oldest = self.entries.iter().enumerate()
                .min_by_key(|(_, e)| e.2)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                self.entries.swap_remove(i);
            }
        }

        let _ = self.entries.push((src, seq, now));

        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receive sub-machine context
pub struct RxContext {
    pub state: RxState,
    /// Frames received and awaiting handling, including those arriving mid-handshake
    pub(crate) queue: Deque<Frame, RX_QUEUE_LEN>,
    /// Sender of the Wake-Request being served
    pub peer: Option<LinkAddr>,
    extensions: u8,
    violations: u8,
    dups: DupFilter,
}

impl Default for RxContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RxContext {
    pub fn new() -> Self {
        Self {
            state: RxState::Stopped,
            queue: Deque::new(),
            peer: None,
            extensions: 0,
            violations: 0,
            dups: DupFilter::default(),
        }
    }

    /// Number of frames awaiting handling
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl <D, T, R> Lwmac<D, T, R>
where
    D: Driver,
    D::Error: FmtError,
    T: Timer,
    R: RngCore,
{
    pub(crate) fn rx_begin(&mut self) {
        let rx = &mut self.ctx.rx;
        rx.peer = None;
        rx.extensions = 0;
        rx.violations = 0;

        self.rx_set_state(RxState::Init);
    }

    fn rx_set_state(&mut self, state: RxState) {
        trace!("RX state {} -> {}", self.ctx.rx.state, state);
        self.ctx.rx.state = state;
        self.reschedule();
    }

    fn rx_violation(&mut self, header: &Header) {
        self.protocol_violation(header);
        self.ctx.rx.violations = self.ctx.rx.violations.saturating_add(1);
    }

    /// Arm a timeout, failing the reception if it cannot be scheduled
    fn rx_arm(&mut self, kind: TimeoutKind, offset_us: u32) -> bool {
        match self.set_timeout(kind, offset_us) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to arm {} timeout: {:?}", kind, e);
                self.rx_set_state(RxState::Failed);
                false
            }
        }
    }

    /// Advance the receive sub-machine by one step
    pub(crate) fn rx_update(&mut self) -> Result<(), CoreError<D::Error>> {
        let now = self.timer.ticks_us();
        let own = self.ctx.own_address;

        match self.ctx.rx.state {
            RxState::Init => {
                // Bound the wait when activity arrives outside our listen window
                if !self.ctx.timeouts.is_running(TimeoutKind::WakeupPeriod)
                        && !self.rx_arm(TimeoutKind::WakeupPeriod, self.config.wakeup_duration_us) {
                    return Ok(());
                }
                self.rx_set_state(RxState::WaitForWr);
            },
            RxState::WaitForWr => {
                while let Some(f) = self.ctx.rx.queue.pop_front() {
                    let h = f.header;

                    match h.kind {
                        FrameKind::WakeRequest if h.dst == own => {
                            debug!("Received WR from {:?}", h.src);
                            self.ctx.rx.peer = Some(h.src);
                            self.rx_set_state(RxState::SendWa);
                            return Ok(());
                        },
                        FrameKind::WakeRequest => {
                            // Channel taken by another exchange, give up this window
                            debug!("Overheard WR for {:?}, quitting listen", h.dst);
                            self.ctx.timeouts.clear(TimeoutKind::WakeupPeriod);
                            self.rx_set_state(RxState::Failed);
                            return Ok(());
                        },
                        FrameKind::Broadcast{ seq } => {
                            self.rx_broadcast(now, h.src, seq, f.payload);
                            self.rx_set_state(RxState::Successful);
                            return Ok(());
                        },
                        _ if h.dst != own => trace!("Ignoring {:?} for {:?}", h.kind, h.dst),
                        _ => self.rx_violation(&h),
                    }
                }

                if self.ctx.rx.violations > self.config.max_protocol_violations {
                    self.rx_set_state(RxState::Failed);
                } else if self.ctx.timeouts.is_expired(TimeoutKind::WakeupPeriod) {
                    trace!("Listen window ended without a WR");
                    self.rx_set_state(RxState::Failed);
                }
            },
            RxState::SendWa => {
                let peer = match self.ctx.rx.peer {
                    Some(p) => p,
                    None => {
                        self.rx_set_state(RxState::Failed);
                        return Ok(());
                    }
                };

                let phase = self.phase_now(now);
                let header = Header::new(FrameKind::WakeAck{ phase }, peer, own);
                self.send_header(&header)?;

                trace!("Sent WA to {:?} (phase: {} us)", peer, phase);

                if self.rx_arm(TimeoutKind::WakeAck, self.config.wa_sent_us) {
                    self.rx_set_state(RxState::WaitWaSent);
                }
            },
            RxState::WaitWaSent => {
                if self.take_feedback().is_some() {
                    self.ctx.timeouts.clear(TimeoutKind::WakeAck);
                    if self.rx_arm(TimeoutKind::Data, self.config.data_delay_us) {
                        self.rx_set_state(RxState::WaitForData);
                    }
                } else if self.ctx.timeouts.is_expired(TimeoutKind::WakeAck) {
                    debug!("WA not sent");
                    self.rx_set_state(RxState::Failed);
                }
            },
            RxState::WaitForData => {
                let peer = self.ctx.rx.peer;

                while let Some(f) = self.ctx.rx.queue.pop_front() {
                    let h = f.header;

                    match h.kind {
                        FrameKind::Data if Some(h.src) == peer => {
                            self.ctx.timeouts.clear(TimeoutKind::Data);

                            // Sender has more queued, stay awake for it
                            if h.pending && self.ctx.duty_cycling_active() {
                                if let Err(e) = self.set_timeout(TimeoutKind::WakeupPeriod, self.config.wakeup_duration_us) {
                                    warn!("Failed to extend listen window: {:?}", e);
                                }
                            }

                            self.stats.rx_success = self.stats.rx_success.saturating_add(1);
                            self.dispatch(h.src, f.payload);
                            self.rx_set_state(RxState::Successful);
                            return Ok(());
                        },
                        FrameKind::WakeRequest if Some(h.src) == peer && h.dst == own => {
                            // Our WA was lost
                            self.ctx.rx.extensions = self.ctx.rx.extensions.saturating_add(1);
                            if self.ctx.rx.extensions > self.config.max_rx_extensions {
                                debug!("Too many WRs from {:?}", h.src);
                                self.rx_set_state(RxState::Failed);
                            } else {
                                self.ctx.timeouts.clear(TimeoutKind::Data);
                                self.rx_set_state(RxState::SendWa);
                            }
                            return Ok(());
                        },
                        FrameKind::Broadcast{ seq } => self.rx_broadcast(now, h.src, seq, f.payload),
                        _ if h.dst != own => trace!("Ignoring {:?} for {:?}", h.kind, h.dst),
                        _ => self.rx_violation(&h),
                    }
                }

                if self.ctx.rx.violations > self.config.max_protocol_violations {
                    self.rx_set_state(RxState::Failed);
                } else if self.ctx.timeouts.is_expired(TimeoutKind::Data) {
                    debug!("No data from {:?}", peer);
                    self.rx_set_state(RxState::Failed);
                }
            },
            _ => (),
        }

        Ok(())
    }

    /// Deliver a broadcast unless recently seen
    fn rx_broadcast(&mut self, now: Ts, src: LinkAddr, seq: u8, payload: Packet) {
        let lifetime = self.config.dup_lifetime_us();

        if self.ctx.rx.dups.check(src, seq, now, lifetime) {
            trace!("Duplicate broadcast {} from {:?}", seq, src);
            self.stats.rx_duplicates = self.stats.rx_duplicates.saturating_add(1);
            return;
        }

        self.stats.rx_success = self.stats.rx_success.saturating_add(1);
        self.dispatch(src, payload);
    }

    /// Complete a reception
    pub(crate) fn rx_end(&mut self) {
        if self.ctx.rx.state == RxState::Failed {
            self.stats.rx_failed = self.stats.rx_failed.saturating_add(1);
        }

        self.rx_reset();
    }

    /// Abandon a reception, discarding buffered frames
    pub(crate) fn rx_abort(&mut self) {
        self.rx_reset();
        self.ctx.rx.queue.clear();
    }

    fn rx_reset(&mut self) {
        self.ctx.timeouts.clear(TimeoutKind::WakeAck);
        self.ctx.timeouts.clear(TimeoutKind::Data);

        let rx = &mut self.ctx.rx;
        rx.state = RxState::Stopped;
        rx.peer = None;
        rx.extensions = 0;
        rx.violations = 0;

        self.ctx.flags.remove(LinkFlags::RX_STARTED);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::super::{LinkState, Config};
    use super::super::timeout::TimeoutState;
    use super::super::harness::*;

    fn wr(dst: LinkAddr, src: LinkAddr) -> std::vec::Vec<u8> {
        frame_bytes(Header::new(FrameKind::WakeRequest, dst, src), &[])
    }

    #[test]
    fn handshake_dispatches_data() {
        let (mut mac, mut driver, mut timer) = started(test_config());

        timer.set_us(2_500);
        driver.push_frame(&wr(OWN, PEER));
        mac.tick().unwrap();

        assert_eq!(mac.state(), LinkState::Receiving);
        assert_eq!(mac.rx_state(), RxState::WaitWaSent);

        let sent = decode_sent(&mut driver);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header, Header::new(FrameKind::WakeAck{ phase: 2_500 }, PEER, OWN));

        settle(&mut mac, &driver);
        assert_eq!(mac.rx_state(), RxState::WaitForData);

        timer.set_us(3_000);
        let mut h = Header::new(FrameKind::Data, OWN, PEER);
        h.pending = true;
        driver.push_frame(&frame_bytes(h, &[1, 2, 3]));
        mac.tick().unwrap();

        assert_eq!(mac.rx_state(), RxState::Stopped);
        assert_eq!(mac.state(), LinkState::Listening);
        assert_eq!(mac.receive(), Some((PEER, Packet::from_slice(&[1, 2, 3]).unwrap())));
        assert_eq!(mac.receive(), None);
        assert_eq!(mac.stats().rx_success, 1);

        // Listen window extended for the pending frame
        assert_eq!(mac.context().timeouts.get(TimeoutKind::WakeupPeriod).state, TimeoutState::Armed(13_000));
    }

    #[test]
    fn data_timeout_dispatches_nothing() {
        let (mut mac, mut driver, mut timer) = started(test_config());

        driver.push_frame(&wr(OWN, PEER));
        mac.tick().unwrap();
        settle(&mut mac, &driver);
        assert_eq!(mac.rx_state(), RxState::WaitForData);

        advance(&mut mac, &driver, &mut timer, 5_000);

        assert_eq!(mac.rx_state(), RxState::Stopped);
        assert_eq!(mac.receive(), None);
        assert_eq!(mac.stats().rx_failed, 1);
        assert_eq!(mac.stats().rx_success, 0);
        assert_eq!(mac.state(), LinkState::Listening);
    }

    #[test]
    fn late_data_after_timeout_dispatches_nothing() {
        let (mut mac, mut driver, mut timer) = started(test_config());

        driver.push_frame(&wr(OWN, PEER));
        mac.tick().unwrap();
        settle(&mut mac, &driver);
        assert_eq!(mac.rx_state(), RxState::WaitForData);
        assert_eq!(mac.context().timeouts.get(TimeoutKind::Data).state, TimeoutState::Armed(5_000));

        // Ticked late, the data frame is collected after its deadline passed
        timer.set_us(7_000);
        driver.push_frame(&frame_bytes(Header::new(FrameKind::Data, OWN, PEER), &[9]));
        mac.tick().unwrap();

        assert_eq!(mac.receive(), None);
        assert_eq!(mac.stats().rx_failed, 1);
        assert_eq!(mac.stats().rx_success, 0);
        assert_eq!(mac.stats().protocol_violations, 1);
    }

    #[test]
    fn repeated_wr_resends_wa() {
        let config = Config{ max_rx_extensions: 1, ..test_config() };
        let (mut mac, mut driver, _timer) = started(config);

        driver.push_frame(&wr(OWN, PEER));
        mac.tick().unwrap();
        settle(&mut mac, &driver);

        // WA lost, sender retries
        driver.push_frame(&wr(OWN, PEER));
        mac.tick().unwrap();
        settle(&mut mac, &driver);
        assert_eq!(mac.rx_state(), RxState::WaitForData);

        let sent = decode_sent(&mut driver);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|f| matches!(f.header.kind, FrameKind::WakeAck{ .. })));

        // Extension budget exhausted
        driver.push_frame(&wr(OWN, PEER));
        mac.tick().unwrap();
        assert_eq!(mac.rx_state(), RxState::Stopped);
        assert_eq!(mac.stats().rx_failed, 1);
    }

    #[test]
    fn overheard_wr_quits_listen() {
        let (mut mac, mut driver, _timer) = started(test_config());

        driver.push_frame(&wr(PEER2, PEER));
        mac.tick().unwrap();

        assert_eq!(mac.rx_state(), RxState::Stopped);
        assert_eq!(mac.state(), LinkState::Sleeping);
        assert!(!driver.rx_on());
        assert!(driver.take_sent().is_empty());
    }

    #[test]
    fn broadcast_duplicates_filtered() {
        let (mut mac, mut driver, mut timer) = started(test_config());
        let bcast = |seq| frame_bytes(Header::new(FrameKind::Broadcast{ seq }, LinkAddr::BROADCAST, PEER), &[seq]);

        driver.push_frame(&bcast(5));
        mac.tick().unwrap();
        assert_eq!(mac.receive(), Some((PEER, packet(5))));

        // Repeated copy within the same window
        timer.set_us(2_000);
        driver.push_frame(&bcast(5));
        mac.tick().unwrap();
        assert_eq!(mac.receive(), None);
        assert_eq!(mac.stats().rx_duplicates, 1);

        driver.push_frame(&bcast(6));
        mac.tick().unwrap();
        assert_eq!(mac.receive(), Some((PEER, packet(6))));

        // No WA for broadcasts
        assert!(driver.take_sent().is_empty());
    }

    #[test]
    fn protocol_violations_bounded() {
        let (mut mac, mut driver, _timer) = started(test_config());

        let wa = frame_bytes(Header::new(FrameKind::WakeAck{ phase: 0 }, OWN, PEER), &[]);
        for _ in 0..4 {
            driver.push_frame(&wa);
        }
        mac.tick().unwrap();

        assert_eq!(mac.rx_state(), RxState::Stopped);
        assert_eq!(mac.stats().protocol_violations, 4);
        assert_eq!(mac.stats().rx_failed, 1);
    }

    #[test]
    fn dup_filter_expiry() {
        let mut f = DupFilter::default();
        let a = LinkAddr::short(2);

        assert!(!f.check(a, 1, 0, 100));
        assert!(f.check(a, 1, 50, 100));
        assert!(!f.check(a, 1, 150, 100));

        for i in 0..DUP_FILTER_LEN as u16 + 1 {
            f.check(LinkAddr::short(0x10 + i), 1, 200 + i as Ts, 1_000);
        }
        assert_eq!(f.len(), DUP_FILTER_LEN);
    }
}
