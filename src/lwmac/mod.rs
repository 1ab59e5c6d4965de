//! LWMAC, a duty-cycled wireless MAC with wake-up phase learning.
//!
//! Nodes sleep for most of each wake-up interval and listen for a short window
//! following every wake-up. A sender rouses a receiver by repeating Wake-Requests
//! (WR) until the receiver answers with a Wake-Ack (WA), then sends its data.
//! The WA carries the receiver's phase so subsequent transmissions can be
//! deferred until the receiver is next awake.
//!
//! All state is owned by a single [`Lwmac`] instance per radio interface and
//! mutated only from [`Lwmac::tick`], which drains driver, timer and duty-cycle
//! events through one serialized event queue.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use heapless::Deque;
use rand_core::RngCore;

use crate::log::{trace, debug, info, warn, error, FmtError};
use crate::{Ts, MAX_FRAME_LEN, Mac as MacIf};
use crate::error::CoreError;
use crate::mac::{Driver, LinkAddr, TxFeedback};
use crate::packet::Packet;
use crate::timer::Timer;

pub mod config;
pub use config::*;

pub mod frame;
use frame::{Frame, Header};

pub mod timeout;
use timeout::{Timeouts, TimeoutKind, TimeoutError};

pub mod neighbour;
use neighbour::{Neighbour, Phase};

pub mod event;
pub use event::{Event, RttEvent};
use event::RttAlarm;

pub mod channel;

mod tx;
pub use tx::{TxState, TxContext, TxReport, TxResult, TxFailure};

mod rx;
pub use rx::{RxState, RxContext};

#[cfg(test)]
mod harness;

/// Bound on chained state machine updates per event
const MAX_UPDATES: usize = 16;

/// Top level link states
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Stopped,
    Start,
    Stop,
    Reset,
    Listening,
    Receiving,
    Transmitting,
    Sleeping,
}

bitflags::bitflags! {
    /// Link control flags
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct LinkFlags: u8 {
        /// Duty cycling active (cleared while paused)
        const DUTY_CYCLING  = 0b0000_0001;
        /// State machine update requested within the current pass
        const RESCHEDULE    = 0b0000_0010;
        /// Reception in progress
        const RX_STARTED    = 0b0000_0100;
        /// Unconsumed transmission feedback in `last_feedback`
        const FEEDBACK      = 0b0000_1000;
        /// New transmission attempts held until the next wake-up
        const TX_DEFERRED   = 0b0001_0000;
    }
}

/// MAC statistics
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacStats {
    pub tx_success: u32,
    pub tx_failed: u32,
    pub tx_dropped: u32,
    pub wr_sent: u32,
    pub broadcast_sent: u32,
    pub rx_success: u32,
    pub rx_failed: u32,
    pub rx_duplicates: u32,
    pub rx_queue_full: u32,
    pub dispatch_full: u32,
    pub report_full: u32,
    pub event_overflow: u32,
    pub decode_errors: u32,
    pub protocol_violations: u32,
    pub resets: u32,
}

/// Per-interface link context
pub struct LinkContext {
    pub state: LinkState,
    pub own_address: LinkAddr,
    pub rx: RxContext,
    pub tx: TxContext,
    /// Outcome of the most recently completed transmission
    pub last_feedback: Option<TxFeedback>,
    pub timeouts: Timeouts,
    /// Time of our last duty-cycle wake-up, the reference for all phases
    pub last_wakeup: Ts,
    pub flags: LinkFlags,
    rtt: RttAlarm,
    /// Shift to apply to our next wake-up
    phase_backoff: Option<u32>,
    /// Shift applied to the upcoming wake-up, neighbour phases rotate when it occurs
    phase_shift: Option<u32>,
}

impl LinkContext {
    pub fn new(own_address: LinkAddr) -> Self {
        Self {
            state: LinkState::Stopped,
            own_address,
            rx: RxContext::new(),
            tx: TxContext::new(),
            last_feedback: None,
            timeouts: Timeouts::new(),
            last_wakeup: 0,
            flags: LinkFlags::empty(),
            rtt: RttAlarm::default(),
            phase_backoff: None,
            phase_shift: None,
        }
    }

    pub fn duty_cycling_active(&self) -> bool {
        self.flags.contains(LinkFlags::DUTY_CYCLING)
    }

    pub fn needs_rescheduling(&self) -> bool {
        self.flags.contains(LinkFlags::RESCHEDULE)
    }

    pub fn rx_started(&self) -> bool {
        self.flags.contains(LinkFlags::RX_STARTED)
    }
}

/// LWMAC instance, generic over radio driver, timer and random source
pub struct Lwmac<D, T, R> {
    ctx: LinkContext,
    config: Config,

    driver: D,
    timer: T,
    rng: R,

    events: Deque<Event, EVENT_QUEUE_LEN>,
    dispatch: Deque<(LinkAddr, Packet), DISPATCH_LEN>,
    reports: Deque<TxReport, REPORT_LEN>,

    stats: MacStats,
    buff: [u8; MAX_FRAME_LEN],
}

impl <D, T, R> Lwmac<D, T, R>
where
    D: Driver,
    D::Error: FmtError,
    T: Timer,
    R: RngCore,
{
    /// Create a new LWMAC instance, the link remains stopped until [`Lwmac::start`].
    ///
    /// Fails with [`CoreError::InvalidConfig`] if `config` is not [`Config::is_valid`]
    pub fn new(address: LinkAddr, config: Config, driver: D, timer: T, rng: R) -> Result<Self, CoreError<D::Error>> {
        if !config.is_valid() {
            error!("Invalid LWMAC configuration: {:?}", config);
            return Err(CoreError::InvalidConfig);
        }

        debug!("Setup LWMAC with address {:?}", address);

        Ok(Self {
            ctx: LinkContext::new(address),
            config,
            driver,
            timer,
            rng,
            events: Deque::new(),
            dispatch: Deque::new(),
            reports: Deque::new(),
            stats: MacStats::default(),
            buff: [0u8; MAX_FRAME_LEN],
        })
    }

    pub fn address(&self) -> LinkAddr {
        self.ctx.own_address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.ctx.state
    }

    pub fn tx_state(&self) -> TxState {
        self.ctx.tx.state
    }

    pub fn rx_state(&self) -> RxState {
        self.ctx.rx.state
    }

    pub fn context(&self) -> &LinkContext {
        &self.ctx
    }

    /// Fetch MAC layer statistics
    pub fn stats(&self) -> MacStats {
        self.stats.clone()
    }

    pub fn neighbour(&self, addr: &LinkAddr) -> Option<&Neighbour> {
        let id = self.ctx.tx.neighbours.find(addr)?;
        self.ctx.tx.neighbours.get(id)
    }

    /// Earliest time at which the MAC needs to be ticked (absent driver events)
    pub fn next_deadline(&self) -> Option<Ts> {
        let t = self.ctx.timeouts.next_deadline();
        let a = self.ctx.rtt.pending().map(|(at, _)| at);
        match (t, a) {
            (Some(t), Some(a)) => Some(t.min(a)),
            (t, a) => t.or(a),
        }
    }

    /// Start the link
    pub fn start(&mut self) -> Result<(), CoreError<D::Error>> {
        self.post(Event::Rtt(RttEvent::Start))
    }

    /// Stop the link, queued packets are retained
    pub fn stop(&mut self) -> Result<(), CoreError<D::Error>> {
        self.post(Event::Rtt(RttEvent::Stop))
    }

    /// Pause duty cycling, the radio listens continuously
    pub fn pause(&mut self) -> Result<(), CoreError<D::Error>> {
        self.post(Event::Rtt(RttEvent::Pause))
    }

    /// Resume duty cycling from the current time
    pub fn resume(&mut self) -> Result<(), CoreError<D::Error>> {
        self.post(Event::Rtt(RttEvent::Resume))
    }

    /// Reset the link, discarding in-flight handshakes and timeouts.
    /// The link is left stopped.
    pub fn reset(&mut self) {
        self.enter_reset();
    }

    /// Post an event to the serialized event queue
    pub fn post(&mut self, ev: Event) -> Result<(), CoreError<D::Error>> {
        if let Err(ev) = self.events.push_back(ev) {
            warn!("Event queue full, dropping {:?}", ev);
            self.stats.event_overflow = self.stats.event_overflow.saturating_add(1);
            return Err(CoreError::EventQueueFull);
        }
        Ok(())
    }

    /// Queue a packet for transmission, fails if the destination queue is full
    pub fn submit(&mut self, dest: LinkAddr, packet: Packet) -> Result<(), CoreError<D::Error>> {
        let capacity = self.config.queue_capacity();
        let tx = &mut self.ctx.tx;

        let id = match tx.neighbours.find_or_insert(dest) {
            Some(id) => id,
            None => {
                warn!("Neighbour table full, rejecting packet for {:?}", dest);
                return Err(CoreError::NeighbourTableFull(packet));
            }
        };

        let in_flight = tx.in_flight(id);
        let n = match tx.neighbours.get_mut(id) {
            Some(n) => n,
            None => return Err(CoreError::NeighbourTableFull(packet)),
        };

        if n.queue.len() + in_flight >= capacity {
            warn!("TX queue full for {:?}", dest);
            return Err(CoreError::QueueFull(packet));
        }

        if let Err(p) = n.queue.push_back(packet) {
            return Err(CoreError::QueueFull(p));
        }

        debug!("Queued packet for {:?} ({} pending)", dest, n.queue.len());

        Ok(())
    }

    /// Fetch a received packet and its sender
    pub fn receive(&mut self) -> Option<(LinkAddr, Packet)> {
        self.dispatch.pop_front()
    }

    /// Fetch the next transmission outcome report
    pub fn poll_report(&mut self) -> Option<TxReport> {
        self.reports.pop_front()
    }

    /// Evict neighbours with empty queues, returns the number evicted.
    /// Does nothing while a transmission holds a current neighbour.
    pub fn collect_neighbours(&mut self) -> usize {
        if self.ctx.tx.current.is_some() {
            return 0;
        }
        self.ctx.tx.neighbours.collect()
    }

    /// Evict a neighbour, dropping (and reporting) its queued packets.
    /// Returns the number of packets dropped, or `None` if the neighbour is
    /// unknown or a transmission holds a current neighbour.
    pub fn remove_neighbour(&mut self, addr: &LinkAddr) -> Option<usize> {
        if self.ctx.tx.current.is_some() {
            return None;
        }

        let n = self.ctx.tx.neighbours.remove(addr)?;
        let dropped = n.queue.len();

        for _ in 0..dropped {
            self.report(TxReport{ dest: n.addr, result: TxResult::Failed(TxFailure::Evicted) });
        }
        self.stats.tx_dropped = self.stats.tx_dropped.saturating_add(dropped as u32);

        info!("Evicted neighbour {:?} ({} packets dropped)", n.addr, dropped);

        Some(dropped)
    }

    /// Update the MAC, collecting and handling pending events.
    ///
    /// Driver errors reset the link before being returned.
    pub fn tick(&mut self) -> Result<(), CoreError<D::Error>> {
        let r = self.process();

        if let Err(CoreError::Radio(e)) = &r {
            error!("Driver error {:?} in state {}, resetting link", e, self.ctx.state);
            self.enter_reset();
        }

        r
    }

    fn process(&mut self) -> Result<(), CoreError<D::Error>> {
        let now = self.timer.ticks_us();

        // Collect due duty-cycle alarms and timeouts in deadline order,
        // ahead of any driver events polled in the same pass
        while !self.events.is_full() {
            let alarm = self.ctx.rtt.pending().map(|(at, _)| at).filter(|at| *at <= now);
            let timeout = self.ctx.timeouts.next_deadline().filter(|d| *d <= now);

            match (alarm, timeout) {
                (Some(a), Some(t)) if a <= t => self.poll_rtt(now)?,
                (Some(_), None) => self.poll_rtt(now)?,
                (_, Some(_)) => self.poll_timeout(now)?,
                (None, None) => break,
            }
        }

        // Collect driver events
        while !self.events.is_full() {
            match self.driver.poll().map_err(CoreError::Radio)? {
                Some(ev) => self.post(ev.into())?,
                None => break,
            }
        }

        // Handle events in arrival order
        while let Some(ev) = self.events.pop_front() {
            self.handle_event(ev)?;
        }

        // Pick up work not triggered by an event (eg. newly submitted packets)
        self.update()
    }

    fn poll_rtt(&mut self, now: Ts) -> Result<(), CoreError<D::Error>> {
        match self.ctx.rtt.poll(now) {
            Some(ev) => self.post(Event::Rtt(ev)),
            None => Ok(()),
        }
    }

    fn poll_timeout(&mut self, now: Ts) -> Result<(), CoreError<D::Error>> {
        match self.ctx.timeouts.poll(now) {
            Some((kind, generation)) => self.post(Event::Timeout{ kind, generation }),
            None => Ok(()),
        }
    }

    fn handle_event(&mut self, ev: Event) -> Result<(), CoreError<D::Error>> {
        trace!("Handle {:?} in state {}", ev, self.ctx.state);

        match ev {
            Event::Rtt(rtt) => self.handle_rtt(rtt)?,
            Event::Timeout{ kind, generation } => {
                if !self.ctx.timeouts.fire(kind, generation) {
                    trace!("Discarding stale {} timeout", kind);
                    return Ok(());
                }
                trace!("Timeout {} expired", kind);
            },
            Event::TxDone(fb) => {
                self.ctx.last_feedback = Some(fb);
                self.ctx.flags.insert(LinkFlags::FEEDBACK);
            },
            Event::RxStarted if self.ctx.state != LinkState::Stopped => {
                self.ctx.flags.insert(LinkFlags::RX_STARTED);
            },
            Event::RxStarted => (),
            Event::Received(raw) => {
                self.ctx.flags.remove(LinkFlags::RX_STARTED);
                self.handle_received(raw.data());
            },
        }

        self.update()
    }

    fn handle_received(&mut self, data: &[u8]) {
        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                debug!("Failed to decode {} byte frame: {:?}", data.len(), e);
                self.stats.decode_errors = self.stats.decode_errors.saturating_add(1);
                return;
            }
        };

        if self.ctx.state == LinkState::Stopped {
            return;
        }

        let h = &frame.header;
        if h.src == self.ctx.own_address {
            return;
        }

        // Overheard data is dropped, control frames for others are kept
        // as they indicate a busy channel
        if h.kind == frame::FrameKind::Data && h.dst != self.ctx.own_address {
            trace!("Dropping data frame for {:?}", h.dst);
            return;
        }

        trace!("Received {:?} from {:?}", h.kind, h.src);

        if let Err(f) = self.ctx.rx.queue.push_back(frame) {
            warn!("RX queue full, dropping frame from {:?}", f.header.src);
            self.stats.rx_queue_full = self.stats.rx_queue_full.saturating_add(1);
        }
    }

    fn handle_rtt(&mut self, ev: RttEvent) -> Result<(), CoreError<D::Error>> {
        let now = self.timer.ticks_us();

        match (ev, self.ctx.state) {
            (RttEvent::Start, LinkState::Stopped) => self.set_state(LinkState::Start),
            (RttEvent::Start, _) => (),
            (RttEvent::Stop, LinkState::Stopped) => (),
            (RttEvent::Stop, _) => self.set_state(LinkState::Stop),
            (_, LinkState::Stopped) => trace!("Ignoring {} while stopped", ev),
            (RttEvent::Pause, _) => {
                info!("Duty cycling paused");
                self.ctx.flags.remove(LinkFlags::DUTY_CYCLING);
                self.ctx.rtt.cancel();
                self.ctx.timeouts.clear(TimeoutKind::WakeupPeriod);
                if self.ctx.state == LinkState::Sleeping {
                    self.enter_listening()?;
                }
            },
            (RttEvent::Resume, _) => {
                if !self.ctx.duty_cycling_active() {
                    info!("Duty cycling resumed");
                    self.ctx.flags.insert(LinkFlags::DUTY_CYCLING);
                    self.wakeup(now);
                }
            },
            (RttEvent::WakeupPending, state) => {
                let at = self.ctx.rtt.fired_at();
                self.wakeup(at);
                if state == LinkState::Sleeping {
                    self.enter_listening()?;
                }
            },
            (RttEvent::SleepPending, _) => {
                let backoff = self.ctx.phase_backoff.take().unwrap_or(0);
                let next = self.ctx.last_wakeup + self.config.wakeup_interval_us as Ts + backoff as Ts;

                if backoff > 0 {
                    debug!("Applying {} us phase backoff", backoff);
                    self.ctx.phase_shift = Some(backoff);
                }

                self.ctx.rtt.set(next, RttEvent::WakeupPending);
                self.reschedule();
            },
        }

        Ok(())
    }

    /// Duty-cycle wake-up, re-anchors phases and opens the listen window
    fn wakeup(&mut self, at: Ts) {
        if let Some(shift) = self.ctx.phase_shift.take() {
            let interval = self.config.wakeup_interval_us;
            for n in self.ctx.tx.neighbours.iter_mut() {
                n.phase = n.phase.shifted(shift, interval);
            }
        }

        self.ctx.last_wakeup = at;
        self.ctx.flags.remove(LinkFlags::TX_DEFERRED);

        if self.ctx.duty_cycling_active() {
            let duration = self.config.wakeup_duration_us;
            if let Err(e) = self.ctx.timeouts.set(TimeoutKind::WakeupPeriod, at, duration) {
                warn!("Failed to arm listen window: {:?}", e);
            }
            self.ctx.rtt.set(at + duration as Ts, RttEvent::SleepPending);
        }

        trace!("Wake-up at {} us", at);
        self.reschedule();
    }

    /// Run the link state machine until no further update is requested
    fn update(&mut self) -> Result<(), CoreError<D::Error>> {
        for _ in 0..MAX_UPDATES {
            self.ctx.flags.remove(LinkFlags::RESCHEDULE);

            self.update_link()?;

            if !self.ctx.needs_rescheduling() {
                return Ok(());
            }
        }

        warn!("Update limit reached in state {}", self.ctx.state);

        Ok(())
    }

    fn update_link(&mut self) -> Result<(), CoreError<D::Error>> {
        let now = self.timer.ticks_us();

        match self.ctx.state {
            LinkState::Stopped => (),
            LinkState::Start => {
                info!("Starting LWMAC at {} us", now);
                self.driver.set_rx_mode(true).map_err(CoreError::Radio)?;
                self.ctx.flags = LinkFlags::DUTY_CYCLING;
                self.wakeup(now);
                self.set_state(LinkState::Listening);
            },
            LinkState::Stop => {
                self.teardown();
                self.driver.set_rx_mode(false).map_err(CoreError::Radio)?;
                info!("Stopped LWMAC");
                self.ctx.state = LinkState::Stopped;
            },
            LinkState::Reset => self.reset_link(),
            LinkState::Listening => {
                if !self.ctx.rx.queue.is_empty() || self.ctx.rx_started() {
                    self.rx_begin();
                    self.set_state(LinkState::Receiving);
                } else if self.tx_resume_due() {
                    self.set_state(LinkState::Transmitting);
                } else if self.tx_ready() {
                    self.tx_begin();
                    self.set_state(LinkState::Transmitting);
                } else if !self.listen_window_open() {
                    self.enter_sleeping()?;
                }
            },
            LinkState::Receiving => {
                self.rx_update()?;

                if self.ctx.rx.state.is_terminal() {
                    self.rx_end();
                    self.resume_duty_cycle()?;
                }
            },
            LinkState::Transmitting => {
                self.tx_update()?;

                if self.ctx.tx.state.is_terminal() {
                    self.tx_end();
                    self.resume_duty_cycle()?;
                } else if self.ctx.tx.state == TxState::WaitDestWakeup || self.ctx.tx.state == TxState::Stopped {
                    self.resume_duty_cycle()?;
                }
            },
            LinkState::Sleeping => {
                if self.tx_resume_due() {
                    self.driver.set_rx_mode(true).map_err(CoreError::Radio)?;
                    self.set_state(LinkState::Transmitting);
                }
            },
        }

        Ok(())
    }

    fn set_state(&mut self, state: LinkState) {
        if state != self.ctx.state {
            debug!("Link state {} -> {}", self.ctx.state, state);
        }
        self.ctx.state = state;
        self.reschedule();
    }

    fn reschedule(&mut self) {
        self.ctx.flags.insert(LinkFlags::RESCHEDULE);
    }

    /// Listen window open, always the case while duty cycling is paused
    fn listen_window_open(&self) -> bool {
        !self.ctx.duty_cycling_active() || self.ctx.timeouts.is_running(TimeoutKind::WakeupPeriod)
    }

    fn enter_listening(&mut self) -> Result<(), CoreError<D::Error>> {
        if self.ctx.state != LinkState::Listening {
            self.driver.set_rx_mode(true).map_err(CoreError::Radio)?;
        }
        self.set_state(LinkState::Listening);
        Ok(())
    }

    fn enter_sleeping(&mut self) -> Result<(), CoreError<D::Error>> {
        self.driver.set_rx_mode(false).map_err(CoreError::Radio)?;
        self.set_state(LinkState::Sleeping);
        Ok(())
    }

    /// Return to listening or sleeping following sub-machine activity
    fn resume_duty_cycle(&mut self) -> Result<(), CoreError<D::Error>> {
        if self.listen_window_open() || !self.ctx.rx.queue.is_empty() {
            self.enter_listening()
        } else {
            self.enter_sleeping()
        }
    }

    /// Tear down sub-machines and timeouts, in-flight packets return to their queues
    fn teardown(&mut self) {
        self.tx_abort();
        self.rx_abort();

        for n in self.ctx.tx.neighbours.iter_mut() {
            n.phase = Phase::Unknown;
        }

        self.ctx.timeouts.reset_all();
        self.ctx.rtt.cancel();
        self.ctx.flags = LinkFlags::empty();
        self.ctx.last_feedback = None;
        self.ctx.phase_backoff = None;
        self.ctx.phase_shift = None;
    }

    /// Pass through RESET into STOPPED, discarding sub-machine state
    fn enter_reset(&mut self) {
        warn!("Resetting link from state {}", self.ctx.state);

        self.set_state(LinkState::Reset);
        self.reset_link();
    }

    fn reset_link(&mut self) {
        self.teardown();
        self.stats.resets = self.stats.resets.saturating_add(1);
        self.ctx.state = LinkState::Stopped;
    }

    /// Our current offset into the wake-up interval
    pub(crate) fn phase_now(&self, now: Ts) -> u32 {
        let i = self.config.wakeup_interval_us as Ts;
        let p = if now >= self.ctx.last_wakeup {
            (now - self.ctx.last_wakeup) % i
        } else {
            (i - (self.ctx.last_wakeup - now) % i) % i
        };
        p as u32
    }

    pub(crate) fn set_timeout(&mut self, kind: TimeoutKind, offset_us: u32) -> Result<(), TimeoutError> {
        let now = self.timer.ticks_us();
        self.ctx.timeouts.set(kind, now, offset_us)
    }

    /// Take unconsumed transmission feedback
    pub(crate) fn take_feedback(&mut self) -> Option<TxFeedback> {
        if !self.ctx.flags.contains(LinkFlags::FEEDBACK) {
            return None;
        }
        self.ctx.flags.remove(LinkFlags::FEEDBACK);
        self.ctx.last_feedback
    }

    /// Send a control frame with no payload
    pub(crate) fn send_header(&mut self, header: &Header) -> Result<(), CoreError<D::Error>> {
        let n = frame::encode_with(header, &[], &mut self.buff)?;
        self.send_buffered(n)
    }

    /// Send the first `n` bytes of the frame buffer
    pub(crate) fn send_buffered(&mut self, n: usize) -> Result<(), CoreError<D::Error>> {
        self.ctx.flags.remove(LinkFlags::FEEDBACK);
        self.ctx.last_feedback = None;

        trace!("Send {} bytes: {:?}", n, &self.buff[..n]);

        self.driver.send(&self.buff[..n]).map_err(CoreError::Radio)
    }

    /// Hand a received packet to the dispatch buffer, rejecting when full
    pub(crate) fn dispatch(&mut self, src: LinkAddr, packet: Packet) {
        debug!("Received {} bytes from {:?}", packet.len(), src);

        if self.dispatch.push_back((src, packet)).is_err() {
            warn!("Dispatch buffer full, dropping packet from {:?}", src);
            self.stats.dispatch_full = self.stats.dispatch_full.saturating_add(1);
        }
    }

    pub(crate) fn report(&mut self, report: TxReport) {
        if let Err(r) = self.reports.push_back(report) {
            warn!("Report queue full, dropping report for {:?}", r.dest);
            self.stats.report_full = self.stats.report_full.saturating_add(1);
        }
    }

    pub(crate) fn protocol_violation(&mut self, header: &Header) {
        debug!("Unexpected {:?} from {:?}", header.kind, header.src);
        self.stats.protocol_violations = self.stats.protocol_violations.saturating_add(1);
    }
}

impl <D, T, R> MacIf for Lwmac<D, T, R>
where
    D: Driver,
    D::Error: FmtError,
    T: Timer,
    R: RngCore,
{
    type Error = CoreError<D::Error>;

    fn transmit(&mut self, dest: LinkAddr, packet: Packet) -> Result<(), Self::Error> {
        self.submit(dest, packet)
    }

    fn receive(&mut self) -> Result<Option<(LinkAddr, Packet)>, Self::Error> {
        Ok(Lwmac::receive(self))
    }

    fn busy(&mut self) -> Result<bool, Self::Error> {
        Ok(self.ctx.tx.state != TxState::Stopped || self.ctx.rx.state != RxState::Stopped)
    }

    fn tick(&mut self) -> Result<(), Self::Error> {
        Lwmac::tick(self)
    }
}

#[cfg(test)]
mod test {
    use rand::rngs::mock::StepRng;

    use crate::mac::mock::{MockDriver, MockDriverError};
    use crate::timer::mock::MockTimer;
    use crate::Mac;

    use super::*;
    use super::harness::*;

    #[test]
    fn duty_cycle() {
        let (mut mac, driver, mut timer) = setup(test_config());

        assert_eq!(mac.state(), LinkState::Stopped);
        mac.start().unwrap();
        mac.tick().unwrap();

        assert_eq!(mac.state(), LinkState::Listening);
        assert!(driver.rx_on());
        assert!(mac.context().duty_cycling_active());

        // Listen window ends
        timer.set_us(10_000);
        mac.tick().unwrap();
        assert_eq!(mac.state(), LinkState::Sleeping);
        assert!(!driver.rx_on());

        // Next wake-up
        timer.set_us(100_000);
        mac.tick().unwrap();
        assert_eq!(mac.state(), LinkState::Listening);
        assert_eq!(mac.context().last_wakeup, 100_000);
        assert!(driver.rx_on());

        mac.stop().unwrap();
        mac.tick().unwrap();
        assert_eq!(mac.state(), LinkState::Stopped);
        assert!(!driver.rx_on());
        assert_eq!(mac.next_deadline(), None);
    }

    #[test]
    fn pause_resume() {
        let (mut mac, driver, mut timer) = started(test_config());

        mac.pause().unwrap();
        mac.tick().unwrap();
        assert!(!mac.context().duty_cycling_active());

        // No sleep while paused
        timer.set_us(250_000);
        mac.tick().unwrap();
        assert_eq!(mac.state(), LinkState::Listening);
        assert!(driver.rx_on());

        mac.resume().unwrap();
        mac.tick().unwrap();
        assert_eq!(mac.context().last_wakeup, 250_000);

        timer.set_us(260_000);
        mac.tick().unwrap();
        assert_eq!(mac.state(), LinkState::Sleeping);
    }

    #[test]
    fn submit_queue_overflow() {
        let (mut mac, _driver, _timer) = started(test_config());
        let capacity = mac.config().queue_capacity();

        for i in 0..capacity {
            mac.submit(PEER, packet(i as u8)).unwrap();
        }

        let excess = packet(0xaa);
        assert_eq!(mac.submit(PEER, excess.clone()), Err(CoreError::QueueFull(excess)));

        // Existing contents are untouched
        let n = mac.neighbour(&PEER).unwrap();
        assert_eq!(n.queue().len(), capacity);
        for (i, p) in n.queue().iter().enumerate() {
            assert_eq!(p, &packet(i as u8));
        }
    }

    #[test]
    fn in_flight_counts_against_capacity() {
        let (mut mac, _driver, _timer) = started(test_config());
        let capacity = mac.config().queue_capacity();

        for i in 0..capacity {
            mac.submit(PEER, packet(i as u8)).unwrap();
        }

        // Start transmission, taking the head packet
        mac.tick().unwrap();
        assert_eq!(mac.tx_state(), TxState::WaitWrSent);
        assert_eq!(mac.neighbour(&PEER).unwrap().queue().len(), capacity - 1);

        assert!(matches!(mac.submit(PEER, packet(0xbb)), Err(CoreError::QueueFull(_))));
    }

    #[test]
    fn neighbour_table_full() {
        let (mut mac, _driver, _timer) = setup(test_config());

        for i in 0..MAX_NEIGHBOURS {
            mac.submit(LinkAddr::short(0x10 + i as u16), packet(1)).unwrap();
        }

        let p = packet(2);
        assert_eq!(mac.submit(LinkAddr::short(0x100), p.clone()), Err(CoreError::NeighbourTableFull(p)));

        // Broadcast has a dedicated queue
        mac.submit(LinkAddr::BROADCAST, packet(3)).unwrap();
    }

    #[test]
    fn neighbour_eviction() {
        let (mut mac, _driver, _timer) = setup(test_config());

        mac.submit(PEER, packet(1)).unwrap();
        mac.submit(PEER, packet(2)).unwrap();
        mac.submit(PEER2, packet(3)).unwrap();

        assert_eq!(mac.remove_neighbour(&PEER), Some(2));
        assert_eq!(mac.poll_report(), Some(TxReport{ dest: PEER, result: TxResult::Failed(TxFailure::Evicted) }));
        assert_eq!(mac.poll_report(), Some(TxReport{ dest: PEER, result: TxResult::Failed(TxFailure::Evicted) }));
        assert_eq!(mac.poll_report(), None);

        assert_eq!(mac.collect_neighbours(), 0);
        assert!(mac.neighbour(&PEER2).is_some());
    }

    #[test]
    fn reset_requeues_in_flight() {
        let (mut mac, _driver, _timer) = started(test_config());

        mac.submit(PEER, packet(1)).unwrap();
        mac.tick().unwrap();
        mac.tick().unwrap();
        assert_eq!(mac.tx_state(), TxState::WaitForWa);
        assert_eq!(mac.neighbour(&PEER).unwrap().queue().len(), 0);

        mac.reset();

        assert_eq!(mac.state(), LinkState::Stopped);
        assert_eq!(mac.tx_state(), TxState::Stopped);
        assert_eq!(mac.neighbour(&PEER).unwrap().queue().len(), 1);
        assert_eq!(mac.context().timeouts.next_deadline(), None);
        assert_eq!(mac.stats().resets, 1);

        // Restart picks the packet up again
        mac.start().unwrap();
        mac.tick().unwrap();
        assert_eq!(mac.tx_state(), TxState::WaitWrSent);
    }

    #[test]
    fn invalid_config_rejected() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let config = Config{ wakeup_interval_us: 0, ..test_config() };
        let r = Lwmac::new(OWN, config, MockDriver::new(), MockTimer::new(), StepRng::new(0, 0));
        assert!(matches!(r, Err(CoreError::InvalidConfig)));
    }

    #[test]
    fn driver_error_resets() {
        let (mut mac, mut driver, _timer) = started(test_config());

        driver.set_fail_send(true);
        mac.submit(PEER, packet(1)).unwrap();

        assert_eq!(mac.tick(), Err(CoreError::Radio(MockDriverError)));
        assert_eq!(mac.state(), LinkState::Stopped);
        assert_eq!(mac.stats().resets, 1);
        assert_eq!(mac.neighbour(&PEER).unwrap().queue().len(), 1);
    }

    #[test]
    fn event_queue_overflow() {
        let (mut mac, _driver, _timer) = setup(test_config());

        for _ in 0..EVENT_QUEUE_LEN {
            mac.post(Event::RxStarted).unwrap();
        }
        assert_eq!(mac.post(Event::RxStarted), Err(CoreError::EventQueueFull));
        assert_eq!(mac.stats().event_overflow, 1);

        // Overflow is not fatal
        mac.tick().unwrap();
        mac.start().unwrap();
        mac.tick().unwrap();
        assert_eq!(mac.state(), LinkState::Listening);
    }

    #[test]
    fn stale_timeout_discarded() {
        let (mut mac, _driver, mut timer) = started(test_config());

        // Expiry is posted then superseded before delivery
        timer.set_us(10_000);
        let (kind, generation) = mac.ctx.timeouts.poll(10_000).unwrap();
        assert_eq!(kind, TimeoutKind::WakeupPeriod);
        mac.post(Event::Timeout{ kind, generation }).unwrap();
        mac.ctx.timeouts.set(kind, 10_000, 5_000).unwrap();

        mac.tick().unwrap();
        assert!(mac.ctx.timeouts.is_running(TimeoutKind::WakeupPeriod));
        assert_eq!(mac.state(), LinkState::Listening);
    }

    #[test]
    fn decode_errors_counted() {
        let (mut mac, mut driver, _timer) = started(test_config());

        driver.push_frame(&[0x7f, 0x00, 0x01]);
        mac.tick().unwrap();

        assert_eq!(mac.stats().decode_errors, 1);
        assert_eq!(mac.state(), LinkState::Listening);
    }

    #[test]
    fn mac_trait() {
        let (mut mac, _driver, _timer) = started(test_config());

        assert!(!Mac::busy(&mut mac).unwrap());

        Mac::transmit(&mut mac, PEER, packet(1)).unwrap();
        Mac::tick(&mut mac).unwrap();

        assert!(Mac::busy(&mut mac).unwrap());
        assert_eq!(Mac::receive(&mut mac).unwrap(), None);
    }

    #[test]
    fn rx_started_ignored_while_stopped() {
        let (mut mac, mut driver, _timer) = setup(test_config());

        driver.push_event(crate::mac::DriverEvent::RxStarted);
        mac.tick().unwrap();
        assert!(!mac.context().rx_started());
    }
}
