//! LWMAC timeout manager
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::Ts;

/// Longest offset that may be scheduled
pub const MAX_TIMEOUT_US: u32 = u32::MAX / 2;

/// Named timeouts, one slot of each kind per link
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumCount, EnumIter, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeoutKind {
    /// Wake-Request retransmission
    WakeRequest,
    /// No Wake-Ack within the WR burst window
    NoResponse,
    /// Wake-Ack transmission completion
    WakeAck,
    /// Data (or data feedback)
    Data,
    /// Predicted destination wake-up
    WaitForDestWakeup,
    /// Listen window following a wake-up
    WakeupPeriod,
    /// Next broadcast repetition
    NextBroadcast,
    /// End of the broadcast window
    BroadcastEnd,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeoutState {
    Idle,
    /// Armed with a deadline
    Armed(Ts),
    /// Expiry posted to the event queue, not yet delivered
    Fired,
    /// Expiry delivered
    Expired,
}

/// Timeout scheduling errors
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeoutError {
    /// Offset beyond the schedulable range
    Exhausted,
}

/// A single timeout slot
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout {
    pub state: TimeoutState,
    /// Incremented on every arm and clear, so stale expiries can be detected
    pub generation: u16,
}

impl Default for Timeout {
    fn default() -> Self {
        Self { state: TimeoutState::Idle, generation: 0 }
    }
}

/// Timeout manager, a fixed array of slots indexed by [`TimeoutKind`]
#[derive(Clone, Debug, PartialEq)]
pub struct Timeouts {
    slots: [Timeout; TimeoutKind::COUNT],
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeouts {
    pub fn new() -> Self {
        Self { slots: [Timeout::default(); TimeoutKind::COUNT] }
    }

    pub fn get(&self, kind: TimeoutKind) -> &Timeout {
        &self.slots[kind as usize]
    }

    /// (Re)arm a timeout to fire `offset_us` after `now`, superseding any prior instance
    pub fn set(&mut self, kind: TimeoutKind, now: Ts, offset_us: u32) -> Result<(), TimeoutError> {
        if offset_us > MAX_TIMEOUT_US {
            return Err(TimeoutError::Exhausted);
        }

        let t = &mut self.slots[kind as usize];
        t.generation = t.generation.wrapping_add(1);
        t.state = TimeoutState::Armed(now + offset_us as Ts);

        Ok(())
    }

    /// Cancel a timeout, safe to call in any state
    pub fn clear(&mut self, kind: TimeoutKind) {
        let t = &mut self.slots[kind as usize];
        if t.state != TimeoutState::Idle {
            t.generation = t.generation.wrapping_add(1);
            t.state = TimeoutState::Idle;
        }
    }

    /// Timeout is armed or its expiry has not yet been delivered
    pub fn is_running(&self, kind: TimeoutKind) -> bool {
        matches!(self.get(kind).state, TimeoutState::Armed(_) | TimeoutState::Fired)
    }

    pub fn is_expired(&self, kind: TimeoutKind) -> bool {
        self.get(kind).state == TimeoutState::Expired
    }

    /// Clear every slot
    pub fn reset_all(&mut self) {
        for k in TimeoutKind::iter() {
            self.clear(k);
        }
    }

    /// Fetch the earliest due timeout, marking it fired.
    /// Returns the kind and generation to be posted as an event.
    pub fn poll(&mut self, now: Ts) -> Option<(TimeoutKind, u16)> {
        let mut due: Option<(TimeoutKind, Ts)> = None;

        for k in TimeoutKind::iter() {
            match self.slots[k as usize].state {
                TimeoutState::Armed(d) if d <= now && due.map(|(_, e)| d < e).unwrap_or(true) => {
                    due = Some((k, d));
                },
                _ => (),
            }
        }

        let (k, _) = due?;
        let t = &mut self.slots[k as usize];
        t.state = TimeoutState::Fired;

        Some((k, t.generation))
    }

    /// Deliver a posted expiry, returns false if the event is stale
    pub fn fire(&mut self, kind: TimeoutKind, generation: u16) -> bool {
        let t = &mut self.slots[kind as usize];
        if t.generation != generation || t.state != TimeoutState::Fired {
            return false;
        }
        t.state = TimeoutState::Expired;
        true
    }

    /// Earliest armed deadline, for callers that sleep between ticks
    pub fn next_deadline(&self) -> Option<Ts> {
        self.slots.iter().filter_map(|t| match t.state {
            TimeoutState::Armed(d) => Some(d),
            _ => None,
        }).min()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_poll_fire() {
        let mut t = Timeouts::new();

        t.set(TimeoutKind::Data, 100, 50).unwrap();
        assert!(t.is_running(TimeoutKind::Data));
        assert_eq!(t.next_deadline(), Some(150));

        assert_eq!(t.poll(149), None);
        let (k, g) = t.poll(150).unwrap();
        assert_eq!(k, TimeoutKind::Data);

        // Fired but undelivered still counts as running
        assert!(t.is_running(TimeoutKind::Data));
        assert_eq!(t.poll(200), None);

        assert!(t.fire(k, g));
        assert!(t.is_expired(TimeoutKind::Data));
        assert!(!t.is_running(TimeoutKind::Data));
    }

    #[test]
    fn poll_in_deadline_order() {
        let mut t = Timeouts::new();

        t.set(TimeoutKind::BroadcastEnd, 0, 10).unwrap();
        t.set(TimeoutKind::WakeRequest, 0, 20).unwrap();

        assert_eq!(t.poll(30).map(|(k, _)| k), Some(TimeoutKind::BroadcastEnd));
        assert_eq!(t.poll(30).map(|(k, _)| k), Some(TimeoutKind::WakeRequest));
        assert_eq!(t.poll(30), None);
    }

    #[test]
    fn rearm_supersedes() {
        let mut t = Timeouts::new();

        t.set(TimeoutKind::WakeRequest, 0, 10).unwrap();
        let (k, stale) = t.poll(10).unwrap();

        // Re-arm before the expiry is delivered
        t.set(TimeoutKind::WakeRequest, 10, 10).unwrap();
        assert!(!t.fire(k, stale));
        assert!(!t.is_expired(TimeoutKind::WakeRequest));

        let (k, g) = t.poll(20).unwrap();
        assert_ne!(g, stale);
        assert!(t.fire(k, g));
    }

    #[test]
    fn clear_is_idempotent() {
        let mut t = Timeouts::new();

        t.set(TimeoutKind::NoResponse, 0, 10).unwrap();
        let (k, g) = t.poll(10).unwrap();

        t.clear(TimeoutKind::NoResponse);
        let after_first = t.get(TimeoutKind::NoResponse).clone();

        t.clear(TimeoutKind::NoResponse);
        assert_eq!(t.get(TimeoutKind::NoResponse), &after_first);
        assert_eq!(after_first.state, TimeoutState::Idle);

        // Cancelled expiry is discarded on delivery
        assert!(!t.fire(k, g));

        // Clearing an expired timeout
        t.set(TimeoutKind::Data, 0, 0).unwrap();
        let (k, g) = t.poll(0).unwrap();
        assert!(t.fire(k, g));
        t.clear(TimeoutKind::Data);
        t.clear(TimeoutKind::Data);
        assert!(!t.is_expired(TimeoutKind::Data));
    }

    #[test]
    fn reset_and_range() {
        let mut t = Timeouts::new();

        for k in TimeoutKind::iter() {
            t.set(k, 0, 1000).unwrap();
        }
        t.reset_all();
        for k in TimeoutKind::iter() {
            assert!(!t.is_running(k));
        }
        assert_eq!(t.next_deadline(), None);

        assert_eq!(t.set(TimeoutKind::Data, 0, u32::MAX), Err(TimeoutError::Exhausted));
    }
}
