//! Serialized MAC events

use crate::{RawPacket, Ts};
use crate::mac::{DriverEvent, TxFeedback};

use super::timeout::TimeoutKind;

/// Duty-cycle timer events
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RttEvent {
    Start,
    Stop,
    Pause,
    Resume,
    /// Periodic wake-up boundary reached
    WakeupPending,
    /// End of the nominal listen window
    SleepPending,
}

/// Events handled by the MAC task, strictly in arrival order
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    Rtt(RttEvent),
    /// Timeout expiry, stale if `generation` no longer matches the slot
    Timeout{ kind: TimeoutKind, generation: u16 },
    TxDone(TxFeedback),
    RxStarted,
    Received(RawPacket),
}

impl From<DriverEvent> for Event {
    fn from(e: DriverEvent) -> Self {
        match e {
            DriverEvent::TxDone(fb) => Event::TxDone(fb),
            DriverEvent::RxStarted => Event::RxStarted,
            DriverEvent::Received(p) => Event::Received(p),
        }
    }
}

/// One-shot duty-cycle alarm
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RttAlarm {
    alarm: Option<(Ts, RttEvent)>,
    fired_at: Ts,
}

impl RttAlarm {
    /// Arm the alarm, replacing any pending alarm
    pub fn set(&mut self, at: Ts, ev: RttEvent) {
        self.alarm = Some((at, ev));
    }

    pub fn cancel(&mut self) {
        self.alarm = None;
    }

    pub fn pending(&self) -> Option<(Ts, RttEvent)> {
        self.alarm
    }

    /// Take the alarm event if due
    pub fn poll(&mut self, now: Ts) -> Option<RttEvent> {
        match self.alarm {
            Some((at, ev)) if at <= now => {
                self.alarm = None;
                self.fired_at = at;
                Some(ev)
            },
            _ => None,
        }
    }

    /// Scheduled time of the most recently fired alarm
    pub fn fired_at(&self) -> Ts {
        self.fired_at
    }
}
