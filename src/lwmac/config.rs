
use super::timeout::MAX_TIMEOUT_US;

/// Maximum number of unicast neighbours tracked
pub const MAX_NEIGHBOURS: usize = 8;

/// Per-neighbour packet queue storage
pub const QUEUE_LEN: usize = 8;

/// Frames buffered for the RX sub-machine (including those arriving mid-handshake)
pub const RX_QUEUE_LEN: usize = 4;

/// Received packets awaiting collection by the upper layer
pub const DISPATCH_LEN: usize = 8;

/// Serialized MAC event queue length
pub const EVENT_QUEUE_LEN: usize = 16;

/// Transmission outcome reports awaiting collection by the upper layer
pub const REPORT_LEN: usize = 8;

/// Broadcast duplicate filter entries
pub const DUP_FILTER_LEN: usize = 4;

/// LWMAC configuration, all durations are in microseconds
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Duty-cycle period between wake-ups
    pub wakeup_interval_us: u32,

    /// Listen window following each wake-up
    pub wakeup_duration_us: u32,

    /// Interval between Wake-Request retransmissions
    pub time_between_wr_us: u32,

    /// Maximum number of Wake-Requests per transmission attempt
    pub max_wr_count: u16,

    /// Overall window for a Wake-Ack before the attempt fails
    pub no_response_us: u32,

    /// Guard for Wake-Ack transmission completion
    pub wa_sent_us: u32,

    /// Data (or data feedback) timeout following a WA exchange
    pub data_delay_us: u32,

    /// Window over which a broadcast is repeated, 0 for single shot
    pub broadcast_duration_us: u32,

    /// Interval between broadcast repetitions
    pub time_between_broadcast_us: u32,

    /// Lead time to start Wake-Requests ahead of a neighbour's phase
    pub wr_preparation_us: u32,

    /// Transmission attempts per frame before it is dropped
    pub max_tx_attempts: u8,

    /// Maximum WA retransmissions per reception
    pub max_rx_extensions: u8,

    /// Unexpected frames tolerated per handshake
    pub max_protocol_violations: u8,

    /// Per-neighbour queue capacity (bounded by [`QUEUE_LEN`])
    pub queue_capacity: usize,

    /// Minimum gap between our own phase and a neighbour's before
    /// a phase backoff is applied, 0 to disable
    pub min_phase_gap_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        let wakeup_interval_us = 200_000;
        let time_between_wr_us = 5_000;

        Self {
            wakeup_interval_us,
            wakeup_duration_us: time_between_wr_us * 15 / 10,
            time_between_wr_us,
            max_wr_count: (wakeup_interval_us * 13 / 10 / time_between_wr_us) as u16,
            no_response_us: wakeup_interval_us * 13 / 10,
            wa_sent_us: time_between_wr_us,
            data_delay_us: 10_000,
            broadcast_duration_us: wakeup_interval_us * 11 / 10,
            time_between_broadcast_us: time_between_wr_us,
            wr_preparation_us: 3_000,
            max_tx_attempts: 3,
            max_rx_extensions: 3,
            max_protocol_violations: 3,
            queue_capacity: QUEUE_LEN,
            min_phase_gap_us: 10_000,
        }
    }
}

impl Config {
    /// Check the configuration can be scheduled, the wake-up interval must be
    /// non-zero and longer than the listen window, and every duration must
    /// fit the timeout range
    pub fn is_valid(&self) -> bool {
        let durations = [
            self.wakeup_interval_us,
            self.wakeup_duration_us,
            self.time_between_wr_us,
            self.no_response_us,
            self.wa_sent_us,
            self.data_delay_us,
            self.broadcast_duration_us,
            self.time_between_broadcast_us,
        ];

        self.wakeup_interval_us > 0
            && self.wakeup_duration_us < self.wakeup_interval_us
            && durations.iter().all(|d| *d <= MAX_TIMEOUT_US)
    }

    /// Effective per-neighbour queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.min(QUEUE_LEN)
    }

    /// Time until a neighbour at `phase` next wakes, given our current phase
    pub fn time_until_phase(&self, phase: u32, phase_now: u32) -> u32 {
        let i = self.wakeup_interval_us;
        ((phase % i) + i - (phase_now % i)) % i
    }

    /// Check whether a neighbour at `phase` is reachable now, either inside
    /// its listen window or due within the WR preparation lead
    pub fn phase_imminent(&self, phase: u32, phase_now: u32) -> bool {
        let until = self.time_until_phase(phase, phase_now);
        let since = (self.wakeup_interval_us - until) % self.wakeup_interval_us;

        until <= self.wr_preparation_us || since < self.wakeup_duration_us
    }

    /// Check whether a learned phase collides with our own wake-up
    pub fn phase_collides(&self, phase: u32) -> bool {
        let gap = self.min_phase_gap_us;
        gap > 0 && (phase < gap || phase > self.wakeup_interval_us.saturating_sub(gap))
    }

    /// Lifetime of broadcast duplicate filter entries
    pub fn dup_lifetime_us(&self) -> u32 {
        self.broadcast_duration_us + self.wakeup_interval_us
    }
}
