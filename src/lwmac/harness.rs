//! Shared fixtures for LWMAC state machine tests

use std::vec::Vec;

use rand::rngs::mock::StepRng;

use crate::mac::LinkAddr;
use crate::mac::mock::MockDriver;
use crate::packet::Packet;
use crate::timer::mock::MockTimer;

use super::{Lwmac, Config};
use super::frame::{self, Frame, Header};
use super::neighbour::Phase;

pub type TestMac = Lwmac<MockDriver, MockTimer, StepRng>;

pub const OWN: LinkAddr = LinkAddr::Short(ieee802154::mac::ShortAddress(0x0001));
pub const PEER: LinkAddr = LinkAddr::Short(ieee802154::mac::ShortAddress(0x0002));
pub const PEER2: LinkAddr = LinkAddr::Short(ieee802154::mac::ShortAddress(0x0003));

/// Bound on ticks while draining driver events
const MAX_SETTLE: usize = 32;

/// Compact timing so tests run in a 100ms cycle
pub fn test_config() -> Config {
    Config {
        wakeup_interval_us: 100_000,
        wakeup_duration_us: 10_000,
        time_between_wr_us: 2_000,
        max_wr_count: 5,
        no_response_us: 130_000,
        wa_sent_us: 2_000,
        data_delay_us: 5_000,
        broadcast_duration_us: 0,
        time_between_broadcast_us: 2_000,
        wr_preparation_us: 1_000,
        max_tx_attempts: 3,
        max_rx_extensions: 3,
        max_protocol_violations: 3,
        queue_capacity: 4,
        min_phase_gap_us: 0,
    }
}

pub fn setup(config: Config) -> (TestMac, MockDriver, MockTimer) {
    let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

    let driver = MockDriver::new();
    let timer = MockTimer::new();

    let mac = Lwmac::new(OWN, config, driver.clone(), timer.clone(), StepRng::new(0, 0)).unwrap();

    (mac, driver, timer)
}

/// Setup a MAC started (and listening) at t=0
pub fn started(config: Config) -> (TestMac, MockDriver, MockTimer) {
    let (mut mac, driver, timer) = setup(config);

    mac.start().unwrap();
    mac.tick().unwrap();

    (mac, driver, timer)
}

pub fn packet(v: u8) -> Packet {
    Packet::from_slice(&[v]).unwrap()
}

pub fn frame_bytes(header: Header, payload: &[u8]) -> Vec<u8> {
    let mut buff = [0u8; 256];
    let n = frame::encode_with(&header, payload, &mut buff).unwrap();
    buff[..n].to_vec()
}

/// Take and decode frames sent via the mock driver
pub fn decode_sent(driver: &mut MockDriver) -> Vec<Frame> {
    driver.take_sent().iter().map(|d| Frame::decode(d).unwrap()).collect()
}

pub fn set_phase(mac: &mut TestMac, addr: LinkAddr, phase: Phase) {
    let id = mac.ctx.tx.neighbours.find_or_insert(addr).unwrap();
    mac.ctx.tx.neighbours.get_mut(id).unwrap().phase = phase;
}

/// Tick until no driver events remain at the current time
pub fn settle(mac: &mut TestMac, driver: &MockDriver) {
    for _ in 0..MAX_SETTLE {
        if !driver.has_events() {
            return;
        }
        mac.tick().unwrap();
    }
    panic!("driver events did not settle");
}

/// Step time through each MAC deadline up to and including `until`
pub fn advance(mac: &mut TestMac, driver: &MockDriver, timer: &mut MockTimer, until: u64) {
    settle(mac, driver);

    loop {
        match mac.next_deadline() {
            Some(d) if d <= until => {
                timer.set_us(d.max(timer.val()));
                mac.tick().unwrap();
                settle(mac, driver);
            },
            _ => {
                timer.set_us(until);
                mac.tick().unwrap();
                settle(mac, driver);
                return;
            }
        }
    }
}
