//! LWMAC two-node simulation
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use rand::{Rng, SeedableRng, rngs::StdRng};
use structopt::StructOpt;
use humantime::Duration;

use heapless::spsc::Queue;

use lwmac::prelude::*;

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "5s")]
    /// Simulated run time
    pub duration: Duration,

    #[structopt(long, default_value = "1s")]
    /// Interval between packets from node 1 to node 2
    pub period: Duration,

    #[structopt(long, default_value = "200ms")]
    /// Duty-cycle wake-up interval
    pub wakeup_interval: Duration,

    #[structopt(long, default_value = "500us")]
    /// Simulation time step
    pub step: Duration,

    #[structopt(long, default_value = "0.0")]
    /// Probability of a frame being lost in the medium
    pub loss: f64,

    #[structopt(long)]
    /// Send broadcasts rather than unicast packets
    pub broadcast: bool,

    #[structopt(long, default_value = "1")]
    /// Seed for the medium and MAC random sources
    pub seed: u64,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

/// Simulated time source shared by all nodes
#[derive(Clone, Debug, Default)]
pub struct SimTimer(Arc<Mutex<u64>>);

impl SimTimer {
    fn advance(&self, us: u64) -> u64 {
        let mut t = self.0.lock().unwrap();
        *t += us;
        *t
    }
}

impl MacTimer for SimTimer {
    fn ticks_us(&self) -> u64 {
        *self.0.lock().unwrap()
    }
}

#[derive(Debug)]
pub struct SimError;

/// Shared radio medium, frames reach every other node with its receiver on
struct Medium {
    rx_on: Vec<bool>,
    inbox: Vec<VecDeque<DriverEvent>>,
    loss: f64,
    rng: StdRng,
}

struct SimDriver {
    id: usize,
    medium: Rc<RefCell<Medium>>,
}

impl Driver for SimDriver {
    type Error = SimError;

    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let mut m = self.medium.borrow_mut();

        for i in 0..m.inbox.len() {
            if i == self.id || !m.rx_on[i] {
                continue;
            }

            let loss = m.loss;
            if m.rng.gen_bool(loss) {
                debug!("Frame from node {} lost before node {}", self.id, i);
                continue;
            }

            m.inbox[i].push_back(DriverEvent::Received(RawPacket::new(data, -50)));
        }

        m.inbox[self.id].push_back(DriverEvent::TxDone(TxFeedback::Success));

        Ok(())
    }

    fn set_rx_mode(&mut self, on: bool) -> Result<(), Self::Error> {
        self.medium.borrow_mut().rx_on[self.id] = on;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<DriverEvent>, Self::Error> {
        Ok(self.medium.borrow_mut().inbox[self.id].pop_front())
    }
}

type Node = Lwmac<SimDriver, SimTimer, StdRng>;

fn main() -> anyhow::Result<()> {
    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    info!("Starting lwmac-sim");

    let timer = SimTimer::default();
    let medium = Rc::new(RefCell::new(Medium {
        rx_on: vec![false; 2],
        inbox: vec![VecDeque::new(), VecDeque::new()],
        loss: opts.loss.clamp(0.0, 1.0),
        rng: StdRng::seed_from_u64(opts.seed),
    }));

    let config = LwmacConfig {
        wakeup_interval_us: opts.wakeup_interval.as_micros() as u32,
        ..Default::default()
    };

    let addrs = [LinkAddr::short(0x0001), LinkAddr::short(0x0002)];

    let mut nodes = Vec::<Node>::new();
    for (i, a) in addrs.iter().enumerate() {
        let driver = SimDriver{ id: i, medium: medium.clone() };
        let rng = StdRng::seed_from_u64(opts.seed.wrapping_add(i as u64 + 1));
        let mac = Lwmac::new(*a, config.clone(), driver, timer.clone(), rng)
            .map_err(|e| anyhow::anyhow!("Setup error: {:?}", e))?;
        nodes.push(mac);
    }

    // Stagger start-up so the nodes wake at different phases
    nodes[0].start().map_err(|e| anyhow::anyhow!("Start error: {:?}", e))?;

    // Requests reach node 1 through its cross-context queue
    let mut requests: RequestQueue<8> = Queue::new();
    let (producer, mut consumer) = requests.split();
    let mut submitter = Submitter::new(producer);

    let dest = if opts.broadcast { LinkAddr::BROADCAST } else { addrs[1] };
    let step = opts.step.as_micros() as u64;
    let end = opts.duration.as_micros() as u64;
    let period = opts.period.as_micros() as u64;
    let second_start = config.wakeup_interval_us as u64 / 3;

    let mut next_tx = period;
    let mut seq = 0u8;
    let mut now = 0;

    while now < end {
        now = timer.advance(step);

        if now >= second_start && nodes[1].state() == LinkState::Stopped {
            nodes[1].start().map_err(|e| anyhow::anyhow!("Start error: {:?}", e))?;
        }

        if now >= next_tx {
            let p = Packet::from_slice(&[seq; 16]).ok_or_else(|| anyhow::anyhow!("Invalid payload"))?;
            if let Err(r) = submitter.submit(dest, p) {
                warn!("Request queue full, dropping packet for {:?}", r.dest);
            }
            seq = seq.wrapping_add(1);
            next_tx += period;
        }

        nodes[0].drain_requests(&mut consumer);

        for (i, n) in nodes.iter_mut().enumerate() {
            if let Err(e) = n.tick() {
                warn!("Node {} tick error: {:?}", i + 1, e);
            }

            while let Some((src, p)) = n.receive() {
                info!("Node {} received {} bytes from {:?} at {} ms", i + 1, p.len(), src, now / 1000);
            }

            while let Some(r) = n.poll_report() {
                info!("Node {} report {:?} at {} ms", i + 1, r, now / 1000);
            }
        }
    }

    for (i, n) in nodes.iter().enumerate() {
        info!("Node {} stats: {:?}", i + 1, n.stats());
        if let Some(nb) = n.neighbour(&addrs[(i + 1) % 2]) {
            info!("Node {} neighbour: {:?}", i + 1, nb);
        }
    }

    Ok(())
}
