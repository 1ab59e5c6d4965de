//! MAC Timer API
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use crate::Ts;

/// Monotonic time source for duty-cycle scheduling and handshake timeouts.
///
/// Wake-up phases are tracked in microseconds so implementations should
/// provide at least millisecond resolution.
pub trait Timer {
    /// Returns the number of microsecond ticks since some unknown epoc
    fn ticks_us(&self) -> Ts;

    /// Returns the number of millisecond ticks since the same epoc
    fn ticks_ms(&self) -> Ts {
        self.ticks_us() / 1000
    }
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    use crate::Ts;

    /// Manually driven timer for tests, clones share the same time
    #[derive(Clone, Debug, Default)]
    pub struct MockTimer (Arc<Mutex<Ts>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_us(&mut self, val: Ts) {
            *self.0.lock().unwrap() = val;
        }

        pub fn advance_us(&mut self, val: Ts) {
            *self.0.lock().unwrap() += val;
        }

        pub fn val(&self) -> Ts {
            *self.0.lock().unwrap()
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_us(&self) -> Ts {
            self.val()
        }
    }
}
