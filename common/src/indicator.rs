use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub const LED_FAST_BLINK_MS: u64 = 200;
pub const LED_SLOW_BLINK_MS: u64 = 900;

/// Connectivity flags shared with the status indicator task.
///
/// Written by the network and MQTT tasks, read by the blinker. Nothing here
/// touches actuator state.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityFlags {
    network_up: Arc<AtomicBool>,
    remote_ready: Arc<AtomicBool>,
}

impl ConnectivityFlags {
    pub fn network_up(&self) -> bool {
        self.network_up.load(Ordering::Relaxed)
    }

    pub fn remote_ready(&self) -> bool {
        self.remote_ready.load(Ordering::Relaxed)
    }

    pub fn set_network_up(&self, up: bool) {
        self.network_up.store(up, Ordering::Relaxed);
    }

    pub fn set_remote_ready(&self, ready: bool) {
        self.remote_ready.store(ready, Ordering::Relaxed);
    }

    pub fn pattern(&self) -> IndicatorPattern {
        IndicatorPattern::for_flags(self.network_up(), self.remote_ready())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorPattern {
    /// Network down.
    FastBlink,
    /// Network up, backend not ready.
    SlowBlink,
    Solid,
}

impl IndicatorPattern {
    pub fn for_flags(network_up: bool, remote_ready: bool) -> Self {
        match (network_up, remote_ready) {
            (false, _) => Self::FastBlink,
            (true, false) => Self::SlowBlink,
            (true, true) => Self::Solid,
        }
    }

    pub fn is_lit(self, now_ms: u64) -> bool {
        match self {
            Self::FastBlink => (now_ms / LED_FAST_BLINK_MS) % 2 == 0,
            Self::SlowBlink => (now_ms / LED_SLOW_BLINK_MS) % 2 == 0,
            Self::Solid => true,
        }
    }
}
