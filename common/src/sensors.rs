use log::{info, warn};

use crate::types::SensorSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorChannel {
    /// Temperature/humidity probe.
    Climate,
    /// CO2 and TVOC air quality sensor.
    Gas,
}

impl SensorChannel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Climate => "climate",
            Self::Gas => "gas",
        }
    }
}

/// Outcome of one read attempt on a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample<T> {
    /// Not polled this round.
    Skipped,
    Failed,
    Value(T),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasReading {
    pub co2_ppm: u32,
    pub tvocs_ppb: u32,
}

/// Raw result of one sensor polling round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub climate: Sample<ClimateReading>,
    pub gas: Sample<GasReading>,
    /// Analog CO level, read every round. `None` holds the last value.
    pub co: Option<u32>,
    pub light: u32,
    pub water_low: bool,
}

#[derive(Debug, Clone, Copy)]
struct ChannelHealth {
    healthy: bool,
    last_attempt_ms: Option<u64>,
    failures: u32,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_attempt_ms: None,
            failures: 0,
        }
    }
}

/// Folds raw polling rounds into the snapshot the control engine consumes.
///
/// A failed channel keeps its last good values and is only retried every
/// `retry_interval_ms` until one read succeeds again.
#[derive(Debug, Clone)]
pub struct SensorHub {
    retry_interval_ms: u64,
    snapshot: SensorSnapshot,
    climate: ChannelHealth,
    gas: ChannelHealth,
    primed: bool,
}

impl SensorHub {
    pub fn new(retry_interval_ms: u64) -> Self {
        Self {
            retry_interval_ms,
            snapshot: SensorSnapshot::default(),
            climate: ChannelHealth::default(),
            gas: ChannelHealth::default(),
            primed: false,
        }
    }

    /// Healthy channels are polled every round; unhealthy ones back off.
    pub fn poll_due(&self, channel: SensorChannel, now_ms: u64) -> bool {
        let health = self.health(channel);
        if health.healthy {
            return true;
        }
        health
            .last_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.retry_interval_ms)
            .unwrap_or(true)
    }

    pub fn is_healthy(&self, channel: SensorChannel) -> bool {
        self.health(channel).healthy
    }

    /// True once the climate probe has produced at least one good reading.
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot
    }

    pub fn ingest(&mut self, reading: SensorReading, now_ms: u64) {
        self.snapshot.light = reading.light;
        self.snapshot.water_low = reading.water_low;
        if let Some(co) = reading.co {
            self.snapshot.co = co;
        }

        match reading.climate {
            Sample::Skipped => {}
            Sample::Value(climate)
                if climate.temperature_c.is_finite() && climate.humidity_pct.is_finite() =>
            {
                self.snapshot.temperature_c = climate.temperature_c;
                self.snapshot.humidity_pct = climate.humidity_pct;
                self.primed = true;
                self.record_success(SensorChannel::Climate, now_ms);
            }
            Sample::Value(_) | Sample::Failed => {
                self.record_failure(SensorChannel::Climate, now_ms);
            }
        }

        match reading.gas {
            Sample::Skipped => {}
            Sample::Value(gas) => {
                self.snapshot.co2_ppm = gas.co2_ppm;
                self.snapshot.tvocs_ppb = gas.tvocs_ppb;
                self.record_success(SensorChannel::Gas, now_ms);
            }
            Sample::Failed => self.record_failure(SensorChannel::Gas, now_ms),
        }
    }

    fn health(&self, channel: SensorChannel) -> &ChannelHealth {
        match channel {
            SensorChannel::Climate => &self.climate,
            SensorChannel::Gas => &self.gas,
        }
    }

    fn health_mut(&mut self, channel: SensorChannel) -> &mut ChannelHealth {
        match channel {
            SensorChannel::Climate => &mut self.climate,
            SensorChannel::Gas => &mut self.gas,
        }
    }

    fn record_success(&mut self, channel: SensorChannel, now_ms: u64) {
        let health = self.health_mut(channel);
        if !health.healthy {
            info!(
                "{} sensor recovered after {} failed reads",
                channel.as_str(),
                health.failures
            );
        }
        *health = ChannelHealth {
            healthy: true,
            last_attempt_ms: Some(now_ms),
            failures: 0,
        };
    }

    fn record_failure(&mut self, channel: SensorChannel, now_ms: u64) {
        let retry_interval_ms = self.retry_interval_ms;
        let health = self.health_mut(channel);
        if health.healthy {
            warn!(
                "{} sensor read failed, holding last values and retrying every {retry_interval_ms} ms",
                channel.as_str()
            );
        }
        health.healthy = false;
        health.last_attempt_ms = Some(now_ms);
        health.failures = health.failures.saturating_add(1);
    }
}
