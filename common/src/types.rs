use serde::{Deserialize, Serialize};

/// One polling cycle's worth of environmental readings.
///
/// Produced by the sensor collaborator and consumed by a single control cycle.
/// `water_low` is `true` when the reservoir is LOW, which is the unsafe state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub light: u32,
    pub co: u32,
    pub co2_ppm: u32,
    pub tvocs_ppb: u32,
    pub water_low: bool,
}

impl Default for SensorSnapshot {
    fn default() -> Self {
        Self {
            temperature_c: 0.0,
            humidity_pct: 0.0,
            light: 0,
            co: 0,
            co2_ppm: 0,
            tvocs_ppb: 0,
            water_low: false,
        }
    }
}

/// Operator-requested actuator levels pulled from the backend while in debug mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualActuatorStates {
    #[serde(rename = "rele1", default)]
    pub relay1: bool,
    #[serde(rename = "rele2", default)]
    pub relay2: bool,
    #[serde(rename = "rele3", default)]
    pub relay3: bool,
    #[serde(rename = "rele4", default)]
    pub relay4: bool,
    #[serde(rename = "ledsOn", default)]
    pub leds_on: bool,
    #[serde(rename = "ledsIntensity", default)]
    pub leds_intensity: u8,
    #[serde(rename = "humidifierOn", default)]
    pub humidifier_on: bool,
}

/// The logical fields published to the backend for every actuator state push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorReport {
    pub relay1: bool,
    pub relay2: bool,
    pub relay3: bool,
    pub relay4: bool,
    #[serde(rename = "ledsOn")]
    pub leds_on: bool,
    #[serde(rename = "ledsWatts")]
    pub leds_watts: u8,
    #[serde(rename = "humidifierOn")]
    pub humidifier_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
    #[serde(flatten)]
    pub snapshot: SensorSnapshot,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "recordedAt", skip_serializing_if = "Option::is_none", default)]
    pub recorded_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "debugMode")]
    pub debug_mode: bool,
    #[serde(rename = "backlog")]
    pub backlog_len: usize,
}
