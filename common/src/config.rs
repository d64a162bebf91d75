use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Hard ceiling on one continuous heating run.
    pub heating_operation_ms: u64,
    /// Rest period after the ceiling trips; heating may not restart inside it.
    pub heating_cooldown_ms: u64,
    pub temp_hysteresis_c: f32,
    pub humidity_hysteresis_pct: f32,
    pub state_publish_interval_ms: u64,
    pub write_suppression_ms: u64,
    pub led_full_intensity: u8,
    pub led_ramp_step: u8,
    pub led_ramp_step_delay_ms: u64,
    pub sensor_poll_interval_ms: u64,
    pub sensor_retry_interval_ms: u64,
    pub control_interval_ms: u64,
    pub remote_sync_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub telemetry_backlog_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heating_operation_ms: 10_000,
            heating_cooldown_ms: 10_000,
            temp_hysteresis_c: 0.5,
            humidity_hysteresis_pct: 2.0,
            state_publish_interval_ms: 5_000,
            write_suppression_ms: 10_000,
            led_full_intensity: 255,
            led_ramp_step: 5,
            led_ramp_step_delay_ms: 10,
            sensor_poll_interval_ms: 2_000,
            sensor_retry_interval_ms: 30_000,
            control_interval_ms: 5_000,
            remote_sync_interval_ms: 5_000,
            telemetry_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            telemetry_backlog_capacity: 50,
        }
    }
}

/// Target bands and gas ceilings the automatic engine regulates against.
///
/// Values arrive from the backend or factory defaults and are trusted as-is;
/// unsigned ceilings keep negative thresholds unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoints {
    #[serde(rename = "lux")]
    pub lux: u32,
    #[serde(rename = "tMin")]
    pub temp_min_c: f32,
    #[serde(rename = "tMax")]
    pub temp_max_c: f32,
    #[serde(rename = "uMin")]
    pub humidity_min_pct: f32,
    #[serde(rename = "uMax")]
    pub humidity_max_pct: f32,
    #[serde(rename = "coSp")]
    pub co: u32,
    #[serde(rename = "co2Sp")]
    pub co2_ppm: u32,
    #[serde(rename = "tvocsSp")]
    pub tvocs_ppb: u32,
}

impl Default for Setpoints {
    fn default() -> Self {
        Self {
            lux: 5_000,
            temp_min_c: 20.0,
            temp_max_c: 30.0,
            humidity_min_pct: 60.0,
            humidity_max_pct: 80.0,
            co: 400,
            co2_ppm: 400,
            tvocs_ppb: 100,
        }
    }
}

impl Setpoints {
    /// Whether both bands are ordered min < max.
    pub fn bands_ordered(&self) -> bool {
        self.temp_min_c < self.temp_max_c && self.humidity_min_pct < self.humidity_max_pct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: "greenhouse-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn setpoints_use_backend_key_names() {
        let json = r#"{"lux":1200,"tMin":18.5,"tMax":27.0,"uMin":55.0,"uMax":85.0,"coSp":300,"co2Sp":900,"tvocsSp":150}"#;
        let parsed: Setpoints = serde_json::from_str(json).unwrap();

        assert_eq!(
            parsed,
            Setpoints {
                lux: 1_200,
                temp_min_c: 18.5,
                temp_max_c: 27.0,
                humidity_min_pct: 55.0,
                humidity_max_pct: 85.0,
                co: 300,
                co2_ppm: 900,
                tvocs_ppb: 150,
            }
        );
    }

    #[test]
    fn negative_ceiling_is_rejected_at_decode() {
        let json = r#"{"lux":1200,"tMin":18.5,"tMax":27.0,"uMin":55.0,"uMax":85.0,"coSp":-1,"co2Sp":900,"tvocsSp":150}"#;
        assert!(serde_json::from_str::<Setpoints>(json).is_err());
    }

    #[test]
    fn partial_runtime_config_fills_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"control":{"write_suppression_ms":2000}}"#).unwrap();

        assert_eq!(runtime.control.write_suppression_ms, 2_000);
        assert_eq!(runtime.control.heating_operation_ms, 10_000);
        assert_eq!(runtime.network.mqtt_port, 1883);
    }

    #[test]
    fn factory_defaults_are_ordered() {
        assert!(Setpoints::default().bands_ordered());
    }
}
