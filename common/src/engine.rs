use log::{info, warn};

use crate::{
    actuators::{ActuatorCommand, ActuatorState, ThermalMode},
    config::{ControlConfig, Setpoints},
    types::SensorSnapshot,
};

/// Hardware writes decided by one control cycle, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutcome {
    pub commands: Vec<ActuatorCommand>,
    /// Whether any physical output moved. Cooldown bookkeeping alone does not
    /// count.
    pub changed: bool,
}

/// Automatic hysteresis and thermal-safety machine.
///
/// Stateless apart from its configuration; everything it remembers between
/// cycles lives in [`ActuatorState`].
#[derive(Debug, Clone)]
pub struct ControlEngine {
    config: ControlConfig,
}

impl ControlEngine {
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Runs one control cycle. While debug mode is active this returns an empty
    /// outcome and leaves `state` untouched.
    ///
    /// Steps run in a fixed order: heating ceiling, cooldown expiry, thermal
    /// hysteresis, humidifier, lighting, then gas/exhaust.
    pub fn run_cycle(
        &self,
        snapshot: &SensorSnapshot,
        setpoints: &Setpoints,
        state: &mut ActuatorState,
        now_ms: u64,
    ) -> CycleOutcome {
        if state.is_debug_mode() {
            return CycleOutcome::default();
        }

        let mut commands = Vec::new();
        let mut changed = false;

        changed |= self.enforce_heating_ceiling(state, now_ms, &mut commands);
        self.expire_cooldown(state, now_ms);
        changed |= self.regulate_temperature(snapshot, setpoints, state, now_ms, &mut commands);
        changed |= self.regulate_humidity(snapshot, setpoints, state, &mut commands);
        changed |= self.regulate_light(snapshot, setpoints, state, &mut commands);
        changed |= self.regulate_gases(snapshot, setpoints, state, &mut commands);

        CycleOutcome { commands, changed }
    }

    fn enforce_heating_ceiling(
        &self,
        state: &mut ActuatorState,
        now_ms: u64,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        if state.thermal_mode() != ThermalMode::Heating {
            return false;
        }
        let Some(started) = state.thermal_started_ms() else {
            return false;
        };
        if now_ms.saturating_sub(started) < self.config.heating_operation_ms {
            return false;
        }

        warn!(
            "heating ran {} ms, forcing thermal module OFF for {} ms cooldown",
            now_ms.saturating_sub(started),
            self.config.heating_cooldown_ms
        );
        state.start_cooldown(now_ms);
        state.set_thermal_mode(ThermalMode::Off, now_ms, commands)
    }

    fn expire_cooldown(&self, state: &mut ActuatorState, now_ms: u64) {
        if !state.is_in_cooldown() {
            return;
        }
        let elapsed = state
            .cooldown_start_ms()
            .map(|start| now_ms.saturating_sub(start))
            .unwrap_or(u64::MAX);
        if elapsed >= self.config.heating_cooldown_ms {
            state.end_cooldown();
            info!("thermal cooldown finished, heating available again");
        }
    }

    fn regulate_temperature(
        &self,
        snapshot: &SensorSnapshot,
        setpoints: &Setpoints,
        state: &mut ActuatorState,
        now_ms: u64,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        let temp = snapshot.temperature_c;
        let band = self.config.temp_hysteresis_c;
        let mode = state.thermal_mode();

        let next = if temp < setpoints.temp_min_c - band {
            // Heating is the only move out of the cold branch.
            if mode == ThermalMode::Heating || state.is_in_cooldown() {
                return false;
            }
            ThermalMode::Heating
        } else if temp > setpoints.temp_max_c + band {
            ThermalMode::Cooling
        } else {
            ThermalMode::Off
        };

        if !state.set_thermal_mode(next, now_ms, commands) {
            return false;
        }
        info!(
            "temperature {temp:.1}C (band {:.1}-{:.1}), thermal module {}",
            setpoints.temp_min_c,
            setpoints.temp_max_c,
            next.as_str()
        );
        true
    }

    fn regulate_humidity(
        &self,
        snapshot: &SensorSnapshot,
        setpoints: &Setpoints,
        state: &mut ActuatorState,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        if snapshot.water_low {
            let changed = state.set_humidifier(false, commands);
            if changed {
                warn!("water level LOW, humidifier forced OFF");
            }
            return changed;
        }

        let humidity = snapshot.humidity_pct;
        let band = self.config.humidity_hysteresis_pct;
        let wanted = if humidity < setpoints.humidity_min_pct - band {
            true
        } else if humidity > setpoints.humidity_max_pct + band {
            false
        } else {
            return false;
        };

        let changed = state.set_humidifier(wanted, commands);
        if changed {
            info!(
                "humidity {humidity:.1}% (band {:.1}-{:.1}), humidifier {}",
                setpoints.humidity_min_pct,
                setpoints.humidity_max_pct,
                if wanted { "ON" } else { "OFF" }
            );
        }
        changed
    }

    fn regulate_light(
        &self,
        snapshot: &SensorSnapshot,
        setpoints: &Setpoints,
        state: &mut ActuatorState,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        let intensity = if snapshot.light < setpoints.lux {
            self.config.led_full_intensity
        } else {
            0
        };

        let changed = state.set_led_intensity(
            intensity,
            self.config.led_ramp_step,
            self.config.led_ramp_step_delay_ms,
            commands,
        );
        if changed {
            info!(
                "light {} vs target {}, LEDs to {intensity}",
                snapshot.light, setpoints.lux
            );
        }
        changed
    }

    fn regulate_gases(
        &self,
        snapshot: &SensorSnapshot,
        setpoints: &Setpoints,
        state: &mut ActuatorState,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        let exceeded = snapshot.co > setpoints.co
            || snapshot.co2_ppm > setpoints.co2_ppm
            || snapshot.tvocs_ppb > setpoints.tvocs_ppb;

        let changed = state.set_exhaust(exceeded, commands);
        if changed {
            if exceeded {
                warn!(
                    "gas ceiling exceeded (co={} co2={} tvocs={}), exhaust ON",
                    snapshot.co, snapshot.co2_ppm, snapshot.tvocs_ppb
                );
            } else {
                info!("gas levels back under ceilings, exhaust OFF");
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::{DamperPosition, Relay};
    use pretty_assertions::assert_eq;

    fn engine() -> ControlEngine {
        ControlEngine::new(ControlConfig::default())
    }

    /// A reading that sits inside every band and under every ceiling.
    fn calm() -> SensorSnapshot {
        SensorSnapshot {
            temperature_c: 25.0,
            humidity_pct: 70.0,
            light: 10_000,
            co: 100,
            co2_ppm: 300,
            tvocs_ppb: 50,
            water_low: false,
        }
    }

    fn at_temp(temperature_c: f32) -> SensorSnapshot {
        SensorSnapshot {
            temperature_c,
            ..calm()
        }
    }

    #[test]
    fn cold_reading_starts_heating() {
        let engine = engine();
        let mut state = ActuatorState::default();

        let outcome = engine.run_cycle(&at_temp(18.0), &Setpoints::default(), &mut state, 0);

        assert_eq!(state.thermal_mode(), ThermalMode::Heating);
        assert_eq!(state.relay_pair(), (true, true));
        assert!(outcome.changed);
        assert_eq!(
            outcome.commands,
            vec![ActuatorCommand::ThermalRelays {
                relay1: true,
                relay2: true
            }]
        );
    }

    #[test]
    fn calm_cycle_writes_nothing() {
        let engine = engine();
        let mut state = ActuatorState::default();

        let outcome = engine.run_cycle(&calm(), &Setpoints::default(), &mut state, 0);

        assert_eq!(outcome, CycleOutcome::default());
        assert_eq!(state, ActuatorState::default());
    }

    #[test]
    fn readings_inside_band_never_toggle() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();

        for (i, temp) in [19.5, 30.5, 19.6, 30.4, 20.0, 30.0, 19.5]
            .into_iter()
            .enumerate()
        {
            let outcome = engine.run_cycle(&at_temp(temp), &setpoints, &mut state, i as u64 * 5_000);
            assert!(!outcome.changed, "toggled at {temp}");
        }
        assert_eq!(state.thermal_mode(), ThermalMode::Off);
    }

    #[test]
    fn one_transition_per_boundary_crossing() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();
        let mut transitions = 0;

        // cross low, hold, return, hold, cross high, hold
        let temps = [19.4, 19.3, 19.6, 25.0, 30.6, 30.8];
        for (i, temp) in temps.into_iter().enumerate() {
            let outcome = engine.run_cycle(&at_temp(temp), &setpoints, &mut state, i as u64 * 1_000);
            if outcome.changed {
                transitions += 1;
            }
        }

        assert_eq!(transitions, 3);
        assert_eq!(state.thermal_mode(), ThermalMode::Cooling);
    }

    #[test]
    fn heating_ceiling_forces_cooldown() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();
        let cold = at_temp(15.0);

        engine.run_cycle(&cold, &setpoints, &mut state, 1_000);
        engine.run_cycle(&cold, &setpoints, &mut state, 6_000);
        assert_eq!(state.thermal_mode(), ThermalMode::Heating);

        let outcome = engine.run_cycle(&cold, &setpoints, &mut state, 11_001);

        assert_eq!(state.thermal_mode(), ThermalMode::Off);
        assert_eq!(state.relay_pair(), (false, false));
        assert!(state.is_in_cooldown());
        assert_eq!(state.cooldown_start_ms(), Some(11_001));
        assert!(outcome.commands.contains(&ActuatorCommand::ThermalRelays {
            relay1: false,
            relay2: false
        }));
    }

    #[test]
    fn heating_cannot_restart_before_cooldown_ends() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();
        let cold = at_temp(15.0);
        let t0 = 3_000;

        engine.run_cycle(&cold, &setpoints, &mut state, t0);
        engine.run_cycle(&cold, &setpoints, &mut state, t0 + 10_000);
        assert!(state.is_in_cooldown());

        for now in (t0 + 10_001..t0 + 20_000).step_by(997) {
            engine.run_cycle(&cold, &setpoints, &mut state, now);
            assert_eq!(state.thermal_mode(), ThermalMode::Off, "heating resumed at {now}");
        }

        engine.run_cycle(&cold, &setpoints, &mut state, t0 + 20_000);
        assert!(!state.is_in_cooldown());
        assert_eq!(state.thermal_mode(), ThermalMode::Heating);
        assert_eq!(state.thermal_started_ms(), Some(t0 + 20_000));
    }

    #[test]
    fn cooling_is_not_blocked_by_cooldown_or_ceiling() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();

        engine.run_cycle(&at_temp(15.0), &setpoints, &mut state, 0);
        engine.run_cycle(&at_temp(15.0), &setpoints, &mut state, 10_000);
        assert!(state.is_in_cooldown());

        engine.run_cycle(&at_temp(35.0), &setpoints, &mut state, 11_000);
        assert_eq!(state.thermal_mode(), ThermalMode::Cooling);
        assert_eq!(state.relay_pair(), (true, false));

        engine.run_cycle(&at_temp(35.0), &setpoints, &mut state, 120_000);
        assert_eq!(state.thermal_mode(), ThermalMode::Cooling);
    }

    #[test]
    fn cold_reading_during_cooldown_leaves_cooling_alone() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();

        engine.run_cycle(&at_temp(15.0), &setpoints, &mut state, 0);
        engine.run_cycle(&at_temp(15.0), &setpoints, &mut state, 10_000);
        engine.run_cycle(&at_temp(35.0), &setpoints, &mut state, 11_000);
        assert_eq!(state.thermal_mode(), ThermalMode::Cooling);
        let outcome = engine.run_cycle(&at_temp(15.0), &setpoints, &mut state, 12_000);

        assert!(state.is_in_cooldown());
        assert_eq!(state.thermal_mode(), ThermalMode::Cooling);
        assert!(!outcome.changed);
        assert!(outcome.commands.is_empty());
    }

    #[test]
    fn low_water_forces_humidifier_off() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();

        let dry = SensorSnapshot {
            humidity_pct: 10.0,
            ..calm()
        };
        engine.run_cycle(&dry, &setpoints, &mut state, 0);
        assert!(state.is_humidifier_on());

        let empty = SensorSnapshot {
            water_low: true,
            ..dry
        };
        let outcome = engine.run_cycle(&empty, &setpoints, &mut state, 5_000);

        assert!(!state.is_humidifier_on());
        assert_eq!(
            outcome.commands,
            vec![ActuatorCommand::Relay {
                relay: Relay::Humidifier,
                on: false
            }]
        );
    }

    #[test]
    fn low_water_keeps_idle_humidifier_off() {
        let engine = engine();
        let mut state = ActuatorState::default();

        let snapshot = SensorSnapshot {
            humidity_pct: 10.0,
            water_low: true,
            ..calm()
        };
        engine.run_cycle(&snapshot, &Setpoints::default(), &mut state, 0);

        assert!(!state.is_humidifier_on());
    }

    #[test]
    fn humidifier_holds_inside_band() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();

        for (humidity, expected) in [(57.9, true), (70.0, true), (82.0, true), (82.1, false), (60.0, false)] {
            let snapshot = SensorSnapshot {
                humidity_pct: humidity,
                ..calm()
            };
            engine.run_cycle(&snapshot, &setpoints, &mut state, 0);
            assert_eq!(state.is_humidifier_on(), expected, "at {humidity}%");
        }
    }

    #[test]
    fn dim_light_ramps_leds_to_full() {
        let engine = engine();
        let mut state = ActuatorState::default();

        let dark = SensorSnapshot { light: 100, ..calm() };
        let outcome = engine.run_cycle(&dark, &Setpoints::default(), &mut state, 0);

        assert_eq!(state.led_intensity(), 255);
        assert_eq!(outcome.commands.first(), Some(&ActuatorCommand::LedDuty(5)));
        assert_eq!(
            outcome.commands.iter().rev().nth(1),
            Some(&ActuatorCommand::LedDuty(255))
        );

        let repeat = engine.run_cycle(&dark, &Setpoints::default(), &mut state, 5_000);
        assert!(repeat.commands.is_empty());
    }

    #[test]
    fn gas_over_ceiling_opens_exhaust() {
        let engine = engine();
        let mut state = ActuatorState::default();
        let setpoints = Setpoints::default();

        let smoky = SensorSnapshot { co: 500, ..calm() };
        engine.run_cycle(&smoky, &setpoints, &mut state, 0);
        assert!(state.is_exhaust_on());
        assert_eq!(state.damper(), DamperPosition::Open);

        engine.run_cycle(&calm(), &setpoints, &mut state, 5_000);
        assert!(!state.is_exhaust_on());
        assert_eq!(state.damper(), DamperPosition::Closed);
    }

    #[test]
    fn debug_mode_suspends_engine() {
        let engine = engine();
        let mut state = ActuatorState::default();
        state.set_debug_mode(true);
        let before = state.clone();

        let harsh = SensorSnapshot {
            temperature_c: 5.0,
            humidity_pct: 5.0,
            light: 0,
            co: 9_999,
            co2_ppm: 9_999,
            tvocs_ppb: 9_999,
            water_low: false,
        };
        let outcome = engine.run_cycle(&harsh, &Setpoints::default(), &mut state, 0);

        assert_eq!(outcome, CycleOutcome::default());
        assert_eq!(state, before);
    }
}
