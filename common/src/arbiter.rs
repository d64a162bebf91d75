use log::{debug, info, warn};

use crate::{
    actuators::{ActuatorCommand, ActuatorState, ThermalMode},
    config::ControlConfig,
    types::ManualActuatorStates,
};

/// Timed throttle that keeps remote publishes from racing manual edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteGate {
    suppressed: bool,
    since_ms: u64,
}

impl WriteGate {
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn suppressed_since_ms(&self) -> Option<u64> {
        self.suppressed.then_some(self.since_ms)
    }

    /// (Re)starts the suppression window at `now_ms`.
    pub fn engage(&mut self, now_ms: u64) {
        if !self.suppressed {
            info!("remote writes suppressed for manual control");
        }
        self.suppressed = true;
        self.since_ms = now_ms;
    }

    /// Open once the window has fully elapsed; the first open check clears
    /// the suppression.
    pub fn can_publish(&mut self, now_ms: u64, window_ms: u64) -> bool {
        if !self.suppressed {
            return true;
        }
        if now_ms.saturating_sub(self.since_ms) >= window_ms {
            self.suppressed = false;
            info!("remote write suppression expired");
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugTransition {
    Unchanged,
    Entered,
    Exited,
}

/// Owns the debug interlock and the manual-write path.
#[derive(Debug, Clone)]
pub struct OverrideArbiter {
    suppression_ms: u64,
    led_ramp_step: u8,
    led_ramp_step_delay_ms: u64,
}

impl OverrideArbiter {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            suppression_ms: config.write_suppression_ms,
            led_ramp_step: config.led_ramp_step,
            led_ramp_step_delay_ms: config.led_ramp_step_delay_ms,
        }
    }

    /// Entering debug mode engages write suppression; leaving it is reported
    /// so the caller can resynchronise the backend.
    pub fn set_debug_mode(&self, state: &mut ActuatorState, on: bool, now_ms: u64) -> DebugTransition {
        if state.is_debug_mode() == on {
            return DebugTransition::Unchanged;
        }

        state.set_debug_mode(on);
        if on {
            info!("debug mode ON, automatic control suspended");
            state.write_gate_mut().engage(now_ms);
            DebugTransition::Entered
        } else {
            info!("debug mode OFF, automatic control resumed");
            DebugTransition::Exited
        }
    }

    /// Applies operator-requested levels. Outside debug mode this is a silent
    /// no-op and `state` is left untouched.
    ///
    /// Only fields that differ from the current state are written. Any applied
    /// change re-arms write suppression instead of publishing, so a burst of
    /// edits lands at the backend as one write once the window lapses.
    pub fn set_manual_states(
        &self,
        state: &mut ActuatorState,
        manual: &ManualActuatorStates,
        now_ms: u64,
    ) -> Vec<ActuatorCommand> {
        let mut commands = Vec::new();
        if !state.is_debug_mode() {
            return commands;
        }

        if manual.relay2 && !manual.relay1 {
            warn!("manual relay2 without relay1 has no thermal meaning, driving module OFF");
        }
        if manual.humidifier_on != manual.relay3 {
            debug!("manual humidifier flag disagrees with relay3, relay3 wins");
        }

        let mut changed = false;
        let mode = ThermalMode::from_relay_pair(manual.relay1, manual.relay2);
        if state.set_thermal_mode(mode, now_ms, &mut commands) {
            info!("[manual] thermal module {}", mode.as_str());
            changed = true;
        }
        if state.set_humidifier(manual.relay3, &mut commands) {
            info!("[manual] relay 3 (humidifier) {}", on_off(manual.relay3));
            changed = true;
        }
        if state.set_exhaust(manual.relay4, &mut commands) {
            info!("[manual] relay 4 (exhaust) {}", on_off(manual.relay4));
            changed = true;
        }

        let intensity = if manual.leds_on {
            manual.leds_intensity
        } else {
            0
        };
        if state.set_led_intensity(
            intensity,
            self.led_ramp_step,
            self.led_ramp_step_delay_ms,
            &mut commands,
        ) {
            info!("[manual] LEDs {} intensity {intensity}/255", on_off(intensity > 0));
            changed = true;
        }

        if changed {
            state.write_gate_mut().engage(now_ms);
        }
        commands
    }

    pub fn can_publish(&self, state: &mut ActuatorState, now_ms: u64) -> bool {
        state.write_gate_mut().can_publish(now_ms, self.suppression_ms)
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::{DamperPosition, Relay};
    use pretty_assertions::assert_eq;

    fn arbiter() -> OverrideArbiter {
        OverrideArbiter::new(&ControlConfig::default())
    }

    fn manual() -> ManualActuatorStates {
        ManualActuatorStates {
            relay1: true,
            relay2: true,
            relay3: true,
            relay4: true,
            leds_on: true,
            leds_intensity: 100,
            humidifier_on: true,
        }
    }

    #[test]
    fn manual_states_are_ignored_outside_debug() {
        let arbiter = arbiter();
        let mut state = ActuatorState::default();
        let before = state.clone();

        let commands = arbiter.set_manual_states(&mut state, &manual(), 1_000);

        assert!(commands.is_empty());
        assert_eq!(state, before);
    }

    #[test]
    fn entering_debug_engages_suppression() {
        let arbiter = arbiter();
        let mut state = ActuatorState::default();

        assert_eq!(arbiter.set_debug_mode(&mut state, true, 500), DebugTransition::Entered);
        assert_eq!(arbiter.set_debug_mode(&mut state, true, 600), DebugTransition::Unchanged);
        assert_eq!(state.write_gate().suppressed_since_ms(), Some(500));
        assert!(!arbiter.can_publish(&mut state, 600));

        assert_eq!(arbiter.set_debug_mode(&mut state, false, 700), DebugTransition::Exited);
        assert!(!state.is_debug_mode());
    }

    #[test]
    fn manual_states_apply_in_debug() {
        let arbiter = arbiter();
        let mut state = ActuatorState::default();
        arbiter.set_debug_mode(&mut state, true, 0);

        let commands = arbiter.set_manual_states(&mut state, &manual(), 2_000);

        assert_eq!(state.thermal_mode(), ThermalMode::Heating);
        assert_eq!(state.thermal_started_ms(), Some(2_000));
        assert!(state.is_humidifier_on());
        assert_eq!(state.damper(), DamperPosition::Open);
        assert_eq!(state.led_intensity(), 100);
        assert_eq!(
            commands.first(),
            Some(&ActuatorCommand::ThermalRelays {
                relay1: true,
                relay2: true
            })
        );
        assert!(commands.contains(&ActuatorCommand::Relay {
            relay: Relay::Humidifier,
            on: true
        }));
        assert_eq!(state.write_gate().suppressed_since_ms(), Some(2_000));
    }

    #[test]
    fn repeated_manual_states_write_nothing() {
        let arbiter = arbiter();
        let mut state = ActuatorState::default();
        arbiter.set_debug_mode(&mut state, true, 0);
        arbiter.set_manual_states(&mut state, &manual(), 1_000);

        let commands = arbiter.set_manual_states(&mut state, &manual(), 3_000);

        assert!(commands.is_empty());
        assert_eq!(state.write_gate().suppressed_since_ms(), Some(1_000));
    }

    #[test]
    fn lone_relay2_drives_module_off() {
        let arbiter = arbiter();
        let mut state = ActuatorState::default();
        arbiter.set_debug_mode(&mut state, true, 0);

        let manual = ManualActuatorStates {
            relay2: true,
            ..ManualActuatorStates::default()
        };
        arbiter.set_manual_states(&mut state, &manual, 100);

        assert_eq!(state.thermal_mode(), ThermalMode::Off);
        assert_eq!(state.relay_pair(), (false, false));
    }

    #[test]
    fn leds_off_ignores_requested_intensity() {
        let arbiter = arbiter();
        let mut state = ActuatorState::default();
        arbiter.set_debug_mode(&mut state, true, 0);
        arbiter.set_manual_states(&mut state, &manual(), 0);

        let dimmed = ManualActuatorStates {
            leds_on: false,
            leds_intensity: 200,
            ..manual()
        };
        arbiter.set_manual_states(&mut state, &dimmed, 100);

        assert_eq!(state.led_intensity(), 0);
        assert!(!state.leds_on());
    }

    #[test]
    fn write_gate_is_monotonic_over_window() {
        let mut gate = WriteGate::default();
        assert!(gate.can_publish(0, 10_000));

        gate.engage(1_000);
        for now in [1_000, 1_001, 5_000, 10_999] {
            assert!(!gate.can_publish(now, 10_000), "open too early at {now}");
        }
        assert!(gate.can_publish(11_000, 10_000));
        assert!(!gate.is_suppressed());
        assert!(gate.can_publish(11_001, 10_000));
    }
}
