use serde::{Deserialize, Serialize};

use crate::{arbiter::WriteGate, types::ActuatorReport};

/// Peltier module drive, encoded on the relay1/relay2 pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThermalMode {
    #[default]
    Off,
    Heating,
    Cooling,
}

impl ThermalMode {
    /// Relay pair levels for this mode: OFF both low, HEATING both high,
    /// COOLING relay1 high and relay2 low.
    pub fn relay_pair(self) -> (bool, bool) {
        match self {
            Self::Off => (false, false),
            Self::Heating => (true, true),
            Self::Cooling => (true, false),
        }
    }

    /// Inverse of [`relay_pair`](Self::relay_pair). relay2 without relay1 has
    /// no drive meaning and collapses to `Off`.
    pub fn from_relay_pair(relay1: bool, relay2: bool) -> Self {
        match (relay1, relay2) {
            (true, true) => Self::Heating,
            (true, false) => Self::Cooling,
            _ => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heating => "HEATING",
            Self::Cooling => "COOLING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    Humidifier,
    Exhaust,
}

impl Relay {
    pub fn number(self) -> u8 {
        match self {
            Self::Humidifier => 3,
            Self::Exhaust => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamperPosition {
    Closed,
    Open,
}

/// One hardware write, in the order the scheduler must perform it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    ThermalRelays { relay1: bool, relay2: bool },
    Relay { relay: Relay, on: bool },
    LedDuty(u8),
    Damper(DamperPosition),
    /// Bounded hardware settle between LED ramp steps.
    Settle(u64),
}

/// Step-wise LED intensity ramp.
///
/// Yields every intermediate duty from `from` towards `to` in `step`
/// increments and always ends on `to` exactly. An unchanged level yields
/// nothing.
#[derive(Debug, Clone)]
pub struct LedRamp {
    next: Option<u8>,
    target: u8,
    step: u8,
}

impl LedRamp {
    pub fn new(from: u8, to: u8, step: u8) -> Self {
        let step = step.max(1);
        let next = if from == to {
            None
        } else {
            Some(Self::advance(from, to, step))
        };
        Self {
            next,
            target: to,
            step,
        }
    }

    fn advance(current: u8, target: u8, step: u8) -> u8 {
        if current < target {
            current.saturating_add(step).min(target)
        } else {
            current.saturating_sub(step).max(target)
        }
    }
}

impl Iterator for LedRamp {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let value = self.next?;
        self.next = if value == self.target {
            None
        } else {
            Some(Self::advance(value, self.target, self.step))
        };
        Some(value)
    }
}

/// Authoritative record of every physical output plus safety bookkeeping.
///
/// The relay pair and the damper are derived, so they can never disagree with
/// `thermal_mode` / `exhaust_on`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActuatorState {
    thermal_mode: ThermalMode,
    thermal_started_ms: Option<u64>,
    in_cooldown: bool,
    cooldown_start_ms: Option<u64>,
    led_intensity: u8,
    humidifier_on: bool,
    exhaust_on: bool,
    debug_mode: bool,
    write_gate: WriteGate,
}

impl ActuatorState {
    pub fn thermal_mode(&self) -> ThermalMode {
        self.thermal_mode
    }

    pub fn is_thermal_active(&self) -> bool {
        self.thermal_mode != ThermalMode::Off
    }

    pub fn thermal_started_ms(&self) -> Option<u64> {
        self.thermal_started_ms
    }

    pub fn relay_pair(&self) -> (bool, bool) {
        self.thermal_mode.relay_pair()
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.in_cooldown
    }

    pub fn cooldown_start_ms(&self) -> Option<u64> {
        self.cooldown_start_ms
    }

    pub fn led_intensity(&self) -> u8 {
        self.led_intensity
    }

    pub fn leds_on(&self) -> bool {
        self.led_intensity > 0
    }

    pub fn is_humidifier_on(&self) -> bool {
        self.humidifier_on
    }

    pub fn is_exhaust_on(&self) -> bool {
        self.exhaust_on
    }

    pub fn damper(&self) -> DamperPosition {
        if self.exhaust_on {
            DamperPosition::Open
        } else {
            DamperPosition::Closed
        }
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn write_gate(&self) -> &WriteGate {
        &self.write_gate
    }

    pub fn report(&self) -> ActuatorReport {
        let (relay1, relay2) = self.relay_pair();
        ActuatorReport {
            relay1,
            relay2,
            relay3: self.humidifier_on,
            relay4: self.exhaust_on,
            leds_on: self.leds_on(),
            leds_watts: self.led_intensity,
            humidifier_on: self.humidifier_on,
        }
    }

    /// Switches the thermal module, returning the relay write when the mode
    /// actually changes. Entering an active mode restarts the run timer.
    pub(crate) fn set_thermal_mode(
        &mut self,
        mode: ThermalMode,
        now_ms: u64,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        if self.thermal_mode == mode {
            return false;
        }

        self.thermal_mode = mode;
        self.thermal_started_ms = match mode {
            ThermalMode::Off => None,
            ThermalMode::Heating | ThermalMode::Cooling => Some(now_ms),
        };

        let (relay1, relay2) = mode.relay_pair();
        commands.push(ActuatorCommand::ThermalRelays { relay1, relay2 });
        true
    }

    pub(crate) fn start_cooldown(&mut self, now_ms: u64) {
        self.in_cooldown = true;
        self.cooldown_start_ms = Some(now_ms);
    }

    pub(crate) fn end_cooldown(&mut self) {
        self.in_cooldown = false;
        self.cooldown_start_ms = None;
    }

    pub(crate) fn set_humidifier(&mut self, on: bool, commands: &mut Vec<ActuatorCommand>) -> bool {
        if self.humidifier_on == on {
            return false;
        }
        self.humidifier_on = on;
        commands.push(ActuatorCommand::Relay {
            relay: Relay::Humidifier,
            on,
        });
        true
    }

    /// Exhaust relay and damper always move together.
    pub(crate) fn set_exhaust(&mut self, on: bool, commands: &mut Vec<ActuatorCommand>) -> bool {
        if self.exhaust_on == on {
            return false;
        }
        self.exhaust_on = on;
        commands.push(ActuatorCommand::Damper(self.damper()));
        commands.push(ActuatorCommand::Relay {
            relay: Relay::Exhaust,
            on,
        });
        true
    }

    /// Ramps the LED PWM to `intensity`, emitting one duty write and one settle
    /// per step.
    pub(crate) fn set_led_intensity(
        &mut self,
        intensity: u8,
        step: u8,
        step_delay_ms: u64,
        commands: &mut Vec<ActuatorCommand>,
    ) -> bool {
        if self.led_intensity == intensity {
            return false;
        }

        for duty in LedRamp::new(self.led_intensity, intensity, step) {
            commands.push(ActuatorCommand::LedDuty(duty));
            if step_delay_ms > 0 {
                commands.push(ActuatorCommand::Settle(step_delay_ms));
            }
        }
        self.led_intensity = intensity;
        true
    }

    pub(crate) fn set_debug_mode(&mut self, on: bool) {
        self.debug_mode = on;
    }

    pub(crate) fn write_gate_mut(&mut self) -> &mut WriteGate {
        &mut self.write_gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn relay_pair_follows_mode() {
        assert_eq!(ThermalMode::Off.relay_pair(), (false, false));
        assert_eq!(ThermalMode::Heating.relay_pair(), (true, true));
        assert_eq!(ThermalMode::Cooling.relay_pair(), (true, false));
        assert_eq!(ThermalMode::from_relay_pair(false, true), ThermalMode::Off);
    }

    #[test]
    fn ramp_up_ends_exactly_on_target() {
        let steps: Vec<u8> = LedRamp::new(0, 12, 5).collect();
        assert_eq!(steps, vec![5, 10, 12]);
    }

    #[test]
    fn ramp_down_reaches_zero() {
        let steps: Vec<u8> = LedRamp::new(255, 240, 5).collect();
        assert_eq!(steps, vec![250, 245, 240]);

        let last = LedRamp::new(255, 0, 5).last();
        assert_eq!(last, Some(0));
        assert_eq!(LedRamp::new(255, 0, 5).count(), 51);
    }

    #[test]
    fn unchanged_ramp_is_empty() {
        assert_eq!(LedRamp::new(128, 128, 5).count(), 0);
    }

    #[test]
    fn exhaust_moves_damper_first() {
        let mut state = ActuatorState::default();
        let mut commands = Vec::new();

        assert!(state.set_exhaust(true, &mut commands));
        assert!(!state.set_exhaust(true, &mut commands));

        assert_eq!(state.damper(), DamperPosition::Open);
        assert_eq!(
            commands,
            vec![
                ActuatorCommand::Damper(DamperPosition::Open),
                ActuatorCommand::Relay {
                    relay: Relay::Exhaust,
                    on: true
                },
            ]
        );
    }

    #[test]
    fn led_ramp_interleaves_settle() {
        let mut state = ActuatorState::default();
        let mut commands = Vec::new();

        state.set_led_intensity(10, 5, 10, &mut commands);

        assert_eq!(
            commands,
            vec![
                ActuatorCommand::LedDuty(5),
                ActuatorCommand::Settle(10),
                ActuatorCommand::LedDuty(10),
                ActuatorCommand::Settle(10),
            ]
        );
        assert!(state.leds_on());
    }

    #[test]
    fn report_mirrors_state() {
        let mut state = ActuatorState::default();
        let mut commands = Vec::new();
        state.set_thermal_mode(ThermalMode::Cooling, 0, &mut commands);
        state.set_humidifier(true, &mut commands);
        state.set_led_intensity(255, 5, 0, &mut commands);

        assert_eq!(
            state.report(),
            ActuatorReport {
                relay1: true,
                relay2: false,
                relay3: true,
                relay4: false,
                leds_on: true,
                leds_watts: 255,
                humidifier_on: true,
            }
        );
    }
}
