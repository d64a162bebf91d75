use log::warn;

use crate::{
    config::Setpoints,
    error::RemoteError,
    topics::{
        MAX_MQTT_PAYLOAD_BYTES, TOPIC_CMD_DEBUG_MODE, TOPIC_CMD_MANUAL_ACTUATORS,
        TOPIC_CMD_SETPOINTS,
    },
    types::{ActuatorReport, Heartbeat, ManualActuatorStates, SensorReport},
};

/// Backend the controller pushes state to and pulls commands from.
///
/// Publishing is best-effort: callers log a returned error and move on, the
/// next periodic cycle retries implicitly. Fetches are only attempted while
/// [`is_ready`](Self::is_ready) holds.
pub trait RemoteSync {
    fn is_ready(&self) -> bool;

    fn publish_actuator_state(&mut self, report: &ActuatorReport) -> Result<(), RemoteError>;
    fn publish_sensor_report(&mut self, report: &SensorReport) -> Result<(), RemoteError>;
    fn publish_heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<(), RemoteError>;

    fn fetch_setpoints(&mut self) -> Option<Setpoints>;
    fn fetch_debug_mode(&mut self) -> bool;
    fn fetch_manual_states(&mut self) -> Option<ManualActuatorStates>;
}

/// Last known value of every backend command document.
///
/// Transport adapters feed raw messages in through
/// [`handle_message`](Self::handle_message); the fetch side of
/// [`RemoteSync`] reads from here. Values are sticky, mirroring a document
/// store where the latest write stays visible until replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteInbox {
    setpoints: Option<Setpoints>,
    debug_mode: bool,
    manual_states: Option<ManualActuatorStates>,
}

impl RemoteInbox {
    /// Decodes one command message. Returns `Ok(false)` for topics the inbox
    /// does not own.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<bool, RemoteError> {
        if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
            warn!(
                "dropping oversized payload on topic {topic} ({} bytes)",
                payload.len()
            );
            return Ok(false);
        }

        match topic {
            TOPIC_CMD_SETPOINTS => {
                let setpoints = serde_json::from_slice::<Setpoints>(payload)
                    .map_err(|err| invalid(topic, err.to_string()))?;
                self.setpoints = Some(setpoints);
            }
            TOPIC_CMD_DEBUG_MODE => {
                self.debug_mode = parse_flag(topic, payload)?;
            }
            TOPIC_CMD_MANUAL_ACTUATORS => {
                let manual = serde_json::from_slice::<ManualActuatorStates>(payload)
                    .map_err(|err| invalid(topic, err.to_string()))?;
                self.manual_states = Some(manual);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn setpoints(&self) -> Option<Setpoints> {
        self.setpoints
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn manual_states(&self) -> Option<ManualActuatorStates> {
        self.manual_states
    }

    pub fn set_setpoints(&mut self, setpoints: Setpoints) {
        self.setpoints = Some(setpoints);
    }

    pub fn set_debug_mode(&mut self, on: bool) {
        self.debug_mode = on;
    }

    pub fn set_manual_states(&mut self, manual: ManualActuatorStates) {
        self.manual_states = Some(manual);
    }
}

fn parse_flag(topic: &str, payload: &[u8]) -> Result<bool, RemoteError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| invalid(topic, "non utf8 payload".to_string()))?
        .trim()
        .to_ascii_lowercase();

    match text.as_str() {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        other => Err(invalid(topic, format!("expected a boolean, got {other:?}"))),
    }
}

fn invalid(topic: &str, reason: String) -> RemoteError {
    RemoteError::InvalidPayload {
        topic: topic.to_string(),
        reason,
    }
}

/// Test double that records every publish.
#[derive(Debug, Clone)]
pub struct InMemoryRemote {
    pub ready: bool,
    pub fail_publishes: bool,
    pub inbox: RemoteInbox,
    pub actuator_states: Vec<ActuatorReport>,
    pub sensor_reports: Vec<SensorReport>,
    pub heartbeats: Vec<Heartbeat>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self {
            ready: true,
            fail_publishes: false,
            inbox: RemoteInbox::default(),
            actuator_states: Vec::new(),
            sensor_reports: Vec::new(),
            heartbeats: Vec::new(),
        }
    }
}

impl InMemoryRemote {
    pub fn offline() -> Self {
        Self {
            ready: false,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), RemoteError> {
        if !self.ready {
            return Err(RemoteError::NotReady);
        }
        if self.fail_publishes {
            return Err(RemoteError::Transport("simulated publish failure".to_string()));
        }
        Ok(())
    }
}

impl RemoteSync for InMemoryRemote {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn publish_actuator_state(&mut self, report: &ActuatorReport) -> Result<(), RemoteError> {
        self.check()?;
        self.actuator_states.push(*report);
        Ok(())
    }

    fn publish_sensor_report(&mut self, report: &SensorReport) -> Result<(), RemoteError> {
        self.check()?;
        self.sensor_reports.push(*report);
        Ok(())
    }

    fn publish_heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<(), RemoteError> {
        self.check()?;
        self.heartbeats.push(*heartbeat);
        Ok(())
    }

    fn fetch_setpoints(&mut self) -> Option<Setpoints> {
        self.inbox.setpoints()
    }

    fn fetch_debug_mode(&mut self) -> bool {
        self.inbox.debug_mode()
    }

    fn fetch_manual_states(&mut self) -> Option<ManualActuatorStates> {
        self.inbox.manual_states()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_setpoints_document() {
        let mut inbox = RemoteInbox::default();
        let payload = br#"{"lux":900,"tMin":21.0,"tMax":27.5,"uMin":65.0,"uMax":85.0,"coSp":300,"co2Sp":800,"tvocsSp":120}"#;

        assert!(inbox.handle_message(TOPIC_CMD_SETPOINTS, payload).unwrap());

        let setpoints = inbox.setpoints().unwrap();
        assert_eq!(setpoints.lux, 900);
        assert_eq!(setpoints.temp_max_c, 27.5);
        assert_eq!(setpoints.co2_ppm, 800);
    }

    #[test]
    fn debug_flag_accepts_text_forms() {
        let mut inbox = RemoteInbox::default();

        inbox.handle_message(TOPIC_CMD_DEBUG_MODE, b" ON ").unwrap();
        assert!(inbox.debug_mode());
        inbox.handle_message(TOPIC_CMD_DEBUG_MODE, b"false").unwrap();
        assert!(!inbox.debug_mode());
        inbox.handle_message(TOPIC_CMD_DEBUG_MODE, b"1").unwrap();
        assert!(inbox.debug_mode());
    }

    #[test]
    fn bad_debug_flag_keeps_previous_value() {
        let mut inbox = RemoteInbox::default();
        inbox.set_debug_mode(true);

        let err = inbox.handle_message(TOPIC_CMD_DEBUG_MODE, b"maybe").unwrap_err();

        assert!(matches!(err, RemoteError::InvalidPayload { .. }));
        assert!(inbox.debug_mode());
    }

    #[test]
    fn manual_states_use_backend_keys_with_defaults() {
        let mut inbox = RemoteInbox::default();
        let payload = br#"{"rele1":true,"rele3":true,"ledsOn":true,"ledsIntensity":128}"#;

        inbox
            .handle_message(TOPIC_CMD_MANUAL_ACTUATORS, payload)
            .unwrap();

        assert_eq!(
            inbox.manual_states(),
            Some(ManualActuatorStates {
                relay1: true,
                relay2: false,
                relay3: true,
                relay4: false,
                leds_on: true,
                leds_intensity: 128,
                humidifier_on: false,
            })
        );
    }

    #[test]
    fn unknown_and_oversized_messages_are_ignored() {
        let mut inbox = RemoteInbox::default();

        assert!(!inbox.handle_message("greenhouse/other", b"{}").unwrap());
        let oversized = vec![b' '; MAX_MQTT_PAYLOAD_BYTES + 1];
        assert!(!inbox
            .handle_message(TOPIC_CMD_SETPOINTS, &oversized)
            .unwrap());
        assert_eq!(inbox, RemoteInbox::default());
    }

    #[test]
    fn offline_fake_rejects_publishes() {
        let mut remote = InMemoryRemote::offline();
        let heartbeat = Heartbeat {
            uptime_ms: 1,
            debug_mode: false,
            backlog_len: 0,
        };

        assert!(matches!(
            remote.publish_heartbeat(&heartbeat),
            Err(RemoteError::NotReady)
        ));
        assert!(remote.heartbeats.is_empty());
    }
}
