pub const TOPIC_STATE_ACTUATORS: &str = "greenhouse/state/actuators";
pub const TOPIC_STATE_SENSORS: &str = "greenhouse/state/sensors";
pub const TOPIC_STATE_HEARTBEAT: &str = "greenhouse/state/heartbeat";

pub const TOPIC_CMD_SETPOINTS: &str = "greenhouse/cmnd/setpoints";
pub const TOPIC_CMD_DEBUG_MODE: &str = "greenhouse/cmnd/debug_mode";
pub const TOPIC_CMD_MANUAL_ACTUATORS: &str = "greenhouse/cmnd/manual_actuators";

pub const COMMAND_TOPICS: [&str; 3] = [
    TOPIC_CMD_SETPOINTS,
    TOPIC_CMD_DEBUG_MODE,
    TOPIC_CMD_MANUAL_ACTUATORS,
];

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
