use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use greenhouse_common::{
    sensors::{ClimateReading, GasReading, Sample, SensorChannel, SensorReading},
    ActuatorCommand, ActuatorReport, ConnectivityFlags, ControlConfig, GreenhouseController,
    Heartbeat, ManualActuatorStates, NetworkConfig, Relay, RemoteError, RemoteInbox, RemoteSync,
    RuntimeConfig, SensorHub, SensorReport, SetpointPersistence, Setpoints, StoreError,
    COMMAND_TOPICS, TOPIC_STATE_ACTUATORS, TOPIC_STATE_HEARTBEAT, TOPIC_STATE_SENSORS,
};

const INDICATOR_TICK_MS: u64 = 100;

type HostController = GreenhouseController<MqttRemote, FileSetpointPersistence>;

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    setpoints_path: Arc<PathBuf>,
}

/// Setpoint record kept as a JSON file next to the runtime config.
#[derive(Debug, Clone)]
struct FileSetpointPersistence {
    path: PathBuf,
}

/// Backend gateway over MQTT. Publishes are queued on the rumqttc client
/// without waiting; command topics land in the shared inbox from the
/// eventloop task.
struct MqttRemote {
    client: AsyncClient,
    inbox: Arc<Mutex<RemoteInbox>>,
    flags: ConnectivityFlags,
}

/// Crude greenhouse model so the host build has something to regulate.
#[derive(Debug, Clone)]
struct SimulatedGreenhouse {
    temperature_c: f32,
    humidity_pct: f32,
    co2_ppm: u32,
    heating: bool,
    cooling: bool,
    humidifier: bool,
    exhaust: bool,
    led_duty: u8,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.network);

    let mut mqtt_options = MqttOptions::new(
        runtime.network.client_id.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    info!(
        "connecting to mqtt broker {}:{}",
        runtime.network.mqtt_host, runtime.network.mqtt_port
    );

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let flags = ConnectivityFlags::default();
    // The host has no radio to bring up.
    flags.set_network_up(true);
    let inbox = Arc::new(Mutex::new(RemoteInbox::default()));

    subscribe_topics(&mqtt)
        .await
        .context("failed to queue mqtt subscriptions")?;
    spawn_mqtt_loop(eventloop, inbox.clone(), flags.clone());
    spawn_indicator_task(flags.clone());

    let remote = MqttRemote {
        client: mqtt,
        inbox,
        flags,
    };
    let persistence = FileSetpointPersistence::new(store.setpoints_path.as_ref().clone());
    let controller = GreenhouseController::new(runtime.control.clone(), remote, persistence);

    run_scheduler(controller, runtime.control).await
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in COMMAND_TOPICS {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(
    mut eventloop: rumqttc::EventLoop,
    inbox: Arc<Mutex<RemoteInbox>>,
    flags: ConnectivityFlags,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let result = lock_inbox(&inbox).handle_message(&message.topic, &message.payload);
                    match result {
                        Ok(true) => debug!("command received on {}", message.topic),
                        Ok(false) => {}
                        Err(err) => warn!("mqtt message handling error: {err}"),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    flags.set_remote_ready(true);
                }
                Ok(_) => {}
                Err(err) => {
                    if flags.remote_ready() {
                        warn!("mqtt connection lost: {err}");
                    } else {
                        debug!("mqtt poll error: {err}");
                    }
                    flags.set_remote_ready(false);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Stands in for the status LED: logs whenever the indicator would change.
fn spawn_indicator_task(flags: ConnectivityFlags) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(INDICATOR_TICK_MS));
        let mut last_pattern = None;
        loop {
            ticker.tick().await;
            let pattern = flags.pattern();
            if last_pattern != Some(pattern) {
                info!("status indicator: {pattern:?}");
                last_pattern = Some(pattern);
            }
        }
    });
}

async fn run_scheduler(mut controller: HostController, config: ControlConfig) -> anyhow::Result<()> {
    let mut hub = SensorHub::new(config.sensor_retry_interval_ms);
    let mut greenhouse = SimulatedGreenhouse::default();

    let mut sensor_tick = ticker(config.sensor_poll_interval_ms);
    let mut control_tick = ticker(config.control_interval_ms);
    let mut sync_tick = ticker(config.remote_sync_interval_ms);
    let mut telemetry_tick = ticker(config.telemetry_interval_ms);
    let mut heartbeat_tick = ticker(config.heartbeat_interval_ms);

    info!("greenhouse scheduler started");
    loop {
        tokio::select! {
            _ = sensor_tick.tick() => {
                let now_ms = monotonic_ms();
                let reading = greenhouse.read(&hub, now_ms);
                hub.ingest(reading, now_ms);
            }
            _ = control_tick.tick() => {
                if hub.is_primed() {
                    let commands = controller.control_cycle(&hub.snapshot(), monotonic_ms());
                    execute_commands(commands, &mut greenhouse).await;
                } else {
                    debug!("waiting for first climate reading before control");
                }
            }
            _ = sync_tick.tick() => {
                let commands = controller.sync_from_remote(monotonic_ms());
                execute_commands(commands, &mut greenhouse).await;
            }
            _ = telemetry_tick.tick() => {
                if hub.is_primed() {
                    controller.record_telemetry(
                        &hub.snapshot(),
                        monotonic_ms(),
                        Some(Utc::now().timestamp()),
                    );
                }
            }
            _ = heartbeat_tick.tick() => {
                controller.heartbeat(monotonic_ms());
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                info!("shutdown requested, leaving scheduler");
                return Ok(());
            }
        }
    }
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_millis(period_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Runs commands strictly in order; settles sleep without blocking the
/// runtime.
async fn execute_commands(commands: Vec<ActuatorCommand>, greenhouse: &mut SimulatedGreenhouse) {
    for command in commands {
        if let ActuatorCommand::Settle(ms) = command {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            continue;
        }

        match command {
            ActuatorCommand::LedDuty(_) => debug!("actuator command: {command:?}"),
            _ => info!("actuator command: {command:?}"),
        }
        greenhouse.apply(command);
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("GREENHOUSE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.greenhouse"));
        Self::in_dir(&data_dir)
    }

    fn in_dir(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            setpoints_path: Arc::new(data_dir.join("setpoints.json")),
        }
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match std::fs::read(self.runtime_path.as_ref()) {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw).with_context(|| {
                format!("invalid runtime config at {}", self.runtime_path.display())
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl FileSetpointPersistence {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl SetpointPersistence for FileSetpointPersistence {
    fn load(&self) -> Result<Option<Setpoints>, StoreError> {
        match std::fs::read(self.path()) {
            Ok(raw) => Ok(Some(serde_json::from_slice::<Setpoints>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, setpoints: &Setpoints) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(setpoints)?;
        std::fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl MqttRemote {
    fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        retain: bool,
        payload: &T,
    ) -> Result<(), RemoteError> {
        if !self.is_ready() {
            return Err(RemoteError::NotReady);
        }
        let body = serde_json::to_vec(payload)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, body)
            .map_err(|err| RemoteError::Transport(err.to_string()))
    }
}

impl RemoteSync for MqttRemote {
    fn is_ready(&self) -> bool {
        self.flags.remote_ready()
    }

    fn publish_actuator_state(&mut self, report: &ActuatorReport) -> Result<(), RemoteError> {
        self.publish_json(TOPIC_STATE_ACTUATORS, true, report)
    }

    fn publish_sensor_report(&mut self, report: &SensorReport) -> Result<(), RemoteError> {
        self.publish_json(TOPIC_STATE_SENSORS, false, report)
    }

    fn publish_heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<(), RemoteError> {
        self.publish_json(TOPIC_STATE_HEARTBEAT, false, heartbeat)
    }

    fn fetch_setpoints(&mut self) -> Option<Setpoints> {
        lock_inbox(&self.inbox).setpoints()
    }

    fn fetch_debug_mode(&mut self) -> bool {
        lock_inbox(&self.inbox).debug_mode()
    }

    fn fetch_manual_states(&mut self) -> Option<ManualActuatorStates> {
        lock_inbox(&self.inbox).manual_states()
    }
}

fn lock_inbox(inbox: &Mutex<RemoteInbox>) -> MutexGuard<'_, RemoteInbox> {
    inbox.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for SimulatedGreenhouse {
    fn default() -> Self {
        Self {
            temperature_c: 19.0,
            humidity_pct: 62.0,
            co2_ppm: 420,
            heating: false,
            cooling: false,
            humidifier: false,
            exhaust: false,
            led_duty: 0,
        }
    }
}

impl SimulatedGreenhouse {
    const AMBIENT_C: f32 = 18.0;

    fn apply(&mut self, command: ActuatorCommand) {
        match command {
            ActuatorCommand::ThermalRelays { relay1, relay2 } => {
                self.heating = relay1 && relay2;
                self.cooling = relay1 && !relay2;
            }
            ActuatorCommand::Relay {
                relay: Relay::Humidifier,
                on,
            } => self.humidifier = on,
            ActuatorCommand::Relay {
                relay: Relay::Exhaust,
                on,
            } => self.exhaust = on,
            ActuatorCommand::LedDuty(duty) => self.led_duty = duty,
            ActuatorCommand::Damper(_) | ActuatorCommand::Settle(_) => {}
        }
    }

    /// Advances the model one polling step and samples it.
    fn read(&mut self, hub: &SensorHub, now_ms: u64) -> SensorReading {
        if self.heating {
            self.temperature_c += 0.4;
        } else if self.cooling {
            self.temperature_c -= 0.4;
        } else {
            self.temperature_c += (Self::AMBIENT_C - self.temperature_c) * 0.05;
        }

        if self.humidifier {
            self.humidity_pct = (self.humidity_pct + 1.5).min(100.0);
        } else {
            self.humidity_pct = (self.humidity_pct - 0.3).max(20.0);
        }

        self.co2_ppm = if self.exhaust {
            self.co2_ppm.saturating_sub(25).max(380)
        } else {
            self.co2_ppm.saturating_add(5)
        };

        let climate = if hub.poll_due(SensorChannel::Climate, now_ms) {
            Sample::Value(ClimateReading {
                temperature_c: self.temperature_c,
                humidity_pct: self.humidity_pct,
            })
        } else {
            Sample::Skipped
        };
        let gas = if hub.poll_due(SensorChannel::Gas, now_ms) {
            Sample::Value(GasReading {
                co2_ppm: self.co2_ppm,
                tvocs_ppb: 40,
            })
        } else {
            Sample::Skipped
        };

        SensorReading {
            climate,
            gas,
            co: Some(80),
            light: 1_500 + u32::from(self.led_duty) * 20,
            water_low: false,
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenhouse_common::ThermalMode;
    use pretty_assertions::assert_eq;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("greenhouse-host-{}-{name}", std::process::id()))
            .join("setpoints.json")
    }

    #[test]
    fn file_persistence_round_trips() {
        let path = scratch_path("round-trip");
        let mut persistence = FileSetpointPersistence::new(path.clone());
        assert!(persistence.load().unwrap().is_none());

        let setpoints = Setpoints {
            lux: 750,
            ..Setpoints::default()
        };
        persistence.save(&setpoints).unwrap();

        assert_eq!(persistence.load().unwrap(), Some(setpoints));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_setpoint_file_is_reported() {
        let path = scratch_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        let persistence = FileSetpointPersistence::new(path.clone());

        assert!(matches!(persistence.load(), Err(StoreError::Corrupt(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn runtime_config_missing_or_partial() {
        let dir = scratch_path("runtime").parent().unwrap().to_path_buf();
        let _ = std::fs::remove_dir_all(&dir);
        let store = AppStore::in_dir(&dir);
        assert_eq!(store.load_runtime_config().unwrap().network.mqtt_port, 1883);

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            store.runtime_path.as_ref(),
            br#"{"network":{"mqtt_host":"broker.local"},"control":{"heartbeat_interval_ms":60000}}"#,
        )
        .unwrap();
        let runtime = store.load_runtime_config().unwrap();

        assert_eq!(runtime.network.mqtt_host, "broker.local");
        assert_eq!(runtime.network.mqtt_port, 1883);
        assert_eq!(runtime.control.heartbeat_interval_ms, 60_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn simulated_heating_warms_greenhouse() {
        let mut greenhouse = SimulatedGreenhouse::default();
        let hub = SensorHub::new(30_000);
        let (relay1, relay2) = ThermalMode::Heating.relay_pair();
        greenhouse.apply(ActuatorCommand::ThermalRelays { relay1, relay2 });

        let before = greenhouse.temperature_c;
        let reading = greenhouse.read(&hub, 0);

        match reading.climate {
            Sample::Value(climate) => assert!(climate.temperature_c > before),
            other => panic!("expected a climate sample, got {other:?}"),
        }
    }
}
