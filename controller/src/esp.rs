use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht22;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, BLOCK},
    gpio::{AnyIOPin, AnyOutputPin, Gpio34, Gpio35, InputOutput, Output, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use greenhouse_common::{
    sensors::{ClimateReading, GasReading, Sample, SensorChannel, SensorReading},
    ActuatorCommand, ActuatorReport, ConnectivityFlags, ControlConfig, DamperPosition,
    GreenhouseController, Heartbeat, ManualActuatorStates, NetworkConfig, Relay, RemoteError,
    RemoteInbox, RemoteSync, RuntimeConfig, SensorHub, SensorReport, SetpointPersistence,
    Setpoints, StoreError, COMMAND_TOPICS, MAX_MQTT_PAYLOAD_BYTES, TOPIC_STATE_ACTUATORS,
    TOPIC_STATE_HEARTBEAT, TOPIC_STATE_SENSORS,
};

const NVS_NAMESPACE: &str = "greenhouse";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SETPOINTS_NAMESPACE: &str = "setpoints";
const NVS_SETPOINTS_KEY: &str = "setpoints_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SCHEDULER_TICK_MS: u64 = 100;
const INDICATOR_TICK_MS: u64 = 50;

const STATUS_LED_PIN: i32 = 2;
const RELAY1_PIN: i32 = 23;
const RELAY2_PIN: i32 = 14;
const RELAY3_PIN: i32 = 18;
const RELAY4_PIN: i32 = 19;
const DHT22_PIN: i32 = 33;

// GPIO32 is touch pad 9; a low touch reading means the float is dry.
const WATER_TOUCH_PAD: esp_idf_svc::sys::touch_pad_t = esp_idf_svc::sys::touch_pad_t_TOUCH_PAD_NUM9;
const WATER_LOW_THRESHOLD: u16 = 35;

const CCS811_ADDR: u8 = 0x5A;
const CCS811_STATUS: u8 = 0x00;
const CCS811_MEAS_MODE: u8 = 0x01;
const CCS811_ALG_RESULT: u8 = 0x02;
const CCS811_APP_START: u8 = 0xF4;
const CCS811_DATA_READY: u8 = 0x08;
const CCS811_MODE_1S: u8 = 0x10;

const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_CLOSED_US: u32 = 500;
const SERVO_OPEN_US: u32 = 1_500;

type EspController = GreenhouseController<EspRemote, NvsSetpointPersistence>;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

#[derive(Clone)]
struct NvsSetpointPersistence {
    store: NvsStore,
}

struct EspRemote {
    client: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    inbox: Arc<Mutex<RemoteInbox>>,
    flags: ConnectivityFlags,
}

struct Actuators {
    relay1: PinDriver<'static, AnyOutputPin, Output>,
    relay2: PinDriver<'static, AnyOutputPin, Output>,
    humidifier: PinDriver<'static, AnyOutputPin, Output>,
    exhaust: PinDriver<'static, AnyOutputPin, Output>,
    leds: LedcDriver<'static>,
    damper: LedcDriver<'static>,
    _led_timer: LedcTimerDriver<'static>,
    _servo_timer: LedcTimerDriver<'static>,
}

struct SensorSuite {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    ldr: AdcChannelDriver<'static, Gpio34, Arc<AdcDriver<'static, ADC1>>>,
    mq7: AdcChannelDriver<'static, Gpio35, Arc<AdcDriver<'static, ADC1>>>,
    air: Option<I2cDriver<'static>>,
    last_air: Option<(u32, u32)>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.mqtt_host, runtime.network.mqtt_port,
    );

    let peripherals = Peripherals::take()?;
    let actuators = Actuators::new(
        peripherals.ledc.timer0,
        peripherals.ledc.channel0,
        peripherals.pins.gpio4,
        peripherals.ledc.timer1,
        peripherals.ledc.channel1,
        peripherals.pins.gpio5,
    )
    .context("actuator init failed")?;

    let adc = Arc::new(AdcDriver::new(peripherals.adc1)?);
    let air = match I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio21,
        peripherals.pins.gpio22,
        &I2cConfig::new().baudrate(100.kHz().into()),
    ) {
        Ok(i2c) => Some(i2c),
        Err(err) => {
            warn!("i2c bus unavailable, air quality sensor disabled: {err}");
            None
        }
    };
    let sensors = SensorSuite::new(
        adc,
        peripherals.pins.gpio34,
        peripherals.pins.gpio35,
        air,
    )
    .context("sensor init failed")?;

    let flags = ConnectivityFlags::default();
    let wifi = connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network);
    let _sntp = match &wifi {
        Some(_) => {
            flags.set_network_up(true);
            disable_wifi_power_save();
            EspSntp::new_default()
                .map_err(|err| warn!("failed to start SNTP: {err}"))
                .ok()
        }
        None => {
            warn!("running without network; control continues offline");
            None
        }
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let inbox = Arc::new(Mutex::new(RemoteInbox::default()));
    let client = match &wifi {
        Some(_) => {
            let (client, conn) = create_mqtt_client(&runtime.network)?;
            let client = Arc::new(Mutex::new(client));
            spawn_mqtt_receiver(conn, client.clone(), inbox.clone(), flags.clone())?;
            Some(client)
        }
        None => None,
    };

    spawn_indicator(init_status_led(STATUS_LED_PIN), flags.clone())?;

    let remote = EspRemote {
        client,
        inbox,
        flags: flags.clone(),
    };
    let persistence = NvsSetpointPersistence {
        store: nvs_store.clone(),
    };
    let controller = GreenhouseController::new(runtime.control.clone(), remote, persistence);
    spawn_control_loop(
        controller,
        sensors,
        actuators,
        runtime.control,
        flags,
        wifi.is_some(),
    )?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> Option<Box<EspWifi<'static>>> {
    if network.wifi_ssid.trim().is_empty() {
        warn!("wifi credentials missing");
        return None;
    }
    match try_connect_wifi(modem, sys_loop, nvs_partition, network) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi startup failed: {err:#}");
            None
        }
    }
}

fn try_connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<Box<EspWifi<'static>>> {
    let mut esp_wifi = Box::new(EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?);
    let mut wifi = BlockingWifi::wrap(esp_wifi.as_mut(), sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        ));
    }
    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Mutex<EspMqttClient<'static>>) -> anyhow::Result<()> {
    let mut mqtt = lock(mqtt);
    for topic in COMMAND_TOPICS {
        mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    inbox: Arc<Mutex<RemoteInbox>>,
    flags: ConnectivityFlags,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        flags.set_remote_ready(true);
                        if let Err(err) = subscribe_topics(&mqtt) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        flags.set_remote_ready(false);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // We only process full MQTT payloads.
                        if !matches!(details, Details::Complete) || data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            continue;
                        }
                        if let Err(err) = lock(&inbox).handle_message(topic, data) {
                            warn!("mqtt message handling failed: {err}");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    flags.set_remote_ready(false);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn spawn_indicator(mut status_led: Option<StatusLed>, flags: ConnectivityFlags) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("indicator".into())
        .stack_size(4 * 1024)
        .spawn(move || loop {
            update_status_led(&mut status_led, &flags, monotonic_ms());
            thread::sleep(Duration::from_millis(INDICATOR_TICK_MS));
        })
        .context("failed to spawn indicator thread")?;
    Ok(())
}

fn spawn_control_loop(
    mut controller: EspController,
    mut sensors: SensorSuite,
    mut actuators: Actuators,
    config: ControlConfig,
    flags: ConnectivityFlags,
    wifi_configured: bool,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut hub = SensorHub::new(config.sensor_retry_interval_ms);
            let mut last_sensor_ms = None;
            let mut last_control_ms = None;
            let mut last_sync_ms = None;
            let mut last_telemetry_ms = None;
            let mut last_heartbeat_ms = None;
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if wifi_configured {
                    let wifi_connected = is_wifi_station_connected();
                    flags.set_network_up(wifi_connected);
                    if wifi_connected {
                        wifi_disconnected_since_ms = None;
                    } else if let Some(since) = wifi_disconnected_since_ms {
                        if now_ms.saturating_sub(since) >= WIFI_RESTART_GRACE_MS {
                            warn!(
                                "wifi disconnected for {}s; restarting device for recovery",
                                WIFI_RESTART_GRACE_MS / 1000
                            );
                            actuators.shutdown();
                            thread::sleep(Duration::from_millis(100));
                            unsafe { esp_idf_svc::sys::esp_restart() };
                        }
                    } else {
                        wifi_disconnected_since_ms = Some(now_ms);
                    }
                }

                if is_due(&mut last_sensor_ms, now_ms, config.sensor_poll_interval_ms) {
                    let reading = sensors.read(&hub, now_ms);
                    hub.ingest(reading, now_ms);
                }

                if is_due(&mut last_control_ms, now_ms, config.control_interval_ms) {
                    if hub.is_primed() {
                        let commands = controller.control_cycle(&hub.snapshot(), now_ms);
                        actuators.execute(commands);
                    } else {
                        debug!("waiting for first climate reading before control");
                    }
                }

                if is_due(&mut last_sync_ms, now_ms, config.remote_sync_interval_ms) {
                    let commands = controller.sync_from_remote(now_ms);
                    actuators.execute(commands);
                }

                if hub.is_primed()
                    && is_due(&mut last_telemetry_ms, now_ms, config.telemetry_interval_ms)
                {
                    controller.record_telemetry(&hub.snapshot(), now_ms, epoch_seconds());
                }

                if is_due(&mut last_heartbeat_ms, now_ms, config.heartbeat_interval_ms) {
                    controller.heartbeat(now_ms);
                }

                thread::sleep(Duration::from_millis(SCHEDULER_TICK_MS));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn is_due(last_ms: &mut Option<u64>, now_ms: u64, period_ms: u64) -> bool {
    let due = last_ms
        .map(|last| now_ms.saturating_sub(last) >= period_ms)
        .unwrap_or(true);
    if due {
        *last_ms = Some(now_ms);
    }
    due
}

/// Wall clock only once SNTP has produced a plausible time.
fn epoch_seconds() -> Option<i64> {
    let now = Utc::now().timestamp();
    (now > 1_600_000_000).then_some(now)
}

impl Actuators {
    fn new(
        led_timer: esp_idf_hal::ledc::TIMER0,
        led_channel: esp_idf_hal::ledc::CHANNEL0,
        led_pin: esp_idf_hal::gpio::Gpio4,
        servo_timer: esp_idf_hal::ledc::TIMER1,
        servo_channel: esp_idf_hal::ledc::CHANNEL1,
        servo_pin: esp_idf_hal::gpio::Gpio5,
    ) -> anyhow::Result<Self> {
        let led_timer = LedcTimerDriver::new(
            led_timer,
            &TimerConfig::new()
                .frequency(5.kHz().into())
                .resolution(Resolution::Bits8),
        )?;
        let leds = LedcDriver::new(led_channel, &led_timer, led_pin)?;

        let servo_timer = LedcTimerDriver::new(
            servo_timer,
            &TimerConfig::new()
                .frequency(50.Hz().into())
                .resolution(Resolution::Bits14),
        )?;
        let damper = LedcDriver::new(servo_channel, &servo_timer, servo_pin)?;

        let mut actuators = Self {
            relay1: output_pin(RELAY1_PIN)?,
            relay2: output_pin(RELAY2_PIN)?,
            humidifier: output_pin(RELAY3_PIN)?,
            exhaust: output_pin(RELAY4_PIN)?,
            leds,
            damper,
            _led_timer: led_timer,
            _servo_timer: servo_timer,
        };
        actuators.shutdown();
        Ok(actuators)
    }

    /// Drives every output to the boot state.
    fn shutdown(&mut self) {
        self.execute(vec![
            ActuatorCommand::ThermalRelays {
                relay1: false,
                relay2: false,
            },
            ActuatorCommand::Relay {
                relay: Relay::Humidifier,
                on: false,
            },
            ActuatorCommand::Relay {
                relay: Relay::Exhaust,
                on: false,
            },
            ActuatorCommand::LedDuty(0),
            ActuatorCommand::Damper(DamperPosition::Closed),
        ]);
    }

    fn execute(&mut self, commands: Vec<ActuatorCommand>) {
        for command in commands {
            if let Err(err) = self.apply(command) {
                warn!("actuator write {command:?} failed: {err:#}");
            }
        }
    }

    fn apply(&mut self, command: ActuatorCommand) -> anyhow::Result<()> {
        match command {
            ActuatorCommand::ThermalRelays { relay1, relay2 } => {
                // Drop the direction relay before switching the common one.
                set_level(&mut self.relay2, false)?;
                set_level(&mut self.relay1, relay1)?;
                set_level(&mut self.relay2, relay2)?;
                info!("thermal relays set to ({relay1}, {relay2})");
            }
            ActuatorCommand::Relay { relay, on } => {
                let pin = match relay {
                    Relay::Humidifier => &mut self.humidifier,
                    Relay::Exhaust => &mut self.exhaust,
                };
                set_level(pin, on)?;
                info!("relay {} {}", relay.number(), if on { "ON" } else { "OFF" });
            }
            ActuatorCommand::LedDuty(duty) => {
                let max = self.leds.get_max_duty();
                self.leds.set_duty(u32::from(duty) * max / 255)?;
            }
            ActuatorCommand::Damper(position) => {
                let pulse_us = match position {
                    DamperPosition::Closed => SERVO_CLOSED_US,
                    DamperPosition::Open => SERVO_OPEN_US,
                };
                let max = self.damper.get_max_duty();
                self.damper.set_duty(max * pulse_us / SERVO_PERIOD_US)?;
                info!("damper {position:?}");
            }
            ActuatorCommand::Settle(ms) => thread::sleep(Duration::from_millis(ms)),
        }
        Ok(())
    }
}

fn output_pin(pin: i32) -> anyhow::Result<PinDriver<'static, AnyOutputPin, Output>> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to claim GPIO{pin} as output"))?;
    Ok(driver)
}

fn set_level(pin: &mut PinDriver<'static, AnyOutputPin, Output>, high: bool) -> anyhow::Result<()> {
    if high {
        pin.set_high()?;
    } else {
        pin.set_low()?;
    }
    Ok(())
}

impl SensorSuite {
    fn new(
        adc: Arc<AdcDriver<'static, ADC1>>,
        ldr_pin: Gpio34,
        mq7_pin: Gpio35,
        air: Option<I2cDriver<'static>>,
    ) -> anyhow::Result<Self> {
        let adc_config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let ldr = AdcChannelDriver::new(adc.clone(), ldr_pin, &adc_config)?;
        let mq7 = AdcChannelDriver::new(adc, mq7_pin, &adc_config)?;

        let mut dht_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(DHT22_PIN) })?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        unsafe {
            esp_idf_svc::sys::touch_pad_init();
            esp_idf_svc::sys::touch_pad_config(WATER_TOUCH_PAD, 0);
        }

        let air = air.and_then(|mut i2c| match start_ccs811(&mut i2c) {
            Ok(()) => {
                info!("CCS811 air quality sensor started");
                Some(i2c)
            }
            Err(err) => {
                warn!("CCS811 unavailable, CO2/TVOC will not update: {err:#}");
                None
            }
        });

        Ok(Self {
            dht_pin,
            delay: Ets,
            ldr,
            mq7,
            air,
            last_air: None,
        })
    }

    fn read(&mut self, hub: &SensorHub, now_ms: u64) -> SensorReading {
        let climate = if hub.poll_due(SensorChannel::Climate, now_ms) {
            self.read_climate()
        } else {
            Sample::Skipped
        };
        let gas = if hub.poll_due(SensorChannel::Gas, now_ms) {
            self.read_gas()
        } else {
            Sample::Skipped
        };

        SensorReading {
            climate,
            gas,
            co: self.read_co(),
            light: self.ldr.read().map(u32::from).unwrap_or_else(|err| {
                warn!("LDR read failed: {err}");
                0
            }),
            water_low: self.read_water_low(),
        }
    }

    fn read_climate(&mut self) -> Sample<ClimateReading> {
        if let Err(err) = self.dht_pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return Sample::Failed;
        }
        match dht22::blocking::read(&mut self.delay, &mut self.dht_pin) {
            Ok(reading) => Sample::Value(ClimateReading {
                temperature_c: reading.temperature,
                humidity_pct: reading.relative_humidity,
            }),
            Err(err) => {
                debug!("DHT22 read on GPIO{DHT22_PIN} failed: {err:?}");
                Sample::Failed
            }
        }
    }

    fn read_co(&mut self) -> Option<u32> {
        match self.mq7.read() {
            Ok(raw) => Some(u32::from(raw)),
            Err(err) => {
                warn!("MQ-7 read failed: {err}");
                None
            }
        }
    }

    fn read_gas(&mut self) -> Sample<GasReading> {
        let Some(i2c) = self.air.as_mut() else {
            return Sample::Failed;
        };
        match read_ccs811(i2c) {
            Ok(Some(air)) => self.last_air = Some(air),
            Ok(None) => {}
            Err(err) => {
                debug!("CCS811 read failed: {err:#}");
                return Sample::Failed;
            }
        }

        match self.last_air {
            Some((co2_ppm, tvocs_ppb)) => Sample::Value(GasReading { co2_ppm, tvocs_ppb }),
            None => Sample::Skipped,
        }
    }

    /// A failed touch read counts as LOW so the humidifier stays safe.
    fn read_water_low(&mut self) -> bool {
        let mut value: u16 = 0;
        let rc = unsafe { esp_idf_svc::sys::touch_pad_read(WATER_TOUCH_PAD, &mut value) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("water level touch read failed: esp_err_t={rc}");
            return true;
        }
        value <= WATER_LOW_THRESHOLD
    }
}

fn start_ccs811(i2c: &mut I2cDriver<'static>) -> anyhow::Result<()> {
    i2c.write(CCS811_ADDR, &[CCS811_APP_START], BLOCK)?;
    thread::sleep(Duration::from_millis(100));
    i2c.write(CCS811_ADDR, &[CCS811_MEAS_MODE, CCS811_MODE_1S], BLOCK)?;
    Ok(())
}

/// `Ok(None)` when no new sample is ready yet.
fn read_ccs811(i2c: &mut I2cDriver<'static>) -> anyhow::Result<Option<(u32, u32)>> {
    let mut status = [0_u8; 1];
    i2c.write_read(CCS811_ADDR, &[CCS811_STATUS], &mut status, BLOCK)?;
    if status[0] & CCS811_DATA_READY == 0 {
        return Ok(None);
    }

    let mut data = [0_u8; 4];
    i2c.write_read(CCS811_ADDR, &[CCS811_ALG_RESULT], &mut data, BLOCK)?;
    let co2 = u32::from(u16::from_be_bytes([data[0], data[1]]));
    let tvoc = u32::from(u16::from_be_bytes([data[2], data[3]]));
    Ok(Some((co2, tvoc)))
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl SetpointPersistence for NvsSetpointPersistence {
    fn load(&self) -> Result<Option<Setpoints>, StoreError> {
        let _guard = lock(&self.store.lock);
        let nvs = EspNvs::new(self.store.partition.clone(), NVS_SETPOINTS_NAMESPACE, true)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let mut buffer = vec![0_u8; 512];

        let raw = nvs
            .get_str(NVS_SETPOINTS_KEY, &mut buffer)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        match raw {
            Some(value) => Ok(Some(serde_json::from_str::<Setpoints>(value)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, setpoints: &Setpoints) -> Result<(), StoreError> {
        let _guard = lock(&self.store.lock);
        let mut nvs = EspNvs::new(self.store.partition.clone(), NVS_SETPOINTS_NAMESPACE, true)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let payload = serde_json::to_string(setpoints)?;
        nvs.set_str(NVS_SETPOINTS_KEY, &payload)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

impl EspRemote {
    fn publish_json<T: Serialize>(
        &mut self,
        topic: &str,
        retain: bool,
        payload: &T,
    ) -> Result<(), RemoteError> {
        let Some(client) = self.client.as_ref() else {
            return Err(RemoteError::NotReady);
        };
        if !self.flags.remote_ready() {
            return Err(RemoteError::NotReady);
        }
        let body = serde_json::to_vec(payload)?;
        lock(client)
            .enqueue(topic, QoS::AtLeastOnce, retain, &body)
            .map(|_| ())
            .map_err(|err| RemoteError::Transport(err.to_string()))
    }
}

impl RemoteSync for EspRemote {
    fn is_ready(&self) -> bool {
        self.client.is_some() && self.flags.network_up() && self.flags.remote_ready()
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
        lock(&self.inbox).setpoints()
    }

    fn fetch_debug_mode(&mut self) -> bool {
        lock(&self.inbox).debug_mode()
    }

    fn fetch_manual_states(&mut self) -> Option<ManualActuatorStates> {
        lock(&self.inbox).manual_states()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    match output_pin(pin) {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable: {err:#}");
            None
        }
    }
}

fn update_status_led(status_led: &mut Option<StatusLed>, flags: &ConnectivityFlags, now_ms: u64) {
    let Some(led) = status_led.as_mut() else {
        return;
    };

    let desired_on = flags.pattern().is_lit(now_ms);
    if desired_on == led.lit {
        return;
    }

    match set_level(&mut led.pin, desired_on) {
        Ok(()) => led.lit = desired_on,
        Err(err) => warn!("failed to drive status LED: {err:#}"),
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
