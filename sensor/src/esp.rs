use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::{dht22, DhtError};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::Read,
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Gpio34, IOPin, InputOutput, Output, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals as HalPeripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    wifi::EspWifi,
};
use log::{info, warn};
use sha2::{Digest, Sha256};

use envsensor_common::{
    config::{self, NetworkConfig},
    BatteryMonitor, Board, BrokerEvent, CheckGate, ConfigError, ConnectivityProvider, DeviceId,
    Indicator, LifecycleConfig, LifecycleController, MessagingClient, PendingCheck, Peripherals,
    PortError, PowerControl, Reading, SensorReader, SensorStatus, SessionStatus, UpdateAgent, UpdateStatus,
    VoltageSample,
};

// Build-time configuration; a missing variable fails the build.
const WIFI_SSID: &str = env!("WIFI_SSID");
const WIFI_PASS: &str = env!("WIFI_PASS");
const MQTT_HOST: &str = env!("MQTT_HOST");
const UPDATE_SERVER: &str = env!("UPDATE_SERVER");
const FIRMWARE_VERSION: &str = env!("FIRMWARE_VERSION");
const MQTT_PORT: u16 = 1883;

const DHT22_PIN: i32 = 4;
const TICK_INTERVAL_MS: u64 = 10;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const OTA_CHUNK_SIZE: usize = 4096;
// Battery is measured through a 1:1 resistor divider.
const BATTERY_DIVIDER_RATIO: f32 = 2.0;

struct EspBoard;

impl Board for EspBoard {
    type Link = EspLink;
    type Broker = EspBroker;
    type Updater = HttpUpdater;
    type Sensor = Dht22Sensor;
    type Battery = AdcBattery;
    type Led = ActiveLowLed;
    type Power = EspPower;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let network = build_network_config();
    let lifecycle = build_lifecycle_config().context("invalid lifecycle timings")?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let HalPeripherals {
        modem, pins, adc1, ..
    } = HalPeripherals::take()?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let device_id = DeviceId::from_chip_id(read_chip_id()?);
    info!("node {device_id} running firmware {FIRMWARE_VERSION}");

    let link = EspLink::new(modem, sys_loop, nvs_partition, &network)
        .context("failed to initialize wifi")?;
    let updater = HttpUpdater::new(&network, &device_id, link.status());

    let peripherals = Peripherals::<EspBoard> {
        link,
        broker: EspBroker::new(&network, &device_id),
        updater,
        sensor: Dht22Sensor::new(pins.gpio4.downgrade())
            .context("failed to initialize DHT22")?,
        battery: AdcBattery::new(adc1, pins.gpio34).context("failed to initialize battery ADC")?,
        led: ActiveLowLed::new(pins.gpio2.downgrade_output())
            .context("failed to initialize indicator LED")?,
        power: EspPower,
    };

    let mut node = LifecycleController::new(lifecycle, device_id, peripherals)
        .context("invalid lifecycle configuration")?;

    let started = Instant::now();
    let mut status = node.boot();
    while status == SessionStatus::Running {
        feed_watchdog();
        let now_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        status = node.tick(now_ms);
        thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
    }

    // Deep sleep and restart do not return on hardware.
    Ok(())
}

fn build_network_config() -> NetworkConfig {
    NetworkConfig {
        wifi_ssid: WIFI_SSID.to_string(),
        wifi_pass: WIFI_PASS.to_string(),
        mqtt_host: MQTT_HOST.to_string(),
        mqtt_port: MQTT_PORT,
        mqtt_user: option_env!("MQTT_USER").unwrap_or_default().to_string(),
        mqtt_pass: option_env!("MQTT_PASS").unwrap_or_default().to_string(),
        update_server: UPDATE_SERVER.to_string(),
        firmware_version: FIRMWARE_VERSION.to_string(),
    }
}

/// Timings default to the stock session and may be overridden at build time.
fn build_lifecycle_config() -> Result<LifecycleConfig, ConfigError> {
    let mut lifecycle = LifecycleConfig::default();
    lifecycle.apply_overrides(|key| {
        let value = match key {
            config::ENV_SENSOR_RETRY_ATTEMPTS => option_env!("SENSOR_RETRY_ATTEMPTS"),
            config::ENV_SENSOR_RETRY_INTERVAL_MS => option_env!("SENSOR_RETRY_INTERVAL_MS"),
            config::ENV_SLEEP_DEADLINE_MS => option_env!("SLEEP_DEADLINE_MS"),
            config::ENV_DEEP_SLEEP_MS => option_env!("DEEP_SLEEP_MS"),
            _ => None,
        };
        value.map(str::to_string)
    })?;
    Ok(lifecycle)
}

/// Lower three bytes of the factory MAC, the same value the chip reports as
/// its id.
fn read_chip_id() -> anyhow::Result<u32> {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("esp_efuse_mac_get_default failed with code {rc}"));
    }
    Ok(u32::from_be_bytes([0, mac[3], mac[4], mac[5]]))
}

struct EspLink {
    wifi: EspWifi<'static>,
    ssid: String,
    last_attempt: Option<Instant>,
    up: Arc<AtomicBool>,
}

impl EspLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

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

        Ok(Self {
            wifi,
            ssid: network.wifi_ssid.clone(),
            last_attempt: None,
            up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Station state as last observed by `is_connected`.
    fn status(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.up)
    }

    fn attempt(&mut self) -> Result<(), PortError> {
        self.last_attempt = Some(Instant::now());
        self.wifi
            .connect()
            .map_err(|err| PortError::Link(format!("{err:?}")))
    }
}

impl ConnectivityProvider for EspLink {
    fn connect(&mut self) -> Result<(), PortError> {
        self.wifi
            .start()
            .map_err(|err| PortError::Link(format!("{err:?}")))?;
        info!("wifi started, connecting to `{}`", self.ssid);
        self.attempt()
    }

    fn is_connected(&mut self) -> bool {
        let up = self.wifi.is_connected().unwrap_or(false)
            && self.wifi.sta_netif().is_up().unwrap_or(false);
        self.up.store(up, Ordering::Release);
        if up {
            return true;
        }

        let retry_due = self
            .last_attempt
            .is_some_and(|at| at.elapsed() >= Duration::from_millis(WIFI_RETRY_DELAY_MS));
        if retry_due {
            if let Err(err) = self.attempt() {
                warn!("wifi reconnect attempt failed: {err}");
            }
        }
        false
    }
}

/// esp-mqtt client; its callback runs on the MQTT task and hands events to the
/// scheduler loop through a channel.
struct EspBroker {
    url: String,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    client: Option<EspMqttClient<'static>>,
    events_tx: mpsc::Sender<BrokerEvent>,
    events: mpsc::Receiver<BrokerEvent>,
}

impl EspBroker {
    fn new(network: &NetworkConfig, device_id: &DeviceId) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            url: format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port),
            client_id: device_id.to_string(),
            username: (!network.mqtt_user.is_empty()).then(|| network.mqtt_user.clone()),
            password: (!network.mqtt_pass.is_empty()).then(|| network.mqtt_pass.clone()),
            client: None,
            events_tx,
            events,
        }
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, PortError> {
        self.client
            .as_mut()
            .ok_or_else(|| PortError::Broker("client not connected".to_string()))
    }
}

impl MessagingClient for EspBroker {
    fn connect(&mut self) -> Result<(), PortError> {
        if self.client.is_some() {
            return Ok(());
        }

        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id.as_str()),
            username: self.username.as_deref(),
            password: self.password.as_deref(),
            ..Default::default()
        };

        let tx = self.events_tx.clone();
        let client = EspMqttClient::new_cb(&self.url, &conf, move |event| {
            let forwarded = match event.payload() {
                EventPayload::Connected(_) => Some(BrokerEvent::Connected),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    ..
                } => Some(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                }),
                EventPayload::Disconnected => {
                    warn!("mqtt disconnected");
                    None
                }
                _ => None,
            };

            if let Some(event) = forwarded {
                let _ = tx.send(event);
            }
        })
        .map_err(|err| PortError::Broker(format!("{err:?}")))?;

        info!("connecting to mqtt broker {}", self.url);
        self.client = Some(client);
        Ok(())
    }

    fn poll(&mut self) -> Option<BrokerEvent> {
        self.events.try_recv().ok()
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PortError> {
        self.client()?
            .enqueue(topic, QoS::AtLeastOnce, false, payload)
            .map(|_| ())
            .map_err(|err| PortError::Publish {
                topic: topic.to_string(),
                reason: format!("{err:?}"),
            })
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), PortError> {
        self.client()?
            .subscribe(filter, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| PortError::Subscribe {
                filter: filter.to_string(),
                reason: format!("{err:?}"),
            })
    }
}

/// Asks the update server for an image newer than the running version.
///
/// The server answers 304 when the node is current and 200 with the image
/// otherwise. A requested check runs on the first `poll` that sees the station
/// up; a successful flash blocks the scheduler until the image is written.
struct HttpUpdater {
    url: String,
    version: String,
    device_id: String,
    link_up: Arc<AtomicBool>,
    check: PendingCheck,
}

impl HttpUpdater {
    fn new(network: &NetworkConfig, device_id: &DeviceId, link_up: Arc<AtomicBool>) -> Self {
        Self {
            url: format!("http://{}/firmware", network.update_server),
            version: network.firmware_version.clone(),
            device_id: device_id.to_string(),
            link_up,
            check: PendingCheck::default(),
        }
    }

    fn check_and_flash(&self) -> anyhow::Result<bool> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
        let headers = [
            ("x-firmware-version", self.version.as_str()),
            ("x-device-id", self.device_id.as_str()),
        ];
        let request = client.request(Method::Get, &self.url, &headers)?;
        let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

        let status = response.status();
        if status == 304 {
            info!("firmware {} is up to date", self.version);
            return Ok(false);
        }
        if !(200..300).contains(&status) {
            return Err(anyhow!("update check failed with HTTP {status}"));
        }

        let expected_sha256 = response
            .header("x-firmware-sha256")
            .map(|value| value.trim().to_ascii_lowercase());

        let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
        let mut update = ota
            .initiate_update()
            .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

        let mut hasher = Sha256::new();
        let mut total_written = 0_u64;
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];

        loop {
            feed_watchdog();
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                break;
            }

            update
                .write(&chunk[..read])
                .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
            hasher.update(&chunk[..read]);
            total_written = total_written.saturating_add(read as u64);
        }

        if total_written == 0 {
            return Err(anyhow!("firmware image is empty"));
        }

        let digest_hex: String = hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();

        if let Some(expected) = expected_sha256 {
            if digest_hex != expected {
                return Err(anyhow!(
                    "sha256 mismatch (expected {expected}, got {digest_hex})"
                ));
            }
        }

        update
            .complete()
            .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;

        info!("flashed {total_written} byte image (sha256 {digest_hex})");
        Ok(true)
    }
}

impl UpdateAgent for HttpUpdater {
    fn start_update(&mut self) -> UpdateStatus {
        self.check.request();
        UpdateStatus::InProgress
    }

    fn poll(&mut self) -> UpdateStatus {
        match self.check.poll(self.link_up.load(Ordering::Acquire)) {
            CheckGate::Idle => return UpdateStatus::Idle,
            CheckGate::Waiting => return UpdateStatus::InProgress,
            CheckGate::Run => {}
        }

        match self.check_and_flash() {
            Ok(true) => UpdateStatus::RestartRequired,
            Ok(false) => UpdateStatus::Idle,
            Err(err) => {
                warn!("firmware update check failed: {err:#}");
                UpdateStatus::Idle
            }
        }
    }
}

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl SensorReader for Dht22Sensor {
    fn read(&mut self) -> Reading {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return Reading::failed(SensorStatus::UnknownError);
        }

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                info!(
                    "[DHT22] {:.1}°C {:.1}%",
                    reading.temperature, reading.relative_humidity
                );
                Reading::ok(reading.temperature, reading.relative_humidity)
            }
            Err(DhtError::ChecksumMismatch { .. }) => Reading::failed(SensorStatus::ChecksumError),
            Err(DhtError::Timeout { .. }) => Reading::failed(SensorStatus::TimeoutError),
            Err(err) => {
                warn!("failed to read DHT22 on GPIO{DHT22_PIN}: {err:?}");
                Reading::failed(SensorStatus::UnknownError)
            }
        }
    }
}

struct AdcBattery {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AdcBattery {
    fn new(adc: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let adc = AdcDriver::new(adc)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(adc, pin, &config)?;
        Ok(Self { channel })
    }
}

impl BatteryMonitor for AdcBattery {
    fn read_voltage(&mut self) -> VoltageSample {
        let raw = self.channel.read_raw().unwrap_or_else(|err| {
            warn!("battery ADC raw read failed: {err:?}");
            0
        });
        let millivolts = self.channel.read().unwrap_or_else(|err| {
            warn!("battery ADC read failed: {err:?}");
            0
        });

        VoltageSample {
            volts: f32::from(millivolts) / 1_000.0 * BATTERY_DIVIDER_RATIO,
            raw,
        }
    }
}

/// On-board LED, lit when the pin is driven low.
struct ActiveLowLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl ActiveLowLed {
    fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)?;
        pin.set_high()?;
        Ok(Self { pin })
    }
}

impl Indicator for ActiveLowLed {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };
        if let Err(err) = result {
            warn!("failed to drive indicator LED: {err:?}");
        }
    }
}

struct EspPower;

impl PowerControl for EspPower {
    fn deep_sleep(&mut self, duration_ms: u64) {
        info!("entering deep sleep for {} s", duration_ms / 1_000);
        unsafe { esp_idf_svc::sys::esp_deep_sleep(duration_ms.saturating_mul(1_000)) }
    }

    fn restart(&mut self) {
        thread::sleep(Duration::from_millis(100));
        esp_idf_svc::hal::reset::restart();
    }
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
