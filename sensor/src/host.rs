use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use envsensor_common::{
    config::NetworkConfig, BatteryMonitor, Board, BrokerEvent, ConnectivityProvider, DeviceId,
    Indicator, LifecycleController, MessagingClient, NodeConfig, Peripherals, PortError,
    PowerControl, Reading, SensorReader, SensorStatus, SessionStatus, UpdateAgent, UpdateStatus,
    VoltageSample,
};

const TICK_INTERVAL_MS: u64 = 10;
const LINK_UP_DELAY_MS: u64 = 300;
const UPDATE_DOWNLOAD_STEPS: u32 = 20;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const DEFAULT_CHIP_ID: u32 = 0x00C0_FFEE;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = load_node_config()?;
    config
        .lifecycle
        .apply_overrides(|key| std::env::var(key).ok())
        .context("invalid lifecycle timings")?;

    let chip_id = std::env::var("DEVICE_CHIP_ID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(DEFAULT_CHIP_ID);
    let device_id = DeviceId::from_chip_id(chip_id);

    info!(
        "sensor node {device_id} running firmware {}",
        config.network.firmware_version
    );

    loop {
        let (status, installed_version) = run_session(&config, &device_id).await?;
        config.network.firmware_version = installed_version;

        match status {
            SessionStatus::Sleeping { duration_ms } => {
                info!("simulating deep sleep for {duration_ms} ms");
                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            }
            SessionStatus::Restarting => {
                info!(
                    "restarting into firmware {}",
                    config.network.firmware_version
                );
            }
            SessionStatus::Running => {}
        }
    }
}

/// Runs one boot-to-sleep session and reports how it ended.
async fn run_session(
    config: &NodeConfig,
    device_id: &DeviceId,
) -> anyhow::Result<(SessionStatus, String)> {
    let peripherals = Peripherals::<HostBoard> {
        link: SimulatedLink::default(),
        broker: HostBroker::new(&config.network, device_id),
        updater: SimulatedUpdater::new(&config.network),
        sensor: SimulatedSensor::from_env(),
        battery: SimulatedBattery,
        led: LoggingLed,
        power: HostPower,
    };

    let mut node =
        LifecycleController::new(config.lifecycle.clone(), device_id.clone(), peripherals)
            .context("failed to create lifecycle controller")?;

    let mut status = node.boot();
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));

    while status == SessionStatus::Running {
        interval.tick().await;
        status = node.tick(monotonic_ms());
    }

    let installed = node.peripherals().updater.installed_version().to_string();
    Ok((status, installed))
}

fn load_node_config() -> anyhow::Result<NodeConfig> {
    let mut config = match std::env::var("SENSOR_NODE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read node config `{path}`"))?;
            serde_json::from_str::<NodeConfig>(&raw)
                .with_context(|| format!("invalid node config `{path}`"))?
        }
        Err(_) => NodeConfig::default(),
    };

    let network = &mut config.network;
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
        network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(server) = std::env::var("UPDATE_SERVER") {
        network.update_server = server;
    }
    if network.firmware_version.is_empty() {
        network.firmware_version = env!("CARGO_PKG_VERSION").to_string();
    }

    Ok(config)
}

struct HostBoard;

impl Board for HostBoard {
    type Link = SimulatedLink;
    type Broker = HostBroker;
    type Updater = SimulatedUpdater;
    type Sensor = SimulatedSensor;
    type Battery = SimulatedBattery;
    type Led = LoggingLed;
    type Power = HostPower;
}

#[derive(Default)]
struct SimulatedLink {
    started_at: Option<Instant>,
}

impl ConnectivityProvider for SimulatedLink {
    fn connect(&mut self) -> Result<(), PortError> {
        info!("bringing up simulated network link");
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.started_at
            .is_some_and(|started| started.elapsed() >= Duration::from_millis(LINK_UP_DELAY_MS))
    }
}

/// rumqttc client whose event loop runs on its own task and forwards
/// connection and message events through a channel.
struct HostBroker {
    options: MqttOptions,
    client: Option<AsyncClient>,
    events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
    task: Option<JoinHandle<()>>,
}

impl HostBroker {
    fn new(network: &NetworkConfig, device_id: &DeviceId) -> Self {
        let mut options = MqttOptions::new(
            device_id.as_str(),
            network.mqtt_host.clone(),
            network.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if !network.mqtt_user.is_empty() {
            options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
        }

        Self {
            options,
            client: None,
            events: None,
            task: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, PortError> {
        self.client
            .as_ref()
            .ok_or_else(|| PortError::Broker("client not connected".to_string()))
    }
}

impl MessagingClient for HostBroker {
    fn connect(&mut self) -> Result<(), PortError> {
        if self.client.is_some() {
            return Ok(());
        }

        let (host, port) = self.options.broker_address();
        info!("connecting to mqtt broker {host}:{port}");

        let (client, eventloop) = AsyncClient::new(self.options.clone(), 32);
        let (tx, rx) = mpsc::unbounded_channel();

        self.task = Some(tokio::spawn(forward_events(eventloop, tx)));
        self.client = Some(client);
        self.events = Some(rx);
        Ok(())
    }

    fn poll(&mut self) -> Option<BrokerEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PortError> {
        debug!("publish {topic} {}", String::from_utf8_lossy(payload));
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|err| PortError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), PortError> {
        self.client()?
            .try_subscribe(filter, QoS::AtMostOnce)
            .map_err(|err| PortError::Subscribe {
                filter: filter.to_string(),
                reason: err.to_string(),
            })
    }
}

impl Drop for HostBroker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn forward_events(mut eventloop: EventLoop, events: mpsc::UnboundedSender<BrokerEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => BrokerEvent::Connected,
            Ok(Event::Incoming(Incoming::Publish(message))) => {
                if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                    warn!(
                        "dropping oversized MQTT payload on topic {} ({} bytes)",
                        message.topic,
                        message.payload.len()
                    );
                    continue;
                }
                BrokerEvent::Message {
                    topic: message.topic,
                    payload: message.payload.to_vec(),
                }
            }
            Ok(_) => continue,
            Err(err) => {
                warn!("mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}

/// Pretends to talk to the update server. A download is simulated when
/// `SENSOR_LATEST_VERSION` names a version other than the running one.
struct SimulatedUpdater {
    server: String,
    installed: String,
    pending: Option<(String, u32)>,
}

impl SimulatedUpdater {
    fn new(network: &NetworkConfig) -> Self {
        Self {
            server: network.update_server.clone(),
            installed: network.firmware_version.clone(),
            pending: None,
        }
    }

    fn installed_version(&self) -> &str {
        &self.installed
    }
}

impl UpdateAgent for SimulatedUpdater {
    fn start_update(&mut self) -> UpdateStatus {
        if self.pending.is_some() {
            return UpdateStatus::InProgress;
        }

        info!(
            "checking {} for firmware newer than {}",
            self.server, self.installed
        );

        match std::env::var("SENSOR_LATEST_VERSION") {
            Ok(latest) if !latest.is_empty() && latest != self.installed => {
                info!("firmware {latest} available; downloading");
                self.pending = Some((latest, UPDATE_DOWNLOAD_STEPS));
                UpdateStatus::InProgress
            }
            _ => {
                info!("firmware {} is up to date", self.installed);
                UpdateStatus::Idle
            }
        }
    }

    fn poll(&mut self) -> UpdateStatus {
        let Some((version, steps_left)) = self.pending.as_mut() else {
            return UpdateStatus::Idle;
        };

        *steps_left = steps_left.saturating_sub(1);
        if *steps_left > 0 {
            return UpdateStatus::InProgress;
        }

        info!("firmware {version} flashed");
        self.installed = std::mem::take(version);
        self.pending = None;
        UpdateStatus::RestartRequired
    }
}

/// Produces `SENSOR_SIM_FAILURES` failed transactions per session before
/// returning plausible values.
struct SimulatedSensor {
    failures_left: u32,
    failure: SensorStatus,
}

impl SimulatedSensor {
    fn from_env() -> Self {
        let failures_left = std::env::var("SENSOR_SIM_FAILURES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        let failure = match std::env::var("SENSOR_SIM_ERROR").as_deref() {
            Ok("timeout") => SensorStatus::TimeoutError,
            Ok("unknown") => SensorStatus::UnknownError,
            _ => SensorStatus::ChecksumError,
        };

        Self {
            failures_left,
            failure,
        }
    }
}

impl SensorReader for SimulatedSensor {
    fn read(&mut self) -> Reading {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Reading::failed(self.failure);
        }

        // Hardware integration point: the esp32 build reads a DHT22 here.
        let step = (monotonic_ms() / 1_000) % 8;
        let temperature = 21.0 + step as f32 * 0.5;
        let humidity = 45.0 + step as f32 * 0.4;
        Reading::ok(temperature, humidity)
    }
}

struct SimulatedBattery;

impl BatteryMonitor for SimulatedBattery {
    fn read_voltage(&mut self) -> VoltageSample {
        VoltageSample {
            volts: 3.3,
            raw: 3072,
        }
    }
}

struct LoggingLed;

impl Indicator for LoggingLed {
    fn set(&mut self, on: bool) {
        info!("indicator {}", if on { "on" } else { "off" });
    }
}

struct HostPower;

impl PowerControl for HostPower {
    fn deep_sleep(&mut self, duration_ms: u64) {
        info!("deep sleep requested for {duration_ms} ms");
    }

    fn restart(&mut self) {
        info!("restart requested");
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
