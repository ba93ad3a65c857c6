//! Boot-to-sleep sequencing for one power-on session.
//!
//! The controller is driven by a single cooperative loop: call [`boot`] once,
//! then [`tick`] repeatedly with a monotonic millisecond clock until it reports
//! something other than [`SessionStatus::Running`].
//!
//! [`boot`]: LifecycleController::boot
//! [`tick`]: LifecycleController::tick

use log::{debug, info, warn};

use crate::{
    config::LifecycleConfig,
    dispatch::Command,
    error::ConfigError,
    ports::{
        BatteryMonitor, Board, BrokerEvent, BrokerEvents, ConnectivityProvider, Indicator,
        MessagingClient, Peripherals, PowerControl, SensorReader, UpdateAgent, UpdateStatus,
    },
    topics::{DeviceId, TopicNamespace, TOPIC_CMD_FIRMWARE_UPDATE, TOPIC_CMD_INDICATOR},
    trigger::{PeriodicTrigger, Repeat},
    types::{LifecycleState, Reading, SessionStatus},
};

// Bounds the time spent draining the broker per tick.
const MAX_BROKER_EVENTS_PER_TICK: usize = 8;

pub struct LifecycleController<B: Board> {
    config: LifecycleConfig,
    device_id: DeviceId,
    topics: TopicNamespace,
    peripherals: Peripherals<B>,

    state: LifecycleState,
    sensor_retry: PeriodicTrigger,
    sleep_deadline: PeriodicTrigger,

    // Publish-once latch.
    published: bool,
    session_armed: bool,
    indicator_on: bool,
    attempts: u32,
}

impl<B: Board> LifecycleController<B> {
    pub fn new(
        config: LifecycleConfig,
        device_id: DeviceId,
        peripherals: Peripherals<B>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let topics = TopicNamespace::new(&device_id);
        let sensor_retry = PeriodicTrigger::new(
            config.sensor_retry_interval_ms,
            Repeat::Times(config.sensor_retry_attempts),
        );
        let sleep_deadline = PeriodicTrigger::once(config.sleep_deadline_ms);

        Ok(Self {
            config,
            device_id,
            topics,
            peripherals,
            state: LifecycleState::Booting,
            sensor_retry,
            sleep_deadline,
            published: false,
            session_armed: false,
            indicator_on: false,
            attempts: 0,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn topics(&self) -> &TopicNamespace {
        &self.topics
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn is_latched(&self) -> bool {
        self.published
    }

    pub fn indicator_on(&self) -> bool {
        self.indicator_on
    }

    /// Sensor transactions performed this session.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn peripherals(&self) -> &Peripherals<B> {
        &self.peripherals
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            LifecycleState::Sleeping => SessionStatus::Sleeping {
                duration_ms: self.config.deep_sleep_ms,
            },
            LifecycleState::Restarting => SessionStatus::Restarting,
            _ => SessionStatus::Running,
        }
    }

    pub fn boot(&mut self) -> SessionStatus {
        if self.state != LifecycleState::Booting {
            warn!("boot requested in state {}", self.state.as_str());
            return self.status();
        }

        info!("booting node {}", self.device_id);
        self.set_indicator(false);

        if self.peripherals.updater.start_update() == UpdateStatus::RestartRequired {
            return self.abort_for_update();
        }

        if let Err(err) = self.peripherals.link.connect() {
            warn!("failed to start network link: {err}");
        }
        self.state = LifecycleState::WifiConnecting;

        SessionStatus::Running
    }

    pub fn tick(&mut self, now_ms: u64) -> SessionStatus {
        match self.state {
            LifecycleState::Booting => return self.boot(),
            state if state.is_terminal() => return self.status(),
            _ => {}
        }

        if self.state == LifecycleState::WifiConnecting && self.peripherals.link.is_connected() {
            info!("network link up; connecting to broker");
            self.state = LifecycleState::BrokerConnecting;
            if let Err(err) = self.peripherals.broker.connect() {
                warn!("failed to start broker connection: {err}");
            }
        }

        self.service_broker(now_ms);
        if self.state.is_terminal() {
            return self.status();
        }

        if self.peripherals.updater.poll() == UpdateStatus::RestartRequired {
            return self.abort_for_update();
        }

        if self.sensor_retry.poll(now_ms) {
            self.attempt_sensor_publish();
        }

        if self.state == LifecycleState::Active && (self.published || !self.sensor_retry.is_armed())
        {
            info!(
                "sensor window closed after {} attempt(s), published={}",
                self.attempts, self.published
            );
            self.state = LifecycleState::SleepArmed;
        }

        if self.sleep_deadline.poll(now_ms) {
            return self.enter_deep_sleep();
        }

        SessionStatus::Running
    }

    fn service_broker(&mut self, now_ms: u64) {
        for _ in 0..MAX_BROKER_EVENTS_PER_TICK {
            let Some(event) = self.peripherals.broker.poll() else {
                break;
            };

            match event {
                BrokerEvent::Connected => self.on_connected(now_ms),
                BrokerEvent::Message { topic, payload } => self.on_message(&topic, &payload),
            }

            if self.state.is_terminal() {
                break;
            }
        }
    }

    fn subscribe_commands(&mut self) {
        for filter in [TOPIC_CMD_INDICATOR, TOPIC_CMD_FIRMWARE_UPDATE] {
            if let Err(err) = self.peripherals.broker.subscribe(filter) {
                warn!("{err}");
            }
        }
    }

    fn publish_voltage(&mut self) {
        let sample = self.peripherals.battery.read_voltage();
        info!("battery voltage {:.3} V (raw {})", sample.volts, sample.raw);

        let broker = &mut self.peripherals.broker;
        publish(broker, &self.topics.voltage, sample.payload().as_bytes());
        publish(broker, &self.topics.debug, sample.debug_dump().as_bytes());
    }

    fn attempt_sensor_publish(&mut self) {
        if self.published {
            debug!("sensor values already published; skipping attempt");
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        let reading = self.peripherals.sensor.read();
        let marker = reading.status.debug_marker();

        if !reading.status.is_ok() {
            warn!(
                "sensor attempt {}/{} failed: {marker}",
                self.attempts, self.config.sensor_retry_attempts
            );
            publish(
                &mut self.peripherals.broker,
                &self.topics.debug,
                marker.as_bytes(),
            );
            return;
        }

        let delivered = self.publish_reading(&reading);
        publish(
            &mut self.peripherals.broker,
            &self.topics.debug,
            marker.as_bytes(),
        );

        if delivered {
            info!(
                "published {:.1} C / {:.1} % on attempt {}",
                reading.temperature, reading.humidity, self.attempts
            );
            self.published = true;
        } else {
            warn!("sensor values were not fully delivered; will retry");
        }
    }

    fn publish_reading(&mut self, reading: &Reading) -> bool {
        let broker = &mut self.peripherals.broker;

        let combined = match serde_json::to_string(&reading.combined()) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode combined payload: {err}");
                return false;
            }
        };

        // Every topic is attempted even if an earlier one was rejected.
        let results = [
            publish(
                broker,
                &self.topics.temperature,
                reading.temperature_payload().as_bytes(),
            ),
            publish(
                broker,
                &self.topics.humidity,
                reading.humidity_payload().as_bytes(),
            ),
            publish(broker, &self.topics.combined, combined.as_bytes()),
        ];

        results.iter().all(|delivered| *delivered)
    }

    fn set_indicator(&mut self, on: bool) {
        self.indicator_on = on;
        self.peripherals.led.set(on);
    }

    fn enter_deep_sleep(&mut self) -> SessionStatus {
        info!(
            "sleep deadline reached; deep sleep for {} s",
            self.config.deep_sleep_ms / 1_000
        );
        self.state = LifecycleState::Sleeping;
        self.peripherals.power.deep_sleep(self.config.deep_sleep_ms);
        self.status()
    }

    fn abort_for_update(&mut self) -> SessionStatus {
        warn!("new firmware flashed; restarting");
        self.state = LifecycleState::Restarting;
        self.peripherals.power.restart();
        self.status()
    }
}

impl<B: Board> BrokerEvents for LifecycleController<B> {
    fn on_connected(&mut self, now_ms: u64) {
        if self.state.is_terminal() {
            return;
        }

        info!("broker connected");
        self.subscribe_commands();

        if self.session_armed {
            // Voltage and both triggers are once per session.
            return;
        }
        self.session_armed = true;

        self.publish_voltage();
        self.sensor_retry.start(now_ms);
        self.sleep_deadline.start(now_ms);
        self.state = LifecycleState::Active;
    }

    fn on_message(&mut self, topic: &str, payload: &[u8]) {
        if self.state.is_terminal() {
            debug!("session over; dropping message on `{topic}`");
            return;
        }

        match Command::classify(topic, payload) {
            Command::Indicator(command) => self.set_indicator(command.is_on()),
            Command::FirmwareUpdate => {
                info!("firmware update requested via `{topic}`");
                if self.peripherals.updater.start_update() == UpdateStatus::RestartRequired {
                    self.abort_for_update();
                }
            }
            Command::Ignored => debug!("ignoring message on `{topic}`"),
        }
    }
}

fn publish<M: MessagingClient>(broker: &mut M, topic: &str, payload: &[u8]) -> bool {
    match broker.publish(topic, payload) {
        Ok(()) => true,
        Err(err) => {
            warn!("{err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        collections::{HashMap, VecDeque},
        rc::Rc,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::PortError,
        types::{SensorStatus, VoltageSample},
        update::{CheckGate, PendingCheck},
    };

    #[derive(Default)]
    struct Recorder {
        link_up: bool,
        link_connects: u32,
        broker_connects: u32,
        events: VecDeque<BrokerEvent>,
        published: Vec<(String, String)>,
        subscriptions: Vec<String>,
        rejections: HashMap<String, u32>,
        update_starts: u32,
        start_status: Option<UpdateStatus>,
        poll_statuses: VecDeque<UpdateStatus>,
        // When set, update checks wait for the link like the HTTP agent does;
        // `checks_run` records the link state each check ran under.
        deferred: Option<PendingCheck>,
        checks_run: Vec<bool>,
        readings: VecDeque<Reading>,
        reads: u32,
        led: Vec<bool>,
        sleeps: Vec<u64>,
        restarts: u32,
    }

    #[derive(Clone, Default)]
    struct Fake(Rc<RefCell<Recorder>>);

    impl ConnectivityProvider for Fake {
        fn connect(&mut self) -> Result<(), PortError> {
            self.0.borrow_mut().link_connects += 1;
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            self.0.borrow().link_up
        }
    }

    impl MessagingClient for Fake {
        fn connect(&mut self) -> Result<(), PortError> {
            self.0.borrow_mut().broker_connects += 1;
            Ok(())
        }

        fn poll(&mut self) -> Option<BrokerEvent> {
            self.0.borrow_mut().events.pop_front()
        }

        fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PortError> {
            let mut rec = self.0.borrow_mut();
            if let Some(remaining) = rec.rejections.get_mut(topic).filter(|left| **left > 0) {
                *remaining -= 1;
                return Err(PortError::Publish {
                    topic: topic.to_string(),
                    reason: "queue full".to_string(),
                });
            }
            rec.published.push((
                topic.to_string(),
                String::from_utf8_lossy(payload).into_owned(),
            ));
            Ok(())
        }

        fn subscribe(&mut self, filter: &str) -> Result<(), PortError> {
            self.0.borrow_mut().subscriptions.push(filter.to_string());
            Ok(())
        }
    }

    impl UpdateAgent for Fake {
        fn start_update(&mut self) -> UpdateStatus {
            let mut rec = self.0.borrow_mut();
            rec.update_starts += 1;
            if let Some(check) = rec.deferred.as_mut() {
                check.request();
                return UpdateStatus::InProgress;
            }
            rec.start_status.unwrap_or(UpdateStatus::Idle)
        }

        fn poll(&mut self) -> UpdateStatus {
            let mut rec = self.0.borrow_mut();
            let link_up = rec.link_up;
            let gate = rec.deferred.as_mut().map(|check| check.poll(link_up));
            match gate {
                Some(CheckGate::Idle) => UpdateStatus::Idle,
                Some(CheckGate::Waiting) => UpdateStatus::InProgress,
                Some(CheckGate::Run) => {
                    rec.checks_run.push(link_up);
                    UpdateStatus::Idle
                }
                None => rec.poll_statuses.pop_front().unwrap_or(UpdateStatus::Idle),
            }
        }
    }

    impl SensorReader for Fake {
        fn read(&mut self) -> Reading {
            let mut rec = self.0.borrow_mut();
            rec.reads += 1;
            rec.readings
                .pop_front()
                .unwrap_or(Reading::failed(SensorStatus::TimeoutError))
        }
    }

    impl BatteryMonitor for Fake {
        fn read_voltage(&mut self) -> VoltageSample {
            VoltageSample {
                volts: 3.3,
                raw: 3072,
            }
        }
    }

    impl Indicator for Fake {
        fn set(&mut self, on: bool) {
            self.0.borrow_mut().led.push(on);
        }
    }

    impl PowerControl for Fake {
        fn deep_sleep(&mut self, duration_ms: u64) {
            self.0.borrow_mut().sleeps.push(duration_ms);
        }

        fn restart(&mut self) {
            self.0.borrow_mut().restarts += 1;
        }
    }

    struct FakeBoard;

    impl Board for FakeBoard {
        type Link = Fake;
        type Broker = Fake;
        type Updater = Fake;
        type Sensor = Fake;
        type Battery = Fake;
        type Led = Fake;
        type Power = Fake;
    }

    const DEBUG: &str = "devices/ESP_7/debug";
    const TEMP: &str = "devices/ESP_7/temp";
    const HUM: &str = "devices/ESP_7/hum";
    const DHT: &str = "devices/ESP_7/dht";
    const VOLTAGE: &str = "devices/ESP_7/voltage";

    fn controller(fake: &Fake) -> LifecycleController<FakeBoard> {
        let peripherals = Peripherals {
            link: fake.clone(),
            broker: fake.clone(),
            updater: fake.clone(),
            sensor: fake.clone(),
            battery: fake.clone(),
            led: fake.clone(),
            power: fake.clone(),
        };
        LifecycleController::new(
            LifecycleConfig::default(),
            DeviceId::from_chip_id(7),
            peripherals,
        )
        .unwrap()
    }

    /// Boots, brings the link up and delivers the broker connect at `t = 0`.
    fn connected(fake: &Fake) -> LifecycleController<FakeBoard> {
        let mut node = controller(fake);
        assert_eq!(node.boot(), SessionStatus::Running);
        fake.0.borrow_mut().link_up = true;
        fake.0.borrow_mut().events.push_back(BrokerEvent::Connected);
        assert_eq!(node.tick(0), SessionStatus::Running);
        node
    }

    /// Ticks every 100 ms in `(from, to]`, returning the time of the first
    /// non-running status.
    fn run(
        node: &mut LifecycleController<FakeBoard>,
        from: u64,
        to: u64,
    ) -> Option<(u64, SessionStatus)> {
        let mut now = from;
        while now < to {
            now += 100;
            let status = node.tick(now);
            if status != SessionStatus::Running {
                return Some((now, status));
            }
        }
        None
    }

    fn payloads(fake: &Fake, topic: &str) -> Vec<String> {
        fake.0
            .borrow()
            .published
            .iter()
            .filter(|(published, _)| published == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn sensor_markers(fake: &Fake) -> Vec<String> {
        payloads(fake, DEBUG)
            .into_iter()
            .filter(|payload| !payload.starts_with("vcc"))
            .collect()
    }

    fn queue_readings(fake: &Fake, readings: impl IntoIterator<Item = Reading>) {
        fake.0.borrow_mut().readings.extend(readings);
    }

    #[test]
    fn boot_starts_update_check_and_link() {
        let fake = Fake::default();
        let mut node = controller(&fake);

        assert_eq!(node.state(), LifecycleState::Booting);
        assert_eq!(node.boot(), SessionStatus::Running);

        assert_eq!(node.state(), LifecycleState::WifiConnecting);
        let rec = fake.0.borrow();
        assert_eq!(rec.update_starts, 1);
        assert_eq!(rec.link_connects, 1);
        assert_eq!(rec.led, vec![false]);
    }

    #[test]
    fn waits_for_link_before_broker() {
        let fake = Fake::default();
        let mut node = controller(&fake);
        node.boot();

        assert_eq!(run(&mut node, 0, 2_000), None);
        assert_eq!(node.state(), LifecycleState::WifiConnecting);
        assert_eq!(fake.0.borrow().broker_connects, 0);

        fake.0.borrow_mut().link_up = true;
        node.tick(2_100);
        assert_eq!(node.state(), LifecycleState::BrokerConnecting);
        assert_eq!(fake.0.borrow().broker_connects, 1);
    }

    #[test]
    fn subscriptions_and_voltage_precede_sensor_data() {
        let fake = Fake::default();
        queue_readings(&fake, [Reading::ok(20.0, 50.0)]);
        let mut node = connected(&fake);

        assert_eq!(node.state(), LifecycleState::Active);
        assert_eq!(
            fake.0.borrow().subscriptions,
            vec!["foo/+/baz".to_string(), "otaUpdate/all".to_string()]
        );
        assert_eq!(payloads(&fake, VOLTAGE), vec!["3.30".to_string()]);
        assert_eq!(fake.0.borrow().reads, 0);

        run(&mut node, 0, 1_000);
        let rec = fake.0.borrow();
        let first_sensor = rec
            .published
            .iter()
            .position(|(topic, _)| topic == TEMP)
            .unwrap();
        let voltage = rec
            .published
            .iter()
            .position(|(topic, _)| topic == VOLTAGE)
            .unwrap();
        assert!(voltage < first_sensor);
    }

    #[test]
    fn checksum_errors_then_success() {
        let fake = Fake::default();
        queue_readings(
            &fake,
            [
                Reading::failed(SensorStatus::ChecksumError),
                Reading::failed(SensorStatus::ChecksumError),
                Reading::failed(SensorStatus::ChecksumError),
                Reading::failed(SensorStatus::ChecksumError),
                Reading::ok(21.5, 48.2),
            ],
        );
        let mut node = connected(&fake);

        assert_eq!(run(&mut node, 0, 14_000), None);

        assert_eq!(
            sensor_markers(&fake),
            vec![
                "DHTLIB_ERROR_CHECKSUM",
                "DHTLIB_ERROR_CHECKSUM",
                "DHTLIB_ERROR_CHECKSUM",
                "DHTLIB_ERROR_CHECKSUM",
                "DHTLIB_OK",
            ]
        );
        assert_eq!(payloads(&fake, TEMP), vec!["21.5"]);
        assert_eq!(payloads(&fake, HUM), vec!["48.2"]);
        assert_eq!(
            payloads(&fake, DHT),
            vec![r#"{"temperature":21.5,"humidity":48.2}"#]
        );
        assert_eq!(fake.0.borrow().reads, 5);
        assert!(node.is_latched());
        assert_eq!(node.state(), LifecycleState::SleepArmed);
    }

    #[test]
    fn latch_stops_attempts_after_first_success() {
        let fake = Fake::default();
        queue_readings(
            &fake,
            [
                Reading::failed(SensorStatus::TimeoutError),
                Reading::ok(19.0, 40.0),
                Reading::ok(25.0, 60.0),
            ],
        );
        let mut node = connected(&fake);

        run(&mut node, 0, 14_000);

        assert_eq!(fake.0.borrow().reads, 2);
        assert_eq!(node.attempts(), 2);
        assert_eq!(payloads(&fake, TEMP), vec!["19"]);
        assert_eq!(
            sensor_markers(&fake),
            vec!["DHTLIB_ERROR_TIMEOUT", "DHTLIB_OK"]
        );
    }

    #[test]
    fn all_timeouts_publish_nothing_and_still_sleep() {
        let fake = Fake::default();
        queue_readings(
            &fake,
            std::iter::repeat(Reading::failed(SensorStatus::TimeoutError)).take(5),
        );
        let mut node = connected(&fake);

        let (at, status) = run(&mut node, 0, 30_000).unwrap();

        assert_eq!(status, SessionStatus::Sleeping { duration_ms: 900_000 });
        assert_eq!(at, 15_000);
        assert!(payloads(&fake, TEMP).is_empty());
        assert!(payloads(&fake, HUM).is_empty());
        assert!(payloads(&fake, DHT).is_empty());
        assert_eq!(sensor_markers(&fake), vec!["DHTLIB_ERROR_TIMEOUT"; 5]);
        assert_eq!(fake.0.borrow().sleeps, vec![900_000]);
    }

    #[test]
    fn unknown_errors_get_their_own_marker() {
        let fake = Fake::default();
        queue_readings(&fake, [Reading::failed(SensorStatus::UnknownError)]);
        let mut node = connected(&fake);

        run(&mut node, 0, 1_000);

        assert_eq!(sensor_markers(&fake), vec!["UNKNOWN ERROR"]);
    }

    #[test]
    fn publishes_at_most_once_for_every_outcome_sequence() {
        for mask in 0_u32..32 {
            let outcomes: Vec<bool> = (0..5).map(|bit| mask & (1 << bit) != 0).collect();
            let fake = Fake::default();
            queue_readings(
                &fake,
                outcomes.iter().map(|ok| {
                    if *ok {
                        Reading::ok(22.0, 45.0)
                    } else {
                        Reading::failed(SensorStatus::ChecksumError)
                    }
                }),
            );
            let mut node = connected(&fake);

            let (_, status) = run(&mut node, 0, 60_000).unwrap();
            assert!(matches!(status, SessionStatus::Sleeping { .. }));

            let expected = usize::from(outcomes.contains(&true));
            assert_eq!(payloads(&fake, TEMP).len(), expected, "mask {mask:05b}");
            assert_eq!(payloads(&fake, HUM).len(), expected, "mask {mask:05b}");
            assert_eq!(payloads(&fake, DHT).len(), expected, "mask {mask:05b}");

            let expected_reads = outcomes
                .iter()
                .position(|ok| *ok)
                .map_or(5, |index| index + 1);
            assert_eq!(fake.0.borrow().reads as usize, expected_reads);
        }
    }

    #[test]
    fn rejected_publish_leaves_latch_open() {
        let fake = Fake::default();
        queue_readings(
            &fake,
            [Reading::ok(21.0, 40.0), Reading::ok(21.5, 41.0)],
        );
        fake.0.borrow_mut().rejections.insert(HUM.to_string(), 1);
        let mut node = connected(&fake);

        run(&mut node, 0, 1_000);
        assert!(!node.is_latched());
        assert_eq!(payloads(&fake, TEMP), vec!["21"]);

        run(&mut node, 1_000, 2_000);
        assert!(node.is_latched());
        assert_eq!(payloads(&fake, HUM), vec!["41"]);
        assert_eq!(payloads(&fake, DHT).len(), 2);
    }

    #[test]
    fn sleep_fires_once_after_retry_window() {
        let fake = Fake::default();
        let mut node = connected(&fake);

        let (at, _) = run(&mut node, 0, 30_000).unwrap();
        assert!(at > node.config().retry_window_ms());

        for now in (at..at + 5_000).step_by(100) {
            assert_eq!(
                node.tick(now),
                SessionStatus::Sleeping { duration_ms: 900_000 }
            );
        }
        assert_eq!(node.state(), LifecycleState::Sleeping);
        assert_eq!(fake.0.borrow().sleeps.len(), 1);
        assert_eq!(fake.0.borrow().reads, 5);
    }

    #[test]
    fn indicator_commands() {
        let fake = Fake::default();
        let mut node = connected(&fake);

        node.on_message("foo/group/baz", b"off");
        assert!(!node.indicator_on());

        node.on_message("foo/group/baz", b"on");
        node.on_message("foo/group/baz", b"on");
        assert!(node.indicator_on());

        node.on_message("foo/group/baz", b"blink");
        assert!(node.indicator_on());

        node.on_message("foo/group/baz", b"off");
        assert!(!node.indicator_on());
        assert_eq!(fake.0.borrow().led.last(), Some(&false));
    }

    #[test]
    fn commands_arrive_through_tick() {
        let fake = Fake::default();
        let mut node = connected(&fake);
        fake.0.borrow_mut().events.push_back(BrokerEvent::Message {
            topic: "foo/all/baz".to_string(),
            payload: b"on".to_vec(),
        });

        node.tick(100);

        assert!(node.indicator_on());
    }

    #[test]
    fn update_command_ignores_payload() {
        let fake = Fake::default();
        let mut node = connected(&fake);

        node.on_message("otaUpdate/all", b"");
        node.on_message("otaUpdate/all", b"1.2.3");

        assert_eq!(fake.0.borrow().update_starts, 3);
        assert_eq!(node.state(), LifecycleState::Active);
    }

    #[test]
    fn commands_do_not_move_the_sleep_deadline() {
        let fake = Fake::default();
        let mut node = connected(&fake);

        for topic in ["foo/a/baz", "otaUpdate/all", "unexpected/topic"] {
            fake.0.borrow_mut().events.push_back(BrokerEvent::Message {
                topic: topic.to_string(),
                payload: b"on".to_vec(),
            });
        }

        let (at, _) = run(&mut node, 0, 30_000).unwrap();
        assert_eq!(at, 15_000);
    }

    #[test]
    fn flashed_update_at_boot_aborts_session() {
        let fake = Fake::default();
        fake.0.borrow_mut().start_status = Some(UpdateStatus::RestartRequired);
        let mut node = controller(&fake);

        assert_eq!(node.boot(), SessionStatus::Restarting);
        assert_eq!(node.tick(100), SessionStatus::Restarting);

        let rec = fake.0.borrow();
        assert_eq!(rec.restarts, 1);
        assert_eq!(rec.link_connects, 0);
        assert!(rec.sleeps.is_empty());
    }

    #[test]
    fn update_finishing_mid_session_preempts_everything() {
        let fake = Fake::default();
        queue_readings(&fake, [Reading::ok(21.0, 40.0)]);
        let mut node = connected(&fake);
        fake.0
            .borrow_mut()
            .poll_statuses
            .extend([UpdateStatus::InProgress, UpdateStatus::RestartRequired]);

        let (at, status) = run(&mut node, 0, 30_000).unwrap();

        assert_eq!(status, SessionStatus::Restarting);
        assert_eq!(at, 200);
        assert_eq!(node.state(), LifecycleState::Restarting);

        run(&mut node, at, 30_000);
        let rec = fake.0.borrow();
        assert_eq!(rec.restarts, 1);
        assert_eq!(rec.reads, 0);
        assert!(rec.sleeps.is_empty());
    }

    #[test]
    fn update_command_can_abort_session() {
        let fake = Fake::default();
        let mut node = connected(&fake);
        fake.0.borrow_mut().start_status = Some(UpdateStatus::RestartRequired);
        fake.0.borrow_mut().events.push_back(BrokerEvent::Message {
            topic: "otaUpdate/all".to_string(),
            payload: Vec::new(),
        });

        assert_eq!(node.tick(100), SessionStatus::Restarting);
        assert_eq!(fake.0.borrow().restarts, 1);
    }

    #[test]
    fn boot_update_check_waits_for_link() {
        let fake = Fake::default();
        fake.0.borrow_mut().deferred = Some(PendingCheck::default());
        let mut node = controller(&fake);
        node.boot();

        assert_eq!(run(&mut node, 0, 3_000), None);
        assert!(fake.0.borrow().checks_run.is_empty());
        assert_eq!(node.state(), LifecycleState::WifiConnecting);

        fake.0.borrow_mut().link_up = true;
        assert_eq!(run(&mut node, 3_000, 4_000), None);

        assert_eq!(fake.0.borrow().checks_run, vec![true]);
        assert_eq!(fake.0.borrow().update_starts, 1);
        assert_eq!(node.state(), LifecycleState::BrokerConnecting);
    }

    #[test]
    fn messages_after_sleep_are_dropped() {
        let fake = Fake::default();
        let mut node = connected(&fake);
        run(&mut node, 0, 30_000).unwrap();
        let starts = fake.0.borrow().update_starts;
        fake.0.borrow_mut().start_status = Some(UpdateStatus::RestartRequired);

        node.on_message("otaUpdate/all", b"");
        node.on_message("foo/a/baz", b"on");

        assert_eq!(node.state(), LifecycleState::Sleeping);
        assert!(!node.indicator_on());
        let rec = fake.0.borrow();
        assert_eq!(rec.update_starts, starts);
        assert_eq!(rec.restarts, 0);
    }

    #[test]
    fn reconnect_only_resubscribes() {
        let fake = Fake::default();
        let mut node = connected(&fake);
        run(&mut node, 0, 3_000);

        fake.0.borrow_mut().events.push_back(BrokerEvent::Connected);
        node.tick(3_050);

        assert_eq!(fake.0.borrow().subscriptions.len(), 4);
        assert_eq!(payloads(&fake, VOLTAGE).len(), 1);

        let (at, _) = run(&mut node, 3_050, 30_000).unwrap();
        assert_eq!(at, 15_050);
    }

    #[test]
    fn rejects_sleep_deadline_inside_retry_window() {
        let fake = Fake::default();
        let config = LifecycleConfig {
            sleep_deadline_ms: 4_000,
            ..LifecycleConfig::default()
        };
        let peripherals = Peripherals::<FakeBoard> {
            link: fake.clone(),
            broker: fake.clone(),
            updater: fake.clone(),
            sensor: fake.clone(),
            battery: fake.clone(),
            led: fake.clone(),
            power: fake.clone(),
        };

        let result = LifecycleController::new(config, DeviceId::from_chip_id(7), peripherals);

        assert!(matches!(
            result,
            Err(ConfigError::SleepBeforeRetryWindow { .. })
        ));
    }
}
