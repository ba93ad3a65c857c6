//! Contracts for the leaf components the lifecycle controller drives.
//!
//! Every method here must return quickly except [`SensorReader::read`], which
//! performs one blocking bus transaction, and [`UpdateAgent::poll`], which may
//! block while an image is downloaded and flashed.

use crate::{
    error::PortError,
    types::{Reading, VoltageSample},
};

pub trait ConnectivityProvider {
    /// Starts bringing the link up. Retries are the provider's business.
    fn connect(&mut self) -> Result<(), PortError>;

    fn is_connected(&mut self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
}

pub trait MessagingClient {
    fn connect(&mut self) -> Result<(), PortError>;

    /// Non-blocking; returns the next pending event, if any.
    fn poll(&mut self) -> Option<BrokerEvent>;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PortError>;

    fn subscribe(&mut self, filter: &str) -> Result<(), PortError>;
}

/// Receiver side of the messaging client's callbacks.
pub trait BrokerEvents {
    fn on_connected(&mut self, now_ms: u64);

    fn on_message(&mut self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Idle,
    InProgress,
    /// A new image has been flashed; the session must end in a restart.
    RestartRequired,
}

pub trait UpdateAgent {
    fn start_update(&mut self) -> UpdateStatus;

    fn poll(&mut self) -> UpdateStatus;
}

pub trait SensorReader {
    fn read(&mut self) -> Reading;
}

pub trait BatteryMonitor {
    fn read_voltage(&mut self) -> VoltageSample;
}

pub trait Indicator {
    fn set(&mut self, on: bool);
}

/// On hardware neither call returns.
pub trait PowerControl {
    fn deep_sleep(&mut self, duration_ms: u64);

    fn restart(&mut self);
}

/// Binds one concrete implementation of every collaborator.
pub trait Board {
    type Link: ConnectivityProvider;
    type Broker: MessagingClient;
    type Updater: UpdateAgent;
    type Sensor: SensorReader;
    type Battery: BatteryMonitor;
    type Led: Indicator;
    type Power: PowerControl;
}

pub struct Peripherals<B: Board> {
    pub link: B::Link,
    pub broker: B::Broker,
    pub updater: B::Updater,
    pub sensor: B::Sensor,
    pub battery: B::Battery,
    pub led: B::Led,
    pub power: B::Power,
}
