pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod ports;
pub mod topics;
pub mod trigger;
pub mod types;
pub mod update;

pub use config::{LifecycleConfig, NetworkConfig, NodeConfig};
pub use dispatch::{Command, IndicatorCommand};
pub use error::{ConfigError, PortError};
pub use lifecycle::LifecycleController;
pub use ports::{
    BatteryMonitor, Board, BrokerEvent, BrokerEvents, ConnectivityProvider, Indicator,
    MessagingClient, Peripherals, PowerControl, SensorReader, UpdateAgent, UpdateStatus,
};
pub use topics::*;
pub use trigger::{PeriodicTrigger, Repeat};
pub use types::{
    CombinedPayload, LifecycleState, Reading, SensorStatus, SessionStatus, VoltageSample,
};
pub use update::{CheckGate, PendingCheck};
