use serde::{Deserialize, Serialize};

/// Outcome of one sensor bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStatus {
    Ok,
    ChecksumError,
    TimeoutError,
    UnknownError,
}

impl SensorStatus {
    /// Marker published on the debug topic after each attempt.
    pub fn debug_marker(self) -> &'static str {
        match self {
            Self::Ok => "DHTLIB_OK",
            Self::ChecksumError => "DHTLIB_ERROR_CHECKSUM",
            Self::TimeoutError => "DHTLIB_ERROR_TIMEOUT",
            Self::UnknownError => "UNKNOWN ERROR",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub status: SensorStatus,
    pub temperature: f32,
    pub humidity: f32,
}

impl Reading {
    pub fn ok(temperature: f32, humidity: f32) -> Self {
        Self {
            status: SensorStatus::Ok,
            temperature,
            humidity,
        }
    }

    pub fn failed(status: SensorStatus) -> Self {
        Self {
            status,
            temperature: f32::NAN,
            humidity: f32::NAN,
        }
    }

    pub fn temperature_payload(&self) -> String {
        self.temperature.to_string()
    }

    pub fn humidity_payload(&self) -> String {
        self.humidity.to_string()
    }

    pub fn combined(&self) -> CombinedPayload {
        CombinedPayload {
            temperature: self.temperature,
            humidity: self.humidity,
        }
    }
}

/// Body of the structured `dht` topic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinedPayload {
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageSample {
    pub volts: f32,
    pub raw: u16,
}

impl VoltageSample {
    pub fn payload(&self) -> String {
        format!("{:.2}", self.volts)
    }

    pub fn debug_dump(&self) -> String {
        format!("vcc raw={} volts={:.3}", self.raw, self.volts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Booting,
    WifiConnecting,
    BrokerConnecting,
    Active,
    SleepArmed,
    Sleeping,
    Restarting,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::WifiConnecting => "WIFI_CONNECTING",
            Self::BrokerConnecting => "BROKER_CONNECTING",
            Self::Active => "ACTIVE",
            Self::SleepArmed => "SLEEP_ARMED",
            Self::Sleeping => "SLEEPING",
            Self::Restarting => "RESTARTING",
        }
    }

    /// Sleeping and Restarting end the session; nothing runs after them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sleeping | Self::Restarting)
    }
}

/// What the scheduler loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Sleeping { duration_ms: u64 },
    Restarting,
}
