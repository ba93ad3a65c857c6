use std::fmt;

/// Indicator commands arrive on a group topic shared by every node.
pub const TOPIC_CMD_INDICATOR: &str = "foo/+/baz";
pub const INDICATOR_COMMAND_PREFIX: &str = "foo/";
pub const TOPIC_CMD_FIRMWARE_UPDATE: &str = "otaUpdate/all";

/// Identity of this node for one power-on session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn from_chip_id(chip_id: u32) -> Self {
        Self(format!("ESP_{chip_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-device publish topics, computed once at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamespace {
    pub temperature: String,
    pub humidity: String,
    pub combined: String,
    pub voltage: String,
    pub debug: String,
}

impl TopicNamespace {
    pub fn new(device_id: &DeviceId) -> Self {
        let base = format!("devices/{device_id}");
        Self {
            temperature: format!("{base}/temp"),
            humidity: format!("{base}/hum"),
            combined: format!("{base}/dht"),
            voltage: format!("{base}/voltage"),
            debug: format!("{base}/debug"),
        }
    }
}
