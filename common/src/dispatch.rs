use crate::topics::{INDICATOR_COMMAND_PREFIX, TOPIC_CMD_FIRMWARE_UPDATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorCommand {
    On,
    Off,
}

impl IndicatorCommand {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"on" => Some(Self::On),
            b"off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

/// A broker message resolved against the subscribed command topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Indicator(IndicatorCommand),
    FirmwareUpdate,
    Ignored,
}

impl Command {
    pub fn classify(topic: &str, payload: &[u8]) -> Self {
        if topic.starts_with(INDICATOR_COMMAND_PREFIX) {
            return IndicatorCommand::parse(payload)
                .map(Self::Indicator)
                .unwrap_or(Self::Ignored);
        }

        if topic == TOPIC_CMD_FIRMWARE_UPDATE {
            // Payload content is irrelevant for update requests.
            return Self::FirmwareUpdate;
        }

        Self::Ignored
    }
}
