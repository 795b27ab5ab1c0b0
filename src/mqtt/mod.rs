pub mod client;

use std::str::FromStr;

use crate::error::CommandDecodeError;

/// Relay instruction received from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Close,
    Toggle,
}

impl FromStr for Command {
    type Err = CommandDecodeError;

    /// Decodes a `relay/set` payload. Only "open" and "close" are accepted,
    /// in any letter case.
    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let command = payload.trim();
        if command.eq_ignore_ascii_case("open") {
            Ok(Command::Open)
        } else if command.eq_ignore_ascii_case("close") {
            Ok(Command::Close)
        } else {
            Err(CommandDecodeError {
                payload: payload.to_string(),
            })
        }
    }
}

/// Which subscribed topic an inbound message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTopic {
    RelaySet,
    RelayToggle,
}

/// Topic contract for one plug: `plug/{device_id}/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        Self {
            prefix: format!("plug/{device_id}"),
        }
    }

    pub fn power(&self) -> String {
        format!("{}/power", self.prefix)
    }

    pub fn temperature(&self) -> String {
        format!("{}/temperature", self.prefix)
    }

    pub fn relay_status(&self) -> String {
        format!("{}/relay/status", self.prefix)
    }

    pub fn relay_set(&self) -> String {
        format!("{}/relay/set", self.prefix)
    }

    pub fn relay_toggle(&self) -> String {
        format!("{}/relay/toggle", self.prefix)
    }

    /// Retained "online"/"offline" marker, also used as the last will.
    pub fn bridge_status(&self) -> String {
        format!("{}/bridge_status", self.prefix)
    }

    pub fn command_topics(&self) -> Vec<String> {
        vec![self.relay_set(), self.relay_toggle()]
    }

    pub fn classify(&self, topic: &str) -> Option<CommandTopic> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        match rest {
            "relay/set" => Some(CommandTopic::RelaySet),
            "relay/toggle" => Some(CommandTopic::RelayToggle),
            _ => None,
        }
    }

    /// Turns an inbound message into a command. Any payload on the toggle
    /// topic toggles; the set topic only takes open/close.
    pub fn decode(
        &self,
        topic: &str,
        payload: &str,
    ) -> Option<Result<Command, CommandDecodeError>> {
        match self.classify(topic)? {
            CommandTopic::RelaySet => Some(payload.parse()),
            CommandTopic::RelayToggle => Some(Ok(Command::Toggle)),
        }
    }
}

pub fn power_payload(power_watts: f64) -> String {
    serde_json::json!({ "power": power_watts }).to_string()
}

pub fn temperature_payload(temperature_celsius: f64) -> String {
    serde_json::json!({ "temperature": temperature_celsius }).to_string()
}
