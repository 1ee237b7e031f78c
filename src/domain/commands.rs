//! Parser for MQTT write-topic commands
//!
//! Topics have the shape `cbus/write/<network>/<application>/<group>/<kind>`,
//! where empty segments are allowed for the kinds that do not address a
//! group (`getall`, `gettree`). `cbus/write/bridge/announce` is a special
//! topic that re-runs Home Assistant discovery.

use crate::domain::types::{percent_to_level, Address};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static WRITE_TOPIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cbus/write/(\w*)/(\w*)/(\w*)/(\w+)$").unwrap());

/// Topic that forces a discovery re-announce regardless of payload.
pub const ANNOUNCE_TOPIC: &str = "cbus/write/bridge/announce";

/// A parsed command from the MQTT write topic space.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    /// Query every group level of `<network>/<application>`.
    GetAll { network: String, application: String },
    /// Request the device tree of a network.
    GetTree { network: String },
    /// Hard on/off of one group.
    Switch { address: Address, on: bool },
    /// Level change of one group.
    Ramp { address: Address, action: RampAction },
    /// Accepted by the topic grammar but reserved; routed to a log-and-drop.
    SetValue { address: Address, payload: String },
    /// Re-run Home Assistant discovery.
    Announce,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RampAction {
    On,
    Off,
    Increase,
    Decrease,
    Level { level: u8, ramp_time: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Topic does not belong to the write grammar at all.
    UnmatchedTopic,
    UnknownKind(String),
    /// The kind addresses a group but the topic left one empty.
    IncompleteAddress,
    InvalidPayload(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnmatchedTopic => write!(f, "topic does not match cbus/write grammar"),
            CommandError::UnknownKind(k) => write!(f, "unknown command kind '{}'", k),
            CommandError::IncompleteAddress => write!(f, "command requires network/app/group"),
            CommandError::InvalidPayload(p) => write!(f, "invalid payload '{}'", p),
        }
    }
}

impl std::error::Error for CommandError {}

/// Parse an MQTT topic + payload into a `WriteCommand`.
pub fn parse_write(topic: &str, payload: &str) -> Result<WriteCommand, CommandError> {
    if topic == ANNOUNCE_TOPIC {
        return Ok(WriteCommand::Announce);
    }

    let caps = WRITE_TOPIC_RE.captures(topic).ok_or(CommandError::UnmatchedTopic)?;
    let network = &caps[1];
    let application = &caps[2];
    let group = &caps[3];
    let kind = &caps[4];

    match kind {
        "getall" => Ok(WriteCommand::GetAll {
            network: network.to_string(),
            application: application.to_string(),
        }),
        "gettree" => Ok(WriteCommand::GetTree { network: network.to_string() }),
        "switch" => {
            let address = full_address(network, application, group)?;
            match payload.trim().to_ascii_uppercase().as_str() {
                "ON" => Ok(WriteCommand::Switch { address, on: true }),
                "OFF" => Ok(WriteCommand::Switch { address, on: false }),
                _ => Err(CommandError::InvalidPayload(payload.to_string())),
            }
        }
        "ramp" => {
            let address = full_address(network, application, group)?;
            let action = parse_ramp_payload(payload)?;
            Ok(WriteCommand::Ramp { address, action })
        }
        "setvalue" => {
            let address = full_address(network, application, group)?;
            Ok(WriteCommand::SetValue { address, payload: payload.to_string() })
        }
        other => Err(CommandError::UnknownKind(other.to_string())),
    }
}

fn full_address(network: &str, application: &str, group: &str) -> Result<Address, CommandError> {
    if network.is_empty() || application.is_empty() || group.is_empty() {
        return Err(CommandError::IncompleteAddress);
    }
    Ok(Address::new(network, application, group))
}

/// Ramp payloads: `ON`/`OFF`/`INCREASE`/`DECREASE` keywords, or
/// `<percent>[,<ramp time>]` where the ramp time passes through verbatim.
fn parse_ramp_payload(payload: &str) -> Result<RampAction, CommandError> {
    let trimmed = payload.trim();
    match trimmed.to_ascii_uppercase().as_str() {
        "ON" => return Ok(RampAction::On),
        "OFF" => return Ok(RampAction::Off),
        "INCREASE" => return Ok(RampAction::Increase),
        "DECREASE" => return Ok(RampAction::Decrease),
        _ => {}
    }

    let (percent_part, ramp_time) = match trimmed.split_once(',') {
        Some((p, t)) => (p.trim(), Some(t.trim().to_string()).filter(|t| !t.is_empty())),
        None => (trimmed, None),
    };

    let percent: u32 = percent_part
        .parse()
        .map_err(|_| CommandError::InvalidPayload(payload.to_string()))?;

    Ok(RampAction::Level { level: percent_to_level(percent), ramp_time })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switch_on() {
        let cmd = parse_write("cbus/write/254/56/4/switch", "ON").unwrap();
        assert_eq!(
            cmd,
            WriteCommand::Switch { address: Address::new("254", "56", "4"), on: true }
        );
    }

    #[test]
    fn test_parse_switch_case_insensitive() {
        let cmd = parse_write("cbus/write/254/56/4/switch", "off").unwrap();
        assert!(matches!(cmd, WriteCommand::Switch { on: false, .. }));
    }

    #[test]
    fn test_parse_switch_bad_payload() {
        let err = parse_write("cbus/write/254/56/4/switch", "TOGGLE").unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload(_)));
    }

    #[test]
    fn test_parse_ramp_keywords() {
        for (payload, expected) in [
            ("ON", RampAction::On),
            ("OFF", RampAction::Off),
            ("INCREASE", RampAction::Increase),
            ("decrease", RampAction::Decrease),
        ] {
            let cmd = parse_write("cbus/write/254/56/4/ramp", payload).unwrap();
            assert_eq!(
                cmd,
                WriteCommand::Ramp { address: Address::new("254", "56", "4"), action: expected }
            );
        }
    }

    #[test]
    fn test_parse_ramp_percent_with_time() {
        let cmd = parse_write("cbus/write/254/56/4/ramp", "50,2s").unwrap();
        assert_eq!(
            cmd,
            WriteCommand::Ramp {
                address: Address::new("254", "56", "4"),
                action: RampAction::Level { level: 128, ramp_time: Some("2s".to_string()) },
            }
        );
    }

    #[test]
    fn test_parse_ramp_percent_clamped() {
        let cmd = parse_write("cbus/write/254/56/4/ramp", "150").unwrap();
        assert_eq!(
            cmd,
            WriteCommand::Ramp {
                address: Address::new("254", "56", "4"),
                action: RampAction::Level { level: 255, ramp_time: None },
            }
        );
    }

    #[test]
    fn test_parse_ramp_garbage_payload() {
        let err = parse_write("cbus/write/254/56/4/ramp", "fifty").unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload(_)));
    }

    #[test]
    fn test_parse_getall_with_empty_group() {
        let cmd = parse_write("cbus/write/254/56//getall", "").unwrap();
        assert_eq!(
            cmd,
            WriteCommand::GetAll { network: "254".to_string(), application: "56".to_string() }
        );
    }

    #[test]
    fn test_parse_gettree() {
        let cmd = parse_write("cbus/write/254///gettree", "anything").unwrap();
        assert_eq!(cmd, WriteCommand::GetTree { network: "254".to_string() });
    }

    #[test]
    fn test_parse_setvalue_reserved() {
        let cmd = parse_write("cbus/write/254/56/4/setvalue", "42").unwrap();
        assert!(matches!(cmd, WriteCommand::SetValue { .. }));
    }

    #[test]
    fn test_parse_announce_topic() {
        let cmd = parse_write("cbus/write/bridge/announce", "").unwrap();
        assert_eq!(cmd, WriteCommand::Announce);
    }

    #[test]
    fn test_parse_unknown_kind() {
        let err = parse_write("cbus/write/254/56/4/blink", "ON").unwrap_err();
        assert_eq!(err, CommandError::UnknownKind("blink".to_string()));
    }

    #[test]
    fn test_parse_switch_missing_group() {
        let err = parse_write("cbus/write/254/56//switch", "ON").unwrap_err();
        assert_eq!(err, CommandError::IncompleteAddress);
    }

    #[test]
    fn test_parse_foreign_topic() {
        let err = parse_write("cbus/read/254/56/4/state", "ON").unwrap_err();
        assert_eq!(err, CommandError::UnmatchedTopic);
    }
}
