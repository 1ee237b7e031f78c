//! Parser for C-Gate event lines
//!
//! Two shapes arrive at this parser:
//! - event-channel lines: `lighting on 254/56/4` / `lighting ramp 254/56/4 128`,
//!   with or without a `//PROJECT/` prefix on the address
//! - object-status payloads from the command channel:
//!   `300 //HOME/254/56/4: level=128`
//!
//! Anything else (C-Gate banners, comments, unit events without a group
//! address) yields `None` and is dropped by the caller.

use crate::domain::types::{Address, CbusEvent};
use once_cell::sync::Lazy;
use regex::Regex;

static EVENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+)\s+(\w+)\s+(?://\w+/)?(\d+/\d+/\d+)(?:\s+(\d+))?")
        .unwrap()
});

static STATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"//\w+/(\d+)/(\d+)/(\d+):\s+level=(\d+)").unwrap()
});

/// Parse one event line into a `CbusEvent`.
///
/// Returns `None` for any line that does not match either shape; callers
/// log and drop, never propagate.
pub fn parse_event_line(line: &str) -> Option<CbusEvent> {
    if line.contains("level=") {
        return parse_status_line(line);
    }

    let caps = EVENT_RE.captures(line)?;
    let (network, application, group) = split_address(caps.get(3)?.as_str())?;
    let level = match caps.get(4) {
        Some(m) => Some(parse_level(m.as_str())?),
        None => None,
    };

    Some(CbusEvent {
        device_type: caps.get(1)?.as_str().to_string(),
        action: caps.get(2)?.as_str().to_ascii_lowercase(),
        address: Address::new(network, application, group),
        level,
    })
}

/// Object-status shape: the level decides the synthesized on/off action.
fn parse_status_line(line: &str) -> Option<CbusEvent> {
    let caps = STATUS_RE.captures(line)?;
    let level = parse_level(caps.get(4)?.as_str())?;

    Some(CbusEvent {
        device_type: "lighting".to_string(),
        action: if level > 0 { "on" } else { "off" }.to_string(),
        address: Address::new(
            caps.get(1)?.as_str(),
            caps.get(2)?.as_str(),
            caps.get(3)?.as_str(),
        ),
        level: Some(level),
    })
}

fn split_address(s: &str) -> Option<(&str, &str, &str)> {
    let mut parts = s.split('/');
    let network = parts.next()?;
    let application = parts.next()?;
    let group = parts.next()?;
    Some((network, application, group))
}

/// Wire levels are 8-bit; anything larger makes the whole line invalid.
fn parse_level(s: &str) -> Option<u8> {
    s.parse::<u16>().ok().filter(|l| *l <= 255).map(|l| l as u8)
}
