//! Shared types for the C-Gate bridge

use std::fmt;

/// A C-Bus address: (network, application, group).
///
/// Segments are kept as the short decimal strings C-Gate uses on the wire so
/// that addresses round-trip without renumbering (`05` stays `05`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub network: String,
    pub application: String,
    pub group: String,
}

impl Address {
    pub fn new(network: &str, application: &str, group: &str) -> Self {
        Self {
            network: network.to_string(),
            application: application.to_string(),
            group: group.to_string(),
        }
    }

    /// C-Gate object path: `//<project>/<network>/<application>/<group>`
    pub fn cgate_path(&self, project: &str) -> String {
        format!("//{}/{}/{}/{}", project, self.network, self.application, self.group)
    }

    /// MQTT read-topic base: `cbus/read/<network>/<application>/<group>`
    pub fn read_topic_base(&self) -> String {
        format!("cbus/read/{}/{}/{}", self.network, self.application, self.group)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.network, self.application, self.group)
    }
}

/// A parsed line from the C-Gate event channel (or a `300` status response).
///
/// `action` is kept verbatim (`on`, `off`, `ramp`, ...); the set is open.
/// `level` is the raw wire level 0-255 when the line carried one.
#[derive(Debug, Clone, PartialEq)]
pub struct CbusEvent {
    pub device_type: String,
    pub action: String,
    pub address: Address,
    pub level: Option<u8>,
}

impl CbusEvent {
    pub fn is_on(&self) -> bool {
        self.action.eq_ignore_ascii_case("on")
    }
}

/// Scale a 0-100 percent to the 0-255 wire range.
pub fn percent_to_level(percent: u32) -> u8 {
    let clamped = percent.min(100);
    ((clamped as f64) * 255.0 / 100.0).round() as u8
}

/// Scale a 0-255 wire level to 0-100 percent.
pub fn level_to_percent(level: u8) -> u8 {
    ((level as f64) * 100.0 / 255.0).round() as u8
}

/// Relative-ramp step used for INCREASE/DECREASE commands (~10% of full range).
pub const RAMP_STEP: i16 = 26;

/// Apply a signed step to a wire level, clamped to the 0-255 range.
pub fn step_level(current: u8, step: i16) -> u8 {
    (current as i16 + step).clamp(0, 255) as u8
}

/// C-Gate response codes the bridge reacts to (HTTP-like, 100-599).
pub mod response_code {
    /// Object status report.
    pub const OBJECT_STATUS: u16 = 300;
    /// Begin of a TREEXML transfer.
    pub const TREE_START: u16 = 343;
    /// End of a TREEXML transfer.
    pub const TREE_END: u16 = 344;
    /// One line of a TREEXML transfer.
    pub const TREE_DATA: u16 = 347;
}

/// Parse a three-digit response code prefix. Valid codes are `[1-6]\d\d`.
pub fn parse_response_code(s: &str) -> Option<u16> {
    if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u16 = s.parse().ok()?;
    if (100..700).contains(&code) {
        Some(code)
    } else {
        None
    }
}

/// Human hint for C-Gate error responses, logged alongside the raw line.
pub fn error_code_hint(code: u16) -> &'static str {
    match code {
        400 => "bad request",
        401 => "unauthorized",
        404 => "object not found",
        406 => "bad parameter",
        500 => "internal C-Gate error",
        503 => "service unavailable",
        _ => "unrecognized error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_formats() {
        let addr = Address::new("254", "56", "4");
        assert_eq!(addr.to_string(), "254/56/4");
        assert_eq!(addr.cgate_path("HOME"), "//HOME/254/56/4");
        assert_eq!(addr.read_topic_base(), "cbus/read/254/56/4");
    }

    #[test]
    fn test_percent_to_level() {
        assert_eq!(percent_to_level(0), 0);
        assert_eq!(percent_to_level(50), 128);
        assert_eq!(percent_to_level(100), 255);
        // Out-of-range percentages clamp to 100
        assert_eq!(percent_to_level(250), 255);
    }

    #[test]
    fn test_level_to_percent() {
        assert_eq!(level_to_percent(0), 0);
        assert_eq!(level_to_percent(128), 50);
        assert_eq!(level_to_percent(255), 100);
    }

    #[test]
    fn test_level_round_trip_law() {
        // Every percent must survive percent -> level -> percent unchanged.
        for p in 0..=100u32 {
            assert_eq!(level_to_percent(percent_to_level(p)) as u32, p);
        }
    }

    #[test]
    fn test_step_level_clamps() {
        assert_eq!(step_level(128, RAMP_STEP), 154);
        assert_eq!(step_level(128, -RAMP_STEP), 102);
        assert_eq!(step_level(250, RAMP_STEP), 255);
        assert_eq!(step_level(10, -RAMP_STEP), 0);
    }

    #[test]
    fn test_parse_response_code() {
        assert_eq!(parse_response_code("300"), Some(300));
        assert_eq!(parse_response_code("503"), Some(503));
        assert_eq!(parse_response_code("700"), None);
        assert_eq!(parse_response_code("30"), None);
        assert_eq!(parse_response_code("3000"), None);
        assert_eq!(parse_response_code("30a"), None);
    }

    #[test]
    fn test_error_code_hint() {
        assert_eq!(error_code_hint(401), "unauthorized");
        assert_eq!(error_code_hint(599), "unrecognized error");
    }
}
