//! MQTT command routing
//!
//! Turns a parsed write command into the C-Gate command lines to enqueue.
//! Relative ramps (INCREASE/DECREASE) cannot be issued blind: the router
//! registers a pending step on the tracker and emits a level query; the
//! bridge emits the RAMP once the level report arrives.

use crate::domain::commands::{RampAction, WriteCommand};
use crate::domain::types::{Address, RAMP_STEP};
use crate::infra::config::Settings;
use crate::services::tracker::{LevelTracker, RELATIVE_RAMP_TIMEOUT};
use tracing::{info, warn};

/// Command lines to enqueue, plus the network of a requested tree transfer
/// (the response processor needs it to label the incoming 343/347/344 run).
#[derive(Debug, Default, PartialEq)]
pub struct RouteResult {
    pub commands: Vec<String>,
    pub tree_request: Option<String>,
}

pub struct CommandRouter {
    settings: Settings,
}

impl CommandRouter {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn route(&self, command: &WriteCommand, tracker: &mut LevelTracker) -> RouteResult {
        match command {
            WriteCommand::GetAll { network, application } => RouteResult {
                commands: vec![self.getall_line(network, application)],
                tree_request: None,
            },
            WriteCommand::GetTree { network } => RouteResult {
                commands: vec![format!("TREEXML {}\n", network)],
                tree_request: Some(network.clone()),
            },
            WriteCommand::Switch { address, on } => RouteResult {
                commands: vec![self.switch_line(address, *on)],
                tree_request: None,
            },
            WriteCommand::Ramp { address, action } => RouteResult {
                commands: self.route_ramp(address, action, tracker),
                tree_request: None,
            },
            WriteCommand::SetValue { address, payload } => {
                // Reserved by the topic grammar; nothing consumes it yet.
                info!(address = %address, payload = %payload, "setvalue_not_handled");
                RouteResult::default()
            }
            WriteCommand::Announce => RouteResult::default(),
        }
    }

    fn route_ramp(
        &self,
        address: &Address,
        action: &RampAction,
        tracker: &mut LevelTracker,
    ) -> Vec<String> {
        match action {
            RampAction::On => vec![self.switch_line(address, true)],
            RampAction::Off => vec![self.switch_line(address, false)],
            RampAction::Increase => self.relative_ramp(address, RAMP_STEP, tracker),
            RampAction::Decrease => self.relative_ramp(address, -RAMP_STEP, tracker),
            RampAction::Level { level, ramp_time } => {
                vec![self.ramp_line(address, *level, ramp_time.as_deref())]
            }
        }
    }

    fn relative_ramp(
        &self,
        address: &Address,
        step: i16,
        tracker: &mut LevelTracker,
    ) -> Vec<String> {
        if !tracker.register_relative(address.clone(), step, RELATIVE_RAMP_TIMEOUT) {
            warn!(address = %address, "relative_ramp_already_pending");
            return Vec::new();
        }
        vec![self.level_query_line(address)]
    }

    pub fn getall_line(&self, network: &str, application: &str) -> String {
        format!(
            "GET //{}/{}/{}/* level\n",
            self.settings.cgate_project(),
            network,
            application
        )
    }

    pub fn level_query_line(&self, address: &Address) -> String {
        format!("GET {} level\n", address.cgate_path(self.settings.cgate_project()))
    }

    pub fn switch_line(&self, address: &Address, on: bool) -> String {
        format!(
            "{} {}\n",
            if on { "ON" } else { "OFF" },
            address.cgate_path(self.settings.cgate_project())
        )
    }

    pub fn ramp_line(&self, address: &Address, level: u8, ramp_time: Option<&str>) -> String {
        match ramp_time {
            Some(time) => {
                format!("RAMP {} {} {}\n", address.cgate_path(self.settings.cgate_project()), level, time)
            }
            None => format!("RAMP {} {}\n", address.cgate_path(self.settings.cgate_project()), level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::commands::parse_write;

    fn router() -> CommandRouter {
        CommandRouter::new(Settings::default())
    }

    fn route(topic: &str, payload: &str, tracker: &mut LevelTracker) -> RouteResult {
        let cmd = parse_write(topic, payload).unwrap();
        router().route(&cmd, tracker)
    }

    #[test]
    fn test_switch_on() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/switch", "ON", &mut tracker);
        assert_eq!(result.commands, vec!["ON //HOME/254/56/4\n"]);
    }

    #[test]
    fn test_switch_off() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/switch", "OFF", &mut tracker);
        assert_eq!(result.commands, vec!["OFF //HOME/254/56/4\n"]);
    }

    #[test]
    fn test_getall() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56//getall", "", &mut tracker);
        assert_eq!(result.commands, vec!["GET //HOME/254/56/* level\n"]);
    }

    #[test]
    fn test_gettree_notes_network() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254///gettree", "", &mut tracker);
        assert_eq!(result.commands, vec!["TREEXML 254\n"]);
        assert_eq!(result.tree_request, Some("254".to_string()));
    }

    #[test]
    fn test_ramp_on_is_switch() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/ramp", "ON", &mut tracker);
        assert_eq!(result.commands, vec!["ON //HOME/254/56/4\n"]);
    }

    #[test]
    fn test_ramp_percent_with_time() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/ramp", "50,2s", &mut tracker);
        assert_eq!(result.commands, vec!["RAMP //HOME/254/56/4 128 2s\n"]);
    }

    #[test]
    fn test_ramp_increase_queries_level_first() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/ramp", "INCREASE", &mut tracker);
        assert_eq!(result.commands, vec!["GET //HOME/254/56/4 level\n"]);
        assert_eq!(tracker.pending_count(), 1);

        // The level report resolves the registration to a RAMP target.
        let due = tracker.record(&Address::new("254", "56", "4"), 128).unwrap();
        assert_eq!(due.level, 154);
        assert_eq!(
            router().ramp_line(&due.address, due.level, None),
            "RAMP //HOME/254/56/4 154\n"
        );
    }

    #[test]
    fn test_ramp_decrease_registers_negative_step() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/ramp", "DECREASE", &mut tracker);
        assert_eq!(result.commands, vec!["GET //HOME/254/56/4 level\n"]);
        let due = tracker.record(&Address::new("254", "56", "4"), 128).unwrap();
        assert_eq!(due.level, 102);
    }

    #[test]
    fn test_duplicate_relative_ramp_emits_nothing() {
        let mut tracker = LevelTracker::new();
        let first = route("cbus/write/254/56/4/ramp", "INCREASE", &mut tracker);
        assert_eq!(first.commands.len(), 1);
        let second = route("cbus/write/254/56/4/ramp", "INCREASE", &mut tracker);
        assert!(second.commands.is_empty());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_setvalue_routes_nowhere() {
        let mut tracker = LevelTracker::new();
        let result = route("cbus/write/254/56/4/setvalue", "42", &mut tracker);
        assert_eq!(result, RouteResult::default());
    }
}
