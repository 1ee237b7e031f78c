//! Event publication
//!
//! Converts a parsed C-Bus event into the retained-or-not state/level pair
//! on `cbus/read/<n>/<a>/<g>/...`. PIR applications are binary sensors:
//! their state follows the action and they never get a level topic.

use crate::domain::types::{level_to_percent, CbusEvent};
use crate::infra::config::Settings;
use crate::io::mqtt::MqttMessage;

pub struct EventPublisher {
    settings: Settings,
}

impl EventPublisher {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Build the publications for one event: `<base>/state` always,
    /// `<base>/level` for everything except PIR applications.
    pub fn messages_for(&self, event: &CbusEvent) -> Vec<MqttMessage> {
        let base = event.address.read_topic_base();
        let retain = self.settings.retain_reads();
        let is_pir = self.settings.ha_pir_app_id() == Some(event.address.application.as_str());

        let level_pct = match event.level {
            Some(level) => level_to_percent(level),
            None if event.is_on() => 100,
            None => 0,
        };

        let state = if is_pir {
            if event.is_on() {
                "ON"
            } else {
                "OFF"
            }
        } else if event.level.is_some() {
            if level_pct > 0 {
                "ON"
            } else {
                "OFF"
            }
        } else if event.is_on() {
            "ON"
        } else {
            "OFF"
        };

        let mut messages = vec![MqttMessage::new(
            format!("{}/state", base),
            state.to_string(),
            retain,
        )];

        if !is_pir {
            messages.push(MqttMessage::new(
                format!("{}/level", base),
                level_pct.to_string(),
                retain,
            ));
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::parse_event_line;
    use crate::infra::config::TomlConfig;

    fn settings_with_pir(pir: Option<&str>, retain: bool) -> Settings {
        let mut toml_config = TomlConfig::default();
        toml_config.discovery.pir_app_id = pir.map(|s| s.to_string());
        toml_config.mqtt.retain_reads = retain;
        Settings::build(toml_config, "test").unwrap()
    }

    #[test]
    fn test_on_event_without_level() {
        let publisher = EventPublisher::new(settings_with_pir(None, false));
        let event = parse_event_line("lighting on 254/56/4").unwrap();
        let messages = publisher.messages_for(&event);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].topic, "cbus/read/254/56/4/state");
        assert_eq!(messages[0].payload, "ON");
        assert_eq!(messages[1].topic, "cbus/read/254/56/4/level");
        assert_eq!(messages[1].payload, "100");
        assert!(!messages[0].retain);
    }

    #[test]
    fn test_off_event_without_level() {
        let publisher = EventPublisher::new(settings_with_pir(None, false));
        let event = parse_event_line("lighting off 254/56/4").unwrap();
        let messages = publisher.messages_for(&event);
        assert_eq!(messages[0].payload, "OFF");
        assert_eq!(messages[1].payload, "0");
    }

    #[test]
    fn test_ramp_event_scales_level() {
        let publisher = EventPublisher::new(settings_with_pir(None, false));
        let event = parse_event_line("lighting ramp 254/56/4 128").unwrap();
        let messages = publisher.messages_for(&event);
        // 128/255 rounds to 50%; a non-zero level reads as ON.
        assert_eq!(messages[0].payload, "ON");
        assert_eq!(messages[1].payload, "50");
    }

    #[test]
    fn test_ramp_to_zero_reads_off() {
        let publisher = EventPublisher::new(settings_with_pir(None, false));
        let event = parse_event_line("lighting ramp 254/56/4 0").unwrap();
        let messages = publisher.messages_for(&event);
        assert_eq!(messages[0].payload, "OFF");
        assert_eq!(messages[1].payload, "0");
    }

    #[test]
    fn test_pir_gets_state_only() {
        let publisher = EventPublisher::new(settings_with_pir(Some("203"), false));
        let event = parse_event_line("trigger on 254/203/7").unwrap();
        let messages = publisher.messages_for(&event);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "cbus/read/254/203/7/state");
        assert_eq!(messages[0].payload, "ON");
    }

    #[test]
    fn test_pir_state_follows_action_not_level() {
        let publisher = EventPublisher::new(settings_with_pir(Some("203"), false));
        // Level would say ON, but PIR state is derived from the action.
        let event = parse_event_line("trigger off 254/203/7 255").unwrap();
        let messages = publisher.messages_for(&event);
        assert_eq!(messages[0].payload, "OFF");
    }

    #[test]
    fn test_retain_reads_sets_retain_flag() {
        let publisher = EventPublisher::new(settings_with_pir(None, true));
        let event = parse_event_line("lighting on 254/56/4").unwrap();
        for msg in publisher.messages_for(&event) {
            assert!(msg.retain);
        }
    }
}
