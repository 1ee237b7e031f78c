//! Command-channel response processing
//!
//! Every line coming back from the command pool carries a three-digit
//! response code, either `<code>-<payload>` or `<code> <payload>`. Object
//! status (300) re-enters the event path; 343/347/344 runs are collected
//! into a tree-XML buffer and handed to discovery; 4xx/5xx are logged with
//! a hint. Because pool responses are not demultiplexed, a tree transfer is
//! labeled with the network from the oldest outstanding TREEXML request.

use crate::domain::events::parse_event_line;
use crate::domain::types::{error_code_hint, parse_response_code, response_code, CbusEvent};
use crate::infra::metrics::Metrics;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the bridge should do with one processed response line.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseAction {
    None,
    /// A 300 object status, parsed into the regular event path.
    Event(CbusEvent),
    /// A completed tree transfer for `network`.
    Tree { network: String, xml: String },
}

pub struct ResponseProcessor {
    tree_buffer: String,
    tree_network: Option<String>,
    requested_networks: VecDeque<String>,
    metrics: Arc<Metrics>,
}

impl ResponseProcessor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            tree_buffer: String::new(),
            tree_network: None,
            requested_networks: VecDeque::new(),
            metrics,
        }
    }

    /// Remember that a TREEXML was sent for `network`; the next tree-begin
    /// response is attributed to the oldest outstanding request.
    pub fn note_tree_request(&mut self, network: String) {
        self.requested_networks.push_back(network);
    }

    pub fn process(&mut self, line: &str) -> ResponseAction {
        let Some((code, rest)) = split_response(line) else {
            debug!(line = line, "cgate_response_without_code");
            return ResponseAction::None;
        };

        match code {
            response_code::OBJECT_STATUS => self.handle_status(rest),
            response_code::TREE_START => {
                self.tree_buffer.clear();
                self.tree_network = self.requested_networks.pop_front();
                if self.tree_network.is_none() {
                    warn!("cgate_tree_transfer_unsolicited");
                }
                ResponseAction::None
            }
            response_code::TREE_DATA => {
                self.tree_buffer.push_str(rest);
                self.tree_buffer.push('\n');
                ResponseAction::None
            }
            response_code::TREE_END => {
                let xml = std::mem::take(&mut self.tree_buffer);
                match self.tree_network.take() {
                    Some(network) => ResponseAction::Tree { network, xml },
                    None => ResponseAction::None,
                }
            }
            400..=599 => {
                self.metrics.record_cgate_error();
                error!(code = code, hint = error_code_hint(code), line = line, "cgate_error_response");
                ResponseAction::None
            }
            _ => {
                info!(code = code, line = line, "cgate_response");
                ResponseAction::None
            }
        }
    }

    fn handle_status(&mut self, rest: &str) -> ResponseAction {
        match parse_event_line(&format!("300 {}", rest.trim())) {
            Some(event) => ResponseAction::Event(event),
            None => {
                self.metrics.record_parse_error();
                warn!(payload = rest, "cgate_status_unparseable");
                ResponseAction::None
            }
        }
    }
}

/// Split at the first hyphen when the prefix is a response code, else at the
/// first space. Lines without a valid code are skipped.
fn split_response(line: &str) -> Option<(u16, &str)> {
    if let Some((prefix, rest)) = line.split_once('-') {
        if let Some(code) = parse_response_code(prefix) {
            return Some((code, rest));
        }
    }

    match line.split_once(' ') {
        Some((prefix, rest)) => parse_response_code(prefix).map(|code| (code, rest)),
        None => parse_response_code(line).map(|code| (code, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Address;

    fn processor() -> ResponseProcessor {
        ResponseProcessor::new(Arc::new(Metrics::new()))
    }

    #[test]
    fn test_split_hyphen_and_space_forms() {
        assert_eq!(split_response("300-payload"), Some((300, "payload")));
        assert_eq!(split_response("300 payload"), Some((300, "payload")));
        // Hyphen later in the line does not confuse the space form.
        assert_eq!(split_response("300 object-path"), Some((300, "object-path")));
        assert_eq!(split_response("banner text"), None);
    }

    #[test]
    fn test_status_response_becomes_event() {
        let mut p = processor();
        let action = p.process("300-//HOME/254/56/4: level=128");
        let ResponseAction::Event(event) = action else {
            panic!("expected event, got {:?}", action);
        };
        assert_eq!(event.address, Address::new("254", "56", "4"));
        assert_eq!(event.level, Some(128));
        assert_eq!(event.action, "on");
    }

    #[test]
    fn test_status_response_space_form() {
        let mut p = processor();
        let action = p.process("300 //HOME/254/56/4: level=0");
        assert!(matches!(action, ResponseAction::Event(_)));
    }

    #[test]
    fn test_unparseable_status_is_dropped() {
        let mut p = processor();
        assert_eq!(p.process("300-sessions active"), ResponseAction::None);
    }

    #[test]
    fn test_tree_transfer_collects_buffer() {
        let mut p = processor();
        p.note_tree_request("254".to_string());

        assert_eq!(p.process("343-Begin XML snippet"), ResponseAction::None);
        assert_eq!(p.process("347-<Network>"), ResponseAction::None);
        assert_eq!(p.process("347-</Network>"), ResponseAction::None);
        let action = p.process("344-End XML snippet");
        assert_eq!(
            action,
            ResponseAction::Tree {
                network: "254".to_string(),
                xml: "<Network>\n</Network>\n".to_string(),
            }
        );
    }

    #[test]
    fn test_tree_begin_resets_buffer() {
        let mut p = processor();
        p.note_tree_request("254".to_string());
        p.process("343-Begin");
        p.process("347-stale");
        // A second begin restarts the transfer with the next request.
        p.note_tree_request("200".to_string());
        p.process("343-Begin");
        p.process("347-fresh");
        let action = p.process("344-End");
        assert_eq!(
            action,
            ResponseAction::Tree { network: "200".to_string(), xml: "fresh\n".to_string() }
        );
    }

    #[test]
    fn test_unsolicited_tree_is_dropped() {
        let mut p = processor();
        p.process("343-Begin");
        p.process("347-<Network/>");
        assert_eq!(p.process("344-End"), ResponseAction::None);
    }

    #[test]
    fn test_requests_attributed_in_order() {
        let mut p = processor();
        p.note_tree_request("254".to_string());
        p.note_tree_request("200".to_string());

        p.process("343-Begin");
        let first = p.process("344-End");
        assert_eq!(first, ResponseAction::Tree { network: "254".to_string(), xml: String::new() });

        p.process("343-Begin");
        let second = p.process("344-End");
        assert_eq!(second, ResponseAction::Tree { network: "200".to_string(), xml: String::new() });
    }

    #[test]
    fn test_error_responses_counted() {
        let metrics = Arc::new(Metrics::new());
        let mut p = ResponseProcessor::new(metrics.clone());
        assert_eq!(p.process("401-Access denied"), ResponseAction::None);
        assert_eq!(p.process("404 no such object"), ResponseAction::None);
        assert_eq!(metrics.report().cgate_errors, 2);
    }

    #[test]
    fn test_lines_without_code_skipped() {
        let mut p = processor();
        assert_eq!(p.process("not a response"), ResponseAction::None);
        assert_eq!(p.process("999-out of range"), ResponseAction::None);
        assert_eq!(p.process("12-too short"), ResponseAction::None);
    }

    #[test]
    fn test_informational_response_ignored() {
        let mut p = processor();
        assert_eq!(p.process("200 OK"), ResponseAction::None);
    }
}
