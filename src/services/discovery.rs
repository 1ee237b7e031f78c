//! Home Assistant discovery from C-Gate tree XML
//!
//! A completed TREEXML transfer describes every unit and application group
//! on a network. Groups whose application matches a configured mapping are
//! announced as retained discovery documents under
//! `<prefix>/<component>/cgateweb_<n>_<a>_<g>/config`; the whole tree is
//! also republished as JSON on `cbus/read/<n>///tree` for non-HA consumers.

use crate::infra::config::Settings;
use crate::io::mqtt::MqttMessage;
use anyhow::{bail, Context};
use roxmltree::{Document, Node};
use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

/// The lighting application is fixed by C-Bus itself.
const LIGHTING_APP_ID: &str = "56";

const MANUFACTURER: &str = "Clipsal C-Bus via cgateweb";
const VIA_DEVICE: &str = "cgateweb_bridge";
const SUPPORT_URL: &str = "https://github.com/dougrathbone/cgateweb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HaComponent {
    Light,
    Cover,
    Switch,
    Relay,
    Pir,
}

impl HaComponent {
    /// Discovery topic segment.
    fn component(&self) -> &'static str {
        match self {
            HaComponent::Light => "light",
            HaComponent::Cover => "cover",
            HaComponent::Switch | HaComponent::Relay => "switch",
            HaComponent::Pir => "binary_sensor",
        }
    }

    fn model(&self) -> &'static str {
        match self {
            HaComponent::Light => "Lighting Group",
            HaComponent::Cover => "Enable Control Group (Cover)",
            HaComponent::Switch => "Enable Control Group (Switch)",
            HaComponent::Relay => "Enable Control Group (Relay)",
            HaComponent::Pir => "PIR Motion Sensor",
        }
    }

    fn device_class(&self) -> Option<&'static str> {
        match self {
            HaComponent::Light | HaComponent::Switch => None,
            HaComponent::Cover => Some("shutter"),
            HaComponent::Relay => Some("outlet"),
            HaComponent::Pir => Some("motion"),
        }
    }

    /// Word used in the fallback display name.
    fn type_word(&self) -> &'static str {
        match self {
            HaComponent::Light => "Light",
            HaComponent::Cover => "Cover",
            HaComponent::Switch => "Switch",
            HaComponent::Relay => "Relay",
            HaComponent::Pir => "Motion Sensor",
        }
    }
}

#[derive(Serialize)]
struct DeviceBlock {
    identifiers: Vec<String>,
    name: String,
    manufacturer: &'static str,
    model: &'static str,
    via_device: &'static str,
}

#[derive(Serialize)]
struct OriginBlock {
    name: &'static str,
    sw_version: &'static str,
    support_url: &'static str,
}

#[derive(Serialize)]
struct DiscoveryConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness_state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness_command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness_scale: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_command_type: Option<&'static str>,
    payload_on: &'static str,
    payload_off: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    qos: u8,
    retain: bool,
    device: DeviceBlock,
    origin: OriginBlock,
}

pub struct Discovery {
    settings: Settings,
}

impl Discovery {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Networks to announce: the configured list, else the getall network.
    pub fn networks(&self) -> Vec<String> {
        self.settings.ha_discovery_networks()
    }

    /// Parse one network's tree XML into the publications it produces:
    /// one retained config per recognized group plus the tree JSON.
    pub fn handle_tree(&self, network: &str, xml: &str) -> anyhow::Result<Vec<MqttMessage>> {
        let doc = Document::parse(xml).context("tree XML did not parse")?;

        let root = doc.root_element();
        if !root.has_tag_name("Network") {
            bail!("tree root is <{}>, expected <Network>", root.tag_name().name());
        }
        let interface = child_element(&root, "Interface")
            .context("tree XML has no <Interface> under the root")?;
        let inner = child_element(&interface, "Network")
            .context("tree XML has no <Network> under <Interface>")?;

        let tree_network = child_text(&inner, "NetworkNumber").unwrap_or_default();
        if tree_network != network {
            bail!("tree is for network {}, expected {}", tree_network, network);
        }

        let mut messages = Vec::new();
        let mut seen: FxHashSet<(String, String)> = FxHashSet::default();

        // A manual gettree still republishes the tree JSON below, but only
        // enabled discovery announces entities to Home Assistant.
        let announce = self.settings.ha_discovery_enabled();

        if announce {
            for unit in inner.children().filter(|n| n.has_tag_name("Unit")) {
                for application in unit.children().filter(|n| n.has_tag_name("Application")) {
                    let Some(app_id) = child_text(&application, "ApplicationAddress") else {
                        continue;
                    };
                    let Some(component) = self.classify(&app_id) else {
                        continue;
                    };

                    for group in application.children().filter(|n| n.has_tag_name("Group")) {
                        let Some(group_id) = child_text(&group, "GroupAddress") else {
                            continue;
                        };
                        if group_id.is_empty() {
                            continue;
                        }
                        if !seen.insert((app_id.clone(), group_id.clone())) {
                            continue;
                        }

                        let label = child_text(&group, "Label").filter(|l| !l.is_empty());
                        messages.push(self.config_message(
                            component, network, &app_id, &group_id, label,
                        )?);
                    }
                }
            }
        }

        info!(network = network, entities = messages.len(), "discovery_tree_announced");

        let tree_json = serde_json::json!({ "Network": tree_to_json(&root) });
        messages.push(MqttMessage::new(
            format!("cbus/read/{}///tree", network),
            serde_json::to_string(&tree_json)?,
            true,
        ));

        Ok(messages)
    }

    /// Map an application id to its component. The lighting application is
    /// always a light; configured ids resolve in priority order
    /// cover > switch > relay > PIR.
    fn classify(&self, app_id: &str) -> Option<HaComponent> {
        if app_id == LIGHTING_APP_ID {
            return Some(HaComponent::Light);
        }
        if self.settings.ha_cover_app_id() == Some(app_id) {
            return Some(HaComponent::Cover);
        }
        if self.settings.ha_switch_app_id() == Some(app_id) {
            return Some(HaComponent::Switch);
        }
        if self.settings.ha_relay_app_id() == Some(app_id) {
            return Some(HaComponent::Relay);
        }
        if self.settings.ha_pir_app_id() == Some(app_id) {
            return Some(HaComponent::Pir);
        }
        None
    }

    fn config_message(
        &self,
        component: HaComponent,
        network: &str,
        app_id: &str,
        group_id: &str,
        label: Option<String>,
    ) -> anyhow::Result<MqttMessage> {
        let unique_id = format!("cgateweb_{}_{}_{}", network, app_id, group_id);
        let name = label.unwrap_or_else(|| {
            format!("CBus {} {}/{}/{}", component.type_word(), network, app_id, group_id)
        });
        let read_base = format!("cbus/read/{}/{}/{}", network, app_id, group_id);
        let write_base = format!("cbus/write/{}/{}/{}", network, app_id, group_id);

        // Lights ramp (dimmable); other writable components switch; PIR is
        // a read-only sensor.
        let command_topic = match component {
            HaComponent::Light => Some(format!("{}/ramp", write_base)),
            HaComponent::Cover | HaComponent::Switch | HaComponent::Relay => {
                Some(format!("{}/switch", write_base))
            }
            HaComponent::Pir => None,
        };
        let is_light = component == HaComponent::Light;

        let config = DiscoveryConfig {
            name: name.clone(),
            unique_id: unique_id.clone(),
            state_topic: format!("{}/state", read_base),
            command_topic,
            brightness_state_topic: is_light.then(|| format!("{}/level", read_base)),
            brightness_command_topic: is_light.then(|| format!("{}/ramp", write_base)),
            brightness_scale: is_light.then_some(100),
            on_command_type: is_light.then_some("brightness"),
            payload_on: "ON",
            payload_off: "OFF",
            device_class: component.device_class(),
            qos: 0,
            retain: true,
            device: DeviceBlock {
                identifiers: vec![unique_id.clone()],
                name,
                manufacturer: MANUFACTURER,
                model: component.model(),
                via_device: VIA_DEVICE,
            },
            origin: OriginBlock {
                name: "cgateweb",
                sw_version: env!("CARGO_PKG_VERSION"),
                support_url: SUPPORT_URL,
            },
        };

        let topic = format!(
            "{}/{}/{}/config",
            self.settings.ha_discovery_prefix(),
            component.component(),
            unique_id
        );

        debug!(topic = %topic, "discovery_config_built");

        Ok(MqttMessage::new(topic, serde_json::to_string(&config)?, true))
    }
}

fn child_element<'a, 'input>(
    node: &Node<'a, 'input>,
    name: &str,
) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn child_text(node: &Node, name: &str) -> Option<String> {
    child_element(node, name).map(|n| n.text().unwrap_or_default().trim().to_string())
}

/// Generic XML-to-JSON conversion for the tree republication: repeated
/// child tags become arrays, text-only elements become strings.
fn tree_to_json(node: &Node) -> Value {
    let elements: Vec<Node> = node.children().filter(|n| n.is_element()).collect();

    if elements.is_empty() {
        return Value::String(node.text().unwrap_or_default().trim().to_string());
    }

    let mut map = serde_json::Map::new();
    for child in elements {
        let name = child.tag_name().name().to_string();
        let value = tree_to_json(&child);
        match map.get_mut(&name) {
            None => {
                map.insert(name, value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
    Value::Object(map)
}
