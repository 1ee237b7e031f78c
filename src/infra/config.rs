//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/default.toml
//!
//! The TOML sections are deserialized, validated once, and flattened into an
//! immutable `Settings` record that is cloned into every component.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct CgateSection {
    #[serde(default = "default_cgate_host")]
    pub host: String,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_event_port")]
    pub event_port: u16,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_cgate_host() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    20023
}

fn default_event_port() -> u16 {
    20025
}

fn default_project() -> String {
    "HOME".to_string()
}

impl Default for CgateSection {
    fn default() -> Self {
        Self {
            host: default_cgate_host(),
            command_port: default_command_port(),
            event_port: default_event_port(),
            project: default_project(),
            user: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    /// Broker endpoint as `host:port`.
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Set the retain flag on every state/level publication.
    #[serde(default)]
    pub retain_reads: bool,
}

fn default_broker() -> String {
    "localhost:1883".to_string()
}

impl Default for MqttSection {
    fn default() -> Self {
        Self { broker: default_broker(), user: None, password: None, retain_reads: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// Minimum spacing between outbound dispatches, both queues.
    #[serde(default = "default_message_interval_ms")]
    pub message_interval_ms: u32,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

fn default_message_interval_ms() -> u32 {
    200
}

fn default_metrics_interval_secs() -> u64 {
    60
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            message_interval_ms: default_message_interval_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GetAllSection {
    /// `<network>/<application>` to refresh, e.g. "254/56".
    #[serde(default)]
    pub net_app: Option<String>,
    /// Emit one refresh as soon as the bridge is ready.
    #[serde(default)]
    pub on_start: bool,
    /// Repeat the refresh every N seconds.
    #[serde(default)]
    pub period_seconds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    #[serde(default)]
    pub enabled: bool,
    /// Networks to query via TREEXML; falls back to the getall network.
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub cover_app_id: Option<String>,
    #[serde(default)]
    pub switch_app_id: Option<String>,
    #[serde(default)]
    pub relay_app_id: Option<String>,
    #[serde(default)]
    pub pir_app_id: Option<String>,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: false,
            networks: Vec::new(),
            prefix: default_discovery_prefix(),
            cover_app_id: None,
            switch_app_id: None,
            relay_app_id: None,
            pir_app_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_pool_size")]
    pub size: u32,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Reconnect attempts per slot before the slot gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_pool_size() -> u32 {
    3
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_keep_alive_interval_ms() -> u64 {
    60_000
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            health_check_interval_ms: default_health_check_interval_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Event-channel reconnect budget before the channel goes terminal.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

fn default_reconnect_initial_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub cgate: CgateSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub getall: GetAllSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Main configuration struct used throughout the application.
///
/// Built once by `Settings::build`; immutable thereafter. Interval floors
/// (health check 5 s, keep-alive 10 s) are applied here so the rest of the
/// code never re-checks them.
#[derive(Debug, Clone)]
pub struct Settings {
    cgate_host: String,
    cgate_command_port: u16,
    cgate_event_port: u16,
    cgate_project: String,
    cgate_user: Option<String>,
    cgate_password: Option<String>,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_user: Option<String>,
    mqtt_password: Option<String>,
    retain_reads: bool,
    message_interval_ms: u32,
    metrics_interval_secs: u64,
    getall_net_app: Option<(String, String)>,
    getall_on_start: bool,
    getall_period_seconds: Option<u32>,
    ha_discovery_enabled: bool,
    ha_discovery_networks: Vec<String>,
    ha_discovery_prefix: String,
    ha_cover_app_id: Option<String>,
    ha_switch_app_id: Option<String>,
    ha_relay_app_id: Option<String>,
    ha_pir_app_id: Option<String>,
    pool_size: u32,
    health_check_interval_ms: u64,
    keep_alive_interval_ms: u64,
    connection_timeout_ms: u64,
    pool_max_retries: u32,
    reconnect_initial_delay_ms: u64,
    reconnect_max_delay_ms: u64,
    reconnect_max_attempts: u32,
    config_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::build(TomlConfig::default(), "default")
            .unwrap_or_else(|e| panic!("built-in defaults must validate: {}", e))
    }
}

impl Settings {
    /// Determine config file path from args or environment.
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/default.toml".to_string()
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::build(toml_config, &path.display().to_string())
    }

    /// Load configuration. A missing file falls back to defaults with a
    /// warning; a file that fails to parse or validate is a hard error.
    pub fn load(args: &[String]) -> anyhow::Result<Self> {
        let config_path = Self::resolve_config_path(args);

        if !Path::new(&config_path).exists() {
            eprintln!("Warning: config file {} not found. Using defaults.", config_path);
            return Ok(Self::default());
        }

        Self::from_file(&config_path)
    }

    /// Validate and flatten the TOML sections.
    pub fn build(toml_config: TomlConfig, config_file: &str) -> anyhow::Result<Self> {
        let c = toml_config;

        if c.cgate.command_port == c.cgate.event_port {
            bail!(
                "cgate.command_port and cgate.event_port must differ (both {})",
                c.cgate.command_port
            );
        }
        if c.cgate.project.is_empty() {
            bail!("cgate.project must not be empty");
        }
        if c.bridge.message_interval_ms == 0 {
            bail!("bridge.message_interval_ms must be > 0");
        }
        if c.pool.size == 0 {
            bail!("pool.size must be >= 1");
        }

        let (mqtt_host, mqtt_port) = parse_broker(&c.mqtt.broker)?;

        let getall_net_app = match &c.getall.net_app {
            Some(s) => Some(parse_net_app(s)?),
            None => None,
        };

        Ok(Self {
            cgate_host: c.cgate.host,
            cgate_command_port: c.cgate.command_port,
            cgate_event_port: c.cgate.event_port,
            cgate_project: c.cgate.project,
            cgate_user: c.cgate.user.filter(|u| !u.is_empty()),
            cgate_password: c.cgate.password,
            mqtt_host,
            mqtt_port,
            mqtt_user: c.mqtt.user.filter(|u| !u.is_empty()),
            mqtt_password: c.mqtt.password,
            retain_reads: c.mqtt.retain_reads,
            message_interval_ms: c.bridge.message_interval_ms,
            metrics_interval_secs: c.bridge.metrics_interval_secs,
            getall_net_app,
            getall_on_start: c.getall.on_start,
            getall_period_seconds: c.getall.period_seconds.filter(|p| *p > 0),
            ha_discovery_enabled: c.discovery.enabled,
            ha_discovery_networks: c.discovery.networks,
            ha_discovery_prefix: c.discovery.prefix,
            ha_cover_app_id: c.discovery.cover_app_id,
            ha_switch_app_id: c.discovery.switch_app_id,
            ha_relay_app_id: c.discovery.relay_app_id,
            ha_pir_app_id: c.discovery.pir_app_id,
            pool_size: c.pool.size,
            health_check_interval_ms: c.pool.health_check_interval_ms.max(5_000),
            keep_alive_interval_ms: c.pool.keep_alive_interval_ms.max(10_000),
            connection_timeout_ms: c.pool.connection_timeout_ms,
            pool_max_retries: c.pool.max_retries,
            reconnect_initial_delay_ms: c.reconnect.initial_delay_ms,
            reconnect_max_delay_ms: c.reconnect.max_delay_ms,
            reconnect_max_attempts: c.reconnect.max_attempts,
            config_file: config_file.to_string(),
        })
    }

    // Getters for all config fields

    pub fn cgate_host(&self) -> &str {
        &self.cgate_host
    }

    pub fn cgate_command_port(&self) -> u16 {
        self.cgate_command_port
    }

    pub fn cgate_event_port(&self) -> u16 {
        self.cgate_event_port
    }

    pub fn cgate_project(&self) -> &str {
        &self.cgate_project
    }

    /// Present only when a non-empty user is configured; the password
    /// defaults to empty so `LOGIN <user> <pass>` is always well-formed.
    pub fn cgate_credentials(&self) -> Option<(&str, &str)> {
        self.cgate_user
            .as_deref()
            .map(|u| (u, self.cgate_password.as_deref().unwrap_or("")))
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_credentials(&self) -> Option<(&str, &str)> {
        self.mqtt_user
            .as_deref()
            .map(|u| (u, self.mqtt_password.as_deref().unwrap_or("")))
    }

    pub fn retain_reads(&self) -> bool {
        self.retain_reads
    }

    pub fn message_interval_ms(&self) -> u32 {
        self.message_interval_ms
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn getall_net_app(&self) -> Option<(&str, &str)> {
        self.getall_net_app.as_ref().map(|(n, a)| (n.as_str(), a.as_str()))
    }

    pub fn getall_on_start(&self) -> bool {
        self.getall_on_start
    }

    pub fn getall_period_seconds(&self) -> Option<u32> {
        self.getall_period_seconds
    }

    pub fn ha_discovery_enabled(&self) -> bool {
        self.ha_discovery_enabled
    }

    /// Explicitly configured networks, else the getall network.
    pub fn ha_discovery_networks(&self) -> Vec<String> {
        if !self.ha_discovery_networks.is_empty() {
            return self.ha_discovery_networks.clone();
        }
        self.getall_net_app
            .as_ref()
            .map(|(n, _)| vec![n.clone()])
            .unwrap_or_default()
    }

    pub fn ha_discovery_prefix(&self) -> &str {
        &self.ha_discovery_prefix
    }

    pub fn ha_cover_app_id(&self) -> Option<&str> {
        self.ha_cover_app_id.as_deref()
    }

    pub fn ha_switch_app_id(&self) -> Option<&str> {
        self.ha_switch_app_id.as_deref()
    }

    pub fn ha_relay_app_id(&self) -> Option<&str> {
        self.ha_relay_app_id.as_deref()
    }

    pub fn ha_pir_app_id(&self) -> Option<&str> {
        self.ha_pir_app_id.as_deref()
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn health_check_interval_ms(&self) -> u64 {
        self.health_check_interval_ms
    }

    pub fn keep_alive_interval_ms(&self) -> u64 {
        self.keep_alive_interval_ms
    }

    pub fn connection_timeout_ms(&self) -> u64 {
        self.connection_timeout_ms
    }

    pub fn pool_max_retries(&self) -> u32 {
        self.pool_max_retries
    }

    pub fn reconnect_initial_delay_ms(&self) -> u64 {
        self.reconnect_initial_delay_ms
    }

    pub fn reconnect_max_delay_ms(&self) -> u64 {
        self.reconnect_max_delay_ms
    }

    pub fn reconnect_max_attempts(&self) -> u32 {
        self.reconnect_max_attempts
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

fn parse_broker(broker: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = broker
        .rsplit_once(':')
        .with_context(|| format!("mqtt.broker '{}' must be host:port", broker))?;
    if host.is_empty() {
        bail!("mqtt.broker '{}' has an empty host", broker);
    }
    let port: u16 =
        port.parse().with_context(|| format!("mqtt.broker '{}' has an invalid port", broker))?;
    Ok((host.to_string(), port))
}

fn parse_net_app(s: &str) -> anyhow::Result<(String, String)> {
    let parts: Vec<&str> = s.split('/').collect();
    let valid = parts.len() == 2
        && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if !valid {
        bail!("getall.net_app '{}' must be <network>/<application>", s);
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.cgate_host(), "127.0.0.1");
        assert_eq!(settings.cgate_command_port(), 20023);
        assert_eq!(settings.cgate_event_port(), 20025);
        assert_eq!(settings.cgate_project(), "HOME");
        assert_eq!(settings.mqtt_host(), "localhost");
        assert_eq!(settings.mqtt_port(), 1883);
        assert_eq!(settings.message_interval_ms(), 200);
        assert_eq!(settings.pool_size(), 3);
        assert_eq!(settings.ha_discovery_prefix(), "homeassistant");
        assert!(settings.cgate_credentials().is_none());
        assert!(!settings.retain_reads());
    }

    #[test]
    fn test_equal_ports_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.cgate.event_port = toml_config.cgate.command_port;
        assert!(Settings::build(toml_config, "test").is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.bridge.message_interval_ms = 0;
        assert!(Settings::build(toml_config, "test").is_err());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let mut toml_config = TomlConfig::default();
        toml_config.pool.size = 0;
        assert!(Settings::build(toml_config, "test").is_err());
    }

    #[test]
    fn test_interval_floors_applied() {
        let mut toml_config = TomlConfig::default();
        toml_config.pool.health_check_interval_ms = 100;
        toml_config.pool.keep_alive_interval_ms = 100;
        let settings = Settings::build(toml_config, "test").unwrap();
        assert_eq!(settings.health_check_interval_ms(), 5_000);
        assert_eq!(settings.keep_alive_interval_ms(), 10_000);
    }

    #[test]
    fn test_broker_parsing() {
        assert_eq!(parse_broker("mqtt.lan:1883").unwrap(), ("mqtt.lan".to_string(), 1883));
        assert!(parse_broker("no-port").is_err());
        assert!(parse_broker(":1883").is_err());
        assert!(parse_broker("host:notaport").is_err());
    }

    #[test]
    fn test_net_app_parsing() {
        assert_eq!(parse_net_app("254/56").unwrap(), ("254".to_string(), "56".to_string()));
        assert!(parse_net_app("254").is_err());
        assert!(parse_net_app("254/56/4").is_err());
        assert!(parse_net_app("254/abc").is_err());
    }

    #[test]
    fn test_empty_user_means_no_credentials() {
        let mut toml_config = TomlConfig::default();
        toml_config.cgate.user = Some(String::new());
        toml_config.cgate.password = Some("secret".to_string());
        let settings = Settings::build(toml_config, "test").unwrap();
        assert!(settings.cgate_credentials().is_none());
    }

    #[test]
    fn test_credentials_with_missing_password() {
        let mut toml_config = TomlConfig::default();
        toml_config.cgate.user = Some("admin".to_string());
        let settings = Settings::build(toml_config, "test").unwrap();
        assert_eq!(settings.cgate_credentials(), Some(("admin", "")));
    }

    #[test]
    fn test_discovery_networks_fallback() {
        let mut toml_config = TomlConfig::default();
        toml_config.getall.net_app = Some("254/56".to_string());
        let settings = Settings::build(toml_config, "test").unwrap();
        assert_eq!(settings.ha_discovery_networks(), vec!["254".to_string()]);

        let mut toml_config = TomlConfig::default();
        toml_config.discovery.networks = vec!["200".to_string(), "201".to_string()];
        toml_config.getall.net_app = Some("254/56".to_string());
        let settings = Settings::build(toml_config, "test").unwrap();
        assert_eq!(settings.ha_discovery_networks(), vec!["200", "201"]);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["cgateweb".to_string()];
        assert_eq!(Settings::resolve_config_path(&args), "config/default.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["cgateweb".to_string(), "--config".to_string(), "config/site.toml".to_string()];
        assert_eq!(Settings::resolve_config_path(&args), "config/site.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["cgateweb".to_string(), "--config=config/site.toml".to_string()];
        assert_eq!(Settings::resolve_config_path(&args), "config/site.toml");
    }
}
