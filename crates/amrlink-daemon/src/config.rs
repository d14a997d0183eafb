//! Configuration loading, environment overrides and validation

use amrlink_core::{
    AffineCoefficients, CacheConfig, FieldMap, ForwarderConfig, MotionConfig, SourceAdapter,
};
use amrlink_twinzo::TwinzoConfig;
use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub twinzo: TwinzoSection,
    #[serde(default)]
    pub transform: AffineCoefficients,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub forwarder: ForwarderSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Topic filter to subscribe to (wildcards allowed)
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    /// Client ID; a random `amrlink-...` ID is generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Subscription QoS (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Connect over TLS
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Consecutive failures before giving up (0 = never)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic: default_mqtt_topic(),
            client_id: None,
            qos: default_qos(),
            keep_alive_secs: default_keep_alive(),
            tls: false,
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: 0,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "ati_fm/sherpa/status".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinzoSection {
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_localization_url")]
    pub localization_url: String,
    /// Tenant name ("client" in the auth request)
    #[serde(default)]
    pub tenant: String,
    /// Shared device password
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub api_key: String,
    /// HTTP timeout for both endpoints
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Refresh credentials this long before they expire
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    /// Sweep expired credentials at most this often
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for TwinzoSection {
    fn default() -> Self {
        Self {
            auth_url: default_auth_url(),
            localization_url: default_localization_url(),
            tenant: String::new(),
            password: String::new(),
            api_key: String::new(),
            timeout_secs: default_timeout(),
            refresh_margin_secs: default_refresh_margin(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_auth_url() -> String {
    TwinzoConfig::default().auth_url
}

fn default_localization_url() -> String {
    TwinzoConfig::default().localization_url
}

fn default_timeout() -> u64 {
    10
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    600
}

/// Pose layout of the inbound feed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// `pose: [x, y, z, roll, pitch, yaw]`
    #[default]
    Array,
    /// `pose: {x, y, z, theta}`
    Object,
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "array" => Ok(SourceFormat::Array),
            "object" => Ok(SourceFormat::Object),
            other => Err(format!("unknown source format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub format: SourceFormat,
    /// Overrides the format's identifier fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_fields: Option<Vec<String>>,
    /// Overrides the format's pose field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose_field: Option<String>,
    /// Overrides the format's battery fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_fields: Option<Vec<String>>,
    /// Source identifier to Twinzo device login
    #[serde(default)]
    pub device_map: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwarderSection {
    #[serde(default = "default_sector_ids")]
    pub sector_ids: Vec<i64>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u32,
    #[serde(default = "default_battery")]
    pub default_battery: u8,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_log_every_n")]
    pub log_every_n: u64,
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f64,
    #[serde(default = "default_motion_window")]
    pub motion_window_ms: i64,
    #[serde(default = "default_max_tracked")]
    pub max_tracked_devices: usize,
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            sector_ids: default_sector_ids(),
            interval_ms: default_interval_ms(),
            default_battery: default_battery(),
            dry_run: false,
            log_every_n: default_log_every_n(),
            motion_threshold: default_motion_threshold(),
            motion_window_ms: default_motion_window(),
            max_tracked_devices: default_max_tracked(),
        }
    }
}

fn default_sector_ids() -> Vec<i64> {
    vec![1]
}

fn default_interval_ms() -> u32 {
    100
}

fn default_battery() -> u8 {
    85
}

fn default_log_every_n() -> u64 {
    50
}

fn default_motion_threshold() -> f64 {
    250.0
}

fn default_motion_window() -> i64 {
    1000
}

fn default_max_tracked() -> usize {
    1024
}

impl Config {
    /// Apply environment overrides on top of the file values
    ///
    /// `lookup` returns the variable's value, if set. Unparsable values are
    /// an error naming the variable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = get("MQTT_PORT") {
            self.mqtt.port = parse_var("MQTT_PORT", &v)?;
        }
        if let Some(v) = get("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = get("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = get("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = get("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(v);
        }
        if let Some(v) = get("MQTT_TLS") {
            self.mqtt.tls = parse_flag("MQTT_TLS", &v)?;
        }

        // Base URL first so explicit endpoint URLs win
        if let Some(v) = get("TWINZO_URL") {
            let derived = TwinzoConfig::with_base_url(&v);
            self.twinzo.auth_url = derived.auth_url;
            self.twinzo.localization_url = derived.localization_url;
        }
        if let Some(v) = get("TWINZO_AUTH_URL") {
            self.twinzo.auth_url = v;
        }
        if let Some(v) = get("TWINZO_LOCALIZATION_URL") {
            self.twinzo.localization_url = v;
        }
        if let Some(v) = get("TWINZO_CLIENT") {
            self.twinzo.tenant = v;
        }
        if let Some(v) = get("TWINZO_PASSWORD") {
            self.twinzo.password = v;
        }
        if let Some(v) = get("TWINZO_API_KEY") {
            self.twinzo.api_key = v;
        }

        let t = &mut self.transform;
        for (name, slot) in [
            ("AFFINE_A", &mut t.a),
            ("AFFINE_B", &mut t.b),
            ("AFFINE_C", &mut t.c),
            ("AFFINE_D", &mut t.d),
            ("AFFINE_TX", &mut t.tx),
            ("AFFINE_TY", &mut t.ty),
        ] {
            if let Some(v) = get(name) {
                *slot = parse_var(name, &v)?;
            }
        }

        if let Some(v) = get("SOURCE_FORMAT") {
            self.source.format = parse_var("SOURCE_FORMAT", &v)?;
        }
        if let Some(v) = get("DRY_RUN") {
            self.forwarder.dry_run = parse_flag("DRY_RUN", &v)?;
        }
        if let Some(v) = get("LOG_EVERY_N") {
            self.forwarder.log_every_n = parse_var("LOG_EVERY_N", &v)?;
        }
        if let Some(v) = get("SECTOR_IDS") {
            self.forwarder.sector_ids = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_var("SECTOR_IDS", s))
                .collect::<Result<Vec<i64>>>()?;
        }

        Ok(())
    }

    /// Reject configurations the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.mqtt.topic.trim().is_empty(), "mqtt.topic must not be empty");
        ensure!(self.mqtt.qos <= 2, "mqtt.qos must be 0, 1 or 2 (got {})", self.mqtt.qos);
        ensure!(!self.twinzo.tenant.trim().is_empty(), "twinzo.tenant must not be empty");
        ensure!(
            !self.twinzo.auth_url.trim().is_empty(),
            "twinzo.auth_url must not be empty"
        );
        ensure!(
            !self.twinzo.localization_url.trim().is_empty(),
            "twinzo.localization_url must not be empty"
        );
        ensure!(self.twinzo.timeout_secs > 0, "twinzo.timeout_secs must be positive");
        ensure!(
            !self.forwarder.sector_ids.is_empty(),
            "forwarder.sector_ids must list at least one sector"
        );
        if !self.transform.is_finite() {
            bail!("transform coefficients must be finite numbers");
        }
        ensure!(
            self.forwarder.motion_threshold.is_finite() && self.forwarder.motion_threshold > 0.0,
            "forwarder.motion_threshold must be positive"
        );
        Ok(())
    }

    pub fn to_adapter(&self) -> SourceAdapter {
        let mut fields = match self.source.format {
            SourceFormat::Array => FieldMap::array_defaults(),
            SourceFormat::Object => FieldMap::object_defaults(),
        };
        if let Some(ids) = &self.source.id_fields {
            fields.id_fields = ids.clone();
        }
        if let Some(pose) = &self.source.pose_field {
            fields.pose_field = pose.clone();
        }
        if let Some(battery) = &self.source.battery_fields {
            fields.battery_fields = battery.clone();
        }
        match self.source.format {
            SourceFormat::Array => SourceAdapter::ArrayPose(fields),
            SourceFormat::Object => SourceAdapter::ObjectPose(fields),
        }
    }

    pub fn to_twinzo_config(&self) -> TwinzoConfig {
        TwinzoConfig {
            auth_url: self.twinzo.auth_url.clone(),
            localization_url: self.twinzo.localization_url.clone(),
            tenant: self.twinzo.tenant.clone(),
            password: self.twinzo.password.clone(),
            api_key: self.twinzo.api_key.clone(),
            timeout: Duration::from_secs(self.twinzo.timeout_secs),
        }
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            refresh_margin: Duration::from_secs(self.twinzo.refresh_margin_secs),
            sweep_interval: Duration::from_secs(self.twinzo.sweep_interval_secs),
        }
    }

    pub fn to_motion_config(&self) -> MotionConfig {
        MotionConfig {
            threshold: self.forwarder.motion_threshold,
            window_ms: self.forwarder.motion_window_ms,
            max_devices: self.forwarder.max_tracked_devices,
        }
    }

    pub fn to_forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            sector_ids: self.forwarder.sector_ids.clone(),
            interval_ms: self.forwarder.interval_ms,
            default_battery: self.forwarder.default_battery,
            dry_run: self.forwarder.dry_run,
            log_every_n: self.forwarder.log_every_n,
            device_map: self.source.device_map.clone(),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid value for {}: '{}' ({})", name, value, e))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => bail!("Invalid value for {}: '{}' (expected true or false)", name, value),
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let mut config = Config::default();
    config.twinzo.tenant = "my-tenant".to_string();

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
