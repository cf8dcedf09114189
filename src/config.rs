//! YAML configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::DeviceType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub devices: Vec<DeviceConfig>,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Topic prefix the openWB instance publishes under.
    pub root_topic: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            root_topic: "openWB".to_string(),
            client_id: "openwb-bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Base URL of the simpleAPI, e.g. `http://openwb.local:8420`.
    pub url: Option<String>,
    /// Optional bearer token for write requests.
    pub token: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

impl HttpConfig {
    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs.unwrap_or(15)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub id: Option<u32>,
    pub transport: TransportMode,
    /// Power class of the wallbox, 11 or 22 kW.
    #[serde(default = "default_wallbox_power")]
    pub wallbox_power_kw: u8,
    /// Optional id→name directory shown alongside vehicle selects.
    #[serde(default)]
    pub vehicles: BTreeMap<u32, String>,
}

fn default_api_port() -> u16 {
    8126
}

fn default_wallbox_power() -> u8 {
    11
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".to_string()));
        }
        for device in &self.devices {
            if device.device_type == DeviceType::Controller {
                if device.id.is_some() {
                    return Err(ConfigError::Invalid(
                        "the controller takes no device id".to_string(),
                    ));
                }
            } else if device.id.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "device type `{}` needs an id",
                    device.device_type.wire_name()
                )));
            }
            if device.transport == TransportMode::Http {
                if self.http.url.is_none() {
                    return Err(ConfigError::Invalid(
                        "an http device is configured but http.url is missing".to_string(),
                    ));
                }
                if device.device_type == DeviceType::Vehicle {
                    return Err(ConfigError::Invalid(
                        "vehicles are not pollable over the simpleAPI, use mqtt".to_string(),
                    ));
                }
            }
            if !matches!(device.wallbox_power_kw, 11 | 22) {
                return Err(ConfigError::Invalid(format!(
                    "wallbox_power_kw must be 11 or 22, got {}",
                    device.wallbox_power_kw
                )));
            }
        }
        Ok(())
    }
}

/// Static addressing facts for one configured device, shared by the
/// resolver, coordinator and dispatcher.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub device_type: DeviceType,
    pub device_id: Option<u32>,
    pub mqtt_root: String,
    pub wallbox_power_kw: u8,
    pub vehicles: BTreeMap<u32, String>,
}

impl DeviceBinding {
    pub fn from_config(device: &DeviceConfig, mqtt: &MqttConfig) -> DeviceBinding {
        DeviceBinding {
            device_type: device.device_type,
            device_id: device.id,
            mqtt_root: mqtt.root_topic.clone(),
            wallbox_power_kw: device.wallbox_power_kw,
            vehicles: device.vehicles.clone(),
        }
    }

    /// Stable handle used in logs and API paths, e.g. `chargepoint_4`.
    pub fn label(&self) -> String {
        match self.device_id {
            Some(id) => format!("{}_{id}", self.device_type.wire_name()),
            None => self.device_type.wire_name().to_string(),
        }
    }

    /// Highest charging current the hardware can deliver.
    pub fn max_charge_current(&self) -> f64 {
        if self.wallbox_power_kw == 22 {
            32.0
        } else {
            16.0
        }
    }
}
