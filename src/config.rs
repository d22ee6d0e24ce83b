use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

// Serial port configuration
pub const BAUD_RATE: u32 = 57_600;
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";
pub const SERIAL_TIMEOUT_MS: u64 = 100;
pub const POST_WRITE_SETTLE_MS: u64 = 200;
pub const POLL_INTERVAL_MS: u64 = 300;

// Per-command deadlines
pub const CONFIG_COMMAND_TIMEOUT_SECS: u64 = 5;
pub const QUERY_COMMAND_TIMEOUT_SECS: u64 = 1;
pub const PHASE_TWO_TIMEOUT_SECS: u64 = 20;

// LoRaWAN defaults
pub const DEFAULT_UPLINK_PORT: u8 = 220;
pub const DISABLED_CHANNEL_BANK: std::ops::Range<u8> = 0..3;
pub const MAX_TRANSMISSIONS: u32 = 50;

// Broker defaults
pub const MQTT_PORT: u16 = 1883;
pub const MQTT_KEEP_ALIVE_SECS: u64 = 60;
pub const MQTT_MAX_CONNECT_ATTEMPTS: u32 = 5;
pub const MQTT_RETRY_DELAY_MS: u64 = 1000;

/// Deadlines applied by the configuration manager to each class of command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    /// `sys`/`mac set`/`mac save` and phase one of join and transmit.
    pub config: Duration,
    /// `mac get` queries, which only complete through the tolerant-timeout rule.
    pub query: Duration,
    /// Phase two of join and transmit.
    pub phase_two: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            config: Duration::from_secs(CONFIG_COMMAND_TIMEOUT_SECS),
            query: Duration::from_secs(QUERY_COMMAND_TIMEOUT_SECS),
            phase_two: Duration::from_secs(PHASE_TWO_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: SerialSettings,
    pub device: DeviceSettings,
    pub mqtt: MqttSettings,
    pub experiment: ExperimentSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: BAUD_RATE,
        }
    }
}

/// Credentials for one of the two LoRaWAN activation modes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Activation {
    Abp {
        devaddr: String,
        nwkskey: String,
        appskey: String,
    },
    Otaa {
        deveui: String,
        appeui: String,
        appkey: String,
    },
}

/// One channel to enable after the default bank has been switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChannelPlan {
    pub id: u8,
    /// Percentage of airtime allowed; 0 leaves the channel unrestricted.
    #[serde(default)]
    pub duty_cycle: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub activation: Option<Activation>,
    pub link_check_interval: u16,
    pub channels: Vec<ChannelPlan>,
    /// Address the network server reports for this device. Defaults to the
    /// ABP `devaddr`; required for OTAA since the address is assigned on join.
    pub feedback_address: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            activation: None,
            link_check_interval: 0,
            channels: (0..3).map(|id| ChannelPlan { id, duty_cycle: 0 }).collect(),
            feedback_address: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub max_connect_attempts: u32,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: MQTT_PORT,
            username: None,
            password: None,
            topic: "#".to_string(),
            client_id: "lora-link-agent".to_string(),
            keep_alive_secs: MQTT_KEEP_ALIVE_SECS,
            max_connect_attempts: MQTT_MAX_CONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperimentSettings {
    pub max_transmissions: u32,
    pub initial_datarate: u8,
    pub initial_power_index: u8,
    pub uplink_port: u8,
    pub confirmed: bool,
    pub adr: bool,
    pub config_retry_delay_ms: u64,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            max_transmissions: MAX_TRANSMISSIONS,
            initial_datarate: 0,
            initial_power_index: 1,
            uplink_port: DEFAULT_UPLINK_PORT,
            confirmed: false,
            adr: false,
            config_retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub decision_table: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            decision_table: PathBuf::from("config/decision_table.json"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. Missing sections fall back to defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=5).contains(&self.experiment.initial_power_index) {
            return Err(ConfigError::Invalid(format!(
                "initial_power_index must be within 1..=5, got {}",
                self.experiment.initial_power_index
            )));
        }
        if let Some(plan) = self.device.channels.iter().find(|c| c.duty_cycle > 100) {
            return Err(ConfigError::Invalid(format!(
                "duty cycle for channel {} exceeds 100%",
                plan.id
            )));
        }
        Ok(())
    }

    pub fn activation(&self) -> Result<&Activation, ConfigError> {
        self.device
            .activation
            .as_ref()
            .ok_or(ConfigError::MissingCredentials("device.activation"))
    }

    /// Device address used to filter incoming telemetry.
    pub fn feedback_address(&self) -> Result<String, ConfigError> {
        if let Some(addr) = &self.device.feedback_address {
            return Ok(addr.clone());
        }
        match self.activation()? {
            Activation::Abp { devaddr, .. } => Ok(devaddr.clone()),
            Activation::Otaa { .. } => Err(ConfigError::MissingCredentials(
                "device.feedback_address",
            )),
        }
    }

    pub fn config_retry_delay(&self) -> Duration {
        Duration::from_millis(self.experiment.config_retry_delay_ms)
    }
}
