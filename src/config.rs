//! # Application Settings
//!
//! Settings for the console harness and anything else that opens a
//! connection from a file. The layout follows the `appsettings.json` the
//! harness has always shipped with:
//!
//! ```json
//! {
//!   "ClientSettings": {
//!     "IP": "127.0.0.1",
//!     "Port": 502,
//!     "BaudRate": 9600
//!   }
//! }
//! ```
//!
//! The same section may also carry `Transport` (`tcp` or `rtu`),
//! `SerialPort`, `UnitId`, `TimeoutMs` and `PacketLogging`. Files ending in
//! `.yaml`/`.yml` are read as YAML, everything else as JSON.

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::transport::{SerialConfig, TransportKind};
use crate::utils::validation;

/// Default settings file name, looked up next to the executable
pub const DEFAULT_SETTINGS_FILE: &str = "appsettings.json";

/// Top-level settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppSettings {
    #[serde(default)]
    pub client_settings: ClientSettings,
}

/// Where and how the client connects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClientSettings {
    /// Device host name or address (TCP)
    #[serde(rename = "IP")]
    pub ip: String,
    pub port: u16,
    pub baud_rate: u32,
    pub transport: TransportKind,
    /// Serial device path (RTU)
    pub serial_port: String,
    pub unit_id: SlaveId,
    pub timeout_ms: u64,
    /// Hex-dump every frame through `tracing`
    pub packet_logging: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: crate::DEFAULT_TCP_PORT,
            baud_rate: 9600,
            transport: TransportKind::Tcp,
            serial_port: default_serial_port().to_string(),
            unit_id: 1,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            packet_logging: false,
        }
    }
}

#[cfg(windows)]
fn default_serial_port() -> &'static str {
    "COM1"
}

#[cfg(not(windows))]
fn default_serial_port() -> &'static str {
    "/dev/ttyUSB0"
}

impl AppSettings {
    /// Load and validate settings from a JSON or YAML file
    pub fn load(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let settings = if is_yaml(path) {
            Self::from_yaml_str(&content)?
        } else {
            Self::from_json_str(&content)?
        };
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> ModbusResult<Self> {
        let settings: Self = serde_json::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ModbusResult<Self> {
        let settings: Self = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that the settings describe a usable connection
    pub fn validate(&self) -> ModbusResult<()> {
        let client = &self.client_settings;
        match client.transport {
            TransportKind::Tcp => {
                if client.ip.trim().is_empty() {
                    return Err(ModbusError::configuration("ClientSettings:IP must not be empty"));
                }
                if client.port == 0 {
                    return Err(ModbusError::configuration("ClientSettings:Port must not be 0"));
                }
            },
            TransportKind::Rtu => {
                if client.serial_port.trim().is_empty() {
                    return Err(ModbusError::configuration("ClientSettings:SerialPort must not be empty"));
                }
            },
        }
        if client.baud_rate == 0 {
            return Err(ModbusError::configuration("ClientSettings:BaudRate must be greater than 0"));
        }
        if client.timeout_ms == 0 {
            return Err(ModbusError::configuration("ClientSettings:TimeoutMs must be greater than 0"));
        }
        validation::validate_unit_id(client.unit_id)
            .map_err(|e| ModbusError::configuration(format!("ClientSettings:UnitId: {}", e)))?;

        debug!("Settings validated: {:?}", client);
        Ok(())
    }

    /// `host:port` for a TCP connection
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.client_settings.ip, self.client_settings.port)
    }

    /// Serial line settings for an RTU connection
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig::new(self.client_settings.serial_port.clone(), self.client_settings.baud_rate)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.client_settings.timeout_ms)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml") | Some("yml")
    )
}
