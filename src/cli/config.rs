use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, time::Duration};

use crate::{
    core::{
        error::ConfigurationError,
        health::{Thresholds, TransactionCounter},
    },
    protocol::{
        codec::{FieldSpec, FrameCodec, ModbusRtuCodec, ModbusTcpCodec, RegisterMode},
        transport::SerialSettings,
    },
};

/// Physical medium shared by one or more links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Serial port (RS-485 / RS-232)
    Serial {
        name: String,
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// TCP connection, e.g. to a Modbus TCP gateway
    Tcp {
        name: String,
        address: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
}

impl TransportConfig {
    pub fn name(&self) -> &str {
        match self {
            TransportConfig::Serial { name, .. } | TransportConfig::Tcp { name, .. } => name,
        }
    }

    pub fn serial_settings(&self) -> Option<SerialSettings> {
        match self {
            TransportConfig::Serial {
                port,
                baud,
                data_bits,
                stop_bits,
                ..
            } => Some(SerialSettings {
                port: port.clone(),
                baud: *baud,
                data_bits: *data_bits,
                stop_bits: *stop_bits,
            }),
            TransportConfig::Tcp { .. } => None,
        }
    }
}

/// One contiguous register read and how to decode it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRead {
    pub unit_id: u8,
    #[serde(default = "default_register_mode")]
    pub mode: RegisterMode,
    #[serde(default)]
    pub address: u16,
    pub count: u16,
    /// Explicit field layout; one field per register/bit when empty
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// Wire protocol of a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum CodecConfig {
    ModbusRtu(RegisterRead),
    ModbusTcp(RegisterRead),
}

impl CodecConfig {
    pub fn read(&self) -> &RegisterRead {
        match self {
            CodecConfig::ModbusRtu(read) | CodecConfig::ModbusTcp(read) => read,
        }
    }

    pub fn build(&self) -> Box<dyn FrameCodec> {
        match self {
            CodecConfig::ModbusRtu(read) => Box::new(
                ModbusRtuCodec::new(read.unit_id, read.mode, read.address, read.count)
                    .with_fields(read.fields.clone()),
            ),
            CodecConfig::ModbusTcp(read) => Box::new(
                ModbusTcpCodec::new(read.unit_id, read.mode, read.address, read.count)
                    .with_fields(read.fields.clone()),
            ),
        }
    }
}

/// One monitored device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    /// Name of the transport this link polls through
    pub transport: String,
    pub codec: CodecConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_initial_poll_delay_ms")]
    pub initial_poll_delay_ms: u64,
    /// 0 disables the Stale transition
    #[serde(default = "default_stale_after_missed")]
    pub stale_after_missed: u32,
    /// 0 disables the Offline transition
    #[serde(default = "default_offline_after_missed")]
    pub offline_after_missed: u32,
    /// 0 disables backoff while Offline
    #[serde(default)]
    pub offline_backoff_multiplier: u32,
    #[serde(default = "default_transaction_id_first")]
    pub transaction_id_first: u16,
    #[serde(default = "default_transaction_id_last")]
    pub transaction_id_last: u16,
    #[serde(default = "default_fragment_max_age_ms")]
    pub fragment_max_age_ms: u64,
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_register_mode() -> RegisterMode {
    RegisterMode::Holding
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_initial_poll_delay_ms() -> u64 {
    100
}

fn default_stale_after_missed() -> u32 {
    3
}

fn default_offline_after_missed() -> u32 {
    10
}

fn default_transaction_id_first() -> u16 {
    1
}

fn default_transaction_id_last() -> u16 {
    254
}

fn default_fragment_max_age_ms() -> u64 {
    100
}

impl LinkConfig {
    pub fn new(name: impl Into<String>, transport: impl Into<String>, codec: CodecConfig) -> Self {
        Self {
            name: name.into(),
            transport: transport.into(),
            codec,
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            initial_poll_delay_ms: default_initial_poll_delay_ms(),
            stale_after_missed: default_stale_after_missed(),
            offline_after_missed: default_offline_after_missed(),
            offline_backoff_multiplier: 0,
            transaction_id_first: default_transaction_id_first(),
            transaction_id_last: default_transaction_id_last(),
            fragment_max_age_ms: default_fragment_max_age_ms(),
        }
    }

    pub fn thresholds(&self) -> Result<Thresholds, ConfigurationError> {
        Ok(Thresholds::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.response_timeout_ms),
            Duration::from_millis(self.initial_poll_delay_ms),
        )?
        .with_stale_after_missed(self.stale_after_missed)
        .with_offline_after_missed(self.offline_after_missed)
        .with_offline_backoff_multiplier(self.offline_backoff_multiplier))
    }

    pub fn transaction_ids(&self) -> Result<TransactionCounter, ConfigurationError> {
        TransactionCounter::new(self.transaction_id_first, self.transaction_id_last)
    }

    pub fn fragment_max_age(&self) -> Duration {
        Duration::from_millis(self.fragment_max_age_ms)
    }
}

/// Root configuration: the transports and the links polled through them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub transports: Vec<TransportConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

impl EngineConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Read configuration from a `.json` or `.toml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("Failed to read {}: {err}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml(&content)?
        } else {
            Self::from_json(&content)?
        };
        Ok(config)
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn transport(&self, name: &str) -> Option<&TransportConfig> {
        self.transports.iter().find(|t| t.name() == name)
    }

    /// Check everything that can be checked before any port is opened
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.links.is_empty() {
            return Err(ConfigurationError::NoLinks);
        }

        let mut transport_names = HashSet::new();
        for transport in &self.transports {
            if !transport_names.insert(transport.name()) {
                return Err(ConfigurationError::DuplicateName {
                    name: transport.name().to_string(),
                });
            }
        }

        let mut link_names = HashSet::new();
        for link in &self.links {
            if !link_names.insert(link.name.as_str()) {
                return Err(ConfigurationError::DuplicateName {
                    name: link.name.clone(),
                });
            }
            if !transport_names.contains(link.transport.as_str()) {
                return Err(ConfigurationError::UnknownTransport {
                    link: link.name.clone(),
                    transport: link.transport.clone(),
                });
            }
            if link.codec.read().count == 0 {
                return Err(ConfigurationError::EmptyRead {
                    link: link.name.clone(),
                });
            }
            link.thresholds()?;
            link.transaction_ids()?;
        }
        Ok(())
    }
}
