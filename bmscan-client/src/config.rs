//! Bus and node-set configuration
//!
//! The engine is configured by its supervisor; this module defines the configuration type and a
//! TOML loader for it. A minimal file looks like:
//!
//! ```toml
//! interface = "can0"
//! bitrate = 250000
//!
//! [[node]]
//! id = 1
//!
//! [[node]]
//! id = 2
//! sdo_timeout_ms = 1000
//! ```
use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Error returned when loading a configuration file
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// Failed to read the file
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// The path that failed to load
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The file content is not valid TOML for this format
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The underlying error
        source: toml::de::Error,
    },
    /// A node entry holds an out-of-range ID
    #[snafu(display("Invalid node ID {id}"))]
    InvalidNodeId {
        /// The offending ID value
        id: u8,
    },
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    250_000
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_sdo_timeout_ms() -> u64 {
    500
}

/// One configured BMS node
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    /// The node's CAN ID (1-127)
    pub id: u8,
    /// Per-node override of the SDO response timeout
    #[serde(default)]
    pub sdo_timeout_ms: Option<u64>,
}

/// One object mapped into a PDO payload
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PdoMapEntry {
    /// Object index
    pub index: u16,
    /// Object sub-index
    #[serde(default)]
    pub sub: u8,
}

/// The payload layout of one transmit PDO
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PdoMapping {
    /// Which TPDO (1-4) this mapping describes
    pub pdo: u8,
    /// The objects carried in the payload, in order
    pub entries: Vec<PdoMapEntry>,
}

/// Engine configuration: the bus, the node set, and optional PDO mappings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// The socketcan interface name
    #[serde(default = "default_interface")]
    pub interface: String,
    /// The bus bitrate
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// The heartbeat producer interval configured on the nodes
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Default SDO response timeout
    #[serde(default = "default_sdo_timeout_ms")]
    pub sdo_timeout_ms: u64,
    /// The nodes to poll
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeEntry>,
    /// TPDO payload layouts, if the nodes broadcast PDOs
    #[serde(default, rename = "tpdo")]
    pub tpdo_mappings: Vec<PdoMapping>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sdo_timeout_ms: default_sdo_timeout_ms(),
            nodes: Vec::new(),
            tpdo_mappings: Vec::new(),
        }
    }
}

impl BusConfig {
    /// Create a default configuration for a set of node IDs
    pub fn with_nodes(ids: &[u8]) -> Self {
        Self {
            nodes: ids
                .iter()
                .map(|id| NodeEntry {
                    id: *id,
                    sdo_timeout_ms: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<BusConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<BusConfig, ConfigError> {
        let config: BusConfig = toml::from_str(s).context(TomlDeserializationSnafu)?;
        for node in &config.nodes {
            if !(1..128).contains(&node.id) {
                return InvalidNodeIdSnafu { id: node.id }.fail();
            }
        }
        Ok(config)
    }

    /// The configured node IDs
    pub fn node_ids(&self) -> Vec<u8> {
        self.nodes.iter().map(|n| n.id).collect()
    }
}
