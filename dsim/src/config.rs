//! Configuration file support for dsim topologies
//!
//! This module provides the JSON topology description consumed by the engine
//! and the CLI. Structural checks that have an automatic correction (reverse
//! channels, self-channels, initiators) belong to the engine's check phase;
//! `validate` only rejects files that cannot describe a network at all.

use std::{collections::BTreeMap, collections::HashSet, fs, path::Path};

use anyhow::{Context, Result};
use dsim_common::{
    constants::{DSIM_BASE_PORT, DSIM_MONITOR_INTERVAL_MS},
    ChannelId, FieldValue, ProcessId,
};
use log::debug;
use serde::{Deserialize, Serialize};

/// Configuration for a single process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Process ID (unique within the topology)
    pub id: ProcessId,
    /// Display name, defaults to `p<id>`
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the process starts the algorithm
    #[serde(default)]
    pub initiator: bool,
}

/// Configuration for a single directed channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel ID (unique within the topology)
    pub id: ChannelId,
    /// Sending process
    pub source: ProcessId,
    /// Receiving process
    pub dest: ProcessId,
}

const fn default_base_port() -> u16 {
    DSIM_BASE_PORT
}

const fn default_monitor_interval() -> u64 {
    DSIM_MONITOR_INTERVAL_MS
}

/// Configuration for an entire simulated network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Registered algorithm name, e.g. `"ping_pong"`
    pub algorithm: String,
    /// Channels are one-way only; when false every channel needs a reverse
    #[serde(default)]
    pub directed: bool,
    /// Exactly one initiator is required
    #[serde(default)]
    pub centralized: bool,
    /// First listener port; process `i` (in file order) gets `base_port + i`.
    /// `0` lets the OS assign every port.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Liveness poll interval of the network monitor
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Algorithm-specific parameters
    #[serde(default)]
    pub params: BTreeMap<String, FieldValue>,
    /// List of all processes
    pub processes: Vec<ProcessConfig>,
    /// List of all channels
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl TopologyConfig {
    /// Load topology configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        // Validate configuration
        config.validate()?;

        debug!(
            "Loaded topology '{}' with {} processes and {} channels",
            config.algorithm,
            config.processes.len(),
            config.channels.len()
        );
        Ok(config)
    }

    /// Save topology configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.processes.is_empty() {
            anyhow::bail!("Configuration must declare at least one process");
        }

        if self.algorithm.trim().is_empty() {
            anyhow::bail!("Configuration must name an algorithm");
        }

        // Check for duplicate process IDs
        let mut seen_process_ids = HashSet::new();
        for process in &self.processes {
            if !seen_process_ids.insert(process.id) {
                anyhow::bail!("Duplicate process id: {}", process.id);
            }
        }

        // Check for duplicate channel IDs and unknown endpoints
        let mut seen_channel_ids = HashSet::new();
        for channel in &self.channels {
            if !seen_channel_ids.insert(channel.id) {
                anyhow::bail!("Duplicate channel id: {}", channel.id);
            }
            for endpoint in [channel.source, channel.dest] {
                if !seen_process_ids.contains(&endpoint) {
                    anyhow::bail!(
                        "Channel {} references unknown process {}",
                        channel.id,
                        endpoint
                    );
                }
            }
        }

        if self.base_port != 0
            && usize::from(self.base_port) + self.processes.len() > usize::from(u16::MAX)
        {
            anyhow::bail!(
                "Port range starting at {} cannot fit {} processes",
                self.base_port,
                self.processes.len()
            );
        }

        if self.monitor_interval_ms == 0 {
            anyhow::bail!("monitor_interval_ms must be greater than 0");
        }

        Ok(())
    }

    /// Get configuration for a specific process ID
    #[must_use]
    pub fn get_process(&self, id: ProcessId) -> Option<&ProcessConfig> {
        self.processes.iter().find(|process| process.id == id)
    }

    /// Listener port for the process at `index` in file order (0 = OS-assigned)
    #[must_use]
    pub fn port_for_index(&self, index: usize) -> u16 {
        if self.base_port == 0 {
            return 0;
        }
        u16::try_from(usize::from(self.base_port) + index).unwrap_or(0)
    }
}

impl ProcessConfig {
    /// Display name of the process
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("p{}", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_process_config() -> TopologyConfig {
        TopologyConfig {
            algorithm: "ping_pong".to_string(),
            directed: false,
            centralized: true,
            base_port: 0,
            monitor_interval_ms: 50,
            params: BTreeMap::new(),
            processes: vec![
                ProcessConfig {
                    id: 0,
                    name: None,
                    initiator: true,
                },
                ProcessConfig {
                    id: 1,
                    name: Some("responder".to_string()),
                    initiator: false,
                },
            ],
            channels: vec![
                ChannelConfig {
                    id: 0,
                    source: 0,
                    dest: 1,
                },
                ChannelConfig {
                    id: 1,
                    source: 1,
                    dest: 0,
                },
            ],
        }
    }

    #[test]
    fn test_topology_config_validation() {
        let config = two_process_config();
        assert!(config.validate().is_ok());

        // Test duplicate process ID
        let mut bad_config = config.clone();
        bad_config.processes[1].id = 0;
        assert!(bad_config.validate().is_err());

        // Test duplicate channel ID
        let mut bad_config = config.clone();
        bad_config.channels[1].id = 0;
        assert!(bad_config.validate().is_err());

        // Test unknown endpoint
        let mut bad_config = config.clone();
        bad_config.channels[0].dest = 9;
        assert!(bad_config.validate().is_err());

        // Test empty process list
        let mut bad_config = config;
        bad_config.processes.clear();
        assert!(bad_config.validate().is_err());
    }

    #[test]
    fn test_defaults_when_parsing() {
        let json = r#"{
            "algorithm": "echo",
            "processes": [{ "id": 3, "initiator": true }],
            "params": { "rounds": 4 }
        }"#;
        let config: TopologyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.base_port, DSIM_BASE_PORT);
        assert_eq!(config.monitor_interval_ms, DSIM_MONITOR_INTERVAL_MS);
        assert!(config.channels.is_empty());
        assert!(!config.directed);
        assert_eq!(config.params.get("rounds"), Some(&FieldValue::Int(4)));
        assert_eq!(config.processes[0].display_name(), "p3");
    }

    #[test]
    fn test_port_assignment() {
        let mut config = two_process_config();
        assert_eq!(config.port_for_index(1), 0);
        config.base_port = 6000;
        assert_eq!(config.port_for_index(0), 6000);
        assert_eq!(config.port_for_index(1), 6001);
    }
}
