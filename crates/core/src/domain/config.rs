//! Daemon configuration
//!
//! This module provides:
//! - Configuration structs for the dispatcher, the simulated domains and the
//!   static topology the store is seeded with
//! - TOML load/save through `tokio::fs`
//! - A [`ConfigManager`] that resolves the per-user config file and falls
//!   back to the factory default when it is missing or corrupt

use crate::domain::handle::MAX_SEQUENCE;
use crate::domain::model::{
    ConnectionFormat, Crossfader, CrossfaderId, Domain, DomainId, Gateway, GatewayId, HotSink,
    Sink, SinkId, SoundProperty, Source, SourceId, Volume,
};
use crate::domain::topology::{MemoryTopology, TopologyStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid topology: {entity} {id}: {reason}")]
    Topology {
        entity: &'static str,
        id: u16,
        reason: String,
    },
}

/// Action dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of concurrently outstanding handles
    pub max_in_flight: usize,

    /// Time an adapter gets to acknowledge, on top of any ramp time
    pub action_timeout_ms: u64,

    /// Period of the timeout watchdog timer
    pub watchdog_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            action_timeout_ms: 5000,
            watchdog_interval_ms: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Behaviour of the simulated threaded domains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub connect_latency_ms: u64,
    pub disconnect_latency_ms: u64,
    /// Latency of property, state and crossfade requests
    pub action_latency_ms: u64,
    /// Tick period used when a ramp has no duration of its own
    pub tick_interval_ms: u64,
    /// Concurrent requests one simulated adapter accepts
    pub worker_slots: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            connect_latency_ms: 200,
            disconnect_latency_ms: 100,
            action_latency_ms: 20,
            tick_interval_ms: 10,
            worker_slots: 10,
        }
    }
}

/// Static topology the store is seeded with
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub domains: Vec<Domain>,
    pub sinks: Vec<Sink>,
    pub sources: Vec<Source>,
    pub gateways: Vec<Gateway>,
    pub crossfaders: Vec<Crossfader>,
}

impl TopologyConfig {
    /// Distinct bus names in declaration order
    pub fn busnames(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.domains
            .iter()
            .filter(|d| seen.insert(d.busname.clone()))
            .map(|d| d.busname.clone())
            .collect()
    }

    /// Build a populated [`MemoryTopology`], rejecting dangling references
    pub fn build_store(&self) -> Result<MemoryTopology> {
        let mut store = MemoryTopology::new();

        for domain in &self.domains {
            if domain.busname.is_empty() {
                return Err(topology_error("domain", domain.id.get(), "empty bus name"));
            }
            store
                .add_domain(domain.clone())
                .map_err(|e| topology_error("domain", domain.id.get(), e))?;
        }
        for sink in &self.sinks {
            store
                .add_sink(sink.clone())
                .map_err(|e| topology_error("sink", sink.id.get(), e))?;
        }
        for source in &self.sources {
            store
                .add_source(source.clone())
                .map_err(|e| topology_error("source", source.id.get(), e))?;
        }
        for gateway in &self.gateways {
            if !gateway.is_matrix_valid() {
                return Err(topology_error(
                    "gateway",
                    gateway.id.get(),
                    "conversion matrix does not match its format lists",
                ));
            }
            store
                .add_gateway(gateway.clone())
                .map_err(|e| topology_error("gateway", gateway.id.get(), e))?;
        }
        for crossfader in &self.crossfaders {
            store
                .add_crossfader(crossfader.clone())
                .map_err(|e| topology_error("crossfader", crossfader.id.get(), e))?;
        }

        debug!(
            domains = self.domains.len(),
            sinks = self.sinks.len(),
            sources = self.sources.len(),
            gateways = self.gateways.len(),
            "Topology store seeded"
        );
        Ok(store)
    }
}

fn topology_error(entity: &'static str, id: u16, reason: impl ToString) -> ConfigError {
    ConfigError::Topology {
        entity,
        id,
        reason: reason.to_string(),
    }
}

/// A main connection requested once the daemon is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupConnection {
    pub source: SourceId,
    pub sink: SinkId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub connections: Vec<StartupConnection>,
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub dispatcher: DispatcherConfig,
    pub simulation: SimulationConfig,
    pub topology: TopologyConfig,
    pub startup: StartupConfig,
}

impl DaemonConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = self.to_toml()?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check settings and the topology for consistency
    pub fn validate(&self) -> Result<()> {
        let max = usize::from(MAX_SEQUENCE);
        if self.dispatcher.max_in_flight == 0 || self.dispatcher.max_in_flight > max {
            return Err(ConfigError::Invalid(format!(
                "dispatcher.max_in_flight must be within 1..={max}"
            )));
        }
        if self.dispatcher.action_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.action_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dispatcher.watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.watchdog_interval_ms must be positive".to_string(),
            ));
        }
        if self.simulation.worker_slots == 0 {
            return Err(ConfigError::Invalid(
                "simulation.worker_slots must be positive".to_string(),
            ));
        }

        let store = self.topology.build_store()?;
        for connection in &self.startup.connections {
            if store.source(connection.source).is_none() || store.sink(connection.sink).is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "startup connection {} -> {} references an unknown endpoint",
                    connection.source, connection.sink
                )));
            }
        }
        Ok(())
    }

    /// Factory default: a head unit with a Bluetooth bridge and a rear-seat zone
    pub fn factory_default() -> Self {
        use ConnectionFormat::{Analog, Mono, Stereo};

        let head_unit = DomainId::new(1);
        let bluetooth = DomainId::new(2);
        let rear_seat = DomainId::new(3);

        let mut amplifier = Sink::new(SinkId::new(1), head_unit, "amplifier", vec![Stereo, Analog]);
        amplifier.volume = Volume::new(10);
        amplifier.sound_properties = vec![SoundProperty::new(1, 0), SoundProperty::new(2, 0)];

        let topology = TopologyConfig {
            domains: vec![
                Domain::new(head_unit, "head_unit", "sim.head_unit"),
                Domain::new(bluetooth, "bluetooth", "sim.bluetooth"),
                Domain::new(rear_seat, "rear_seat", "sim.head_unit"),
            ],
            sinks: vec![
                amplifier,
                Sink::new(SinkId::new(2), rear_seat, "rear_headphones", vec![Stereo]),
                Sink::new(SinkId::new(50), bluetooth, "bt_bridge_in", vec![Stereo, Mono]),
                Sink::new(SinkId::new(51), head_unit, "rear_bridge_in", vec![Stereo]),
            ],
            sources: vec![
                Source::new(SourceId::new(1), head_unit, "tuner", vec![Stereo, Analog]),
                Source::new(SourceId::new(2), head_unit, "media_player", vec![Stereo]),
                Source::new(SourceId::new(3), bluetooth, "a2dp", vec![Stereo, Mono]),
                Source::new(SourceId::new(50), head_unit, "bt_bridge_out", vec![Stereo, Analog]),
                Source::new(SourceId::new(51), rear_seat, "rear_bridge_out", vec![Stereo]),
            ],
            gateways: vec![
                Gateway {
                    id: GatewayId::new(1),
                    name: "bt_bridge".to_string(),
                    sink_id: SinkId::new(50),
                    source_id: SourceId::new(50),
                    domain_sink_id: bluetooth,
                    domain_source_id: head_unit,
                    control_domain_id: head_unit,
                    sink_formats: vec![Mono, Stereo],
                    source_formats: vec![Stereo, Analog],
                    // mono -> stereo, stereo -> stereo | analog
                    conversion_matrix: vec![true, false, true, true],
                },
                Gateway {
                    id: GatewayId::new(2),
                    name: "rear_bridge".to_string(),
                    sink_id: SinkId::new(51),
                    source_id: SourceId::new(51),
                    domain_sink_id: head_unit,
                    domain_source_id: rear_seat,
                    control_domain_id: head_unit,
                    sink_formats: vec![Stereo],
                    source_formats: vec![Stereo],
                    conversion_matrix: vec![true],
                },
            ],
            crossfaders: vec![Crossfader {
                id: CrossfaderId::new(1),
                name: "front_rear".to_string(),
                source_id: SourceId::new(2),
                sink_a: SinkId::new(1),
                sink_b: SinkId::new(2),
                hot_sink: HotSink::SinkA,
            }],
        };

        Self {
            dispatcher: DispatcherConfig::default(),
            simulation: SimulationConfig::default(),
            topology,
            startup: StartupConfig {
                connections: vec![StartupConnection {
                    source: SourceId::new(3),
                    sink: SinkId::new(1),
                }],
            },
        }
    }
}

/// Configuration manager for persistent settings
///
/// Handles loading and saving of the daemon configuration in the per-user
/// config directory.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_path: config_dir.join("crossover.toml"),
        }
    }

    /// Use an explicit config file instead of the per-user one
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// `~/.config/crossover` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("crossover"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// A missing file is replaced by the factory default. A corrupt or
    /// invalid file is backed up next to itself and the factory default is
    /// used instead.
    #[instrument(skip(self))]
    pub async fn load(&self) -> DaemonConfig {
        if fs::metadata(&self.config_path).await.is_err() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = DaemonConfig::factory_default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }
            return config;
        }

        match DaemonConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                match fs::copy(&self.config_path, &backup_path).await {
                    Ok(_) => warn!(path = %backup_path.display(), "Corrupt config backed up"),
                    Err(e) => error!(error = %e, "Failed to back up corrupt config"),
                }

                DaemonConfig::factory_default()
            }
        }
    }

    pub async fn save(&self, config: &DaemonConfig) -> Result<()> {
        config.save_to_file(&self.config_path).await
    }
}
