//! Domain entities and routing rules

pub mod backend;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handle;
pub mod model;
pub mod ramp;
pub mod router;
pub mod topology;

pub use backend::{InterfaceVersion, RoutingBackend, ROUTING_INTERFACE_VERSION};
pub use config::{
    ConfigError, ConfigManager, DaemonConfig, DispatcherConfig, SimulationConfig, StartupConfig,
    StartupConnection, TopologyConfig,
};
pub use control::{
    Completion, CompletionDetail, ControlBackend, NullController, VolumeChange, VolumeTarget,
};
pub use dispatcher::{ActionDispatcher, HandlePhase};
pub use error::{Result, RoutingError};
pub use events::RoutingEvent;
pub use handle::{Handle, HandleKind, HandleTable, MAX_SEQUENCE};
pub use model::*;
pub use ramp::{RampPlan, RampType};
pub use router::{RoutePolicy, Router, ShortestPath};
pub use topology::{MemoryTopology, TopologyStore};
