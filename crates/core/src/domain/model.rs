//! Topology entities: domains, sources, sinks, gateways, connections
//!
//! These are plain records. Ownership of the live set lives in the
//! [`TopologyStore`](crate::domain::topology::TopologyStore); the router and
//! the dispatcher only ever read or update them through it.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u16);

        impl $name {
            pub const fn new(id: u16) -> Self {
                Self(id)
            }

            pub const fn get(&self) -> u16 {
                self.0
            }
        }

        impl From<u16> for $name {
            fn from(id: u16) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a routing domain
    DomainId
);
id_type!(
    /// Identifier of a source (also used for gateway output sides)
    SourceId
);
id_type!(
    /// Identifier of a sink (also used for gateway input sides)
    SinkId
);
id_type!(GatewayId);
id_type!(CrossfaderId);
id_type!(ConnectionId);
id_type!(MainConnectionId);

/// Connection format negotiated for a single hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionFormat {
    Unknown,
    Mono,
    Stereo,
    Analog,
    Auto,
    Custom(u16),
}

/// Volume in domain units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(i16);

impl Volume {
    pub const fn new(value: i16) -> Self {
        Self(value)
    }

    pub const fn get(&self) -> i16 {
        self.0
    }

    /// Number of unit steps between two volumes
    pub fn distance(&self, other: Volume) -> u32 {
        (i32::from(self.0) - i32::from(other.0)).unsigned_abs()
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed property value attached to a sink or source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoundProperty {
    pub kind: u16,
    pub value: i16,
}

impl SoundProperty {
    pub const fn new(kind: u16, value: i16) -> Self {
        Self { kind, value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    #[default]
    Unknown,
    Controlled,
    IndependentStartup,
    IndependentRundown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    #[default]
    Unknown,
    On,
    Off,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteState {
    #[default]
    Unknown,
    Muted,
    Unmuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityState {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

/// Availability of a sink or source together with the domain's reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Availability {
    pub state: AvailabilityState,
    #[serde(default)]
    pub reason: u16,
}

impl Availability {
    pub const fn available() -> Self {
        Self {
            state: AvailabilityState::Available,
            reason: 0,
        }
    }
}

/// Which of the two crossfader sinks currently receives the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotSink {
    #[default]
    Unknown,
    SinkA,
    SinkB,
}

/// Lifecycle of a main (end-to-end) connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Suspended,
}

/// A routing domain, owned by exactly one adapter bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub busname: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub early: bool,
    #[serde(default = "default_true")]
    pub complete: bool,
    #[serde(default)]
    pub state: DomainState,
}

impl Domain {
    pub fn new(id: DomainId, name: impl Into<String>, busname: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            busname: busname.into(),
            node_name: String::new(),
            early: false,
            complete: true,
            state: DomainState::Controlled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub domain_id: DomainId,
    pub name: String,
    #[serde(default)]
    pub class_id: u16,
    #[serde(default)]
    pub volume: Volume,
    #[serde(default)]
    pub state: SourceState,
    pub formats: Vec<ConnectionFormat>,
    #[serde(default = "Availability::available")]
    pub availability: Availability,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub sound_properties: Vec<SoundProperty>,
}

impl Source {
    pub fn new(
        id: SourceId,
        domain_id: DomainId,
        name: impl Into<String>,
        formats: Vec<ConnectionFormat>,
    ) -> Self {
        Self {
            id,
            domain_id,
            name: name.into(),
            class_id: 0,
            volume: Volume::default(),
            state: SourceState::Unknown,
            formats,
            availability: Availability::available(),
            visible: true,
            sound_properties: Vec::new(),
        }
    }

    pub fn supports(&self, format: ConnectionFormat) -> bool {
        self.formats.contains(&format)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sink {
    pub id: SinkId,
    pub domain_id: DomainId,
    pub name: String,
    #[serde(default)]
    pub class_id: u16,
    #[serde(default)]
    pub volume: Volume,
    #[serde(default)]
    pub mute_state: MuteState,
    pub formats: Vec<ConnectionFormat>,
    #[serde(default = "Availability::available")]
    pub availability: Availability,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub sound_properties: Vec<SoundProperty>,
}

impl Sink {
    pub fn new(
        id: SinkId,
        domain_id: DomainId,
        name: impl Into<String>,
        formats: Vec<ConnectionFormat>,
    ) -> Self {
        Self {
            id,
            domain_id,
            name: name.into(),
            class_id: 0,
            volume: Volume::default(),
            mute_state: MuteState::Unknown,
            formats,
            availability: Availability::available(),
            visible: true,
            sound_properties: Vec::new(),
        }
    }

    pub fn supports(&self, format: ConnectionFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// A bridge between two domains
///
/// Audio enters through `sink_id` (a sink living in `domain_sink_id`) and
/// leaves through `source_id` (a source living in `domain_source_id`).
/// `conversion_matrix` is row-major by sink-side format: entry
/// `i * source_formats.len() + j` allows sink format `i` to become source
/// format `j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    pub name: String,
    pub sink_id: SinkId,
    pub source_id: SourceId,
    pub domain_sink_id: DomainId,
    pub domain_source_id: DomainId,
    pub control_domain_id: DomainId,
    pub sink_formats: Vec<ConnectionFormat>,
    pub source_formats: Vec<ConnectionFormat>,
    pub conversion_matrix: Vec<bool>,
}

impl Gateway {
    pub fn is_matrix_valid(&self) -> bool {
        !self.conversion_matrix.is_empty()
            && self.conversion_matrix.len() == self.sink_formats.len() * self.source_formats.len()
    }

    /// Source-side formats reachable from the given sink-side format
    pub fn convertible_from(&self, input: ConnectionFormat) -> Vec<ConnectionFormat> {
        if !self.is_matrix_valid() {
            return Vec::new();
        }
        let Some(row) = self.sink_formats.iter().position(|f| *f == input) else {
            return Vec::new();
        };
        let width = self.source_formats.len();
        self.source_formats
            .iter()
            .enumerate()
            .filter(|(col, _)| self.conversion_matrix[row * width + col])
            .map(|(_, format)| *format)
            .collect()
    }

    pub fn converts(&self, input: ConnectionFormat, output: ConnectionFormat) -> bool {
        self.convertible_from(input).contains(&output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crossfader {
    pub id: CrossfaderId,
    pub name: String,
    pub source_id: SourceId,
    pub sink_a: SinkId,
    pub sink_b: SinkId,
    #[serde(default)]
    pub hot_sink: HotSink,
}

/// A single-hop connection inside one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub format: ConnectionFormat,
    /// Measured delay in milliseconds, unknown until the domain reports it
    pub delay: Option<i16>,
    /// The connect acknowledgement has not arrived yet
    pub pending: bool,
}

/// An end-to-end connection composed of one connection per hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainConnection {
    pub id: MainConnectionId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub connections: Vec<ConnectionId>,
    pub delay: Option<i16>,
    pub state: ConnectionState,
}

/// One hop of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingElement {
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub domain_id: DomainId,
    pub format: ConnectionFormat,
}

/// A fully specified path from a source to a sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub elements: Vec<RoutingElement>,
}

impl Route {
    pub fn hop_count(&self) -> usize {
        self.elements.len()
    }
}

fn default_true() -> bool {
    true
}
