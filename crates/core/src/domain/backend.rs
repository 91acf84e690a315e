//! Domain routing adapter interface
//!
//! One [`RoutingBackend`] serves every domain registered under its bus name.
//! Each accepted `async_*` request must eventually be answered by exactly one
//! terminal acknowledgement (see [`RoutingEvent`](crate::domain::events::RoutingEvent))
//! carrying the same handle, optionally preceded by volume ticks.

use crate::domain::control::VolumeChange;
use crate::domain::error::Result;
use crate::domain::handle::Handle;
use crate::domain::model::{
    ConnectionFormat, ConnectionId, CrossfaderId, DomainId, DomainState, HotSink, SinkId,
    SoundProperty, SourceId, SourceState,
};
use crate::domain::ramp::{RampPlan, RampType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Version of the adapter interface implemented by this crate
pub const ROUTING_INTERFACE_VERSION: InterfaceVersion = InterfaceVersion::new(3, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceVersion {
    pub major: u16,
    pub minor: u16,
}

impl InterfaceVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// An adapter is usable when it speaks the same major version and does
    /// not require a newer minor revision than we provide
    pub fn accepts(&self, adapter: InterfaceVersion) -> bool {
        self.major == adapter.major && adapter.minor <= self.minor
    }
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A domain adapter
///
/// Errors returned synchronously mean the request was not accepted and no
/// acknowledgement will follow.
pub trait RoutingBackend {
    /// Bus name the adapter's domains register under
    fn busname(&self) -> &str;

    fn interface_version(&self) -> InterfaceVersion {
        ROUTING_INTERFACE_VERSION
    }

    /// Cancel an outstanding request; fails `NonExistent` once it finished
    fn async_abort(&mut self, handle: Handle) -> Result<()>;

    fn async_connect(
        &mut self,
        handle: Handle,
        connection: ConnectionId,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<()>;

    fn async_disconnect(&mut self, handle: Handle, connection: ConnectionId) -> Result<()>;

    fn async_set_sink_volume(
        &mut self,
        handle: Handle,
        sink: SinkId,
        plan: RampPlan,
    ) -> Result<()>;

    fn async_set_source_volume(
        &mut self,
        handle: Handle,
        source: SourceId,
        plan: RampPlan,
    ) -> Result<()>;

    /// Several sink or source volumes of this adapter in one request,
    /// answered by a single `AckSetVolumes`
    fn async_set_volumes(&mut self, handle: Handle, changes: &[VolumeChange]) -> Result<()>;

    fn async_set_source_state(
        &mut self,
        handle: Handle,
        source: SourceId,
        state: SourceState,
    ) -> Result<()>;

    fn async_set_sink_sound_property(
        &mut self,
        handle: Handle,
        sink: SinkId,
        property: SoundProperty,
    ) -> Result<()>;

    fn async_set_sink_sound_properties(
        &mut self,
        handle: Handle,
        sink: SinkId,
        properties: &[SoundProperty],
    ) -> Result<()>;

    fn async_set_source_sound_property(
        &mut self,
        handle: Handle,
        source: SourceId,
        property: SoundProperty,
    ) -> Result<()>;

    fn async_set_source_sound_properties(
        &mut self,
        handle: Handle,
        source: SourceId,
        properties: &[SoundProperty],
    ) -> Result<()>;

    fn async_cross_fade(
        &mut self,
        handle: Handle,
        crossfader: CrossfaderId,
        hot_sink: HotSink,
        ramp: RampType,
        time: Duration,
    ) -> Result<()>;

    /// Synchronous; the domain reports the change back through a hook
    fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()>;
}
