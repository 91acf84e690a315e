//! Messages sent by domain adapters back to the dispatcher

use crate::domain::control::VolumeTarget;
use crate::domain::error::Result;
use crate::domain::handle::Handle;
use crate::domain::model::{
    Availability, ConnectionId, DomainId, DomainState, HotSink, SinkId, SourceId, Volume,
};

/// Acknowledgements, progress ticks and topology hooks from an adapter
///
/// Every variant is plain data so it can cross threads on the way to the
/// event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    AckConnect {
        handle: Handle,
        connection: ConnectionId,
        result: Result<()>,
    },
    AckDisconnect {
        handle: Handle,
        connection: ConnectionId,
        result: Result<()>,
    },
    AckSetSinkVolume {
        handle: Handle,
        volume: Volume,
        result: Result<()>,
    },
    AckSetSourceVolume {
        handle: Handle,
        volume: Volume,
        result: Result<()>,
    },
    /// Volumes each batch entry reached, in request order
    AckSetVolumes {
        handle: Handle,
        volumes: Vec<(VolumeTarget, Volume)>,
        result: Result<()>,
    },
    AckSetSourceState {
        handle: Handle,
        result: Result<()>,
    },
    AckSetSinkSoundProperty {
        handle: Handle,
        result: Result<()>,
    },
    AckSetSinkSoundProperties {
        handle: Handle,
        result: Result<()>,
    },
    AckSetSourceSoundProperty {
        handle: Handle,
        result: Result<()>,
    },
    AckSetSourceSoundProperties {
        handle: Handle,
        result: Result<()>,
    },
    AckCrossFading {
        handle: Handle,
        hot_sink: HotSink,
        result: Result<()>,
    },
    SinkVolumeTick {
        handle: Handle,
        sink: SinkId,
        volume: Volume,
    },
    SourceVolumeTick {
        handle: Handle,
        source: SourceId,
        volume: Volume,
    },
    TimingInformationChanged {
        connection: ConnectionId,
        delay: i16,
    },
    SinkAvailabilityChanged {
        sink: SinkId,
        availability: Availability,
    },
    SourceAvailabilityChanged {
        source: SourceId,
        availability: Availability,
    },
    DomainStateChanged {
        domain: DomainId,
        state: DomainState,
    },
}

impl RoutingEvent {
    /// The handle this event refers to, if it is an ack or a tick
    pub fn handle(&self) -> Option<Handle> {
        match self {
            RoutingEvent::AckConnect { handle, .. }
            | RoutingEvent::AckDisconnect { handle, .. }
            | RoutingEvent::AckSetSinkVolume { handle, .. }
            | RoutingEvent::AckSetSourceVolume { handle, .. }
            | RoutingEvent::AckSetVolumes { handle, .. }
            | RoutingEvent::AckSetSourceState { handle, .. }
            | RoutingEvent::AckSetSinkSoundProperty { handle, .. }
            | RoutingEvent::AckSetSinkSoundProperties { handle, .. }
            | RoutingEvent::AckSetSourceSoundProperty { handle, .. }
            | RoutingEvent::AckSetSourceSoundProperties { handle, .. }
            | RoutingEvent::AckCrossFading { handle, .. }
            | RoutingEvent::SinkVolumeTick { handle, .. }
            | RoutingEvent::SourceVolumeTick { handle, .. } => Some(*handle),
            RoutingEvent::TimingInformationChanged { .. }
            | RoutingEvent::SinkAvailabilityChanged { .. }
            | RoutingEvent::SourceAvailabilityChanged { .. }
            | RoutingEvent::DomainStateChanged { .. } => None,
        }
    }

    pub fn is_tick(&self) -> bool {
        matches!(
            self,
            RoutingEvent::SinkVolumeTick { .. } | RoutingEvent::SourceVolumeTick { .. }
        )
    }
}
