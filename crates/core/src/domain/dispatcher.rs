//! Action dispatcher
//!
//! Accepts controller requests, runs the synchronous pre-checks, allocates a
//! [`Handle`] and forwards the request to the adapter owning the target.
//! Acknowledgements and ticks coming back from adapters are correlated purely
//! by handle. Every handle ends in exactly one
//! [`ControlBackend::on_action_complete`] call, whether it finished normally,
//! was aborted, or timed out.
//!
//! Everything here runs on the event-loop thread, so no locking is involved.

mod main_connection;
mod pending;

pub use pending::HandlePhase;

use crate::domain::backend::RoutingBackend;
use crate::domain::config::DispatcherConfig;
use crate::domain::control::{
    Completion, CompletionDetail, ControlBackend, VolumeChange, VolumeTarget,
};
use crate::domain::error::{Result, RoutingError};
use crate::domain::events::RoutingEvent;
use crate::domain::handle::{Handle, HandleKind, HandleTable};
use crate::domain::model::{
    ConnectionFormat, ConnectionId, ConnectionState, CrossfaderId, DomainId, DomainState, HotSink,
    MainConnectionId, Route, SinkId, SoundProperty, SourceId, SourceState, Volume,
};
use crate::domain::ramp::{RampPlan, RampType};
use crate::domain::router::Router;
use crate::domain::topology::TopologyStore;
use main_connection::{aggregate_delay, MainConnectionTracker, MainOutcome};
use pending::{ActionTarget, PendingAction};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Extra data an acknowledgement carries
#[derive(Debug, Clone)]
enum AckPayload {
    None,
    Connection(ConnectionId),
    Volume(Volume),
    Volumes(Vec<(VolumeTarget, Volume)>),
    HotSink(HotSink),
}

pub struct ActionDispatcher<S: TopologyStore> {
    store: S,
    router: Router,
    controller: Box<dyn ControlBackend>,
    backends: Vec<Box<dyn RoutingBackend>>,
    buses: HashMap<String, usize>,
    pending: HandleTable<PendingAction>,
    /// Connect or disconnect handle currently in flight per connection
    in_flight: HashMap<ConnectionId, Handle>,
    mains: MainConnectionTracker,
    /// Hops of a failed `connect_main` that must not stay connected
    abandoned: HashSet<Handle>,
    action_timeout: Duration,
}

impl<S: TopologyStore> ActionDispatcher<S> {
    pub fn new(store: S, config: &DispatcherConfig, controller: Box<dyn ControlBackend>) -> Self {
        Self {
            store,
            router: Router::new(),
            controller,
            backends: Vec::new(),
            buses: HashMap::new(),
            pending: HandleTable::with_capacity(config.max_in_flight),
            in_flight: HashMap::new(),
            mains: MainConnectionTracker::default(),
            abandoned: HashSet::new(),
            action_timeout: config.action_timeout(),
        }
    }

    /// Replace the default shortest-path router
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Register the adapter serving `backend.busname()`
    pub fn add_backend(&mut self, backend: Box<dyn RoutingBackend>) -> Result<()> {
        let busname = backend.busname().to_string();
        if self.buses.contains_key(&busname) {
            return Err(RoutingError::AlreadyExists);
        }
        info!(bus = %busname, version = %backend.interface_version(), "Routing adapter registered");
        self.buses.insert(busname, self.backends.len());
        self.backends.push(backend);
        Ok(())
    }

    pub fn has_backend(&self, busname: &str) -> bool {
        self.buses.contains_key(busname)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Outstanding handles in sequence order
    pub fn list_handles(&self) -> Vec<Handle> {
        self.pending.handles()
    }

    pub fn handle_phase(&self, handle: Handle) -> Option<HandlePhase> {
        self.pending.get(handle).map(|action| action.phase)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Earliest instant at which an outstanding handle times out
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(_, action)| action.deadline).min()
    }

    pub fn find_routes(
        &self,
        only_free: bool,
        source: SourceId,
        sink: SinkId,
    ) -> Result<Vec<Route>> {
        self.router.find_routes(&self.store, only_free, source, sink)
    }

    // ------------------------------------------------------------------------
    // Controller requests
    // ------------------------------------------------------------------------

    /// Connect a source to a sink inside one domain
    pub fn connect(
        &mut self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<(Handle, ConnectionId)> {
        let source_entity = self.store.source(source).ok_or(RoutingError::NonExistent)?;
        let sink_entity = self.store.sink(sink).ok_or(RoutingError::NonExistent)?;
        if !source_entity.supports(format) || !sink_entity.supports(format) {
            return Err(RoutingError::WrongFormat);
        }
        if self.store.find_connection(source, sink, format).is_some() {
            return Err(RoutingError::AlreadyExists);
        }
        let backend = self.backend_for_domain(sink_entity.domain_id)?;
        self.ensure_capacity(1)?;

        let connection = self.store.enter_connection(source, sink, format)?;
        let action = PendingAction::new(
            backend,
            ActionTarget::Connect { connection },
            self.deadline(Duration::ZERO),
        );
        match self.issue(HandleKind::Connect, action, |b, h| {
            b.async_connect(h, connection, source, sink, format)
        }) {
            Ok(handle) => {
                self.in_flight.insert(connection, handle);
                info!(%handle, %connection, %source, %sink, ?format, "Connect dispatched");
                Ok((handle, connection))
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove_connection(connection) {
                    error!(%connection, error = %cleanup, "Failed to drop provisional connection");
                }
                Err(e)
            }
        }
    }

    /// Tear down an established connection
    ///
    /// Hops owned by a main connection are released through
    /// [`Self::disconnect_main`] only and fail `NotPossible` here.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Result<Handle> {
        let owners = self.store.main_connections_using(connection);
        if !owners.is_empty() {
            warn!(%connection, mains = ?owners, "Hop belongs to a main connection");
            return Err(RoutingError::NotPossible);
        }
        self.disconnect_hop(connection)
    }

    fn disconnect_hop(&mut self, connection: ConnectionId) -> Result<Handle> {
        let record = self
            .store
            .connection(connection)
            .ok_or(RoutingError::NonExistent)?;
        if record.pending || self.in_flight.contains_key(&connection) {
            return Err(RoutingError::NonExistent);
        }
        let sink = self
            .store
            .sink(record.sink_id)
            .ok_or(RoutingError::NonExistent)?;
        let backend = self.backend_for_domain(sink.domain_id)?;

        let action = PendingAction::new(
            backend,
            ActionTarget::Disconnect { connection },
            self.deadline(Duration::ZERO),
        );
        let handle = self.issue(HandleKind::Disconnect, action, |b, h| {
            b.async_disconnect(h, connection)
        })?;
        self.in_flight.insert(connection, handle);
        info!(%handle, %connection, "Disconnect dispatched");
        Ok(handle)
    }

    pub fn set_sink_volume(
        &mut self,
        sink: SinkId,
        volume: Volume,
        ramp: RampType,
        time: Duration,
    ) -> Result<Handle> {
        let entity = self.store.sink(sink).ok_or(RoutingError::NonExistent)?;
        if entity.volume == volume {
            return Err(RoutingError::NoChange);
        }
        let plan = RampPlan::new(entity.volume, volume, ramp, time);
        let backend = self.backend_for_domain(entity.domain_id)?;

        let action = PendingAction::new(
            backend,
            ActionTarget::SinkVolume { sink, volume },
            self.deadline(time),
        )
        .with_ramp(plan);
        let handle = self.issue(HandleKind::SetSinkVolume, action, |b, h| {
            b.async_set_sink_volume(h, sink, plan)
        })?;
        info!(%handle, %sink, from = %plan.from, to = %volume, ticks = plan.expected_ticks(), "Sink volume dispatched");
        Ok(handle)
    }

    pub fn set_source_volume(
        &mut self,
        source: SourceId,
        volume: Volume,
        ramp: RampType,
        time: Duration,
    ) -> Result<Handle> {
        let entity = self.store.source(source).ok_or(RoutingError::NonExistent)?;
        if entity.volume == volume {
            return Err(RoutingError::NoChange);
        }
        let plan = RampPlan::new(entity.volume, volume, ramp, time);
        let backend = self.backend_for_domain(entity.domain_id)?;

        let action = PendingAction::new(
            backend,
            ActionTarget::SourceVolume { source, volume },
            self.deadline(time),
        )
        .with_ramp(plan);
        let handle = self.issue(HandleKind::SetSourceVolume, action, |b, h| {
            b.async_set_source_volume(h, source, plan)
        })?;
        info!(%handle, %source, from = %plan.from, to = %volume, ticks = plan.expected_ticks(), "Source volume dispatched");
        Ok(handle)
    }

    /// Change several volumes served by one adapter with a single handle
    ///
    /// Every entry names a distinct known sink or source whose volume
    /// differs from the request. No ticks are tracked for the batch.
    pub fn set_volumes(&mut self, changes: Vec<VolumeChange>) -> Result<Handle> {
        if changes.is_empty() {
            return Err(RoutingError::NotPossible);
        }
        let mut owner = None;
        let mut longest = Duration::ZERO;
        for (index, change) in changes.iter().enumerate() {
            if changes[..index].iter().any(|c| c.target == change.target) {
                warn!(entry = ?change.target, "Volume batch names a target twice");
                return Err(RoutingError::NotPossible);
            }
            let (current, domain) = self.volume_of(change.target)?;
            if current == change.volume {
                return Err(RoutingError::NoChange);
            }
            let backend = self.backend_for_domain(domain)?;
            if *owner.get_or_insert(backend) != backend {
                warn!(entry = ?change.target, "Volume batch spans several adapters");
                return Err(RoutingError::NotPossible);
            }
            longest = longest.max(change.time);
        }
        let backend = owner.ok_or(RoutingError::NotPossible)?;

        let action = PendingAction::new(
            backend,
            ActionTarget::Volumes {
                changes: changes.clone(),
            },
            self.deadline(longest),
        );
        let handle = self.issue(HandleKind::SetVolumes, action, |b, h| {
            b.async_set_volumes(h, &changes)
        })?;
        info!(%handle, entries = changes.len(), "Volume batch dispatched");
        Ok(handle)
    }

    pub fn set_source_state(&mut self, source: SourceId, state: SourceState) -> Result<Handle> {
        let entity = self.store.source(source).ok_or(RoutingError::NonExistent)?;
        let backend = self.backend_for_domain(entity.domain_id)?;

        let action = PendingAction::new(
            backend,
            ActionTarget::SourceState { source, state },
            self.deadline(Duration::ZERO),
        );
        let handle = self.issue(HandleKind::SetSourceState, action, |b, h| {
            b.async_set_source_state(h, source, state)
        })?;
        info!(%handle, %source, ?state, "Source state dispatched");
        Ok(handle)
    }

    pub fn set_sink_sound_property(
        &mut self,
        sink: SinkId,
        property: SoundProperty,
    ) -> Result<Handle> {
        let backend = self.check_sink_properties(sink, &[property])?;
        let action = PendingAction::new(
            backend,
            ActionTarget::SinkSoundProperties {
                sink,
                properties: vec![property],
            },
            self.deadline(Duration::ZERO),
        );
        let handle = self.issue(HandleKind::SetSinkSoundProperty, action, |b, h| {
            b.async_set_sink_sound_property(h, sink, property)
        })?;
        info!(%handle, %sink, kind = property.kind, value = property.value, "Sink sound property dispatched");
        Ok(handle)
    }

    pub fn set_sink_sound_properties(
        &mut self,
        sink: SinkId,
        properties: Vec<SoundProperty>,
    ) -> Result<Handle> {
        let backend = self.check_sink_properties(sink, &properties)?;
        let action = PendingAction::new(
            backend,
            ActionTarget::SinkSoundProperties {
                sink,
                properties: properties.clone(),
            },
            self.deadline(Duration::ZERO),
        );
        let handle = self.issue(HandleKind::SetSinkSoundProperties, action, |b, h| {
            b.async_set_sink_sound_properties(h, sink, &properties)
        })?;
        info!(%handle, %sink, count = properties.len(), "Sink sound properties dispatched");
        Ok(handle)
    }

    pub fn set_source_sound_property(
        &mut self,
        source: SourceId,
        property: SoundProperty,
    ) -> Result<Handle> {
        let backend = self.check_source_properties(source, &[property])?;
        let action = PendingAction::new(
            backend,
            ActionTarget::SourceSoundProperties {
                source,
                properties: vec![property],
            },
            self.deadline(Duration::ZERO),
        );
        let handle = self.issue(HandleKind::SetSourceSoundProperty, action, |b, h| {
            b.async_set_source_sound_property(h, source, property)
        })?;
        info!(%handle, %source, kind = property.kind, value = property.value, "Source sound property dispatched");
        Ok(handle)
    }

    pub fn set_source_sound_properties(
        &mut self,
        source: SourceId,
        properties: Vec<SoundProperty>,
    ) -> Result<Handle> {
        let backend = self.check_source_properties(source, &properties)?;
        let action = PendingAction::new(
            backend,
            ActionTarget::SourceSoundProperties {
                source,
                properties: properties.clone(),
            },
            self.deadline(Duration::ZERO),
        );
        let handle = self.issue(HandleKind::SetSourceSoundProperties, action, |b, h| {
            b.async_set_source_sound_properties(h, source, &properties)
        })?;
        info!(%handle, %source, count = properties.len(), "Source sound properties dispatched");
        Ok(handle)
    }

    pub fn crossfade(
        &mut self,
        crossfader: CrossfaderId,
        hot_sink: HotSink,
        ramp: RampType,
        time: Duration,
    ) -> Result<Handle> {
        let entity = self
            .store
            .crossfader(crossfader)
            .ok_or(RoutingError::NonExistent)?;
        if hot_sink == HotSink::Unknown {
            return Err(RoutingError::NotPossible);
        }
        if entity.hot_sink == hot_sink {
            return Err(RoutingError::NoChange);
        }
        let source = self
            .store
            .source(entity.source_id)
            .ok_or(RoutingError::NonExistent)?;
        let backend = self.backend_for_domain(source.domain_id)?;

        let action = PendingAction::new(
            backend,
            ActionTarget::CrossFade {
                crossfader,
                hot_sink,
            },
            self.deadline(time),
        );
        let handle = self.issue(HandleKind::CrossFade, action, |b, h| {
            b.async_cross_fade(h, crossfader, hot_sink, ramp, time)
        })?;
        info!(%handle, %crossfader, ?hot_sink, "Crossfade dispatched");
        Ok(handle)
    }

    /// Forwarded synchronously; the store follows the domain's hook
    pub fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()> {
        let backend = self.backend_for_domain(domain)?;
        self.backends[backend].set_domain_state(domain, state)?;
        info!(%domain, ?state, "Domain state requested");
        Ok(())
    }

    /// Ask the owning adapter to cancel an outstanding action
    ///
    /// Once accepted, the handle's terminal report becomes `Aborted` even if
    /// the adapter finishes normally.
    pub fn abort(&mut self, handle: Handle) -> Result<()> {
        let action = self.pending.get(handle).ok_or(RoutingError::NonExistent)?;
        if action.aborted {
            return Ok(());
        }
        let backend = action.backend;
        self.backends[backend].async_abort(handle)?;
        if let Some(action) = self.pending.get_mut(handle) {
            action.aborted = true;
        }
        info!(%handle, "Abort requested");
        Ok(())
    }

    /// Route and connect every hop from `source` to `sink`
    ///
    /// Uses the best route over free gateways. Either all hops are
    /// dispatched or none stays tracked as part of a main connection.
    pub fn connect_main(&mut self, source: SourceId, sink: SinkId) -> Result<MainConnectionId> {
        let routes = self.router.find_routes(&self.store, true, source, sink)?;
        let route = routes.into_iter().next().ok_or(RoutingError::NotPossible)?;
        self.ensure_capacity(route.hop_count())?;

        for element in &route.elements {
            if self
                .store
                .find_connection(element.source_id, element.sink_id, element.format)
                .is_some()
            {
                return Err(RoutingError::AlreadyExists);
            }
            self.backend_for_domain(element.domain_id)?;
        }

        let mut issued: Vec<(Handle, ConnectionId)> = Vec::with_capacity(route.hop_count());
        for element in &route.elements {
            match self.connect(element.source_id, element.sink_id, element.format) {
                Ok(hop) => issued.push(hop),
                Err(e) => {
                    self.abandon_hops(&issued);
                    return Err(e);
                }
            }
        }

        let connections: Vec<ConnectionId> = issued.iter().map(|(_, c)| *c).collect();
        let main = match self.store.enter_main_connection(source, sink, connections) {
            Ok(main) => main,
            Err(e) => {
                self.abandon_hops(&issued);
                return Err(e);
            }
        };

        let handles: Vec<Handle> = issued.iter().map(|(h, _)| *h).collect();
        self.mains.track_connect(main, &handles);
        info!(%main, %source, %sink, hops = handles.len(), "Main connection requested");
        self.controller
            .on_main_connection_state(main, ConnectionState::Connecting);
        Ok(main)
    }

    /// Disconnect every hop of a connected main connection
    pub fn disconnect_main(&mut self, main: MainConnectionId) -> Result<()> {
        let record = self
            .store
            .main_connection(main)
            .ok_or(RoutingError::NonExistent)?;
        if record.state != ConnectionState::Connected || self.mains.is_busy(main) {
            return Err(RoutingError::NotPossible);
        }
        let connections = record.connections.clone();
        self.ensure_capacity(connections.len())?;

        let mut handles = Vec::with_capacity(connections.len());
        let mut failure = None;
        for connection in connections {
            match self.disconnect_hop(connection) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(%main, %connection, error = %e, "Hop disconnect rejected");
                    failure.get_or_insert(e);
                }
            }
        }
        if handles.is_empty() {
            return Err(failure.unwrap_or(RoutingError::Unknown));
        }

        self.store
            .change_main_connection_state(main, ConnectionState::Disconnecting)?;
        self.mains.track_disconnect(main, &handles, failure);
        info!(%main, hops = handles.len(), "Main disconnection requested");
        self.controller
            .on_main_connection_state(main, ConnectionState::Disconnecting);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Adapter events
    // ------------------------------------------------------------------------

    pub fn handle_event(&mut self, event: RoutingEvent) {
        match event {
            RoutingEvent::AckConnect {
                handle,
                connection,
                result,
            }
            | RoutingEvent::AckDisconnect {
                handle,
                connection,
                result,
            } => self.on_ack(handle, result, AckPayload::Connection(connection)),
            RoutingEvent::AckSetSinkVolume {
                handle,
                volume,
                result,
            }
            | RoutingEvent::AckSetSourceVolume {
                handle,
                volume,
                result,
            } => self.on_ack(handle, result, AckPayload::Volume(volume)),
            RoutingEvent::AckSetVolumes {
                handle,
                volumes,
                result,
            } => self.on_ack(handle, result, AckPayload::Volumes(volumes)),
            RoutingEvent::AckCrossFading {
                handle,
                hot_sink,
                result,
            } => self.on_ack(handle, result, AckPayload::HotSink(hot_sink)),
            RoutingEvent::AckSetSourceState { handle, result }
            | RoutingEvent::AckSetSinkSoundProperty { handle, result }
            | RoutingEvent::AckSetSinkSoundProperties { handle, result }
            | RoutingEvent::AckSetSourceSoundProperty { handle, result }
            | RoutingEvent::AckSetSourceSoundProperties { handle, result } => {
                self.on_ack(handle, result, AckPayload::None)
            }
            RoutingEvent::SinkVolumeTick {
                handle,
                sink,
                volume,
            } => self.on_tick(handle, VolumeTarget::Sink(sink), volume),
            RoutingEvent::SourceVolumeTick {
                handle,
                source,
                volume,
            } => self.on_tick(handle, VolumeTarget::Source(source), volume),
            RoutingEvent::TimingInformationChanged { connection, delay } => {
                self.on_timing_information(connection, delay)
            }
            RoutingEvent::SinkAvailabilityChanged { sink, availability } => {
                if let Err(e) = self.store.change_sink_availability(sink, availability) {
                    warn!(%sink, error = %e, "Availability for unknown sink discarded");
                }
            }
            RoutingEvent::SourceAvailabilityChanged {
                source,
                availability,
            } => {
                if let Err(e) = self.store.change_source_availability(source, availability) {
                    warn!(%source, error = %e, "Availability for unknown source discarded");
                }
            }
            RoutingEvent::DomainStateChanged { domain, state } => {
                match self.store.change_domain_state(domain, state) {
                    Ok(()) => info!(%domain, ?state, "Domain state changed"),
                    Err(e) => warn!(%domain, error = %e, "State for unknown domain discarded"),
                }
            }
        }
    }

    /// Force every handle whose deadline passed to a `Timeout` report
    ///
    /// Returns the number of handles expired.
    pub fn expire_overdue(&mut self, now: Instant) -> usize {
        let overdue: Vec<Handle> = self
            .pending
            .iter()
            .filter(|(_, action)| action.deadline <= now)
            .map(|(handle, _)| handle)
            .collect();

        for handle in &overdue {
            let Some(action) = self.pending.remove(*handle) else {
                continue;
            };
            warn!(%handle, "Action timed out");
            if let Err(e) = self.backends[action.backend].async_abort(*handle) {
                debug!(%handle, error = %e, "Abort after timeout not accepted");
            }
            self.finish(*handle, action, Err(RoutingError::Timeout), AckPayload::None);
        }
        overdue.len()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn backend_for_domain(&self, domain: DomainId) -> Result<usize> {
        let domain = self.store.domain(domain).ok_or(RoutingError::NonExistent)?;
        self.buses
            .get(&domain.busname)
            .copied()
            .ok_or(RoutingError::NonExistent)
    }

    fn ensure_capacity(&self, needed: usize) -> Result<()> {
        if self.pending.free_slots() < needed {
            warn!(
                outstanding = self.pending.len(),
                capacity = self.pending.capacity(),
                "Action pool exhausted"
            );
            return Err(RoutingError::NotPossible);
        }
        Ok(())
    }

    fn deadline(&self, extra: Duration) -> Instant {
        Instant::now() + self.action_timeout + extra
    }

    fn issue<F>(&mut self, kind: HandleKind, action: PendingAction, send: F) -> Result<Handle>
    where
        F: FnOnce(&mut dyn RoutingBackend, Handle) -> Result<()>,
    {
        let backend = action.backend;
        let handle = self.pending.insert(kind, action)?;
        if let Err(e) = send(self.backends[backend].as_mut(), handle) {
            self.pending.remove(handle);
            warn!(%handle, bus = %self.backends[backend].busname(), error = %e, "Adapter rejected request");
            return Err(e);
        }
        Ok(handle)
    }

    fn volume_of(&self, target: VolumeTarget) -> Result<(Volume, DomainId)> {
        match target {
            VolumeTarget::Sink(sink) => self.store.sink(sink).map(|s| (s.volume, s.domain_id)),
            VolumeTarget::Source(source) => {
                self.store.source(source).map(|s| (s.volume, s.domain_id))
            }
        }
        .ok_or(RoutingError::NonExistent)
    }

    fn check_sink_properties(&self, sink: SinkId, properties: &[SoundProperty]) -> Result<usize> {
        let entity = self.store.sink(sink).ok_or(RoutingError::NonExistent)?;
        check_properties(&entity.sound_properties, properties)?;
        self.backend_for_domain(entity.domain_id)
    }

    fn check_source_properties(
        &self,
        source: SourceId,
        properties: &[SoundProperty],
    ) -> Result<usize> {
        let entity = self.store.source(source).ok_or(RoutingError::NonExistent)?;
        check_properties(&entity.sound_properties, properties)?;
        self.backend_for_domain(entity.domain_id)
    }

    /// Abort the hops already dispatched; a hop that still connects is
    /// disconnected once its acknowledgement arrives
    fn abandon_hops(&mut self, issued: &[(Handle, ConnectionId)]) {
        for (handle, _) in issued {
            self.abandoned.insert(*handle);
            if let Err(e) = self.abort(*handle) {
                warn!(%handle, error = %e, "Failed to abort hop of abandoned main connection");
            }
        }
    }

    /// Disconnect a hop whose main connection was abandoned while it was
    /// being connected
    fn release_abandoned(&mut self, handle: Handle, target: &ActionTarget, result: Result<()>) {
        if !self.abandoned.remove(&handle) {
            return;
        }
        if let (ActionTarget::Connect { connection }, Ok(())) = (target, result) {
            match self.disconnect_hop(*connection) {
                Ok(release) => {
                    info!(%handle, %connection, %release, "Releasing hop of abandoned main connection")
                }
                Err(e) => {
                    error!(%handle, %connection, error = %e, "Failed to release hop of abandoned main connection")
                }
            }
        }
    }

    fn on_ack(&mut self, handle: Handle, result: Result<()>, payload: AckPayload) {
        let Some(action) = self.pending.get(handle) else {
            warn!(%handle, "Acknowledgement for unknown handle discarded");
            return;
        };
        if let AckPayload::Connection(connection) = &payload {
            if action.target.connection() != Some(*connection) {
                warn!(%handle, %connection, "Acknowledgement for a different connection discarded");
                return;
            }
        }
        let Some(action) = self.pending.remove(handle) else {
            return;
        };
        let result = match result {
            Ok(()) if action.aborted => Err(RoutingError::Aborted),
            other => other,
        };
        self.finish(handle, action, result, payload);
    }

    fn on_tick(&mut self, handle: Handle, target: VolumeTarget, volume: Volume) {
        let Some(action) = self.pending.get_mut(handle) else {
            warn!(%handle, %volume, "Tick for unknown handle discarded");
            return;
        };
        let matches = match (&action.target, target) {
            (ActionTarget::SinkVolume { sink, .. }, VolumeTarget::Sink(s)) => *sink == s,
            (ActionTarget::SourceVolume { source, .. }, VolumeTarget::Source(s)) => *source == s,
            _ => false,
        };
        if !matches {
            warn!(%handle, ?target, "Tick for a different target discarded");
            return;
        }
        let Some(ramp) = action.ramp.as_mut() else {
            warn!(%handle, "Tick for an instant volume change discarded");
            return;
        };
        if ramp.ticks >= ramp.plan.expected_ticks() {
            warn!(%handle, %volume, "Surplus tick discarded");
            return;
        }
        if !ramp.plan.is_progress(ramp.last, volume) {
            warn!(%handle, last = %ramp.last, %volume, "Non-monotonic tick discarded");
            return;
        }
        ramp.ticks += 1;
        ramp.last = volume;
        action.phase = HandlePhase::Ticking;
        debug!(%handle, %volume, tick = ramp.ticks, "Volume tick");

        self.controller.on_volume_tick(handle, target, volume);
    }

    fn on_timing_information(&mut self, connection: ConnectionId, delay: i16) {
        if let Err(e) = self.store.change_connection_delay(connection, delay) {
            warn!(%connection, error = %e, "Timing information for unknown connection discarded");
            return;
        }
        debug!(%connection, delay, "Connection delay changed");
        for main in self.store.main_connections_using(connection) {
            self.refresh_main_delay(main);
        }
    }

    fn refresh_main_delay(&mut self, main: MainConnectionId) {
        let Some(record) = self.store.main_connection(main) else {
            return;
        };
        let delay = aggregate_delay(&self.store, &record.connections);
        if let Err(e) = self.store.change_main_connection_delay(main, delay) {
            error!(%main, error = %e, "Failed to store main connection delay");
        }
    }

    /// Apply terminal effects, report the completion, advance main connections
    fn finish(
        &mut self,
        handle: Handle,
        action: PendingAction,
        result: Result<()>,
        payload: AckPayload,
    ) {
        if let Some(connection) = action.target.connection() {
            self.in_flight.remove(&connection);
        }

        let stored = self.apply_effects(&action.target, result, &payload);
        let result = match (result, stored) {
            (Ok(()), Err(e)) => {
                error!(%handle, error = %e, "Failed to record completed action");
                Err(RoutingError::Database)
            }
            (result, _) => result,
        };

        let detail = match (&action.target, payload) {
            (_, AckPayload::Connection(c)) => CompletionDetail::Connection(c),
            (ActionTarget::Connect { connection }, _)
            | (ActionTarget::Disconnect { connection }, _) => {
                CompletionDetail::Connection(*connection)
            }
            (_, AckPayload::Volume(v)) => CompletionDetail::Volume(v),
            (_, AckPayload::HotSink(h)) => CompletionDetail::HotSink(h),
            (_, AckPayload::Volumes(_)) | (_, AckPayload::None) => CompletionDetail::None,
        };

        match result {
            Ok(()) => info!(%handle, "Action completed"),
            Err(e) => info!(%handle, error = %e, "Action failed"),
        }
        self.controller.on_action_complete(&Completion {
            handle,
            result,
            detail,
        });

        self.release_abandoned(handle, &action.target, result);
        if action.target.connection().is_some() {
            if let Some((main, outcome)) = self.mains.hop_finished(handle, result) {
                self.settle_main(main, outcome);
            }
        }
    }

    fn apply_effects(
        &mut self,
        target: &ActionTarget,
        result: Result<()>,
        payload: &AckPayload,
    ) -> Result<()> {
        let reached = match payload {
            AckPayload::Volume(v) if result.is_ok() || result == Err(RoutingError::Aborted) => {
                Some(*v)
            }
            _ => None,
        };

        match (target, result) {
            (ActionTarget::Connect { connection }, Ok(())) => {
                self.store.finalize_connection(*connection)
            }
            (ActionTarget::Connect { connection }, Err(_)) => {
                if let Err(e) = self.store.remove_connection(*connection) {
                    debug!(%connection, error = %e, "Provisional connection already gone");
                }
                Ok(())
            }
            (ActionTarget::Disconnect { connection }, Ok(())) => {
                self.store.remove_connection(*connection).map(drop)
            }
            (ActionTarget::SinkVolume { sink, volume }, _) => match reached {
                Some(reached) => {
                    if result.is_ok() && reached != *volume {
                        warn!(%sink, requested = %volume, %reached, "Sink volume differs from request");
                    }
                    self.store.change_sink_volume(*sink, reached)
                }
                None => Ok(()),
            },
            (ActionTarget::SourceVolume { source, volume }, _) => match reached {
                Some(reached) => {
                    if result.is_ok() && reached != *volume {
                        warn!(%source, requested = %volume, %reached, "Source volume differs from request");
                    }
                    self.store.change_source_volume(*source, reached)
                }
                None => Ok(()),
            },
            (ActionTarget::Volumes { changes }, _) => {
                let reported = match payload {
                    AckPayload::Volumes(volumes) => volumes.as_slice(),
                    _ => &[],
                };
                for change in changes {
                    let reached = reported
                        .iter()
                        .find(|(target, _)| *target == change.target)
                        .map(|(_, volume)| *volume);
                    let volume = match (reached, result) {
                        (Some(reached), Ok(())) | (Some(reached), Err(RoutingError::Aborted)) => {
                            reached
                        }
                        (None, Ok(())) => change.volume,
                        _ => continue,
                    };
                    if result.is_ok() && volume != change.volume {
                        warn!(entry = ?change.target, requested = %change.volume, reached = %volume, "Batched volume differs from request");
                    }
                    self.store_volume(change.target, volume)?;
                }
                Ok(())
            }
            (ActionTarget::SourceState { source, state }, Ok(())) => {
                self.store.change_source_state(*source, *state)
            }
            (ActionTarget::SinkSoundProperties { sink, properties }, Ok(())) => properties
                .iter()
                .try_for_each(|p| self.store.change_sink_sound_property(*sink, *p)),
            (ActionTarget::SourceSoundProperties { source, properties }, Ok(())) => properties
                .iter()
                .try_for_each(|p| self.store.change_source_sound_property(*source, *p)),
            (
                ActionTarget::CrossFade {
                    crossfader,
                    hot_sink,
                },
                Ok(()),
            ) => {
                let reported = match payload {
                    AckPayload::HotSink(h) => *h,
                    _ => *hot_sink,
                };
                self.store.change_hot_sink(*crossfader, reported)
            }
            _ => Ok(()),
        }
    }

    fn store_volume(&mut self, target: VolumeTarget, volume: Volume) -> Result<()> {
        match target {
            VolumeTarget::Sink(sink) => self.store.change_sink_volume(sink, volume),
            VolumeTarget::Source(source) => self.store.change_source_volume(source, volume),
        }
    }

    fn settle_main(&mut self, main: MainConnectionId, outcome: MainOutcome) {
        let state = match outcome {
            MainOutcome::Connected => {
                self.refresh_main_delay(main);
                if let Err(e) = self
                    .store
                    .change_main_connection_state(main, ConnectionState::Connected)
                {
                    error!(%main, error = %e, "Failed to store main connection state");
                }
                info!(%main, "Main connection established");
                ConnectionState::Connected
            }
            MainOutcome::ConnectFailed(e) => {
                warn!(%main, error = %e, "Main connection failed, releasing established hops");
                if let Ok(record) = self.store.remove_main_connection(main) {
                    for connection in record.connections {
                        let established = self
                            .store
                            .connection(connection)
                            .is_some_and(|c| !c.pending);
                        if established {
                            if let Err(e) = self.disconnect_hop(connection) {
                                warn!(%connection, error = %e, "Failed to release hop");
                            }
                        }
                    }
                }
                ConnectionState::Disconnected
            }
            MainOutcome::Disconnected => {
                if let Err(e) = self.store.remove_main_connection(main) {
                    error!(%main, error = %e, "Main connection vanished during disconnect");
                }
                info!(%main, "Main connection removed");
                ConnectionState::Disconnected
            }
            MainOutcome::DisconnectFailed(e) => {
                let remaining = self.store.main_connection(main).map_or(0, |record| {
                    record
                        .connections
                        .iter()
                        .filter(|c| self.store.connection(**c).is_some())
                        .count()
                });
                if remaining == 0 {
                    if let Err(e) = self.store.remove_main_connection(main) {
                        error!(%main, error = %e, "Main connection vanished during disconnect");
                    }
                    info!(%main, "Main connection removed after failed hop disconnects");
                    ConnectionState::Disconnected
                } else {
                    warn!(%main, error = %e, remaining, "Main disconnection incomplete");
                    if let Err(e) = self
                        .store
                        .change_main_connection_state(main, ConnectionState::Connected)
                    {
                        error!(%main, error = %e, "Failed to store main connection state");
                    }
                    ConnectionState::Connected
                }
            }
        };
        self.controller.on_main_connection_state(main, state);
    }
}

/// `NonExistent` for kinds the entity does not carry, `NoChange` when every
/// requested value is already current
fn check_properties(current: &[SoundProperty], requested: &[SoundProperty]) -> Result<()> {
    let mut changed = false;
    for property in requested {
        let existing = current
            .iter()
            .find(|p| p.kind == property.kind)
            .ok_or(RoutingError::NonExistent)?;
        changed |= existing.value != property.value;
    }
    if changed {
        Ok(())
    } else {
        Err(RoutingError::NoChange)
    }
}
