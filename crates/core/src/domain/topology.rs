//! Topology store
//!
//! The [`TopologyStore`] trait is the read-mostly view the router and the
//! dispatcher work against. [`MemoryTopology`] keeps everything in ordered
//! maps, which also makes route enumeration order deterministic.

use crate::domain::error::{Result, RoutingError};
use crate::domain::model::{
    Availability, Connection, ConnectionFormat, ConnectionId, ConnectionState, Crossfader,
    CrossfaderId, Domain, DomainId, DomainState, Gateway, GatewayId, HotSink, MainConnection,
    MainConnectionId, Sink, SinkId, SoundProperty, Source, SourceId, SourceState, Volume,
};
use std::collections::BTreeMap;
use tracing::{debug, trace};

pub trait TopologyStore {
    fn domain(&self, id: DomainId) -> Option<&Domain>;
    fn domains(&self) -> Vec<&Domain>;
    fn source(&self, id: SourceId) -> Option<&Source>;
    fn sources(&self) -> Vec<&Source>;
    fn sink(&self, id: SinkId) -> Option<&Sink>;
    fn sinks(&self) -> Vec<&Sink>;
    fn gateway(&self, id: GatewayId) -> Option<&Gateway>;
    fn gateways(&self) -> Vec<&Gateway>;
    fn crossfader(&self, id: CrossfaderId) -> Option<&Crossfader>;
    fn connection(&self, id: ConnectionId) -> Option<&Connection>;
    fn connections(&self) -> Vec<&Connection>;
    fn main_connection(&self, id: MainConnectionId) -> Option<&MainConnection>;
    fn main_connections(&self) -> Vec<&MainConnection>;

    fn add_domain(&mut self, domain: Domain) -> Result<DomainId>;
    fn add_source(&mut self, source: Source) -> Result<SourceId>;
    fn add_sink(&mut self, sink: Sink) -> Result<SinkId>;
    fn add_gateway(&mut self, gateway: Gateway) -> Result<GatewayId>;
    fn add_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId>;
    fn remove_domain(&mut self, id: DomainId) -> Result<Domain>;
    fn remove_source(&mut self, id: SourceId) -> Result<Source>;
    fn remove_sink(&mut self, id: SinkId) -> Result<Sink>;
    fn remove_gateway(&mut self, id: GatewayId) -> Result<Gateway>;
    fn remove_crossfader(&mut self, id: CrossfaderId) -> Result<Crossfader>;

    /// Enter a provisional connection; its delay is unknown and it is pending
    fn enter_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<ConnectionId>;
    fn finalize_connection(&mut self, id: ConnectionId) -> Result<()>;
    fn remove_connection(&mut self, id: ConnectionId) -> Result<Connection>;
    fn change_connection_delay(&mut self, id: ConnectionId, delay: i16) -> Result<()>;

    fn change_sink_volume(&mut self, id: SinkId, volume: Volume) -> Result<()>;
    fn change_source_volume(&mut self, id: SourceId, volume: Volume) -> Result<()>;
    fn change_sink_sound_property(&mut self, id: SinkId, property: SoundProperty) -> Result<()>;
    fn change_source_sound_property(
        &mut self,
        id: SourceId,
        property: SoundProperty,
    ) -> Result<()>;
    fn change_source_state(&mut self, id: SourceId, state: SourceState) -> Result<()>;
    fn change_hot_sink(&mut self, id: CrossfaderId, hot_sink: HotSink) -> Result<()>;
    fn change_sink_availability(&mut self, id: SinkId, availability: Availability) -> Result<()>;
    fn change_source_availability(
        &mut self,
        id: SourceId,
        availability: Availability,
    ) -> Result<()>;
    fn change_domain_state(&mut self, id: DomainId, state: DomainState) -> Result<()>;

    fn enter_main_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        connections: Vec<ConnectionId>,
    ) -> Result<MainConnectionId>;
    fn change_main_connection_state(
        &mut self,
        id: MainConnectionId,
        state: ConnectionState,
    ) -> Result<()>;
    fn change_main_connection_delay(
        &mut self,
        id: MainConnectionId,
        delay: Option<i16>,
    ) -> Result<()>;
    fn remove_main_connection(&mut self, id: MainConnectionId) -> Result<MainConnection>;

    /// Gateways whose output side lives in `domain`
    fn gateways_into(&self, domain: DomainId) -> Vec<&Gateway> {
        self.gateways()
            .into_iter()
            .filter(|gw| gw.domain_source_id == domain)
            .collect()
    }

    /// A gateway is in use when a connection touches its input or output side
    fn is_gateway_in_use(&self, gateway: &Gateway) -> bool {
        self.connections()
            .iter()
            .any(|c| c.sink_id == gateway.sink_id || c.source_id == gateway.source_id)
    }

    fn find_connection(
        &self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Option<&Connection> {
        self.connections()
            .into_iter()
            .find(|c| c.source_id == source && c.sink_id == sink && c.format == format)
    }

    /// Main connections that include the given hop
    fn main_connections_using(&self, connection: ConnectionId) -> Vec<MainConnectionId> {
        self.main_connections()
            .iter()
            .filter(|m| m.connections.contains(&connection))
            .map(|m| m.id)
            .collect()
    }
}

/// In-process topology store
#[derive(Debug, Clone, Default)]
pub struct MemoryTopology {
    domains: BTreeMap<DomainId, Domain>,
    sources: BTreeMap<SourceId, Source>,
    sinks: BTreeMap<SinkId, Sink>,
    gateways: BTreeMap<GatewayId, Gateway>,
    crossfaders: BTreeMap<CrossfaderId, Crossfader>,
    connections: BTreeMap<ConnectionId, Connection>,
    main_connections: BTreeMap<MainConnectionId, MainConnection>,
    last_connection: u16,
    last_main_connection: u16,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_domain(&self, id: DomainId) -> Result<()> {
        if self.domains.contains_key(&id) {
            Ok(())
        } else {
            Err(RoutingError::NonExistent)
        }
    }
}

/// Next free id after `last`, wrapping in `1..=u16::MAX`
fn next_free_id<K: Ord + From<u16>, V>(last: &mut u16, used: &BTreeMap<K, V>) -> Result<u16> {
    if used.len() >= usize::from(u16::MAX) {
        return Err(RoutingError::Database);
    }
    let mut candidate = *last;
    loop {
        candidate = candidate.checked_add(1).unwrap_or(1);
        if !used.contains_key(&K::from(candidate)) {
            *last = candidate;
            return Ok(candidate);
        }
    }
}

fn upsert_property(properties: &mut Vec<SoundProperty>, property: SoundProperty) {
    match properties.iter_mut().find(|p| p.kind == property.kind) {
        Some(existing) => existing.value = property.value,
        None => properties.push(property),
    }
}

impl TopologyStore for MemoryTopology {
    fn domain(&self, id: DomainId) -> Option<&Domain> {
        self.domains.get(&id)
    }

    fn domains(&self) -> Vec<&Domain> {
        self.domains.values().collect()
    }

    fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    fn sources(&self) -> Vec<&Source> {
        self.sources.values().collect()
    }

    fn sink(&self, id: SinkId) -> Option<&Sink> {
        self.sinks.get(&id)
    }

    fn sinks(&self) -> Vec<&Sink> {
        self.sinks.values().collect()
    }

    fn gateway(&self, id: GatewayId) -> Option<&Gateway> {
        self.gateways.get(&id)
    }

    fn gateways(&self) -> Vec<&Gateway> {
        self.gateways.values().collect()
    }

    fn crossfader(&self, id: CrossfaderId) -> Option<&Crossfader> {
        self.crossfaders.get(&id)
    }

    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    fn connections(&self) -> Vec<&Connection> {
        self.connections.values().collect()
    }

    fn main_connection(&self, id: MainConnectionId) -> Option<&MainConnection> {
        self.main_connections.get(&id)
    }

    fn main_connections(&self) -> Vec<&MainConnection> {
        self.main_connections.values().collect()
    }

    fn add_domain(&mut self, domain: Domain) -> Result<DomainId> {
        if self.domains.contains_key(&domain.id) {
            return Err(RoutingError::AlreadyExists);
        }
        let id = domain.id;
        debug!(domain = %id, name = %domain.name, bus = %domain.busname, "Domain added");
        self.domains.insert(id, domain);
        Ok(id)
    }

    fn add_source(&mut self, source: Source) -> Result<SourceId> {
        if self.sources.contains_key(&source.id) {
            return Err(RoutingError::AlreadyExists);
        }
        self.require_domain(source.domain_id)?;
        let id = source.id;
        debug!(source = %id, domain = %source.domain_id, name = %source.name, "Source added");
        self.sources.insert(id, source);
        Ok(id)
    }

    fn add_sink(&mut self, sink: Sink) -> Result<SinkId> {
        if self.sinks.contains_key(&sink.id) {
            return Err(RoutingError::AlreadyExists);
        }
        self.require_domain(sink.domain_id)?;
        let id = sink.id;
        debug!(sink = %id, domain = %sink.domain_id, name = %sink.name, "Sink added");
        self.sinks.insert(id, sink);
        Ok(id)
    }

    fn add_gateway(&mut self, gateway: Gateway) -> Result<GatewayId> {
        if self.gateways.contains_key(&gateway.id) {
            return Err(RoutingError::AlreadyExists);
        }
        self.require_domain(gateway.domain_sink_id)?;
        self.require_domain(gateway.domain_source_id)?;
        self.require_domain(gateway.control_domain_id)?;

        let input_ok = self
            .sinks
            .get(&gateway.sink_id)
            .is_some_and(|s| s.domain_id == gateway.domain_sink_id);
        let output_ok = self
            .sources
            .get(&gateway.source_id)
            .is_some_and(|s| s.domain_id == gateway.domain_source_id);
        if !input_ok || !output_ok {
            return Err(RoutingError::NonExistent);
        }

        let id = gateway.id;
        debug!(
            gateway = %id,
            from = %gateway.domain_sink_id,
            to = %gateway.domain_source_id,
            "Gateway added"
        );
        self.gateways.insert(id, gateway);
        Ok(id)
    }

    fn add_crossfader(&mut self, crossfader: Crossfader) -> Result<CrossfaderId> {
        if self.crossfaders.contains_key(&crossfader.id) {
            return Err(RoutingError::AlreadyExists);
        }
        let endpoints_known = self.sources.contains_key(&crossfader.source_id)
            && self.sinks.contains_key(&crossfader.sink_a)
            && self.sinks.contains_key(&crossfader.sink_b);
        if !endpoints_known {
            return Err(RoutingError::NonExistent);
        }
        let id = crossfader.id;
        self.crossfaders.insert(id, crossfader);
        Ok(id)
    }

    fn remove_domain(&mut self, id: DomainId) -> Result<Domain> {
        self.domains.remove(&id).ok_or(RoutingError::NonExistent)
    }

    fn remove_source(&mut self, id: SourceId) -> Result<Source> {
        self.sources.remove(&id).ok_or(RoutingError::NonExistent)
    }

    fn remove_sink(&mut self, id: SinkId) -> Result<Sink> {
        self.sinks.remove(&id).ok_or(RoutingError::NonExistent)
    }

    fn remove_gateway(&mut self, id: GatewayId) -> Result<Gateway> {
        self.gateways.remove(&id).ok_or(RoutingError::NonExistent)
    }

    fn remove_crossfader(&mut self, id: CrossfaderId) -> Result<Crossfader> {
        self.crossfaders.remove(&id).ok_or(RoutingError::NonExistent)
    }

    fn enter_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        format: ConnectionFormat,
    ) -> Result<ConnectionId> {
        if !self.sources.contains_key(&source) || !self.sinks.contains_key(&sink) {
            return Err(RoutingError::NonExistent);
        }
        let id = ConnectionId::new(next_free_id(&mut self.last_connection, &self.connections)?);
        trace!(connection = %id, %source, %sink, ?format, "Provisional connection entered");
        self.connections.insert(
            id,
            Connection {
                id,
                source_id: source,
                sink_id: sink,
                format,
                delay: None,
                pending: true,
            },
        );
        Ok(id)
    }

    fn finalize_connection(&mut self, id: ConnectionId) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RoutingError::NonExistent)?;
        connection.pending = false;
        Ok(())
    }

    fn remove_connection(&mut self, id: ConnectionId) -> Result<Connection> {
        self.connections.remove(&id).ok_or(RoutingError::NonExistent)
    }

    fn change_connection_delay(&mut self, id: ConnectionId, delay: i16) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RoutingError::NonExistent)?;
        connection.delay = Some(delay);
        Ok(())
    }

    fn change_sink_volume(&mut self, id: SinkId, volume: Volume) -> Result<()> {
        let sink = self.sinks.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        sink.volume = volume;
        Ok(())
    }

    fn change_source_volume(&mut self, id: SourceId, volume: Volume) -> Result<()> {
        let source = self.sources.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        source.volume = volume;
        Ok(())
    }

    fn change_sink_sound_property(&mut self, id: SinkId, property: SoundProperty) -> Result<()> {
        let sink = self.sinks.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        upsert_property(&mut sink.sound_properties, property);
        Ok(())
    }

    fn change_source_sound_property(
        &mut self,
        id: SourceId,
        property: SoundProperty,
    ) -> Result<()> {
        let source = self.sources.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        upsert_property(&mut source.sound_properties, property);
        Ok(())
    }

    fn change_source_state(&mut self, id: SourceId, state: SourceState) -> Result<()> {
        let source = self.sources.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        source.state = state;
        Ok(())
    }

    fn change_hot_sink(&mut self, id: CrossfaderId, hot_sink: HotSink) -> Result<()> {
        let crossfader = self
            .crossfaders
            .get_mut(&id)
            .ok_or(RoutingError::NonExistent)?;
        crossfader.hot_sink = hot_sink;
        Ok(())
    }

    fn change_sink_availability(&mut self, id: SinkId, availability: Availability) -> Result<()> {
        let sink = self.sinks.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        sink.availability = availability;
        Ok(())
    }

    fn change_source_availability(
        &mut self,
        id: SourceId,
        availability: Availability,
    ) -> Result<()> {
        let source = self.sources.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        source.availability = availability;
        Ok(())
    }

    fn change_domain_state(&mut self, id: DomainId, state: DomainState) -> Result<()> {
        let domain = self.domains.get_mut(&id).ok_or(RoutingError::NonExistent)?;
        domain.state = state;
        Ok(())
    }

    fn enter_main_connection(
        &mut self,
        source: SourceId,
        sink: SinkId,
        connections: Vec<ConnectionId>,
    ) -> Result<MainConnectionId> {
        if connections.is_empty() {
            return Err(RoutingError::NotPossible);
        }
        if connections.iter().any(|c| !self.connections.contains_key(c)) {
            return Err(RoutingError::NonExistent);
        }
        let id = MainConnectionId::new(next_free_id(
            &mut self.last_main_connection,
            &self.main_connections,
        )?);
        self.main_connections.insert(
            id,
            MainConnection {
                id,
                source_id: source,
                sink_id: sink,
                connections,
                delay: None,
                state: ConnectionState::Connecting,
            },
        );
        Ok(id)
    }

    fn change_main_connection_state(
        &mut self,
        id: MainConnectionId,
        state: ConnectionState,
    ) -> Result<()> {
        let main = self
            .main_connections
            .get_mut(&id)
            .ok_or(RoutingError::NonExistent)?;
        main.state = state;
        Ok(())
    }

    fn change_main_connection_delay(
        &mut self,
        id: MainConnectionId,
        delay: Option<i16>,
    ) -> Result<()> {
        let main = self
            .main_connections
            .get_mut(&id)
            .ok_or(RoutingError::NonExistent)?;
        main.delay = delay;
        Ok(())
    }

    fn remove_main_connection(&mut self, id: MainConnectionId) -> Result<MainConnection> {
        self.main_connections
            .remove(&id)
            .ok_or(RoutingError::NonExistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_domain_store() -> MemoryTopology {
        let mut store = MemoryTopology::new();
        store
            .add_domain(Domain::new(DomainId::new(1), "head_unit", "sim.head_unit"))
            .unwrap();
        store
            .add_domain(Domain::new(DomainId::new(2), "bluetooth", "sim.bluetooth"))
            .unwrap();
        store
            .add_source(Source::new(
                SourceId::new(1),
                DomainId::new(1),
                "radio",
                vec![ConnectionFormat::Stereo],
            ))
            .unwrap();
        store
            .add_sink(Sink::new(
                SinkId::new(1),
                DomainId::new(1),
                "amplifier",
                vec![ConnectionFormat::Stereo],
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_entities_require_their_domain() {
        let mut store = two_domain_store();
        let orphan = Sink::new(SinkId::new(9), DomainId::new(7), "orphan", vec![]);
        assert_eq!(store.add_sink(orphan), Err(RoutingError::NonExistent));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut store = two_domain_store();
        let again = Domain::new(DomainId::new(1), "other", "sim.other");
        assert_eq!(store.add_domain(again), Err(RoutingError::AlreadyExists));
    }

    #[test]
    fn test_gateway_endpoints_must_match_domains() {
        let mut store = two_domain_store();
        let gw = Gateway {
            id: GatewayId::new(1),
            name: "bridge".into(),
            // sink 1 lives in domain 1, not 2
            sink_id: SinkId::new(1),
            source_id: SourceId::new(1),
            domain_sink_id: DomainId::new(2),
            domain_source_id: DomainId::new(1),
            control_domain_id: DomainId::new(1),
            sink_formats: vec![ConnectionFormat::Stereo],
            source_formats: vec![ConnectionFormat::Stereo],
            conversion_matrix: vec![true],
        };
        assert_eq!(store.add_gateway(gw), Err(RoutingError::NonExistent));
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut store = two_domain_store();
        let id = store
            .enter_connection(SourceId::new(1), SinkId::new(1), ConnectionFormat::Stereo)
            .unwrap();

        let c = store.connection(id).unwrap();
        assert!(c.pending);
        assert_eq!(c.delay, None);

        store.finalize_connection(id).unwrap();
        store.change_connection_delay(id, 12).unwrap();
        let c = store.connection(id).unwrap();
        assert!(!c.pending);
        assert_eq!(c.delay, Some(12));

        assert!(store
            .find_connection(SourceId::new(1), SinkId::new(1), ConnectionFormat::Stereo)
            .is_some());
        store.remove_connection(id).unwrap();
        assert!(store.connection(id).is_none());
    }

    #[test]
    fn test_connection_ids_are_not_reused_while_live() {
        let mut store = two_domain_store();
        let a = store
            .enter_connection(SourceId::new(1), SinkId::new(1), ConnectionFormat::Stereo)
            .unwrap();
        let b = store
            .enter_connection(SourceId::new(1), SinkId::new(1), ConnectionFormat::Mono)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sound_property_upsert() {
        let mut store = two_domain_store();
        let sink = SinkId::new(1);
        store
            .change_sink_sound_property(sink, SoundProperty::new(3, 10))
            .unwrap();
        store
            .change_sink_sound_property(sink, SoundProperty::new(3, 12))
            .unwrap();
        let props = &store.sink(sink).unwrap().sound_properties;
        assert_eq!(props, &vec![SoundProperty::new(3, 12)]);
    }

    #[test]
    fn test_main_connection_needs_hops() {
        let mut store = two_domain_store();
        assert_eq!(
            store.enter_main_connection(SourceId::new(1), SinkId::new(1), vec![]),
            Err(RoutingError::NotPossible)
        );
    }
}
