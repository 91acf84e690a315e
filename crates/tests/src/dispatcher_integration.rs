//! Integration tests for routing and dispatch over a configured topology
//!
//! The topology is read from a TOML file; adapters are in-process loopbacks
//! whose acknowledgements the tests deliver explicitly.

use crossover_core::domain::{
    ActionDispatcher, ConnectionFormat, ConnectionId, ConnectionState, CrossfaderId, DaemonConfig,
    DomainId, DomainState, Handle, HotSink, MainConnectionId, MemoryTopology, RampPlan, RampType,
    Result, Route, RoutePolicy, Router, RoutingBackend, RoutingError, RoutingEvent, SinkId,
    SoundProperty, SourceId, SourceState, TopologyStore, Volume, VolumeChange, VolumeTarget,
};
use crossover_tests::Recorder;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

const CHAIN: &str = r#"
[dispatcher]
max_in_flight = 6

[[topology.domains]]
id = 1
name = "front"
busname = "loop.a"

[[topology.domains]]
id = 2
name = "bridge"
busname = "loop.b"

[[topology.domains]]
id = 3
name = "rear"
busname = "loop.a"

[[topology.sources]]
id = 1
domain_id = 1
name = "radio"
formats = ["stereo"]

[[topology.sinks]]
id = 1
domain_id = 3
name = "speaker"
formats = ["stereo", "mono"]

[[topology.sinks]]
id = 101
domain_id = 1
name = "gw1_in"
formats = ["stereo"]

[[topology.sources]]
id = 101
domain_id = 2
name = "gw1_out"
formats = ["stereo", "mono"]

[[topology.sinks]]
id = 102
domain_id = 2
name = "gw2_in"
formats = ["stereo", "mono"]

[[topology.sources]]
id = 102
domain_id = 3
name = "gw2_out"
formats = ["stereo", "mono"]

[[topology.sinks]]
id = 103
domain_id = 1
name = "shortcut_in"
formats = ["stereo"]

[[topology.sources]]
id = 103
domain_id = 3
name = "shortcut_out"
formats = ["mono"]

[[topology.gateways]]
id = 1
name = "front_to_bridge"
sink_id = 101
source_id = 101
domain_sink_id = 1
domain_source_id = 2
control_domain_id = 1
sink_formats = ["stereo"]
source_formats = ["stereo", "mono"]
conversion_matrix = [true, true]

[[topology.gateways]]
id = 2
name = "bridge_to_rear"
sink_id = 102
source_id = 102
domain_sink_id = 2
domain_source_id = 3
control_domain_id = 2
sink_formats = ["stereo", "mono"]
source_formats = ["stereo", "mono"]
conversion_matrix = [true, false, false, true]

[[topology.gateways]]
id = 3
name = "shortcut"
sink_id = 103
source_id = 103
domain_sink_id = 1
domain_source_id = 3
control_domain_id = 1
sink_formats = ["stereo"]
source_formats = ["mono"]
conversion_matrix = [true]

[[topology.crossfaders]]
id = 1
name = "fader"
source_id = 1
sink_a = 101
sink_b = 103
hot_sink = "sink_a"
"#;

const RADIO: SourceId = SourceId::new(1);
const SPEAKER: SinkId = SinkId::new(1);

/// Adapter that queues a successful acknowledgement for every request
struct Loopback {
    busname: &'static str,
    queue: Rc<RefCell<VecDeque<RoutingEvent>>>,
    fail_connects: bool,
}

impl Loopback {
    fn push(&self, event: RoutingEvent) -> Result<()> {
        self.queue.borrow_mut().push_back(event);
        Ok(())
    }
}

impl RoutingBackend for Loopback {
    fn busname(&self) -> &str {
        self.busname
    }

    fn async_abort(&mut self, _handle: Handle) -> Result<()> {
        Ok(())
    }

    fn async_connect(
        &mut self,
        handle: Handle,
        connection: ConnectionId,
        _source: SourceId,
        _sink: SinkId,
        _format: ConnectionFormat,
    ) -> Result<()> {
        let result = if self.fail_connects {
            Err(RoutingError::NotPossible)
        } else {
            Ok(())
        };
        self.push(RoutingEvent::AckConnect {
            handle,
            connection,
            result,
        })?;
        self.push(RoutingEvent::TimingInformationChanged {
            connection,
            delay: 3,
        })
    }

    fn async_disconnect(&mut self, handle: Handle, connection: ConnectionId) -> Result<()> {
        self.push(RoutingEvent::AckDisconnect {
            handle,
            connection,
            result: Ok(()),
        })
    }

    fn async_set_sink_volume(
        &mut self,
        handle: Handle,
        _sink: SinkId,
        plan: RampPlan,
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSinkVolume {
            handle,
            volume: plan.to,
            result: Ok(()),
        })
    }

    fn async_set_source_volume(
        &mut self,
        handle: Handle,
        _source: SourceId,
        plan: RampPlan,
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSourceVolume {
            handle,
            volume: plan.to,
            result: Ok(()),
        })
    }

    fn async_set_volumes(&mut self, handle: Handle, changes: &[VolumeChange]) -> Result<()> {
        self.push(RoutingEvent::AckSetVolumes {
            handle,
            volumes: changes.iter().map(|c| (c.target, c.volume)).collect(),
            result: Ok(()),
        })
    }

    fn async_set_source_state(
        &mut self,
        handle: Handle,
        _source: SourceId,
        _state: SourceState,
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSourceState {
            handle,
            result: Ok(()),
        })
    }

    fn async_set_sink_sound_property(
        &mut self,
        handle: Handle,
        _sink: SinkId,
        _property: SoundProperty,
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSinkSoundProperty {
            handle,
            result: Ok(()),
        })
    }

    fn async_set_sink_sound_properties(
        &mut self,
        handle: Handle,
        _sink: SinkId,
        _properties: &[SoundProperty],
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSinkSoundProperties {
            handle,
            result: Ok(()),
        })
    }

    fn async_set_source_sound_property(
        &mut self,
        handle: Handle,
        _source: SourceId,
        _property: SoundProperty,
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSourceSoundProperty {
            handle,
            result: Ok(()),
        })
    }

    fn async_set_source_sound_properties(
        &mut self,
        handle: Handle,
        _source: SourceId,
        _properties: &[SoundProperty],
    ) -> Result<()> {
        self.push(RoutingEvent::AckSetSourceSoundProperties {
            handle,
            result: Ok(()),
        })
    }

    fn async_cross_fade(
        &mut self,
        handle: Handle,
        _crossfader: CrossfaderId,
        hot_sink: HotSink,
        _ramp: RampType,
        _time: Duration,
    ) -> Result<()> {
        self.push(RoutingEvent::AckCrossFading {
            handle,
            hot_sink,
            result: Ok(()),
        })
    }

    fn set_domain_state(&mut self, domain: DomainId, state: DomainState) -> Result<()> {
        self.push(RoutingEvent::DomainStateChanged { domain, state })
    }
}

struct Harness {
    dispatcher: ActionDispatcher<MemoryTopology>,
    queue: Rc<RefCell<VecDeque<RoutingEvent>>>,
    recorder: Recorder,
}

impl Harness {
    fn new(config: &DaemonConfig, failing_bus: Option<&'static str>) -> Self {
        let recorder = Recorder::new();
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let store = config.topology.build_store().unwrap();
        let mut dispatcher = ActionDispatcher::new(store, &config.dispatcher, recorder.boxed());
        for busname in ["loop.a", "loop.b"] {
            dispatcher
                .add_backend(Box::new(Loopback {
                    busname,
                    queue: queue.clone(),
                    fail_connects: failing_bus == Some(busname),
                }))
                .unwrap();
        }
        Self {
            dispatcher,
            queue,
            recorder,
        }
    }

    /// Deliver queued adapter events, including those they trigger
    fn pump(&mut self) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some(event) => self.dispatcher.handle_event(event),
                None => break,
            }
        }
    }

    fn main_state(&self, main: MainConnectionId) -> Option<ConnectionState> {
        self.dispatcher
            .store()
            .main_connection(main)
            .map(|m| m.state)
    }
}

async fn load_chain() -> DaemonConfig {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crossover.toml");
    tokio::fs::write(&path, CHAIN).await.unwrap();
    DaemonConfig::load_from_file(&path).await.unwrap()
}

// ============================================================================
// CONFIGURED TOPOLOGY
// ============================================================================

#[tokio::test]
async fn test_chain_loads_with_defaults() {
    let config = load_chain().await;
    assert_eq!(config.dispatcher.max_in_flight, 6);
    assert_eq!(config.dispatcher.action_timeout_ms, 5000);
    assert_eq!(config.topology.busnames(), vec!["loop.a", "loop.b"]);
    assert!(config.startup.connections.is_empty());

    let store = config.topology.build_store().unwrap();
    assert_eq!(store.gateways().len(), 3);
    assert_eq!(
        store.crossfader(CrossfaderId::new(1)).unwrap().hot_sink,
        HotSink::SinkA
    );
}

#[tokio::test]
async fn test_routes_are_ranked_by_hop_count() {
    let config = load_chain().await;
    let store = config.topology.build_store().unwrap();
    let routes = Router::new()
        .find_routes(&store, false, RADIO, SPEAKER)
        .unwrap();

    let hops: Vec<usize> = routes.iter().map(Route::hop_count).collect();
    assert_eq!(hops, vec![2, 3, 3]);
    // The shortcut delivers mono only
    assert_eq!(routes[0].elements[1].format, ConnectionFormat::Mono);
    for route in &routes {
        assert_eq!(route.source_id, RADIO);
        assert_eq!(route.sink_id, SPEAKER);
        assert_eq!(route.elements.first().unwrap().source_id, RADIO);
        assert_eq!(route.elements.last().unwrap().sink_id, SPEAKER);
    }
}

/// Prefers routes ending in stereo, then fewer hops
struct StereoFirst;

impl RoutePolicy for StereoFirst {
    fn compare(&self, a: &Route, b: &Route) -> Ordering {
        let stereo = |r: &Route| {
            r.elements
                .last()
                .map_or(false, |e| e.format == ConnectionFormat::Stereo)
        };
        stereo(b)
            .cmp(&stereo(a))
            .then(a.hop_count().cmp(&b.hop_count()))
    }
}

#[tokio::test]
async fn test_custom_policy_reorders_routes() {
    let config = load_chain().await;
    let store = config.topology.build_store().unwrap();
    let routes = Router::with_policy(Box::new(StereoFirst))
        .find_routes(&store, false, RADIO, SPEAKER)
        .unwrap();
    assert_eq!(routes[0].hop_count(), 3);
    assert_eq!(
        routes[0].elements.last().unwrap().format,
        ConnectionFormat::Stereo
    );
    assert_eq!(routes[1].hop_count(), 2);
    assert_eq!(routes[2].hop_count(), 3);
}

// ============================================================================
// MAIN CONNECTIONS OVER LOOPBACK ADAPTERS
// ============================================================================

#[tokio::test]
async fn test_main_connection_uses_shortest_route() {
    let config = load_chain().await;
    let mut harness = Harness::new(&config, None);

    let main = harness.dispatcher.connect_main(RADIO, SPEAKER).unwrap();
    assert_eq!(harness.main_state(main), Some(ConnectionState::Connecting));
    harness.pump();

    let record = harness.dispatcher.store().main_connection(main).unwrap();
    assert_eq!(record.state, ConnectionState::Connected);
    assert_eq!(record.connections.len(), 2);
    assert_eq!(record.delay, Some(6));
    let hops = record.connections.clone();
    for hop in hops {
        assert_eq!(
            harness.dispatcher.disconnect(hop),
            Err(RoutingError::NotPossible)
        );
    }

    // The shortcut is busy now; the next request takes the long way
    let routes = harness
        .dispatcher
        .find_routes(true, RADIO, SPEAKER)
        .unwrap();
    assert!(routes.iter().all(|r| r.hop_count() == 3));
}

#[tokio::test]
async fn test_failed_hop_releases_main_connection() {
    let config = load_chain().await;
    // Every hop of the shortest route lives on loop.a
    let mut harness = Harness::new(&config, Some("loop.a"));

    let main = harness.dispatcher.connect_main(RADIO, SPEAKER).unwrap();
    harness.pump();

    assert_eq!(harness.main_state(main), None);
    assert!(harness.dispatcher.store().connections().is_empty());
    assert!(harness.dispatcher.list_handles().is_empty());
    let record = harness.recorder.0.borrow();
    assert_eq!(
        record.mains.last(),
        Some(&(main, ConnectionState::Disconnected))
    );
    assert!(record
        .completions
        .iter()
        .all(|c| c.result == Err(RoutingError::NotPossible)));
}

#[tokio::test]
async fn test_full_disconnect_cycle_frees_the_pool() {
    let config = load_chain().await;
    let mut harness = Harness::new(&config, None);

    for _ in 0..3 {
        let main = harness.dispatcher.connect_main(RADIO, SPEAKER).unwrap();
        harness.pump();
        harness.dispatcher.disconnect_main(main).unwrap();
        assert_eq!(harness.main_state(main), Some(ConnectionState::Disconnecting));
        harness.pump();
        assert_eq!(harness.main_state(main), None);
    }
    assert!(harness.dispatcher.store().connections().is_empty());
    assert_eq!(harness.dispatcher.outstanding(), 0);
}

#[tokio::test]
async fn test_pool_limits_parallel_main_connections() {
    let mut config = load_chain().await;
    config.dispatcher.max_in_flight = 3;
    let mut harness = Harness::new(&config, None);

    // Two hops outstanding leave one free slot, too few for another route
    harness.dispatcher.connect_main(RADIO, SPEAKER).unwrap();
    assert_eq!(harness.dispatcher.outstanding(), 2);
    assert_eq!(
        harness.dispatcher.connect_main(RADIO, SinkId::new(102)),
        Err(RoutingError::NotPossible)
    );
    harness.pump();
    assert_eq!(harness.dispatcher.outstanding(), 0);
}

// ============================================================================
// OTHER ACTIONS
// ============================================================================

#[tokio::test]
async fn test_crossfade_and_domain_state() {
    let config = load_chain().await;
    let mut harness = Harness::new(&config, None);

    harness
        .dispatcher
        .crossfade(
            CrossfaderId::new(1),
            HotSink::SinkB,
            RampType::Linear,
            Duration::from_millis(200),
        )
        .unwrap();
    harness
        .dispatcher
        .set_domain_state(DomainId::new(2), DomainState::IndependentStartup)
        .unwrap();
    harness.pump();

    let store = harness.dispatcher.store();
    assert_eq!(
        store.crossfader(CrossfaderId::new(1)).unwrap().hot_sink,
        HotSink::SinkB
    );
    assert_eq!(
        store.domain(DomainId::new(2)).unwrap().state,
        DomainState::IndependentStartup
    );
    assert_eq!(
        harness.dispatcher.crossfade(
            CrossfaderId::new(1),
            HotSink::Unknown,
            RampType::Linear,
            Duration::ZERO
        ),
        Err(RoutingError::NotPossible)
    );
}

#[tokio::test]
async fn test_volume_batch_across_domains_of_one_adapter() {
    let config = load_chain().await;
    let mut harness = Harness::new(&config, None);

    // Radio (front) and speaker (rear) are both served by loop.a
    let handle = harness
        .dispatcher
        .set_volumes(vec![
            VolumeChange::new(VolumeTarget::Source(RADIO), Volume::new(-4)),
            VolumeChange::new(VolumeTarget::Sink(SPEAKER), Volume::new(12))
                .ramped(RampType::Linear, Duration::from_millis(50)),
        ])
        .unwrap();
    harness.pump();

    assert_eq!(
        harness.recorder.0.borrow().completion(handle).map(|c| c.result),
        Some(Ok(()))
    );
    let store = harness.dispatcher.store();
    assert_eq!(store.source(RADIO).unwrap().volume, Volume::new(-4));
    assert_eq!(store.sink(SPEAKER).unwrap().volume, Volume::new(12));

    // The gateway sink of the bridge domain sits behind loop.b
    assert_eq!(
        harness.dispatcher.set_volumes(vec![
            VolumeChange::new(VolumeTarget::Sink(SPEAKER), Volume::new(3)),
            VolumeChange::new(VolumeTarget::Sink(SinkId::new(102)), Volume::new(3)),
        ]),
        Err(RoutingError::NotPossible)
    );
}
