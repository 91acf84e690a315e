//! End-to-end tests driving a real daemon with simulated threaded domains
//!
//! Adapters run their requests on worker threads and report back through
//! the routing mailbox; the tests turn the event loop on the test thread.

use crossover_core::domain::{
    ConnectionFormat, ConnectionState, DomainId, RampType, RoutingError, Sink, SinkId, Source,
    SourceId, TopologyStore, Volume,
};
use crossover_infra::Daemon;
use crossover_tests::{drive_until, fast_config, Recorder};
use std::thread;
use std::time::Duration;

const A2DP: SourceId = SourceId::new(3);
const TUNER: SourceId = SourceId::new(1);
const MEDIA_PLAYER: SourceId = SourceId::new(2);
const AMPLIFIER: SinkId = SinkId::new(1);
const PATIENCE: Duration = Duration::from_secs(5);

// ============================================================================
// MAIN CONNECTIONS
// ============================================================================

#[test]
fn test_main_connection_round_trip() {
    let recorder = Recorder::new();
    let config = fast_config();
    let mut daemon = Daemon::new(&config, recorder.boxed()).unwrap();
    let dispatcher = daemon.dispatcher();

    let main = dispatcher.borrow_mut().connect_main(A2DP, AMPLIFIER).unwrap();
    let hop_delay = config.simulation.connect_latency_ms as i16;

    let established = drive_until(&mut daemon, PATIENCE, || {
        dispatcher
            .borrow()
            .store()
            .main_connection(main)
            .is_some_and(|m| m.state == ConnectionState::Connected && m.delay.is_some())
    });
    assert!(established);
    {
        let dispatcher = dispatcher.borrow();
        let record = dispatcher.store().main_connection(main).unwrap();
        assert_eq!(record.source_id, A2DP);
        assert_eq!(record.sink_id, AMPLIFIER);
        assert_eq!(record.connections.len(), 2);
        assert_eq!(record.delay, Some(2 * hop_delay));
        assert!(dispatcher.store().connections().iter().all(|c| !c.pending));
    }

    dispatcher.borrow_mut().disconnect_main(main).unwrap();
    let removed = drive_until(&mut daemon, PATIENCE, || {
        let dispatcher = dispatcher.borrow();
        dispatcher.store().main_connection(main).is_none()
            && dispatcher.store().connections().is_empty()
    });
    assert!(removed);

    let states: Vec<ConnectionState> = recorder.0.borrow().mains.iter().map(|(_, s)| *s).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
    assert_eq!(recorder.0.borrow().completions.len(), 4);
}

#[test]
fn test_busy_gateway_is_skipped_for_second_main_connection() {
    let config = fast_config();
    let mut daemon = Daemon::new(&config, Recorder::new().boxed()).unwrap();
    let dispatcher = daemon.dispatcher();

    let main = dispatcher.borrow_mut().connect_main(A2DP, AMPLIFIER).unwrap();
    assert!(drive_until(&mut daemon, PATIENCE, || {
        dispatcher
            .borrow()
            .store()
            .main_connection(main)
            .is_some_and(|m| m.state == ConnectionState::Connected)
    }));

    // The only bridge out of the Bluetooth domain is now in use
    assert_eq!(
        dispatcher.borrow_mut().connect_main(A2DP, SinkId::new(2)),
        Err(RoutingError::NotPossible)
    );
}

// ============================================================================
// HANDLE POOL
// ============================================================================

#[test]
fn test_pool_admits_ten_concurrent_connects() {
    let recorder = Recorder::new();
    let mut daemon = Daemon::new(&fast_config(), recorder.boxed()).unwrap();
    let dispatcher = daemon.dispatcher();

    let sources: Vec<SourceId> = (0..11)
        .map(|i| {
            let id = SourceId::new(300 + i);
            dispatcher
                .borrow_mut()
                .store_mut()
                .add_source(Source::new(
                    id,
                    DomainId::new(1),
                    format!("aux{i}"),
                    vec![ConnectionFormat::Stereo],
                ))
                .unwrap();
            id
        })
        .collect();

    let mut issued = Vec::new();
    for source in &sources[..10] {
        issued.push(
            dispatcher
                .borrow_mut()
                .connect(*source, AMPLIFIER, ConnectionFormat::Stereo)
                .unwrap(),
        );
    }
    assert_eq!(
        dispatcher
            .borrow_mut()
            .connect(sources[10], AMPLIFIER, ConnectionFormat::Stereo),
        Err(RoutingError::NotPossible)
    );

    assert!(drive_until(&mut daemon, PATIENCE, || {
        recorder.0.borrow().completions.len() == 10
    }));
    let record = recorder.0.borrow();
    for (handle, connection) in &issued {
        let completion = record.completion(*handle).unwrap();
        assert_eq!(completion.result, Ok(()));
        assert!(!dispatcher
            .borrow()
            .store()
            .connection(*connection)
            .unwrap()
            .pending);
    }
    drop(record);

    assert!(dispatcher
        .borrow_mut()
        .connect(sources[10], AMPLIFIER, ConnectionFormat::Stereo)
        .is_ok());
}

// ============================================================================
// ABORT / TIMEOUT
// ============================================================================

#[test]
fn test_abort_before_ack() {
    let recorder = Recorder::new();
    let mut config = fast_config();
    config.simulation.connect_latency_ms = 2_000;
    let mut daemon = Daemon::new(&config, recorder.boxed()).unwrap();
    let dispatcher = daemon.dispatcher();

    let (handle, connection) = dispatcher
        .borrow_mut()
        .connect(TUNER, AMPLIFIER, ConnectionFormat::Stereo)
        .unwrap();
    dispatcher.borrow_mut().abort(handle).unwrap();

    assert!(drive_until(&mut daemon, PATIENCE, || {
        recorder.0.borrow().completion(handle).is_some()
    }));
    assert_eq!(
        recorder.0.borrow().completion(handle).unwrap().result,
        Err(RoutingError::Aborted)
    );
    assert!(dispatcher.borrow().store().connection(connection).is_none());
    assert_eq!(
        dispatcher.borrow_mut().abort(handle),
        Err(RoutingError::NonExistent)
    );
}

#[test]
fn test_overdue_action_times_out_once() {
    let recorder = Recorder::new();
    let mut config = fast_config();
    config.simulation.connect_latency_ms = 400;
    config.dispatcher.action_timeout_ms = 30;
    let mut daemon = Daemon::new(&config, recorder.boxed()).unwrap();
    let dispatcher = daemon.dispatcher();

    let (handle, connection) = dispatcher
        .borrow_mut()
        .connect(TUNER, AMPLIFIER, ConnectionFormat::Stereo)
        .unwrap();
    assert!(drive_until(&mut daemon, PATIENCE, || {
        recorder.0.borrow().completion(handle).is_some()
    }));
    assert_eq!(
        recorder.0.borrow().completion(handle).unwrap().result,
        Err(RoutingError::Timeout)
    );
    assert!(dispatcher.borrow().store().connection(connection).is_none());

    // The cancelled worker's late acknowledgement must not produce a second report
    drive_until(&mut daemon, Duration::from_millis(100), || false);
    assert_eq!(recorder.0.borrow().completions_for(handle), 1);
}

// ============================================================================
// VOLUME RAMPS
// ============================================================================

#[test]
fn test_direct_ramp_ticks_then_acks() {
    let recorder = Recorder::new();
    let mut daemon = Daemon::new(&fast_config(), recorder.boxed()).unwrap();
    let dispatcher = daemon.dispatcher();

    let handle = dispatcher
        .borrow_mut()
        .set_sink_volume(
            AMPLIFIER,
            Volume::new(16),
            RampType::Direct,
            Duration::from_millis(30),
        )
        .unwrap();
    assert!(drive_until(&mut daemon, PATIENCE, || {
        recorder.0.borrow().completion(handle).is_some()
    }));

    let record = recorder.0.borrow();
    let ticks: Vec<i16> = record.ticks.iter().map(|(_, _, v)| v.get()).collect();
    assert_eq!(ticks, vec![11, 12, 13, 14, 15, 16]);
    assert_eq!(record.completion(handle).unwrap().result, Ok(()));
    assert_eq!(
        dispatcher.borrow().store().sink(AMPLIFIER).unwrap().volume,
        Volume::new(16)
    );
}

#[test]
fn test_no_change_volume_is_rejected_synchronously() {
    let daemon = Daemon::new(&fast_config(), Recorder::new().boxed()).unwrap();
    let dispatcher = daemon.dispatcher();
    assert_eq!(
        dispatcher.borrow_mut().set_sink_volume(
            AMPLIFIER,
            Volume::new(10),
            RampType::Direct,
            Duration::from_millis(30)
        ),
        Err(RoutingError::NoChange)
    );
    assert!(dispatcher.borrow().list_handles().is_empty());
}

// ============================================================================
// CONTROL FROM OTHER THREADS
// ============================================================================

#[test]
fn test_control_handle_drives_running_daemon() {
    let mut daemon = Daemon::new(&fast_config(), Recorder::new().boxed()).unwrap();
    let control = daemon.control_handle();

    let client = thread::spawn(move || {
        let main = control.connect(A2DP, AMPLIFIER).unwrap();
        let mut connected = false;
        for _ in 0..500 {
            let mains = control.main_connections().unwrap();
            if mains
                .iter()
                .any(|m| m.id == main && m.state == ConnectionState::Connected)
            {
                connected = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let routes = control.find_routes(MEDIA_PLAYER, AMPLIFIER, true).unwrap();
        control.shutdown().unwrap();
        (connected, routes.len())
    });

    daemon.run().unwrap();
    let (connected, routes) = client.join().unwrap();
    assert!(connected);
    assert_eq!(routes, 1);
}

#[test]
fn test_sink_added_at_runtime_is_connectable() {
    let mut daemon = Daemon::new(&fast_config(), Recorder::new().boxed()).unwrap();
    let dispatcher = daemon.dispatcher();
    dispatcher
        .borrow_mut()
        .store_mut()
        .add_sink(Sink::new(
            SinkId::new(60),
            DomainId::new(2),
            "bt_headset",
            vec![ConnectionFormat::Mono],
        ))
        .unwrap();

    let (handle, _) = dispatcher
        .borrow_mut()
        .connect(A2DP, SinkId::new(60), ConnectionFormat::Mono)
        .unwrap();
    let completed = drive_until(&mut daemon, PATIENCE, || {
        dispatcher.borrow().list_handles().is_empty()
    });
    assert!(completed);
    assert!(!dispatcher.borrow().list_handles().contains(&handle));
}
