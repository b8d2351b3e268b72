//! End-to-end scenario tests driving the public crate surface rather than
//! a single module. Scenarios A, B, D, E are already exercised as unit
//! tests alongside the FSM/Reassembler; this file covers C and G, which
//! need multiple components wired together.

use aa_headunit_rs::config::EngineConfig;
use aa_headunit_rs::dispatcher::Dispatcher;
use aa_headunit_rs::engine::Engine;
use aa_headunit_rs::event::{EngineEvent, EventSink};
use aa_headunit_rs::message::ChannelId;
use aa_headunit_rs::transport::testing::LoopbackTransport;

use std::io::Cursor;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Scenario C: three audio frames arrive while the control handler is busy
/// elsewhere; all three reach the sink within 50ms and no drops occur.
#[test]
fn scenario_c_audio_frames_reach_sink_without_drops() {
    let dispatcher = Dispatcher::new();
    let (tx, rx) = mpsc::channel();
    dispatcher.start(
        Box::new(move |_ch, payload| {
            let _ = tx.send(payload);
        }),
        Box::new(|_, _| {}),
        Box::new(|_, _| {}),
    );

    let started = Instant::now();
    for i in 0..3u8 {
        dispatcher.dispatch(ChannelId::AUDIO_MEDIA, vec![i; 128]);
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv_timeout(Duration::from_millis(50)).expect("audio payload within 50ms"));
    }
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(received.len(), 3);
    assert_eq!(dispatcher.audio_drops(), 0);

    dispatcher.stop();
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pinned_certificate_chain_path = "tests/fixtures/test_cert.pem".into();
    config.pinned_private_key_path = "tests/fixtures/test_key.pem".into();
    config
}

/// Scenario G: once the transport reports the peer gone, the FSM closes the
/// session and the engine's worker threads join within their deadlines.
#[test]
fn scenario_g_peer_gone_shuts_engine_down_cleanly() {
    let transport = LoopbackTransport {
        inbound: Cursor::new(Vec::new()), // immediate EOF on first read
        outbound: Arc::new(Mutex::new(Vec::new())),
    };
    let (tx, rx) = mpsc::channel();
    let events = EventSink::new(tx);

    let engine = Engine::start(&test_config(), Box::new(transport), events).expect("engine starts");

    let disconnected = rx.recv_timeout(Duration::from_secs(2)).expect("disconnect event");
    assert!(matches!(disconnected, EngineEvent::Disconnected { .. }));

    let stopped_at = Instant::now();
    engine.stop();
    assert!(stopped_at.elapsed() < Duration::from_secs(3), "engine.stop() should respect its join deadlines");
}
