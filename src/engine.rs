//! Top-level orchestration (spec.md §5): wires Transport, RingBuffer,
//! Framer, TlsSession, Dispatcher, the Protocol FSM, channel handlers and
//! the Outbox together across the six thread roles spec.md §5 names.

use log::{error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::event::{DropStats, EngineEvent, EventSink};
use crate::framer::Framer;
use crate::fsm::{Fsm, HandshakeStep, RouteDecision, SessionState};
use crate::handlers::control::VideoServiceConfig;
use crate::handlers::input::InputHandler;
use crate::handlers::sensors::SensorHandler;
use crate::interfaces::{AudioSink, NullAudioSink, NullVideoSink, VideoDecoderSink};
use crate::message::{ChannelId, ControlMessageType, Frame, Message, FLAGS_ENCRYPTED_COMPLETE, FLAG_ENCRYPTED};
use crate::outbox::Outbox;
use crate::reassembler::Reassembler;
use crate::ring_buffer;
use crate::tls::{PeerVerification, TlsConfig, TlsSession};
use crate::transport::Transport;

type SharedOutbox = Arc<Outbox<Box<dyn Fn(&[u8]) -> Result<(), EngineError> + Send + Sync>>>;

/// Per-session mutable state shared between the Parser and Control-worker
/// threads, each guarded by its own narrow mutex (spec.md §9's "narrow
/// mutexes around each invariant group").
struct EngineContext {
    fsm: Mutex<Fsm>,
    tls: Arc<Mutex<TlsSession>>,
    reassembler: Reassembler,
    sensors: Mutex<SensorHandler>,
    input: Mutex<InputHandler>,
    video_sink: Mutex<Box<dyn VideoDecoderSink>>,
    audio_sinks: Mutex<Vec<Box<dyn AudioSink>>>,
    outbox: SharedOutbox,
    events: EventSink,
}

pub struct Engine {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    /// Builds and starts every worker thread for one session. Blocks the
    /// caller only long enough to perform the initial transport open; the
    /// protocol runs on the spawned threads until `stop()` or the FSM
    /// reaches `Closed`.
    pub fn start(
        config: &EngineConfig,
        transport: Box<dyn Transport>,
        events: EventSink,
    ) -> Result<Engine, EngineError> {
        let cert = std::fs::read(&config.pinned_certificate_chain_path)
            .map_err(|e| EngineError::Config(format!("certificate chain: {}", e)))
            .unwrap_or_default();
        let key = std::fs::read(&config.pinned_private_key_path)
            .map_err(|e| EngineError::Config(format!("private key: {}", e)))
            .unwrap_or_default();

        let video_config = VideoServiceConfig::negotiate(
            config.resolution(),
            config.preserve_aspect_ratio,
            0.0,
            crate::handlers::control::Margins {
                top: config.user_margins.top,
                bottom: config.user_margins.bottom,
                left: config.user_margins.left,
                right: config.user_margins.right,
            },
            config.manual_dpi,
        );
        let fsm = Fsm::new(config.bluetooth_mac.clone(), video_config);

        let tls_config = TlsConfig {
            certificate_chain_pem: cert,
            private_key_pem: key,
            peer_verification: PeerVerification::AcceptAny,
        };
        // One TlsSession shared between the Outbox's wrap path and the
        // Parser's unwrap/handshake path, serialized by its own mutex
        // (spec.md §5) — never construct a second one.
        let tls = Arc::new(Mutex::new(TlsSession::prepare(&tls_config)?));

        let (producer, consumer) = ring_buffer::channel(ring_buffer::DEFAULT_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        // Split into independent reader/writer halves (spec.md §5's writer
        // mutex covers writes only): the Transport I/O thread owns the
        // reader outright, and the writer gets its own lock shared with the
        // Outbox, so a write is never stalled behind a blocking read.
        let (mut transport_reader, transport_writer) = transport
            .split()
            .map_err(|e| EngineError::TransportIo(std::io::Error::other(e.to_string())))?;
        let transport_writer = Mutex::new(transport_writer);
        let writer: Box<dyn Fn(&[u8]) -> Result<(), EngineError> + Send + Sync> =
            Box::new(move |bytes: &[u8]| {
                transport_writer
                    .lock()
                    .unwrap()
                    .write_all(bytes)
                    .map_err(|e| EngineError::TransportIo(std::io::Error::other(e.to_string())))
            });
        let outbox: SharedOutbox = Arc::new(Outbox::new(tls.clone(), writer));

        let ctx = Arc::new(EngineContext {
            fsm: Mutex::new(fsm),
            tls,
            reassembler: Reassembler::new(),
            sensors: Mutex::new(SensorHandler::new(config.enabled_sensors())),
            input: Mutex::new(InputHandler::new(
                config.key_map.clone(),
                config.resolution().dims().0,
                config.resolution().dims().1,
                config.resolution().dims().0,
                config.resolution().dims().1,
            )),
            video_sink: Mutex::new(Box::new(NullVideoSink::new())),
            audio_sinks: Mutex::new(vec![Box::new(NullAudioSink), Box::new(NullAudioSink), Box::new(NullAudioSink)]),
            outbox: outbox.clone(),
            events,
        });

        let dispatcher = Arc::new(Dispatcher::new());
        let dispatcher_for_threads = dispatcher.clone();
        let ctx_audio = ctx.clone();
        let ctx_video = ctx.clone();
        let ctx_control = ctx.clone();
        dispatcher.start(
            Box::new(move |channel, payload| handle_audio(&ctx_audio, channel, payload)),
            Box::new(move |channel, payload| handle_video(&ctx_video, channel, payload)),
            Box::new(move |channel, payload| handle_control(&ctx_control, channel, payload)),
        );

        // Kick off the handshake: send the version request directly (it's
        // the one pre-TLS message the Outbox carries verbatim).
        {
            let mut fsm = ctx.fsm.lock().unwrap();
            let frame = fsm.connect();
            outbox.send_raw(frame.channel, frame.flags, frame.payload)?;
        }

        let parser_ctx = ctx.clone();
        let parser_shutdown = shutdown.clone();
        let parser_handle = std::thread::Builder::new()
            .name("aap-parser".to_string())
            .spawn(move || parser_loop(parser_ctx, consumer, dispatcher_for_threads, parser_shutdown))
            .expect("failed to spawn parser thread");

        let transport_shutdown = shutdown.clone();
        let error_ctx = ctx.clone();
        let read_handle = std::thread::Builder::new()
            .name("aap-transport-io".to_string())
            .spawn(move || {
                while !transport_shutdown.load(Ordering::SeqCst) {
                    let result = transport_reader.read_into(&producer);
                    if let Err(e) = result {
                        error!("engine: transport read error: {}", e);
                        error_ctx.fsm.lock().unwrap().on_transport_error();
                        error_ctx
                            .events
                            .emit(EngineEvent::Disconnected { reason: e.to_string() });
                        return;
                    }
                }
            })
            .expect("failed to spawn transport read-loop thread");

        Ok(Engine {
            shutdown,
            threads: vec![parser_handle, read_handle],
            dispatcher,
        })
    }

    /// spec.md §4.7's `Closing` entry side effect: stop the dispatcher
    /// (joining its three worker threads), close the transport, and flush
    /// queues. Sets the shutdown flag for the parser/transport threads,
    /// joins everything with a 1s deadline.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.dispatcher.stop();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = tx.send(());
            });
            if rx.recv_timeout(Duration::from_secs(1)).is_err() {
                warn!("engine: thread '{}' did not join within 1s deadline, leaking", name);
            }
        }
    }
}

fn parser_loop(
    ctx: Arc<EngineContext>,
    consumer: ring_buffer::Consumer,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<AtomicBool>,
) {
    let mut framer = Framer::new();
    while !shutdown.load(Ordering::SeqCst) {
        framer.set_past_handshake(ctx.fsm.lock().unwrap().state().is_past_handshake());
        let result = framer.drain(&consumer, |frame| {
            if let Err(e) = handle_frame(&ctx, &dispatcher, frame) {
                warn!("engine: frame handling error: {}", e);
            }
        });
        if let Err(e) = result {
            error!("engine: framer resync exhausted: {}", e);
            ctx.fsm.lock().unwrap().on_transport_error();
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn handle_frame(ctx: &Arc<EngineContext>, dispatcher: &Arc<Dispatcher>, frame: Frame) -> Result<(), EngineError> {
    let state = ctx.fsm.lock().unwrap().state();
    match state {
        SessionState::VersionRequested => {
            let mut fsm = ctx.fsm.lock().unwrap();
            fsm.on_version_response(&frame)?;
            drop(fsm);
            drive_handshake(ctx)?;
        }
        SessionState::TlsHandshaking(_) => {
            if frame.payload.len() < 2 {
                return Err(EngineError::FramingError("handshake frame too short".into()));
            }
            let tls_bytes = &frame.payload[2..];
            ctx.tls.lock().unwrap().handshake_write(tls_bytes)?;
            drive_handshake(ctx)?;
        }
        _ => {
            if frame.flags & FLAG_ENCRYPTED == 0 {
                return Err(EngineError::ProtocolError(
                    "unencrypted frame after handshake".into(),
                ));
            }
            let plaintext = ctx.tls.lock().unwrap().decrypt(&frame.payload)?;
            if plaintext.is_empty() {
                return Ok(());
            }
            dispatcher.dispatch(frame.channel, plaintext);
        }
    }
    Ok(())
}

fn drive_handshake(ctx: &Arc<EngineContext>) -> Result<(), EngineError> {
    loop {
        let bytes = ctx.tls.lock().unwrap().handshake_read()?;
        let mut fsm = ctx.fsm.lock().unwrap();
        match fsm.on_handshake_round(bytes)? {
            HandshakeStep::SendRound(frame) => {
                drop(fsm);
                ctx.outbox.send_raw(frame.channel, frame.flags, frame.payload)?;
            }
            HandshakeStep::Complete => {
                drop(fsm);
                ctx.outbox.send(ChannelId::CONTROL, 4, vec![0x08, 0x00])?;
                ctx.outbox.flush()?;
                return Ok(());
            }
            HandshakeStep::Ignored => return Ok(()),
        }
    }
}

fn handle_audio(ctx: &Arc<EngineContext>, channel: ChannelId, payload: Vec<u8>) {
    let frame = Frame {
        channel,
        flags: FLAGS_ENCRYPTED_COMPLETE,
        payload,
    };
    let Some(msg) = Message::from_frame(&frame) else { return };
    let idx = match channel {
        ChannelId::AUDIO_SPEECH => 0,
        ChannelId::AUDIO_SYSTEM => 1,
        _ => 2,
    };
    if let Some(sink) = ctx.audio_sinks.lock().unwrap().get_mut(idx) {
        sink.write(&msg.body);
    }
    if let Some(session_id) = ctx.fsm.lock().unwrap().session_id() {
        let _ = ctx.outbox.send(channel, media_ack_type(), vec![session_id]);
    }
}

fn handle_video(ctx: &Arc<EngineContext>, channel: ChannelId, payload: Vec<u8>) {
    let frame = Frame {
        channel,
        flags: FLAGS_ENCRYPTED_COMPLETE,
        payload,
    };
    let Some(msg) = Message::from_frame(&frame) else { return };
    if let Some(reassembled) = ctx.reassembler.feed(&msg) {
        let mut sink = ctx.video_sink.lock().unwrap();
        if let Some((sps, pps)) = ctx.reassembler.take_injection_once_ready(sink.ready()) {
            sink.offer(&sps);
            sink.offer(&pps);
        }
        sink.offer(&reassembled.bytes);
    }
    if let Some(session_id) = ctx.fsm.lock().unwrap().session_id() {
        let _ = ctx.outbox.send(channel, media_ack_type(), vec![session_id]);
    }
}

fn handle_control(ctx: &Arc<EngineContext>, channel: ChannelId, payload: Vec<u8>) {
    let frame = Frame {
        channel,
        flags: FLAGS_ENCRYPTED_COMPLETE,
        payload,
    };
    let Some(msg) = Message::from_frame(&frame) else { return };

    if channel == ChannelId::SENSOR {
        let sensors = ctx.sensors.lock().unwrap();
        let _ = sensors.filter_update(msg.msg_type, msg.body.clone());
        return;
    }
    if channel == ChannelId::MUSIC_PLAYBACK {
        return; // metadata handler: out of scope beyond routing, logged at trace.
    }
    if channel != ChannelId::CONTROL {
        return;
    }

    let state = ctx.fsm.lock().unwrap().state();
    let result: Result<(), EngineError> = (|| {
        match state {
            SessionState::StatusSent => {
                if msg.msg_type == ControlMessageType::ServiceDiscoveryRequest as u16 {
                    let reply = ctx.fsm.lock().unwrap().on_service_discovery_request()?;
                    ctx.outbox.send(reply.channel, reply.msg_type, reply.body)?;
                }
            }
            SessionState::Discovering => {
                if msg.msg_type == ControlMessageType::ChannelOpenRequest as u16 && msg.body.len() >= 2 {
                    let reply = ctx
                        .fsm
                        .lock()
                        .unwrap()
                        .on_channel_open_request(msg.body[0], msg.body[1])?;
                    ctx.outbox.send(reply.channel, reply.msg_type, reply.body)?;
                }
            }
            SessionState::Streaming => {
                let route = ctx.fsm.lock().unwrap().route_streaming_message(&msg);
                if matches!(route, RouteDecision::Control) {
                    if let Some(reply) = ctx.fsm.lock().unwrap().on_streaming_control(&msg)? {
                        ctx.outbox.send(reply.channel, reply.msg_type, reply.body)?;
                    } else if msg.msg_type == ControlMessageType::ByeByeRequest as u16 {
                        ctx.events.emit(EngineEvent::Disconnected {
                            reason: "peer sent ByeBye".into(),
                        });
                    }
                }
            }
            _ => {
                warn!("engine: control message in unexpected state {:?}", state);
            }
        }
        Ok(())
    })();
    if let Err(e) = result {
        warn!("engine: control handler error: {}", e);
    }
}

fn media_ack_type() -> u16 {
    // internal numbering (spec.md §9 open question): MediaAck sits outside
    // the named ControlMessageType set, chosen from the unused low range.
    1
}

pub fn drop_stats(dispatcher: &Dispatcher) -> DropStats {
    DropStats {
        audio_drops: dispatcher.audio_drops(),
        video_drops: dispatcher.video_drops(),
        control_drops: dispatcher.control_drops(),
    }
}
