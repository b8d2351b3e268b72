//! Protocol FSM (spec.md §4.7): the handshake and session state machine.
//! Runs single-threaded on the control worker; every method here is
//! synchronous and side-effect-free beyond `&mut self`, so the thread that
//! owns the FSM stays the sole place transitions happen (spec.md §3:
//! "Transitions are triggered only by the dispatcher thread that owns the
//! FSM").

use std::collections::HashSet;
use std::time::Duration;

use log::{info, warn};

use crate::error::EngineError;
use crate::handlers::control::{negotiated_service_ids, ControlHandler, VideoServiceConfig};
use crate::message::{ChannelId, ControlMessageType, Frame, Message, FLAGS_HANDSHAKE};

/// spec.md §3: traversed monotonically, no state is ever re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    VersionRequested,
    VersionNegotiated,
    TlsHandshaking(u8),
    StatusSent,
    Discovering,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    /// Monotonic rank used to enforce Property 6 (spec.md §8): no
    /// transition may decrease this value, except `TlsHandshaking(n)`
    /// advancing its own round counter, which shares one rank.
    fn rank(self) -> u8 {
        match self {
            SessionState::Opened => 0,
            SessionState::VersionRequested => 1,
            SessionState::VersionNegotiated => 2,
            SessionState::TlsHandshaking(_) => 3,
            SessionState::StatusSent => 4,
            SessionState::Discovering => 5,
            SessionState::Streaming => 6,
            SessionState::Closing => 7,
            SessionState::Closed => 8,
        }
    }

    /// spec.md §6: "After 'Status OK' is sent, all subsequent Frames must
    /// have `flags & 0x08 = 1`" — i.e. from `StatusSent` onward.
    pub fn is_past_handshake(self) -> bool {
        self.rank() >= SessionState::StatusSent.rank()
    }
}

const MAX_VERSION_ATTEMPTS: u8 = 3;
const VERSION_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_TLS_ROUNDS: u8 = 10;
/// spec.md §4.7 "stabilisation" wait before any streaming traffic.
pub const DEFAULT_STABILISATION_DELAY: Duration = Duration::from_millis(500);
/// spec.md §5: no pong within this window tears the session down.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

pub enum RouteDecision {
    Audio,
    Video,
    MusicMetadata,
    Control,
    Unknown,
}

/// A reply the FSM wants sent; the caller (control worker) hands these to
/// the Outbox.
pub struct Reply {
    pub channel: ChannelId,
    pub msg_type: u16,
    pub body: Vec<u8>,
}

pub struct Fsm {
    state: SessionState,
    version: Option<(u8, u8)>,
    version_attempts: u8,
    control: ControlHandler,
    video_config: VideoServiceConfig,
    expected_channels: HashSet<u8>,
    opened_channels: HashSet<u8>,
    session_id: Option<u8>,
    night_mode_on: bool,
    bye_bye: bool,
}

impl Fsm {
    pub fn new(bluetooth_mac: String, video_config: VideoServiceConfig) -> Self {
        let expected: HashSet<u8> = negotiated_service_ids(&bluetooth_mac)
            .into_iter()
            .filter(|&id| id != ChannelId::CONTROL.0)
            .collect();
        Fsm {
            state: SessionState::Opened,
            version: None,
            version_attempts: 0,
            control: ControlHandler::new(bluetooth_mac),
            video_config,
            expected_channels: expected,
            opened_channels: HashSet::new(),
            session_id: None,
            night_mode_on: false,
            bye_bye: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, to: SessionState) {
        debug_assert!(
            to.rank() >= self.state.rank(),
            "FSM transition {:?} -> {:?} moves backwards",
            self.state,
            to
        );
        info!("fsm: {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    /// `Opened --connect()--> VersionRequested`. Up to 3 attempts with a
    /// 500 ms back-off are the caller's responsibility (via
    /// `retry_version_request`); this just produces the first frame.
    pub fn connect(&mut self) -> Frame {
        self.version_attempts = 1;
        self.transition(SessionState::VersionRequested);
        version_request_frame()
    }

    /// Called by the caller's timer when no version response has arrived.
    /// Returns `Some(frame)` to resend, or `None` once attempts are
    /// exhausted (the caller should then fail the session).
    pub fn retry_version_request(&mut self) -> Option<(Frame, Duration)> {
        if self.state != SessionState::VersionRequested || self.version_attempts >= MAX_VERSION_ATTEMPTS {
            return None;
        }
        self.version_attempts += 1;
        Some((version_request_frame(), VERSION_RETRY_BACKOFF))
    }

    /// `VersionRequested | bytes received, length >= 10 -> VersionNegotiated`.
    /// `frame` is the raw (header + payload) frame as produced by the
    /// Framer; major/minor sit at byte offsets 8/9 of the full frame
    /// (spec.md §4.7's table, offsets counted from the start of the wire
    /// bytes, not the payload).
    pub fn on_version_response(&mut self, frame: &Frame) -> Result<(), EngineError> {
        if self.state != SessionState::VersionRequested {
            warn!("fsm: version response in unexpected state {:?}", self.state);
            return Ok(());
        }
        let full_len = 4 + frame.payload.len();
        if full_len < 10 {
            return Err(EngineError::ProtocolError(
                "version response shorter than 10 bytes".into(),
            ));
        }
        let major = frame.payload[4];
        let minor = frame.payload[5];
        self.version = Some((major, minor));
        self.transition(SessionState::VersionNegotiated);
        self.transition(SessionState::TlsHandshaking(0));
        Ok(())
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        self.version
    }

    /// `TlsHandshaking(n)`: caller drives `TlsSession::handshake_read()`
    /// and reports the result here. Non-empty bytes mean another round is
    /// needed; empty means the handshake completed.
    pub fn on_handshake_round(&mut self, bytes: Vec<u8>) -> Result<HandshakeStep, EngineError> {
        let n = match self.state {
            SessionState::TlsHandshaking(n) => n,
            other => {
                warn!("fsm: handshake round reported in state {:?}", other);
                return Ok(HandshakeStep::Ignored);
            }
        };
        if !bytes.is_empty() {
            if n >= MAX_TLS_ROUNDS {
                self.transition(SessionState::Closing);
                return Err(EngineError::TlsHandshakeFailed(
                    "exceeded maximum handshake rounds".into(),
                ));
            }
            self.transition(SessionState::TlsHandshaking(n + 1));
            let mut payload = Vec::with_capacity(2 + bytes.len());
            payload.extend_from_slice(&3u16.to_be_bytes());
            payload.extend_from_slice(&bytes);
            return Ok(HandshakeStep::SendRound(Frame {
                channel: ChannelId::CONTROL,
                flags: FLAGS_HANDSHAKE,
                payload,
            }));
        }
        self.transition(SessionState::StatusSent);
        Ok(HandshakeStep::Complete)
    }

    /// `StatusSent | ServiceDiscoveryRequest -> Discovering`.
    pub fn on_service_discovery_request(&mut self) -> Result<Reply, EngineError> {
        if self.state != SessionState::StatusSent {
            return Err(EngineError::ProtocolError(format!(
                "ServiceDiscoveryRequest in state {:?}",
                self.state
            )));
        }
        self.transition(SessionState::Discovering);
        let response = self.control.service_discovery_response(self.video_config.clone());
        Ok(Reply {
            channel: ChannelId::CONTROL,
            msg_type: ControlMessageType::ServiceDiscoveryResponse as u16,
            body: response.encode(),
        })
    }

    /// `Discovering | ChannelOpenRequest -> Discovering` (or `Streaming`
    /// once every expected channel has been opened).
    pub fn on_channel_open_request(&mut self, channel_id: u8, session_id: u8) -> Result<Reply, EngineError> {
        if self.state != SessionState::Discovering {
            return Err(EngineError::ProtocolError(format!(
                "ChannelOpenRequest in state {:?}",
                self.state
            )));
        }
        self.session_id = Some(session_id);
        self.opened_channels.insert(channel_id);
        if self.opened_channels.is_superset(&self.expected_channels) {
            self.transition(SessionState::Streaming);
        }
        Ok(Reply {
            channel: ChannelId::CONTROL,
            msg_type: ControlMessageType::ChannelOpenResponse as u16,
            body: vec![0x00], // OK
        })
    }

    pub fn session_id(&self) -> Option<u8> {
        self.session_id
    }

    /// Streaming-state control messages: ping, audio/video focus, night
    /// mode, bye-bye. Returns `None` for bye-bye (no reply; caller should
    /// transition to Closing).
    pub fn on_streaming_control(&mut self, msg: &Message) -> Result<Option<Reply>, EngineError> {
        if self.state != SessionState::Streaming {
            return Err(EngineError::ProtocolError(format!(
                "control message in state {:?}",
                self.state
            )));
        }
        let Some(kind) = ControlMessageType::from_u16(msg.msg_type) else {
            warn!("fsm: unrecognized control type {} while streaming", msg.msg_type);
            return Ok(None);
        };
        match kind {
            ControlMessageType::PingRequest => Ok(Some(Reply {
                channel: ChannelId::CONTROL,
                msg_type: ControlMessageType::PingResponse as u16,
                body: msg.body.clone(), // echo timestamp
            })),
            ControlMessageType::AudioFocusRequest => Ok(Some(Reply {
                channel: ChannelId::CONTROL,
                msg_type: ControlMessageType::AudioFocusResponse as u16,
                body: vec![0x01], // granted
            })),
            ControlMessageType::VideoFocusRequest => Ok(Some(Reply {
                channel: ChannelId::CONTROL,
                msg_type: ControlMessageType::VideoFocusResponse as u16,
                body: vec![0x01, 0x00], // gain=true, unsolicited=false
            })),
            ControlMessageType::NightModeRequest => Ok(Some(Reply {
                channel: ChannelId::CONTROL,
                msg_type: ControlMessageType::NightModeResponse as u16,
                body: vec![self.night_mode_on as u8],
            })),
            ControlMessageType::ByeByeRequest => {
                self.bye_bye = true;
                self.transition(SessionState::Closing);
                Ok(None)
            }
            other => {
                warn!("fsm: unhandled control type {:?} while streaming", other);
                Ok(None)
            }
        }
    }

    pub fn set_night_mode(&mut self, on: bool) {
        self.night_mode_on = on;
    }

    /// spec.md §4.7's streaming routing table, independent of control
    /// handling above.
    pub fn route_streaming_message(&self, msg: &Message) -> RouteDecision {
        if msg.channel.is_audio() {
            return RouteDecision::Audio;
        }
        if msg.channel.is_video() {
            return RouteDecision::Video;
        }
        if msg.channel == ChannelId::MUSIC_PLAYBACK {
            return RouteDecision::MusicMetadata;
        }
        if Message::is_control_type(msg.msg_type) {
            return RouteDecision::Control;
        }
        RouteDecision::Unknown
    }

    /// `any | Transport error -> Closing`.
    pub fn on_transport_error(&mut self) {
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closing);
        }
    }

    /// `Closing | entry -> Closed`.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closing);
            self.transition(SessionState::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

pub enum HandshakeStep {
    SendRound(Frame),
    Complete,
    Ignored,
}

fn version_request_frame() -> Frame {
    Frame {
        channel: ChannelId::CONTROL,
        flags: FLAGS_HANDSHAKE,
        payload: vec![0x01, 0x00, 0x00, 0x07],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::control::{Margins, Resolution};

    fn default_video() -> VideoServiceConfig {
        VideoServiceConfig::negotiate(
            Resolution::W1280H720,
            false,
            0.0,
            Margins { top: 0, bottom: 0, left: 0, right: 0 },
            0,
        )
    }

    /// Scenario A (spec.md §8).
    #[test]
    fn scenario_a_version_negotiation() {
        let mut fsm = Fsm::new(String::new(), default_video());
        let _req = fsm.connect();
        assert_eq!(fsm.state(), SessionState::VersionRequested);

        let raw: Vec<u8> = vec![
            0x00, 0x03, 0x00, 0x08, 0x01, 0x01, 0x00, 0x07, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        let frame = Frame {
            channel: ChannelId::CONTROL,
            flags: FLAGS_HANDSHAKE,
            payload: raw[4..].to_vec(),
        };
        fsm.on_version_response(&frame).unwrap();
        assert_eq!(fsm.version(), Some((1, 1)));
        assert_eq!(fsm.state(), SessionState::TlsHandshaking(0));
    }

    /// Scenario B (spec.md §8): service-discovery response after the TLS
    /// handshake completes.
    #[test]
    fn scenario_b_service_discovery_response() {
        let mut fsm = Fsm::new(String::new(), default_video());
        fsm.connect();
        let frame = Frame {
            channel: ChannelId::CONTROL,
            flags: FLAGS_HANDSHAKE,
            payload: vec![0, 0, 0, 0, 1, 1, 0, 0, 0, 0],
        };
        fsm.on_version_response(&frame).unwrap();
        // drive a single empty handshake round to complete the handshake
        match fsm.on_handshake_round(Vec::new()).unwrap() {
            HandshakeStep::Complete => {}
            _ => panic!("expected handshake completion"),
        }
        assert_eq!(fsm.state(), SessionState::StatusSent);

        let reply = fsm.on_service_discovery_request().unwrap();
        assert_eq!(fsm.state(), SessionState::Discovering);
        assert_eq!(reply.msg_type, ControlMessageType::ServiceDiscoveryResponse as u16);
        let mut ids = reply.body[1..1 + reply.body[0] as usize].to_vec();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7, 9]);
        let dpi = u16::from_be_bytes([reply.body[reply.body.len() - 2], reply.body[reply.body.len() - 1]]);
        assert_eq!(dpi, 240);
    }

    /// Property 6 (spec.md §8): no transition moves backwards.
    #[test]
    fn property_state_monotonicity() {
        let mut fsm = Fsm::new(String::new(), default_video());
        let mut last_rank = fsm.state().rank();
        fsm.connect();
        assert!(fsm.state().rank() >= last_rank);
        last_rank = fsm.state().rank();

        let frame = Frame {
            channel: ChannelId::CONTROL,
            flags: FLAGS_HANDSHAKE,
            payload: vec![0, 0, 0, 0, 1, 1, 0, 0, 0, 0],
        };
        fsm.on_version_response(&frame).unwrap();
        assert!(fsm.state().rank() >= last_rank);
        last_rank = fsm.state().rank();

        fsm.on_handshake_round(vec![1, 2, 3]).unwrap();
        assert!(fsm.state().rank() >= last_rank);
        fsm.on_handshake_round(Vec::new()).unwrap();
        assert!(fsm.state().rank() >= last_rank);

        fsm.on_transport_error();
        assert_eq!(fsm.state(), SessionState::Closing);
        fsm.close();
        assert_eq!(fsm.state(), SessionState::Closed);
    }

    /// Property 7 (spec.md §8): a fresh `Fsm` after `connect()` carries no
    /// carryover state from a previous session.
    #[test]
    fn property_handshake_idempotence() {
        let mut fsm = Fsm::new(String::new(), default_video());
        fsm.connect();
        let frame = Frame {
            channel: ChannelId::CONTROL,
            flags: FLAGS_HANDSHAKE,
            payload: vec![0, 0, 0, 0, 1, 1, 0, 0, 0, 0],
        };
        fsm.on_version_response(&frame).unwrap();
        fsm.on_transport_error();
        fsm.close();
        assert!(fsm.is_closed());

        let fresh = Fsm::new(String::new(), default_video());
        assert_eq!(fresh.state(), SessionState::Opened);
        assert_eq!(fresh.version(), None);
    }

    /// Scenario G (spec.md §8): after Streaming, a transport error closes
    /// the session.
    #[test]
    fn scenario_g_transport_error_closes_session() {
        let mut fsm = Fsm::new(String::new(), default_video());
        fsm.connect();
        let frame = Frame {
            channel: ChannelId::CONTROL,
            flags: FLAGS_HANDSHAKE,
            payload: vec![0, 0, 0, 0, 1, 1, 0, 0, 0, 0],
        };
        fsm.on_version_response(&frame).unwrap();
        fsm.on_handshake_round(Vec::new()).unwrap();
        fsm.on_service_discovery_request().unwrap();
        for &id in &[1u8, 2, 3, 4, 5, 6, 7, 9] {
            fsm.on_channel_open_request(id, 1).unwrap();
        }
        assert_eq!(fsm.state(), SessionState::Streaming);

        fsm.on_transport_error();
        fsm.close();
        assert_eq!(fsm.state(), SessionState::Closed);
    }
}
