//! Wire-level types: channel ids, frame flags and the frame/message structs
//! that flow between the Framer, TlsSession and Dispatcher.

use std::fmt;

/// `flags` bit-mask (spec.md §3). Bit values are load-bearing: they must
/// match what a real peer sends, not an arbitrary internal numbering.
pub const FLAG_CONTROL: u8 = 0x01;
pub const FLAG_LAST_FRAGMENT: u8 = 0x02;
pub const FLAG_FIRST_FRAGMENT: u8 = 0x04;
pub const FLAG_ENCRYPTED: u8 = 0x08;

/// The seven well-known byte values the source combines these bits into.
pub const FLAGS_ENCRYPTED_COMPLETE: u8 =
    FLAG_ENCRYPTED | FLAG_FIRST_FRAGMENT | FLAG_LAST_FRAGMENT | FLAG_CONTROL; // 0x0B
pub const FLAGS_ENCRYPTED_FIRST: u8 = FLAG_ENCRYPTED | FLAG_FIRST_FRAGMENT; // 0x09
pub const FLAGS_ENCRYPTED_LAST: u8 = FLAG_ENCRYPTED | FLAG_LAST_FRAGMENT; // 0x0A
pub const FLAGS_ENCRYPTED_MIDDLE: u8 = FLAG_ENCRYPTED; // 0x08
pub const FLAGS_HANDSHAKE: u8 = FLAG_FIRST_FRAGMENT | FLAG_LAST_FRAGMENT; // 0x03
pub const FLAGS_CONTROL_COMPLETE: u8 = FLAG_FIRST_FRAGMENT | FLAG_LAST_FRAGMENT | FLAG_CONTROL; // 0x07

/// Logical stream identifying a channel, per spec.md §3's channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub const CONTROL: ChannelId = ChannelId(0);
    pub const SENSOR: ChannelId = ChannelId(1);
    pub const VIDEO: ChannelId = ChannelId(2);
    pub const INPUT: ChannelId = ChannelId(3);
    pub const AUDIO_SPEECH: ChannelId = ChannelId(4);
    pub const AUDIO_SYSTEM: ChannelId = ChannelId(5);
    pub const AUDIO_MEDIA: ChannelId = ChannelId(6);
    pub const MIC: ChannelId = ChannelId(7);
    pub const BLUETOOTH: ChannelId = ChannelId(8);
    pub const MUSIC_PLAYBACK: ChannelId = ChannelId(9);
    pub const NAVIGATION: ChannelId = ChannelId(10);
    pub const NOTIFICATION: ChannelId = ChannelId(11);
    pub const PHONE: ChannelId = ChannelId(12);

    pub fn is_audio(self) -> bool {
        matches!(
            self,
            ChannelId::AUDIO_SPEECH | ChannelId::AUDIO_SYSTEM | ChannelId::AUDIO_MEDIA
        )
    }

    pub fn is_video(self) -> bool {
        self == ChannelId::VIDEO
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// A decoded-but-still-possibly-encrypted frame as produced by the Framer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel: ChannelId,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_first_fragment(&self) -> bool {
        self.flags & FLAG_FIRST_FRAGMENT != 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.flags & FLAG_LAST_FRAGMENT != 0
    }
}

/// A decrypted, application-level message: the first two payload bytes are
/// the big-endian message type, the rest is the opaque (protobuf-shaped,
/// but here untyped) body.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: ChannelId,
    pub flags: u8,
    pub msg_type: u16,
    pub body: Vec<u8>,
}

impl Message {
    /// Parses `{type: u16_be, body}` out of a decrypted frame payload.
    /// Returns `None` if the payload is too short to carry a type.
    pub fn from_frame(frame: &Frame) -> Option<Message> {
        if frame.payload.len() < 2 {
            return None;
        }
        let msg_type = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        Some(Message {
            channel: frame.channel,
            flags: frame.flags,
            msg_type,
            body: frame.payload[2..].to_vec(),
        })
    }

    /// Serializes back into a `{type, body}` payload suitable for framing.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.body.len());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// True for the reserved control-message-type ranges (spec.md §3).
    pub fn is_control_type(msg_type: u16) -> bool {
        (0..=31).contains(&msg_type)
            || (32768..=32799).contains(&msg_type)
            || (65504..=65535).contains(&msg_type)
    }
}

/// Well-known control message type codes. spec.md leaves the exact numbering
/// as an opaque-but-enumerable set; this is this crate's internal numbering
/// (see SPEC_FULL.md §9), not a wire requirement beyond "a consistent u16".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlMessageType {
    AuthComplete = 2,
    ServiceDiscoveryRequest = 3,
    ServiceDiscoveryResponse = 4,
    ChannelOpenRequest = 7,
    ChannelOpenResponse = 8,
    AudioFocusRequest = 9,
    AudioFocusResponse = 10,
    PingRequest = 11,
    PingResponse = 12,
    NavFocusRequest = 13,
    NavFocusResponse = 14,
    ByeByeRequest = 15,
    ByeByeResponse = 16,
    VideoFocusRequest = 17,
    VideoFocusResponse = 18,
    NightModeRequest = 19,
    NightModeResponse = 20,
}

impl ControlMessageType {
    pub fn from_u16(v: u16) -> Option<Self> {
        use ControlMessageType::*;
        Some(match v {
            2 => AuthComplete,
            3 => ServiceDiscoveryRequest,
            4 => ServiceDiscoveryResponse,
            7 => ChannelOpenRequest,
            8 => ChannelOpenResponse,
            9 => AudioFocusRequest,
            10 => AudioFocusResponse,
            11 => PingRequest,
            12 => PingResponse,
            13 => NavFocusRequest,
            14 => NavFocusResponse,
            15 => ByeByeRequest,
            16 => ByeByeResponse,
            17 => VideoFocusRequest,
            18 => VideoFocusResponse,
            19 => NightModeRequest,
            20 => NightModeResponse,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrips_through_payload() {
        let frame = Frame {
            channel: ChannelId::CONTROL,
            flags: FLAGS_ENCRYPTED_COMPLETE,
            payload: vec![0x00, 0x03, 1, 2, 3],
        };
        let msg = Message::from_frame(&frame).unwrap();
        assert_eq!(msg.msg_type, 3);
        assert_eq!(msg.body, vec![1, 2, 3]);
        assert_eq!(msg.to_payload(), frame.payload);
    }

    #[test]
    fn control_type_ranges() {
        assert!(Message::is_control_type(0));
        assert!(Message::is_control_type(31));
        assert!(!Message::is_control_type(32));
        assert!(Message::is_control_type(32768));
        assert!(Message::is_control_type(32799));
        assert!(Message::is_control_type(65504));
        assert!(Message::is_control_type(65535));
        assert!(!Message::is_control_type(1000));
    }

    #[test]
    fn flag_constants_match_spec_bytes() {
        assert_eq!(FLAGS_ENCRYPTED_COMPLETE, 0x0B);
        assert_eq!(FLAGS_ENCRYPTED_FIRST, 0x09);
        assert_eq!(FLAGS_ENCRYPTED_LAST, 0x0A);
        assert_eq!(FLAGS_ENCRYPTED_MIDDLE, 0x08);
        assert_eq!(FLAGS_HANDSHAKE, 0x03);
        assert_eq!(FLAGS_CONTROL_COMPLETE, 0x07);
    }
}
