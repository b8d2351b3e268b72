//! Video-channel fragment reassembler with SPS/PPS caching (spec.md §4.6).

use log::{debug, warn};
use std::sync::Mutex;

use crate::message::{ChannelId, Message};

pub const MAX_SLOT_SIZE: usize = 512 * 1024;
const NAL_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

struct Slot {
    in_progress: bool,
    expected_channel: Option<ChannelId>,
    buf: Vec<u8>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            in_progress: false,
            expected_channel: None,
            buf: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.in_progress = false;
        self.expected_channel = None;
        self.buf.clear();
    }
}

#[derive(Default)]
struct SpsPpsCache {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    injected: bool,
}

/// Output of reassembling a fragment sequence or a single complete frame:
/// the contiguous NAL bytes ready for the decoder.
pub struct ReassembledFrame {
    pub bytes: Vec<u8>,
}

pub struct Reassembler {
    slot: Mutex<Slot>,
    cache: Mutex<SpsPpsCache>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            slot: Mutex::new(Slot::new()),
            cache: Mutex::new(SpsPpsCache::default()),
        }
    }

    /// Clears the reassembly slot and the SPS/PPS cache; called on
    /// disconnect (spec.md §4.6).
    pub fn reset(&self) {
        self.slot.lock().unwrap().reset();
        let mut cache = self.cache.lock().unwrap();
        cache.sps = None;
        cache.pps = None;
        cache.injected = false;
    }

    /// Feeds a decrypted video-channel message through the reassembler.
    /// Returns `Some` when a complete frame is ready to hand to the decoder.
    pub fn feed(&self, msg: &Message) -> Option<ReassembledFrame> {
        use crate::message::{
            FLAGS_ENCRYPTED_COMPLETE, FLAGS_ENCRYPTED_FIRST, FLAGS_ENCRYPTED_LAST,
            FLAGS_ENCRYPTED_MIDDLE,
        };

        match msg.flags {
            FLAGS_ENCRYPTED_COMPLETE => self.handle_complete(msg),
            FLAGS_ENCRYPTED_FIRST => {
                self.handle_first(msg);
                None
            }
            FLAGS_ENCRYPTED_MIDDLE => {
                self.handle_middle(msg);
                None
            }
            FLAGS_ENCRYPTED_LAST => self.handle_last(msg),
            other => {
                warn!("reassembler: unexpected video flags {:#04x}, discarding", other);
                None
            }
        }
    }

    fn handle_complete(&self, msg: &Message) -> Option<ReassembledFrame> {
        // msg.body is the frame payload minus the 2-byte message type that
        // Message::from_frame already stripped; spec.md's "bytes [10..]"
        // offset is relative to the raw frame payload (2-byte type + 8
        // bytes of header-ish content the peer prepends for full frames).
        let raw = prepend_type(msg);
        let body = if raw.len() > 10 && raw[10..].starts_with(&NAL_START_CODE) {
            raw[10..].to_vec()
        } else if msg.msg_type == 1 && raw.len() > 2 {
            raw[2..].to_vec()
        } else {
            debug!("reassembler: complete frame has no recognizable NAL header, discarding");
            return None;
        };
        self.inspect_and_cache(&body);
        Some(ReassembledFrame { bytes: body })
    }

    fn handle_first(&self, msg: &Message) {
        let mut slot = self.slot.lock().unwrap();
        if slot.in_progress {
            warn!("reassembler: new first-fragment while in-progress, discarding old slot");
        }
        slot.reset();
        let raw = prepend_type(msg);
        let start = raw.len().min(10);
        slot.buf.extend_from_slice(&raw[start..]);
        slot.in_progress = true;
        slot.expected_channel = Some(msg.channel);
    }

    fn handle_middle(&self, msg: &Message) {
        let mut slot = self.slot.lock().unwrap();
        if !slot.in_progress || slot.expected_channel != Some(msg.channel) {
            warn!("reassembler: middle fragment without matching in-progress slot, discarding");
            slot.reset();
            return;
        }
        if slot.buf.len() + msg.body.len() + 2 > MAX_SLOT_SIZE {
            warn!("reassembler: slot overflow, dropping frame");
            slot.reset();
            return;
        }
        let raw = prepend_type(msg);
        slot.buf.extend_from_slice(&raw);
    }

    fn handle_last(&self, msg: &Message) -> Option<ReassembledFrame> {
        let mut slot = self.slot.lock().unwrap();
        if !slot.in_progress || slot.expected_channel != Some(msg.channel) {
            warn!("reassembler: last fragment without matching in-progress slot, discarding");
            slot.reset();
            return None;
        }
        let raw = prepend_type(msg);
        if slot.buf.len() + raw.len() > MAX_SLOT_SIZE {
            warn!("reassembler: slot overflow on last fragment, dropping frame");
            slot.reset();
            return None;
        }
        slot.buf.extend_from_slice(&raw);
        let bytes = std::mem::take(&mut slot.buf);
        slot.reset();
        drop(slot);
        self.inspect_and_cache(&bytes);
        Some(ReassembledFrame { bytes })
    }

    /// Scans for NAL start codes and caches SPS/PPS by NAL type
    /// (spec.md §4.6).
    fn inspect_and_cache(&self, bytes: &[u8]) {
        let mut i = 0;
        while i + 5 <= bytes.len() {
            if bytes[i..i + 4] == NAL_START_CODE {
                let nal_type = bytes[i + 4] & 0x1F;
                let nal_start = i + 4;
                let nal_end = find_next_start_code(bytes, nal_start + 1).unwrap_or(bytes.len());
                let mut cache = self.cache.lock().unwrap();
                match nal_type {
                    NAL_TYPE_SPS => cache.sps = Some(bytes[i..nal_end].to_vec()),
                    NAL_TYPE_PPS => cache.pps = Some(bytes[i..nal_end].to_vec()),
                    _ => {}
                }
                i = nal_end;
            } else {
                i += 1;
            }
        }
    }

    /// Returns SPS then PPS exactly once, the first time the decoder queue
    /// signals ready (spec.md §4.6, Property 5).
    pub fn take_injection_once_ready(&self, decoder_ready: bool) -> Option<(Vec<u8>, Vec<u8>)> {
        if !decoder_ready {
            return None;
        }
        let mut cache = self.cache.lock().unwrap();
        if cache.injected {
            return None;
        }
        match (&cache.sps, &cache.pps) {
            (Some(sps), Some(pps)) => {
                let result = (sps.clone(), pps.clone());
                cache.injected = true;
                Some(result)
            }
            _ => None,
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

fn find_next_start_code(bytes: &[u8], from: usize) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(4)
        .position(|w| w == NAL_START_CODE)
        .map(|p| from + p)
}

/// Reconstructs the flags-stripped-but-type-prefixed raw payload for offset
/// math: spec.md's fragment offsets (e.g. "[10..]") are counted from the
/// start of the frame payload, which includes the 2-byte message type that
/// `Message::from_frame` already split off.
fn prepend_type(msg: &Message) -> Vec<u8> {
    let mut raw = Vec::with_capacity(2 + msg.body.len());
    raw.extend_from_slice(&msg.msg_type.to_be_bytes());
    raw.extend_from_slice(&msg.body);
    raw
}
