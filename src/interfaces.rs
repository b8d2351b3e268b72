//! Consumed external interfaces (spec.md §6): decoder, audio, mic, sensors,
//! clock. The concrete implementations (hardware decode, audio output, mic
//! capture, GPS) are explicit non-goals; only the traits plus the
//! production stubs this crate can honestly provide (`StdClock`, a `log`
//! sink) live here.

use std::time::Instant;

/// `{offer(bytes); reset(); ready()}` from spec.md §6.
pub trait VideoDecoderSink: Send {
    fn offer(&mut self, nal_bytes: &[u8]);
    fn reset(&mut self);
    fn ready(&self) -> bool;
}

/// `{write(bytes); start(sample_rate, bits, channels); stop()}`.
pub trait AudioSink: Send {
    fn start(&mut self, sample_rate: u32, bits: u8, channels: u8);
    fn write(&mut self, pcm: &[u8]);
    fn stop(&mut self);
}

/// Monotonic clock, grounded on the teacher's `Instant`-based stall/report
/// timers in `src/io_uring.rs::transfer_monitor`.
pub trait Clock: Send + Sync {
    fn elapsed_ms(&self, since: Instant) -> u64;
}

pub struct StdClock;

impl Clock for StdClock {
    fn elapsed_ms(&self, since: Instant) -> u64 {
        since.elapsed().as_millis() as u64
    }
}

/// A `VideoDecoderSink`/`AudioSink` that logs and discards — used when no
/// real sink is wired in (e.g. tests, or a head unit without a decoder
/// attached yet).
pub struct NullVideoSink {
    ready: bool,
}

impl NullVideoSink {
    pub fn new() -> Self {
        NullVideoSink { ready: true }
    }
}

impl Default for NullVideoSink {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoderSink for NullVideoSink {
    fn offer(&mut self, nal_bytes: &[u8]) {
        log::trace!("video sink (null): discarding {} bytes", nal_bytes.len());
    }
    fn reset(&mut self) {}
    fn ready(&self) -> bool {
        self.ready
    }
}

pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn start(&mut self, sample_rate: u32, bits: u8, channels: u8) {
        log::trace!(
            "audio sink (null): start {}Hz {}bit {}ch",
            sample_rate,
            bits,
            channels
        );
    }
    fn write(&mut self, pcm: &[u8]) {
        log::trace!("audio sink (null): discarding {} bytes", pcm.len());
    }
    fn stop(&mut self) {}
}
