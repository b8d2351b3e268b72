//! The engine's single outward-facing event stream (spec.md §7).

/// Snapshot of dispatcher drop counters, reported alongside `Stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropStats {
    pub audio_drops: u64,
    pub video_drops: u64,
    pub control_drops: u64,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connected,
    Disconnected { reason: String },
    Stats(DropStats),
}

/// Thin wrapper around a bounded `mpsc::Sender` so callers never observe a
/// `SendError` when the receiving end (e.g. a UI) has gone away — matching
/// spec.md §7's "does not retry the session itself" stance: a dead listener
/// is the caller's problem, not a reason to fail the session.
#[derive(Clone)]
pub struct EventSink {
    tx: std::sync::mpsc::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(tx: std::sync::mpsc::Sender<EngineEvent>) -> Self {
        EventSink { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
