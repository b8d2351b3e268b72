//! Priority-based message dispatcher (spec.md §4.5): three bounded queues,
//! each drained by one worker thread. Not lock-free — spec.md reserves
//! lock-freedom for the RingBuffer; these queues use a narrow `Mutex` +
//! `Condvar` per queue, matching the "narrow mutexes around each invariant
//! group" redesign note in spec.md §9.

use crossbeam_utils::CachePadded;
use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::message::ChannelId;

pub const AUDIO_CAPACITY: usize = 64;
pub const VIDEO_CAPACITY: usize = 16;
pub const CONTROL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub channel: ChannelId,
    pub payload: Vec<u8>,
}

struct BoundedQueue {
    capacity: usize,
    items: Mutex<std::collections::VecDeque<QueuedMessage>>,
    not_empty: Condvar,
    drop_counter: CachePadded<AtomicU64>,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity,
            items: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            drop_counter: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Never blocks the caller: when full, drops the oldest entry and
    /// increments the drop counter (spec.md §3/§4.5).
    fn push(&self, msg: QueuedMessage) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
            self.drop_counter.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(msg);
        self.not_empty.notify_one();
    }

    fn pop_wait(&self, timeout: Duration) -> Option<QueuedMessage> {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(msg) = items.pop_front() {
                return Some(msg);
            }
            let (guard, res) = self.not_empty.wait_timeout(items, timeout).unwrap();
            items = guard;
            if res.timed_out() && items.is_empty() {
                return None;
            }
        }
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

pub type Callback = Box<dyn Fn(ChannelId, Vec<u8>) + Send + 'static>;

pub struct Dispatcher {
    audio: Arc<BoundedQueue>,
    video: Arc<BoundedQueue>,
    control: Arc<BoundedQueue>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Poll timeout for condvar waits: bounds how promptly a worker notices
/// shutdown even if no new message arrives.
const WORKER_POLL: Duration = Duration::from_millis(200);
/// spec.md §4.5 `stop()`'s join deadline.
const JOIN_DEADLINE: Duration = Duration::from_millis(500);

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            audio: Arc::new(BoundedQueue::new(AUDIO_CAPACITY)),
            video: Arc::new(BoundedQueue::new(VIDEO_CAPACITY)),
            control: Arc::new(BoundedQueue::new(CONTROL_CAPACITY)),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Classifies by channel and pushes; never blocks (spec.md §4.5).
    pub fn dispatch(&self, channel: ChannelId, payload: Vec<u8>) {
        let msg = QueuedMessage { channel, payload };
        if channel.is_audio() {
            self.audio.push(msg);
        } else if channel.is_video() {
            self.video.push(msg);
        } else {
            self.control.push(msg);
        }
    }

    pub fn audio_drops(&self) -> u64 {
        self.audio.drop_counter.load(Ordering::Relaxed)
    }
    pub fn video_drops(&self) -> u64 {
        self.video.drop_counter.load(Ordering::Relaxed)
    }
    pub fn control_drops(&self) -> u64 {
        self.control.drop_counter.load(Ordering::Relaxed)
    }
    pub fn audio_len(&self) -> usize {
        self.audio.len()
    }
    pub fn video_len(&self) -> usize {
        self.video.len()
    }
    pub fn control_len(&self) -> usize {
        self.control.len()
    }

    /// Starts the three worker threads. Each worker pops from its queue and
    /// invokes `callback` synchronously; a panic inside the callback is
    /// caught, logged, and the worker continues (spec.md §4.5).
    pub fn start(
        &self,
        audio_cb: Callback,
        video_cb: Callback,
        control_cb: Callback,
    ) {
        let mut workers = self.workers.lock().unwrap();
        workers.push(spawn_worker(
            "aap-audio",
            self.audio.clone(),
            self.shutdown.clone(),
            audio_cb,
            true,
        ));
        workers.push(spawn_worker(
            "aap-video",
            self.video.clone(),
            self.shutdown.clone(),
            video_cb,
            false,
        ));
        workers.push(spawn_worker(
            "aap-control",
            self.control.clone(),
            self.shutdown.clone(),
            control_cb,
            false,
        ));
    }

    /// Sets the shutdown flag, wakes all workers, and joins them with a
    /// 500ms deadline (spec.md §4.5 `stop()`).
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.audio.not_empty.notify_all();
        self.video.not_empty.notify_all();
        self.control.not_empty.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            join_with_deadline(handle, JOIN_DEADLINE);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn join_with_deadline(handle: JoinHandle<()>, deadline: Duration) {
    let (tx, rx) = std::sync::mpsc::channel();
    let name = handle.thread().name().unwrap_or("worker").to_string();
    std::thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    if rx.recv_timeout(deadline).is_err() {
        error!("dispatcher: worker '{}' did not join within deadline, leaking", name);
    }
}

fn spawn_worker(
    name: &'static str,
    queue: Arc<BoundedQueue>,
    shutdown: Arc<AtomicBool>,
    callback: Callback,
    realtime: bool,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if realtime {
                try_elevate_priority();
            }
            while !shutdown.load(Ordering::SeqCst) {
                if let Some(msg) = queue.pop_wait(WORKER_POLL) {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        callback(msg.channel, msg.payload);
                    }));
                    if let Err(panic) = result {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!("dispatcher: handler on '{}' panicked: {}", name, reason);
                    }
                }
            }
        })
        .expect("failed to spawn dispatcher worker thread")
}

/// Best-effort realtime priority bump for the audio worker. Silently falls
/// back to default priority when unsupported (e.g. no CAP_SYS_NICE, or
/// running on a desktop without realtime scheduling enabled) — this is the
/// common case in development, not an error worth logging.
fn try_elevate_priority() {
    use thread_priority::{ThreadPriority, ThreadPriorityValue};
    let _ = ThreadPriority::Crossplatform(
        ThreadPriorityValue::try_from(80u8).unwrap_or(ThreadPriorityValue::try_from(50u8).unwrap()),
    )
    .set_for_current();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Property 3 (spec.md §8): after pushing k > 64 audio messages into a
    /// stopped (undrained) audio queue, exactly 64 remain and
    /// audio_drops = k - 64; the 64 retained are the most recent.
    #[test]
    fn priority_drop_keeps_most_recent() {
        let dispatcher = Dispatcher::new();
        let k = 100u64;
        for i in 0..k {
            dispatcher.dispatch(ChannelId::AUDIO_MEDIA, vec![i as u8]);
        }
        assert_eq!(dispatcher.audio_len(), AUDIO_CAPACITY);
        assert_eq!(dispatcher.audio_drops(), k - AUDIO_CAPACITY as u64);

        // drain and confirm the retained entries are the most recent 64
        let (tx, rx) = mpsc::channel();
        dispatcher.start(
            Box::new(move |_ch, payload| {
                let _ = tx.send(payload[0]);
            }),
            Box::new(|_, _| {}),
            Box::new(|_, _| {}),
        );
        let mut received = Vec::new();
        for _ in 0..AUDIO_CAPACITY {
            received.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        }
        dispatcher.stop();
        let expected: Vec<u8> = ((k - AUDIO_CAPACITY as u64)..k).map(|v| v as u8).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn dispatch_classifies_by_channel() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(ChannelId::AUDIO_SPEECH, vec![1]);
        dispatcher.dispatch(ChannelId::VIDEO, vec![2]);
        dispatcher.dispatch(ChannelId::CONTROL, vec![3]);
        dispatcher.dispatch(ChannelId::SENSOR, vec![4]);
        assert_eq!(dispatcher.audio_len(), 1);
        assert_eq!(dispatcher.video_len(), 1);
        assert_eq!(dispatcher.control_len(), 2);
    }

    #[test]
    fn panicking_handler_does_not_stop_worker() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = mpsc::channel();
        dispatcher.start(
            Box::new(|_, _| {}),
            Box::new(|_, _| {}),
            Box::new(move |_ch, payload| {
                if payload == vec![0xFF] {
                    panic!("synthetic handler panic");
                }
                let _ = tx.send(payload);
            }),
        );
        dispatcher.dispatch(ChannelId::CONTROL, vec![0xFF]);
        dispatcher.dispatch(ChannelId::CONTROL, vec![1]);
        let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got, vec![1]);
        dispatcher.stop();
    }
}
