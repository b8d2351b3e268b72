//! Lock-free single-producer/single-consumer byte ring buffer used between
//! the Transport I/O thread and the Parser thread (spec.md §4.1).
//!
//! The buffer is fixed-capacity and allocates once at construction. Two
//! atomic indices (`write`, `read`), each monotonically increasing modulo
//! `2 * capacity`, track the producer and consumer positions; the actual
//! byte offset is `index % capacity`. Using a doubled modulus instead of a
//! one-slot gap lets `available()`/`free_space()` distinguish "full" from
//! "empty" without wasting a byte of capacity.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const DEFAULT_CAPACITY: usize = 512 * 1024;

struct Shared {
    buf: Box<[std::cell::UnsafeCell<u8>]>,
    capacity: usize,
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
}

// SAFETY: `write` is only ever mutated by the single `Producer`, `read` only
// by the single `Consumer`; the byte storage itself is touched by the
// producer in `[read, write)`'s complement and by the consumer in
// `[read, write)`, which never overlap by construction.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

/// Creates a ring buffer of the given capacity and returns its producer and
/// consumer halves. Ownership is exclusive: exactly one `Producer` and one
/// `Consumer` exist per buffer, matching spec.md's "exactly one producer
/// reference and one consumer reference may be handed out".
pub fn channel(capacity: usize) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring buffer capacity must be non-zero");
    let buf: Box<[std::cell::UnsafeCell<u8>]> = (0..capacity)
        .map(|_| std::cell::UnsafeCell::new(0u8))
        .collect();
    let shared = Arc::new(Shared {
        buf,
        capacity,
        write: CachePadded::new(AtomicUsize::new(0)),
        read: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

fn mask(index: usize, capacity: usize) -> usize {
    index % capacity
}

/// `available` bytes given `write`/`read` counters each modulo `2*capacity`.
fn available_from(write: usize, read: usize, capacity: usize) -> usize {
    let modulus = 2 * capacity;
    let diff = (write + modulus - read) % modulus;
    debug_assert!(diff <= modulus);
    diff
}

pub struct Producer {
    shared: Arc<Shared>,
}

// Producer/Consumer are deliberately !Clone: only one of each may exist.
unsafe impl Send for Producer {}

pub struct Consumer {
    shared: Arc<Shared>,
}

unsafe impl Send for Consumer {}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn free_space(&self) -> usize {
        let capacity = self.shared.capacity;
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Acquire);
        capacity - available_from(write, read, capacity)
    }

    /// Copies as much of `src` as fits into the free space, returning the
    /// number of bytes written. Never blocks.
    pub fn write(&self, src: &[u8]) -> usize {
        let capacity = self.shared.capacity;
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Acquire);
        let free = capacity - available_from(write, read, capacity);
        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        let start = mask(write, capacity);
        let first_chunk = n.min(capacity - start);
        // SAFETY: the region [start, start+n) modulo capacity is disjoint
        // from the consumer's [mask(read), mask(write)) region because `n`
        // never exceeds the currently-free space computed above.
        unsafe {
            let base = self.shared.buf.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first_chunk);
            if first_chunk < n {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first_chunk),
                    base,
                    n - first_chunk,
                );
            }
        }

        let new_write = wrap_add(write, n, capacity);
        self.shared.write.store(new_write, Ordering::Release);
        n
    }
}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn available(&self) -> usize {
        let capacity = self.shared.capacity;
        let write = self.shared.write.load(Ordering::Acquire);
        let read = self.shared.read.load(Ordering::Relaxed);
        available_from(write, read, capacity)
    }

    /// Copies as many bytes as fit into `dst` without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        self.peek_or_read(dst, false)
    }

    /// Copies as many bytes as fit into `dst`, consuming them.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.peek_or_read(dst, true)
    }

    /// Discards up to `n` bytes without copying them out; returns the
    /// number actually skipped.
    pub fn skip(&self, n: usize) -> usize {
        let capacity = self.shared.capacity;
        let write = self.shared.write.load(Ordering::Acquire);
        let read = self.shared.read.load(Ordering::Relaxed);
        let avail = available_from(write, read, capacity);
        let skipped = n.min(avail);
        if skipped > 0 {
            let new_read = wrap_add(read, skipped, capacity);
            self.shared.read.store(new_read, Ordering::Release);
        }
        skipped
    }

    fn peek_or_read(&self, dst: &mut [u8], consume: bool) -> usize {
        let capacity = self.shared.capacity;
        let write = self.shared.write.load(Ordering::Acquire);
        let read = self.shared.read.load(Ordering::Relaxed);
        let avail = available_from(write, read, capacity);
        let n = dst.len().min(avail);
        if n == 0 {
            return 0;
        }

        let start = mask(read, capacity);
        let first_chunk = n.min(capacity - start);
        unsafe {
            let base = self.shared.buf.as_ptr() as *const u8;
            std::ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first_chunk);
            if first_chunk < n {
                std::ptr::copy_nonoverlapping(
                    base,
                    dst.as_mut_ptr().add(first_chunk),
                    n - first_chunk,
                );
            }
        }

        if consume {
            let new_read = wrap_add(read, n, capacity);
            self.shared.read.store(new_read, Ordering::Release);
        }
        n
    }
}

fn wrap_add(index: usize, n: usize, capacity: usize) -> usize {
    (index + n) % (2 * capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let (p, c) = channel(16);
        assert_eq!(p.write(b"hello"), 5);
        let mut buf = [0u8; 5];
        assert_eq!(c.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(c.available(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let (p, c) = channel(16);
        p.write(b"abc");
        let mut buf = [0u8; 3];
        assert_eq!(c.peek(&mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(c.available(), 3);
        assert_eq!(c.read(&mut buf), 3);
        assert_eq!(c.available(), 0);
    }

    #[test]
    fn wraps_around_capacity() {
        let (p, c) = channel(8);
        assert_eq!(p.write(b"123456"), 6);
        let mut buf = [0u8; 4];
        assert_eq!(c.read(&mut buf), 4);
        assert_eq!(&buf, b"1234");
        // free space is now 6, write wraps around the end of the buffer
        assert_eq!(p.write(b"7890AB"), 6);
        let mut rest = [0u8; 8];
        assert_eq!(c.read(&mut rest), 8);
        assert_eq!(&rest, b"567890AB");
    }

    #[test]
    fn write_reports_zero_when_full() {
        let (p, c) = channel(4);
        assert_eq!(p.write(b"1234"), 4);
        assert_eq!(p.free_space(), 0);
        assert_eq!(p.write(b"5"), 0);
        let mut buf = [0u8; 4];
        c.read(&mut buf);
        assert_eq!(p.write(b"5"), 1);
    }

    #[test]
    fn skip_discards_without_copy() {
        let (p, c) = channel(8);
        p.write(b"abcdef");
        assert_eq!(c.skip(3), 3);
        let mut buf = [0u8; 3];
        assert_eq!(c.read(&mut buf), 3);
        assert_eq!(&buf, b"def");
    }

    /// Property 2 (spec.md §8): for any interleaving of writer/reader calls
    /// on a single producer/consumer pair, the consumer observes a prefix of
    /// the producer's bytes; nothing is lost unless free_space was 0.
    #[test]
    fn spsc_interleaving_preserves_prefix_order() {
        let (p, c) = channel(32);
        let source: Vec<u8> = (0u8..=255).collect();
        let mut produced = Vec::new();
        let mut consumed = Vec::new();
        let mut cursor = 0usize;
        let mut step = 1usize;
        while cursor < source.len() || consumed.len() < produced.len() {
            if cursor < source.len() {
                let chunk_len = step.min(source.len() - cursor);
                let chunk = &source[cursor..cursor + chunk_len];
                let written = p.write(chunk);
                produced.extend_from_slice(&chunk[..written]);
                cursor += written;
                if written < chunk_len {
                    // buffer was full; drain before retrying
                }
            }
            let mut tmp = vec![0u8; step];
            let n = c.read(&mut tmp);
            consumed.extend_from_slice(&tmp[..n]);
            step = step % 7 + 1;
        }
        assert_eq!(produced, consumed);
        assert!(produced.starts_with(&consumed[..consumed.len().min(produced.len())]));
    }
}
