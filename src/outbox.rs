//! Thread-safe send path (spec.md §4.8): encrypt, frame, enqueue.

use log::{debug, warn};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::message::{ChannelId, Message};
use crate::tls::TlsSession;

/// A message queued for sending, in arrival order, before the transport is
/// ready to accept traffic.
struct Pending {
    channel: ChannelId,
    flags: u8,
    payload: Vec<u8>,
}

enum WriteTarget {
    Pending(Vec<Pending>),
    Ready,
}

/// Serializes all outbound frames behind a single mutex (spec.md §4.8's
/// "single sender mutex around the final `Transport.write`"), and holds
/// pre-`StatusSent` messages until the FSM flips `flush()`.
pub struct Outbox<W: Fn(&[u8]) -> Result<(), EngineError> + Send> {
    state: Mutex<WriteTarget>,
    tls: Arc<Mutex<TlsSession>>,
    writer: W,
}

impl<W: Fn(&[u8]) -> Result<(), EngineError> + Send> Outbox<W> {
    /// `tls` is shared with whatever thread owns unwrap/handshake duties
    /// (spec.md §5: "All wrap/unwrap operations are serialized by an
    /// internal mutex on TlsSession" — one mutex, one session).
    pub fn new(tls: Arc<Mutex<TlsSession>>, writer: W) -> Self {
        Outbox {
            state: Mutex::new(WriteTarget::Pending(Vec::new())),
            tls,
            writer,
        }
    }

    /// Sends an already-encrypted-phase message: encrypts the payload,
    /// frames it (length computed after encryption, per spec.md §4.8), and
    /// writes it out, or queues it if the transport isn't ready yet.
    pub fn send(&self, channel: ChannelId, msg_type: u16, body: Vec<u8>) -> Result<(), EngineError> {
        let msg = Message {
            channel,
            flags: crate::message::FLAGS_ENCRYPTED_COMPLETE,
            msg_type,
            body,
        };
        let plaintext = msg.to_payload();
        let mut tls = self.tls.lock().unwrap();
        let records = tls.encrypt(&plaintext)?;
        drop(tls);
        self.send_raw(channel, crate::message::FLAGS_ENCRYPTED_COMPLETE, records)
    }

    /// Sends bytes that are already in their final on-wire form (used for
    /// the unencrypted version-request and TLS-handshake frames, which
    /// bypass `TlsSession::encrypt`).
    pub fn send_raw(&self, channel: ChannelId, flags: u8, payload: Vec<u8>) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            WriteTarget::Ready => {
                drop(state);
                self.write_framed(channel, flags, &payload)
            }
            WriteTarget::Pending(list) => {
                debug!("outbox: queuing message on {} while transport not ready", channel);
                list.push(Pending {
                    channel,
                    flags,
                    payload,
                });
                Ok(())
            }
        }
    }

    /// Called by the FSM on entering `StatusSent`: flushes the pending list
    /// in arrival order and switches to immediate delivery thereafter.
    pub fn flush(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let pending = match std::mem::replace(&mut *state, WriteTarget::Ready) {
            WriteTarget::Pending(list) => list,
            WriteTarget::Ready => return Ok(()),
        };
        drop(state);
        for item in pending {
            self.write_framed(item.channel, item.flags, &item.payload)?;
        }
        Ok(())
    }

    fn write_framed(&self, channel: ChannelId, flags: u8, payload: &[u8]) -> Result<(), EngineError> {
        if payload.len() > u16::MAX as usize {
            warn!("outbox: payload of {} bytes exceeds frame length field, truncating", payload.len());
        }
        let length = payload.len().min(u16::MAX as usize) as u16;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.push(channel.0);
        frame.push(flags);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&payload[..length as usize]);
        (self.writer)(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{PeerVerification, TlsConfig};
    use std::sync::{Arc, Mutex as StdMutex};

    const TEST_CERT: &str = include_str!("../tests/fixtures/test_cert.pem");
    const TEST_KEY: &str = include_str!("../tests/fixtures/test_key.pem");

    fn new_session() -> TlsSession {
        let config = TlsConfig {
            certificate_chain_pem: TEST_CERT.as_bytes().to_vec(),
            private_key_pem: TEST_KEY.as_bytes().to_vec(),
            peer_verification: PeerVerification::AcceptAny,
        };
        TlsSession::prepare(&config).unwrap()
    }

    #[test]
    fn messages_queue_until_flush_then_deliver_in_order() {
        let written: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = written.clone();
        let outbox = Outbox::new(Arc::new(StdMutex::new(new_session())), move |bytes: &[u8]| {
            sink.lock().unwrap().push(bytes.to_vec());
            Ok(())
        });

        outbox.send_raw(ChannelId::CONTROL, 0x03, vec![1]).unwrap();
        outbox.send_raw(ChannelId::CONTROL, 0x03, vec![2]).unwrap();
        assert!(written.lock().unwrap().is_empty());

        outbox.flush().unwrap();
        let frames = written.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][4], 1);
        assert_eq!(frames[1][4], 2);
    }

    #[test]
    fn send_raw_after_flush_delivers_immediately() {
        let written: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = written.clone();
        let outbox = Outbox::new(Arc::new(StdMutex::new(new_session())), move |bytes: &[u8]| {
            sink.lock().unwrap().push(bytes.to_vec());
            Ok(())
        });
        outbox.flush().unwrap();
        outbox.send_raw(ChannelId::CONTROL, 0x03, vec![9]).unwrap();
        assert_eq!(written.lock().unwrap().len(), 1);
    }
}
