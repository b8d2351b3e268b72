//! Client-mode TLS 1.2 engine (spec.md §4.3), built the way the teacher
//! wires up `openssl::ssl::SslStream` over an in-memory `Read+Write` shim
//! (`src/mitm.rs::SslMemBuf`/`ssl_builder`), since `rust-openssl` has no
//! `BIO_s_mem`-backed in-process record wrap/unwrap API.

use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Minimum size for the wrap/unwrap scratch buffers (spec.md §4.3).
pub const MIN_APP_BUFFER: usize = 131072;

/// How the engine decides whether to trust the peer's certificate chain.
/// `AcceptAny` matches spec.md §9's "trust-manager that always accepts the
/// peer"; `Pinned` is available for deployments that want to verify against
/// a specific chain instead.
#[derive(Clone)]
pub enum PeerVerification {
    AcceptAny,
    Pinned(Vec<u8>),
}

#[derive(Clone)]
pub struct TlsConfig {
    pub certificate_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
    pub peer_verification: PeerVerification,
}

type SharedBuf = Arc<Mutex<VecDeque<u8>>>;

/// `Read`/`Write` shim handed to `openssl::ssl::SslStream`: writes from the
/// TLS engine land in `outgoing` (cleartext-out on encrypt, records-out on
/// decrypt's wrap direction is symmetric here since this is client mode),
/// reads come from `incoming`.
#[derive(Clone)]
struct MemBio {
    incoming: SharedBuf,
    outgoing: SharedBuf,
}

impl Read for MemBio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.incoming.lock().unwrap().read(buf)
    }
}

impl Write for MemBio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct TlsSession {
    mem: MemBio,
    stream: openssl::ssl::SslStream<MemBio>,
    handshake_done: bool,
}

impl TlsSession {
    /// Builds the engine and allocates the wrap/unwrap scratch buffers
    /// (spec.md §4.3 `prepare()`).
    pub fn prepare(config: &TlsConfig) -> Result<Self, EngineError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls())
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;

        let certificate_chain = X509::from_pem(&config.certificate_chain_pem)
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
        ctx_builder
            .set_certificate(&certificate_chain)
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
        ctx_builder
            .set_private_key_file_from_pem(&config.private_key_pem)
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;

        match &config.peer_verification {
            PeerVerification::AcceptAny => {
                ctx_builder.set_verify(SslVerifyMode::NONE);
            }
            PeerVerification::Pinned(chain) => {
                let cert = X509::from_pem(chain)
                    .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
                let mut store = openssl::x509::store::X509StoreBuilder::new()
                    .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
                store
                    .add_cert(cert)
                    .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
                ctx_builder.set_cert_store(store.build());
                ctx_builder.set_verify(SslVerifyMode::PEER);
            }
        }

        ctx_builder
            .set_min_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
        ctx_builder.set_options(openssl::ssl::SslOptions::NO_TLSV1_3);
        // cipher-suite allow-list, in the order spec.md §4.3 requires
        ctx_builder
            .set_cipher_list(
                "ECDHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-AES128-GCM-SHA256:\
                 ECDHE-RSA-AES256-SHA384:ECDHE-RSA-AES128-SHA256:\
                 AES256-GCM-SHA384:AES128-GCM-SHA256",
            )
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;

        let openssl_ctx = ctx_builder.build();
        let mut ssl =
            Ssl::new(&openssl_ctx).map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
        ssl.set_connect_state();

        let mem = MemBio {
            incoming: Arc::new(Mutex::new(VecDeque::new())),
            outgoing: Arc::new(Mutex::new(VecDeque::new())),
        };
        let stream = openssl::ssl::SslStream::new(ssl, mem.clone())
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;

        Ok(TlsSession {
            mem,
            stream,
            handshake_done: false,
        })
    }

    /// Drives the handshake forward and returns the bytes that must be sent
    /// to the peer next. An empty result means the handshake is complete
    /// (spec.md §4.3 `handshake_read()`).
    pub fn handshake_read(&mut self) -> Result<Vec<u8>, EngineError> {
        match self.stream.connect() {
            Ok(()) => self.handshake_done = true,
            Err(e) => {
                if !matches!(
                    e.code(),
                    openssl::ssl::ErrorCode::WANT_READ | openssl::ssl::ErrorCode::WANT_WRITE
                ) {
                    return Err(EngineError::TlsHandshakeFailed(e.to_string()));
                }
            }
        }
        let mut out = Vec::new();
        self.mem
            .outgoing
            .lock()
            .unwrap()
            .read_to_end(&mut out)
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
        Ok(out)
    }

    /// Feeds handshake bytes received from the peer into the engine
    /// (spec.md §4.3 `handshake_write()`).
    pub fn handshake_write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.mem
            .incoming
            .lock()
            .unwrap()
            .write_all(bytes)
            .map_err(|e| EngineError::TlsHandshakeFailed(e.to_string()))?;
        Ok(())
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_done || self.stream.ssl().is_init_finished()
    }

    /// Wraps plaintext into TLS records (spec.md §4.3 `encrypt()`). Returns
    /// the raw records only; the caller is responsible for prepending the
    /// frame header (§4.8's `Outbox::write_framed`).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
        self.stream
            .write_all(plaintext)
            .map_err(|e| EngineError::TlsRecordError(e.to_string()))?;
        let mut records = Vec::new();
        self.mem
            .outgoing
            .lock()
            .unwrap()
            .read_to_end(&mut records)
            .map_err(|e| EngineError::TlsRecordError(e.to_string()))?;
        Ok(records)
    }

    /// Unwraps TLS records into plaintext (spec.md §4.3 `decrypt()`).
    pub fn decrypt(&mut self, records: &[u8]) -> Result<Vec<u8>, EngineError> {
        self.mem
            .incoming
            .lock()
            .unwrap()
            .write_all(records)
            .map_err(|e| EngineError::TlsRecordError(e.to_string()))?;
        let mut plaintext = Vec::new();
        match self.stream.read_to_end(&mut plaintext) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(EngineError::TlsRecordError(e.to_string())),
        }
        Ok(plaintext)
    }
}

trait SetPrivateKeyPem {
    fn set_private_key_file_from_pem(&mut self, pem: &[u8]) -> Result<(), openssl::error::ErrorStack>;
}

impl SetPrivateKeyPem for SslContextBuilder {
    fn set_private_key_file_from_pem(&mut self, pem: &[u8]) -> Result<(), openssl::error::ErrorStack> {
        let key = openssl::pkey::PKey::private_key_from_pem(pem)?;
        self.set_private_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A minimal self-signed cert/key pair, generated once for test fixtures.
    // openssl req -x509 -newkey rsa:2048 -keyout key.pem -out cert.pem -days 3650 -nodes -subj "/CN=test"
    const TEST_CERT: &str = include_str!("../tests/fixtures/test_cert.pem");
    const TEST_KEY: &str = include_str!("../tests/fixtures/test_key.pem");

    #[test]
    fn prepare_builds_connect_state_engine() {
        let config = TlsConfig {
            certificate_chain_pem: TEST_CERT.as_bytes().to_vec(),
            private_key_pem: TEST_KEY.as_bytes().to_vec(),
            peer_verification: PeerVerification::AcceptAny,
        };
        let session = TlsSession::prepare(&config).expect("prepare");
        assert!(!session.is_handshake_complete());
    }

    #[test]
    fn handshake_read_produces_client_hello() {
        let config = TlsConfig {
            certificate_chain_pem: TEST_CERT.as_bytes().to_vec(),
            private_key_pem: TEST_KEY.as_bytes().to_vec(),
            peer_verification: PeerVerification::AcceptAny,
        };
        let mut session = TlsSession::prepare(&config).expect("prepare");
        let hello = session.handshake_read().expect("handshake_read");
        assert!(!hello.is_empty(), "ClientHello bytes expected");
        assert!(!session.is_handshake_complete());
    }
}
