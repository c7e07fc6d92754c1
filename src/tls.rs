//! TLS layer: wraps another layer with confidentiality/integrity,
//! driven entirely through in-memory buffers rather than a live socket.
//!
//! rustls's `Connection` already separates the ciphertext path
//! (`read_tls`/`write_tls`) from the plaintext path (`reader()`/
//! `writer()`), which is exactly the seam this layer needs to sit
//! between a transport that only deals in bytes and an application
//! that only deals in plaintext — so this layer drives rustls's own
//! API directly rather than introducing another abstraction on top.

use crate::error::{Error, Result};
use crate::layer::{Down, Layer};
use crate::manager::EventResult;
use crate::multiplexer::Multiplexer;
use crate::timer::TimeoutId;
use crate::transport::ReceivePolicy;
use bytes::BytesMut;
use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Bytes accumulated per `read_tls` call before handing plaintext to
/// the next layer.
const PLAINTEXT_BUFFER_SIZE: usize = 2048;

enum Role {
    Client(ClientConnection),
    Server(ServerConnection),
}

/// A small [`Down`] view presenting this layer's own plaintext staging
/// buffer (`encrypt_buf`) to whatever layer is mounted on top, while
/// forwarding every multiplexer-touching call to the real parent.
/// Built fresh for the duration of exactly one call into the layer
/// above.
struct TlsAsDown<'a> {
    encrypt_buf: &'a mut BytesMut,
    parent: &'a mut dyn Down,
}

impl<'a> Down for TlsAsDown<'a> {
    fn configure_next_read(&mut self, _policy: ReceivePolicy) {
        // Ignored: TLS imposes its own record-sized chunking on the
        // transport below it.
    }
    fn write_buffer(&mut self) -> &mut BytesMut {
        self.encrypt_buf
    }
    fn enqueue(&mut self, bytes: &[u8]) {
        self.encrypt_buf.extend_from_slice(bytes);
    }
    fn handle_error(&mut self, mpx: &Multiplexer, err: Error) {
        self.parent.handle_error(mpx, err);
    }
    fn register_writing(&mut self, mpx: &Multiplexer) {
        self.parent.register_writing(mpx);
    }
    fn set_timeout_in(&mut self, mpx: &Multiplexer, duration: Duration) -> TimeoutId {
        self.parent.set_timeout_in(mpx, duration)
    }
    fn set_timeout_at(&mut self, mpx: &Multiplexer, point: SystemTime) -> TimeoutId {
        self.parent.set_timeout_at(mpx, point)
    }
}

/// Wraps `next` with a TLS session. Mounted directly atop a
/// [`crate::transport::StreamTransport`] (or another layer), taking
/// over the record-level chunking of whatever sits below it.
pub struct TlsLayer<L> {
    role: Role,
    encrypt_buf: BytesMut,
    next_layer: L,
}

impl<L: Layer> TlsLayer<L> {
    /// Build a client-side session for `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: rustls::ServerName, next_layer: L) -> Result<Self> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::tls(e.to_string()))?;
        Ok(Self {
            role: Role::Client(conn),
            encrypt_buf: BytesMut::new(),
            next_layer,
        })
    }

    /// Build a server-side session.
    pub fn server(config: Arc<ServerConfig>, next_layer: L) -> Result<Self> {
        let conn = ServerConnection::new(config).map_err(|e| Error::tls(e.to_string()))?;
        Ok(Self {
            role: Role::Server(conn),
            encrypt_buf: BytesMut::new(),
            next_layer,
        })
    }

    fn is_handshaking(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.is_handshaking(),
            Role::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match &self.role {
            Role::Client(c) => c.wants_write(),
            Role::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match &mut self.role {
            Role::Client(c) => c.read_tls(rd),
            Role::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match &mut self.role {
            Role::Client(c) => c.write_tls(wr),
            Role::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<(), rustls::Error> {
        match &mut self.role {
            Role::Client(c) => c.process_new_packets().map(|_| ()),
            Role::Server(c) => c.process_new_packets().map(|_| ()),
        }
    }

    fn plaintext_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.role {
            Role::Client(c) => c.reader().read(buf),
            Role::Server(c) => c.reader().read(buf),
        }
    }

    fn plaintext_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.role {
            Role::Client(c) => c.writer().write(buf),
            Role::Server(c) => c.writer().write(buf),
        }
    }

    /// Drains whatever ciphertext rustls has queued for the wire into
    /// `down`'s outbound path (mirrors `read_all_from_ssl`). Arms write
    /// readiness whenever it actually enqueues anything: this may run
    /// from `consume` (handshake flights, renegotiation) where nothing
    /// else would otherwise ask the transport to flush them.
    fn drain_ciphertext(&mut self, down: &mut dyn Down, mpx: &Multiplexer) -> Result<()> {
        let mut out = Vec::new();
        while self.wants_write() {
            match self.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::tls(e.to_string())),
            }
        }
        if !out.is_empty() {
            down.enqueue(&out);
            down.register_writing(mpx);
        }
        Ok(())
    }

    /// Feeds queued plaintext into rustls for encryption (mirrors
    /// `encrypt`'s write loop; a no-op during the handshake).
    fn encrypt(&mut self) -> Result<()> {
        if self.is_handshaking() {
            return Ok(());
        }
        while !self.encrypt_buf.is_empty() {
            match self.plaintext_write(&self.encrypt_buf.clone()) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.encrypt_buf.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::tls(e.to_string())),
            }
        }
        Ok(())
    }
}

/// Builds a server TLS config from a PEM certificate chain and PEM
/// private key on disk (PKCS#8 or RSA). No client auth; callers that
/// need mutual TLS build a `ServerConfig` themselves and pass it to
/// [`TlsLayer::server`] directly.
pub fn server_config_from_files(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(e.to_string()))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).map_err(|e| Error::tls(format!("opening {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let der = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::tls(format!("parsing certificates from {}: {e}", path.display())))?;
    Ok(der.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path).map_err(|e| Error::tls(format!("opening {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::tls(format!("parsing PKCS#8 key from {}: {e}", path.display())))?;
    if let Some(key) = pkcs8.pop() {
        return Ok(PrivateKey(key));
    }
    let file = File::open(path).map_err(|e| Error::tls(format!("opening {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut rsa = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|e| Error::tls(format!("parsing RSA key from {}: {e}", path.display())))?;
    rsa.pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::tls(format!("no private key found in {}", path.display())))
}

impl<L: Layer> Layer for TlsLayer<L> {
    fn init(&mut self, down: &mut dyn Down, mpx: &Multiplexer) -> Result<()> {
        // A client session has a handshake flight queued as soon as it
        // is constructed; drain it immediately.
        self.drain_ciphertext(down, mpx)?;
        down.configure_next_read(ReceivePolicy::up_to(PLAINTEXT_BUFFER_SIZE));
        let mut as_down = TlsAsDown {
            encrypt_buf: &mut self.encrypt_buf,
            parent: down,
        };
        self.next_layer.init(&mut as_down, mpx)
    }

    fn has_more_data(&mut self) -> bool {
        !self.encrypt_buf.is_empty() || self.next_layer.has_more_data()
    }

    fn produce(&mut self, down: &mut dyn Down, mpx: &Multiplexer) -> EventResult {
        {
            let mut as_down = TlsAsDown {
                encrypt_buf: &mut self.encrypt_buf,
                parent: down,
            };
            if self.next_layer.produce(&mut as_down, mpx) == EventResult::Error {
                return EventResult::Error;
            }
        }
        if let Err(e) = self.encrypt() {
            down.handle_error(mpx, e);
            return EventResult::Error;
        }
        if let Err(e) = self.drain_ciphertext(down, mpx) {
            down.handle_error(mpx, e);
            return EventResult::Error;
        }
        if self.next_layer.has_more_data() {
            EventResult::Ok
        } else {
            EventResult::Done
        }
    }

    fn consume(&mut self, down: &mut dyn Down, mpx: &Multiplexer, bytes: &[u8]) -> EventResult {
        let mut cursor = Cursor::new(bytes);
        loop {
            match self.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    down.handle_error(mpx, Error::tls(e.to_string()));
                    return EventResult::Error;
                }
            }
        }
        if let Err(e) = self.process_new_packets() {
            down.handle_error(mpx, Error::tls(e.to_string()));
            return EventResult::Error;
        }
        if let Err(e) = self.drain_ciphertext(down, mpx) {
            down.handle_error(mpx, e);
            return EventResult::Error;
        }
        if self.is_handshaking() {
            return EventResult::Ok;
        }
        let mut plaintext = [0u8; PLAINTEXT_BUFFER_SIZE];
        loop {
            match self.plaintext_read(&mut plaintext) {
                Ok(0) => break,
                Ok(n) => {
                    let mut as_down = TlsAsDown {
                        encrypt_buf: &mut self.encrypt_buf,
                        parent: down,
                    };
                    if self.next_layer.consume(&mut as_down, mpx, &plaintext[..n]) == EventResult::Error {
                        return EventResult::Error;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    down.handle_error(mpx, Error::tls(e.to_string()));
                    return EventResult::Error;
                }
            }
        }
        EventResult::Ok
    }

    fn handle_timeout(&mut self, down: &mut dyn Down, mpx: &Multiplexer, id: TimeoutId) -> EventResult {
        let mut as_down = TlsAsDown {
            encrypt_buf: &mut self.encrypt_buf,
            parent: down,
        };
        self.next_layer.handle_timeout(&mut as_down, mpx, id)
    }
}
