//! A mirrored echo, but with a [`cyclone::tls::TlsLayer`] mounted
//! between the transport and the application on both ends. A
//! self-signed certificate minted with
//! `rcgen` stands in for a real CA-issued one; the test asserts the
//! handshake completes and `"Hello World"` arrives on the server side
//! decrypted verbatim.

#![cfg(feature = "tls")]

use cyclone::config::Config;
use cyclone::error::Result;
use cyclone::factory::SocketManagerFactory;
use cyclone::layer::Down;
use cyclone::layer::Layer;
use cyclone::manager::{share, EventResult, Operation, SharedManager};
use cyclone::multiplexer::Multiplexer;
use cyclone::pollset::RemoteSocketManagerFactory;
use cyclone::runtime::Cyclone;
use cyclone::socket::{StreamSocket, TcpStreamSocket};
use cyclone::timer::TimeoutId;
use cyclone::tls::TlsLayer;
use cyclone::transport::StreamTransport;
use rustls::{Certificate, ClientConfig, PrivateKey, ServerConfig, ServerName};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Writes one fixed message as soon as it has a chance to, then goes
/// quiet.
struct SendOnceLayer {
    payload: &'static [u8],
    sent: bool,
}

impl Layer for SendOnceLayer {
    fn init(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer) -> Result<()> {
        Ok(())
    }

    fn has_more_data(&mut self) -> bool {
        !self.sent
    }

    fn produce(&mut self, down: &mut dyn Down, _mpx: &Multiplexer) -> EventResult {
        if !self.sent {
            down.enqueue(self.payload);
            self.sent = true;
        }
        EventResult::Done
    }

    fn consume(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer, _bytes: &[u8]) -> EventResult {
        EventResult::Ok
    }

    fn handle_timeout(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer, _id: TimeoutId) -> EventResult {
        EventResult::Ok
    }
}

/// Records every plaintext byte it is handed, for the test to assert
/// on afterwards.
struct RecordingLayer {
    received: Arc<Mutex<Vec<u8>>>,
}

impl Layer for RecordingLayer {
    fn init(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer) -> Result<()> {
        Ok(())
    }

    fn has_more_data(&mut self) -> bool {
        false
    }

    fn produce(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer) -> EventResult {
        EventResult::Done
    }

    fn consume(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer, bytes: &[u8]) -> EventResult {
        self.received.lock().unwrap().extend_from_slice(bytes);
        EventResult::Ok
    }

    fn handle_timeout(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer, _id: TimeoutId) -> EventResult {
        EventResult::Ok
    }
}

struct ServerFactory {
    tls_config: Arc<ServerConfig>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl SocketManagerFactory for ServerFactory {
    fn make(&self, handle: TcpStreamSocket, _mpx: &Multiplexer) -> SharedManager {
        let tls = TlsLayer::server(
            self.tls_config.clone(),
            RecordingLayer { received: self.received.clone() },
        )
        .expect("server TLS session constructs");
        let transport = StreamTransport::new(StreamSocket(handle.0), tls, &Config::default());
        share(transport)
    }
}
impl RemoteSocketManagerFactory for ServerFactory {}

struct ClientFactory {
    tls_config: Arc<ClientConfig>,
    server_name: ServerName,
}

impl SocketManagerFactory for ClientFactory {
    fn make(&self, handle: TcpStreamSocket, _mpx: &Multiplexer) -> SharedManager {
        let tls = TlsLayer::client(
            self.tls_config.clone(),
            self.server_name.clone(),
            SendOnceLayer {
                payload: b"Hello World",
                sent: false,
            },
        )
        .expect("client TLS session constructs");
        let transport = StreamTransport::new(StreamSocket(handle.0), tls, &Config::default());
        share(transport)
    }
}
impl RemoteSocketManagerFactory for ClientFactory {}

/// Accepts any server certificate; fine against a self-signed cert
/// minted on the fly for this test, never for production use.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[test]
fn hello_world_round_trips_through_a_tls_handshake() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed cert generates");
    let cert_der = Certificate(cert.serialize_der().expect("cert serializes to DER"));
    let key_der = PrivateKey(cert.serialize_private_key_der());

    let server_config = Arc::new(
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .expect("server config builds from the self-signed cert"),
    );
    let client_config = Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from("localhost").expect("valid DNS name");

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut config = Config::default();
    config.port = 0;
    let running = Cyclone::new(config)
        .start(Arc::new(ServerFactory {
            tls_config: server_config,
            received: received.clone(),
        }))
        .expect("reactor starts");

    // Connect back into the same reactor: the client side of the TLS
    // handshake only exists as a `TlsLayer`, which (like every layer)
    // must be driven by a manager living on the reactor thread, so the
    // cross-thread `connect` handle is the only way to stand one up
    // rather than a plain `std::net::TcpStream`.
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), running.port());
    running.handle().connect(
        addr,
        Arc::new(ClientFactory {
            tls_config: client_config,
            server_name,
        }),
        Operation::READ,
    );

    std::thread::sleep(Duration::from_millis(300));

    running.shutdown();
    running.join().expect("reactor shuts down cleanly");

    assert_eq!(&received.lock().unwrap()[..], b"Hello World");
}
