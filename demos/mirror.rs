//! Illustrative mirror client/server CLI. Not part of the library's
//! public API; this is a standalone binary.
//!
//! ```text
//! mirror -s -p 7777
//! mirror -c -h 127.0.0.1 -p 7777 -n 4 -b 65536
//! mirror -c -h 127.0.0.1 -p 7777 -m
//! ```

use cyclone::config::Config;
use cyclone::error::Result;
use cyclone::factory::SocketManagerFactory;
use cyclone::layer::{Down, Layer, TransportAdaptor};
use cyclone::manager::EventResult;
use cyclone::manager::{share, SharedManager, SocketManager};
use cyclone::multiplexer::Multiplexer;
use cyclone::pollset::RemoteSocketManagerFactory;
use cyclone::runtime::Cyclone;
use cyclone::socket::TcpStreamSocket;
use cyclone::timer::TimeoutId;
use cyclone::transport::{ReceivePolicy, StreamTransport};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Appends whatever it is handed to an internal buffer and, once
/// asked to produce, hands that whole buffer to the transport's write
/// path. A direct translation of `net::application::mirror`, which
/// guards its buffer with a `std::mutex` because the original can be
/// driven by more than one thread; here the transport never calls a
/// layer from more than the reactor thread, so a plain `Vec` suffices.
#[derive(Default)]
struct MirrorLayer {
    received: Vec<u8>,
}

impl Layer for MirrorLayer {
    fn init(&mut self, down: &mut dyn Down, _mpx: &Multiplexer) -> Result<()> {
        down.configure_next_read(ReceivePolicy::up_to(8096));
        Ok(())
    }

    fn has_more_data(&mut self) -> bool {
        !self.received.is_empty()
    }

    fn produce(&mut self, down: &mut dyn Down, _mpx: &Multiplexer) -> EventResult {
        if self.received.is_empty() {
            return EventResult::Done;
        }
        down.enqueue(&self.received);
        self.received.clear();
        EventResult::Done
    }

    fn consume(&mut self, down: &mut dyn Down, mpx: &Multiplexer, bytes: &[u8]) -> EventResult {
        self.received.extend_from_slice(bytes);
        down.configure_next_read(ReceivePolicy::up_to(8096));
        down.register_writing(mpx);
        EventResult::Ok
    }

    fn handle_timeout(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer, _id: TimeoutId) -> EventResult {
        EventResult::Ok
    }
}

struct MirrorFactory;

impl SocketManagerFactory for MirrorFactory {
    fn make(&self, handle: TcpStreamSocket, mpx: &Multiplexer) -> SharedManager {
        let config = Config::default();
        let transport = StreamTransport::new(
            cyclone::socket::StreamSocket(handle.0),
            TransportAdaptor::new(MirrorLayer::default()),
            &config,
        );
        let mgr = share(transport);
        let _ = mpx;
        mgr
    }
}
impl RemoteSocketManagerFactory for MirrorFactory {}

struct Args {
    server: bool,
    host: String,
    port: u16,
    mirror: bool,
    writers: usize,
    bytes_per_sec: usize,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            server: false,
            host: "127.0.0.1".into(),
            port: 7777,
            mirror: false,
            writers: 1,
            bytes_per_sec: 0,
        }
    }
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "-s" => args.server = true,
            "-c" => args.server = false,
            "-h" => args.host = it.next().unwrap_or_else(|| args.host.clone()),
            "-p" => {
                if let Some(v) = it.next() {
                    args.port = v.parse().unwrap_or(args.port);
                }
            }
            "-m" => args.mirror = true,
            "-n" => {
                if let Some(v) = it.next() {
                    args.writers = v.parse().unwrap_or(args.writers);
                }
            }
            "-b" => {
                if let Some(v) = it.next() {
                    args.bytes_per_sec = v.parse().unwrap_or(args.bytes_per_sec);
                }
            }
            other => eprintln!("ignoring unrecognized flag {other}"),
        }
    }
    args
}

fn run_server(args: &Args) -> Result<()> {
    let mut config = Config::default();
    config.port = args.port;
    config.bind_loopback = args.host == "127.0.0.1";
    cyclone::runtime::init_logging(&config);
    let cyclone = Cyclone::new(config);
    let running = cyclone.start(Arc::new(MirrorFactory))?;
    println!("mirror server listening on port {}", running.port());

    let shutdown_handle = running.handle();
    ctrlc::set_handler(move || {
        eprintln!("received Ctrl-C, shutting down");
        shutdown_handle.shutdown();
    })
    .expect("installing the Ctrl-C handler should not fail");

    running.join()
}

/// One writer thread: connects, then either streams `bytes_per_sec`
/// worth of data per second (plain client mode) or reflects back
/// whatever it reads (`-m`, used by a second peer exercising the
/// server's mirror behavior end to end).
fn run_writer(addr: String, mirror: bool, bytes_per_sec: usize) {
    let stream = match TcpStream::connect(&addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("connect to {addr} failed: {e}");
            return;
        }
    };
    let reader = Arc::new(Mutex::new(stream.try_clone().expect("clone stream")));
    let mut writer = stream;
    if mirror {
        let mut buf = [0u8; 8096];
        loop {
            let n = match reader.lock().unwrap().read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if writer.write_all(&buf[..n]).is_err() {
                break;
            }
        }
        return;
    }
    let chunk = if bytes_per_sec == 0 { 4096 } else { bytes_per_sec.min(65536) };
    let payload: Vec<u8> = (0..chunk).map(|i| (i % 256) as u8).collect();
    loop {
        if writer.write_all(&payload).is_err() {
            break;
        }
        if bytes_per_sec > 0 {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

fn run_client(args: &Args) {
    let addr = format!("{}:{}", args.host, args.port);
    let handles: Vec<_> = (0..args.writers.max(1))
        .map(|_| {
            let addr = addr.clone();
            let mirror = args.mirror;
            let bytes_per_sec = args.bytes_per_sec;
            std::thread::spawn(move || run_writer(addr, mirror, bytes_per_sec))
        })
        .collect();
    for h in handles {
        let _ = h.join();
    }
}

fn main() -> Result<()> {
    let args = parse_args();
    if args.server {
        run_server(&args)
    } else {
        run_client(&args);
        Ok(())
    }
}
