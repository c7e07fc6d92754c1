//! Configure `exactly(1024)`, feed the transport 2048 bytes in four
//! 512-byte segments, and expect exactly two `consume` calls, each of
//! length 1024.

mod common;

use cyclone::config::Config;
use cyclone::error::Result;
use cyclone::factory::SocketManagerFactory;
use cyclone::layer::{Down, Layer, TransportAdaptor};
use cyclone::manager::{share, EventResult, SharedManager};
use cyclone::multiplexer::Multiplexer;
use cyclone::pollset::RemoteSocketManagerFactory;
use cyclone::runtime::Cyclone;
use cyclone::socket::{StreamSocket, TcpStreamSocket};
use cyclone::timer::TimeoutId;
use cyclone::transport::{ReceivePolicy, StreamTransport};
use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the length of every `consume` call it receives, under a
/// fixed `exactly(1024)` receive policy.
struct RecordingLayer {
    consume_lengths: Arc<Mutex<Vec<usize>>>,
}

impl Layer for RecordingLayer {
    fn init(&mut self, down: &mut dyn Down, _mpx: &Multiplexer) -> Result<()> {
        down.configure_next_read(ReceivePolicy::exactly(1024));
        Ok(())
    }

    fn has_more_data(&mut self) -> bool {
        false
    }

    fn produce(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer) -> EventResult {
        EventResult::Done
    }

    fn consume(&mut self, down: &mut dyn Down, _mpx: &Multiplexer, bytes: &[u8]) -> EventResult {
        self.consume_lengths.lock().unwrap().push(bytes.len());
        down.configure_next_read(ReceivePolicy::exactly(1024));
        EventResult::Ok
    }

    fn handle_timeout(&mut self, _down: &mut dyn Down, _mpx: &Multiplexer, _id: TimeoutId) -> EventResult {
        EventResult::Ok
    }
}

struct RecordingFactory(Arc<Mutex<Vec<usize>>>);

impl SocketManagerFactory for RecordingFactory {
    fn make(&self, handle: TcpStreamSocket, _mpx: &Multiplexer) -> SharedManager {
        let config = Config::default();
        let layer = RecordingLayer { consume_lengths: self.0.clone() };
        let transport = StreamTransport::new(StreamSocket(handle.0), TransportAdaptor::new(layer), &config);
        share(transport)
    }
}
impl RemoteSocketManagerFactory for RecordingFactory {}

#[test]
fn exactly_1024_dispatches_twice_for_four_512_byte_segments() {
    let consume_lengths = Arc::new(Mutex::new(Vec::new()));
    let mut config = Config::default();
    config.port = 0;
    let running = Cyclone::new(config)
        .start(Arc::new(RecordingFactory(consume_lengths.clone())))
        .expect("reactor starts");
    let addr = format!("127.0.0.1:{}", running.port());

    let mut stream = TcpStream::connect(&addr).expect("client connects");
    let segment: Vec<u8> = (0u8..=255).cycle().take(512).collect();
    for _ in 0..4 {
        stream.write_all(&segment).expect("client writes a 512-byte segment");
        // Give the reactor a chance to drain each segment separately
        // rather than coalescing all four into one `read(2)`.
        std::thread::sleep(Duration::from_millis(30));
    }

    std::thread::sleep(Duration::from_millis(100));
    drop(stream);
    std::thread::sleep(Duration::from_millis(50));

    running.shutdown();
    running.join().expect("reactor shuts down cleanly");

    let lengths = consume_lengths.lock().unwrap().clone();
    assert_eq!(lengths, vec![1024, 1024]);
}
