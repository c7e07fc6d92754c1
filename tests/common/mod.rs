//! Shared test support for the end-to-end reactor scenarios below.
#![allow(dead_code)]

use cyclone::config::Config;
use cyclone::error::Result;
use cyclone::factory::SocketManagerFactory;
use cyclone::layer::{Down, Layer, TransportAdaptor};
use cyclone::manager::{share, EventResult, SharedManager};
use cyclone::multiplexer::Multiplexer;
use cyclone::pollset::RemoteSocketManagerFactory;
use cyclone::socket::{StreamSocket, TcpStreamSocket};
use cyclone::timer::TimeoutId;
use cyclone::transport::{ReceivePolicy, StreamTransport};

/// Appends consumed bytes to an internal buffer and flushes the whole
/// buffer on the next `produce`.
#[derive(Default)]
pub struct MirrorLayer {
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

/// Builds a `stream_transport<adaptor<mirror>>` manager per accepted
/// connection.
pub struct MirrorFactory;

impl SocketManagerFactory for MirrorFactory {
    fn make(&self, handle: TcpStreamSocket, _mpx: &Multiplexer) -> SharedManager {
        let config = Config::default();
        let transport = StreamTransport::new(StreamSocket(handle.0), TransportAdaptor::new(MirrorLayer::default()), &config);
        share(transport)
    }
}
impl RemoteSocketManagerFactory for MirrorFactory {}

/// A bare reactor running on its own thread with no listener, for
/// scenarios that drive the multiplexer purely through timers or the
/// cross-thread control channel. Mirrors the bring-up `Cyclone::start`
/// does internally, minus the `listen` call.
pub struct BareReactor {
    pub handle: cyclone::pollset::MultiplexerHandle,
    worker: Option<std::thread::JoinHandle<Result<()>>>,
}

impl BareReactor {
    /// Spawns the reactor thread. `setup` runs on that thread with the
    /// freshly built multiplexer before the loop starts, so it can
    /// register managers directly (same-thread `add`, not the
    /// cross-thread control channel).
    pub fn spawn<F>(setup: F) -> Self
    where
        F: FnOnce(&Multiplexer) + Send + 'static,
    {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || -> Result<()> {
            let mpx = Multiplexer::new()?;
            let handle = mpx.handle();
            setup(&mpx);
            let _ = ready_tx.send(handle);
            mpx.run()
        });
        let handle = ready_rx.recv().expect("reactor thread failed to start");
        Self { handle, worker: Some(worker) }
    }

    pub fn join(mut self) -> Result<()> {
        self.handle.shutdown();
        self.worker.take().unwrap().join().expect("reactor thread panicked")
    }
}
