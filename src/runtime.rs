//! Top-level convenience wrapper tying configuration, the multiplexer,
//! and a connection factory together for an application: `start`
//! spawns the reactor thread and blocks until it is ready, `join` waits
//! for it to exit.
//!
//! [`Multiplexer`] is reactor-thread-confined by construction (its
//! registration table is `Rc`-keyed), so unlike a typical Rust
//! "runtime" type it cannot be built on one thread and handed to
//! another. [`Cyclone::start`] resolves that by constructing the
//! multiplexer *on* the worker thread it will run on, and letting only
//! the thread-safe [`MultiplexerHandle`] escape back to the caller.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manager::SharedManager;
use crate::multiplexer::Multiplexer;
use crate::pollset::{MultiplexerHandle, RemoteSocketManagerFactory};
use crate::socket::{TcpStreamSocket, MAX_CONN_BACKLOG};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Installs a `tracing` subscriber from `config`'s `log.terminal`/
/// `log.file` knobs. Library code never calls this itself; only
/// applications (the `demos/` binaries, integration tests) do.
pub fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_terminal {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

fn bind_addr(config: &Config) -> SocketAddr {
    let ip = if config.bind_loopback {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, config.port)
}

/// Adapts an `Arc`-held, cross-thread-safe factory to the `Rc`-based
/// [`crate::factory::SocketManagerFactory`] the reactor thread's
/// [`Multiplexer::listen`] expects, so applications can build their
/// factory once (on whatever thread constructs a [`Cyclone`]) and hand
/// it across the spawn boundary as a plain `Arc`.
struct ArcFactory(Arc<dyn RemoteSocketManagerFactory>);

impl crate::factory::SocketManagerFactory for ArcFactory {
    fn make(&self, handle: TcpStreamSocket, mpx: &Multiplexer) -> SharedManager {
        self.0.make(handle, mpx)
    }
}

/// Not yet running: owns the configuration that [`Cyclone::start`]
/// will apply.
pub struct Cyclone {
    config: Config,
}

enum StartupResult {
    Ready(MultiplexerHandle, u16),
    Failed(Error),
}

impl Cyclone {
    /// Build a `Cyclone` from `config`; nothing happens until `start`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawns the reactor's worker thread, builds the multiplexer on
    /// it, binds a listener at `config.port`/`config.bind_loopback`,
    /// registers `factory` as the acceptor's connection factory, and
    /// runs the reactor loop until [`RunningCyclone::shutdown`]. Blocks
    /// the calling thread only until the listener is bound and its port
    /// known, not for the lifetime of the loop.
    pub fn start(self, factory: Arc<dyn RemoteSocketManagerFactory>) -> Result<RunningCyclone> {
        let (ready_tx, ready_rx) = mpsc::channel::<StartupResult>();
        let config = self.config;
        let addr = bind_addr(&config);
        let worker: JoinHandle<Result<()>> = std::thread::Builder::new()
            .name("cyclone-reactor".into())
            .spawn(move || -> Result<()> {
                let mpx = match Multiplexer::new() {
                    Ok(mpx) => mpx,
                    Err(e) => {
                        let _ = ready_tx.send(StartupResult::Failed(e));
                        return Ok(());
                    }
                };
                let handle = mpx.handle();
                let local_factory: Rc<dyn crate::factory::SocketManagerFactory> =
                    Rc::new(ArcFactory(factory));
                match mpx.listen(addr, local_factory, MAX_CONN_BACKLOG) {
                    Ok(port) => {
                        let _ = ready_tx.send(StartupResult::Ready(handle, port));
                    }
                    Err(e) => {
                        let _ = ready_tx.send(StartupResult::Failed(e));
                        return Ok(());
                    }
                }
                mpx.run()
            })
            .map_err(|e| Error::runtime(format!("failed to spawn reactor thread: {e}")))?;

        match ready_rx.recv() {
            Ok(StartupResult::Ready(handle, port)) => Ok(RunningCyclone { handle, port, worker: Some(worker) }),
            Ok(StartupResult::Failed(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let join_err = worker.join();
                match join_err {
                    Ok(Err(e)) => Err(e),
                    _ => Err(Error::runtime("reactor thread exited before becoming ready")),
                }
            }
        }
    }
}

/// A reactor running on its own worker thread. Cheaply cloned handles
/// ([`MultiplexerHandle`]) are available via [`RunningCyclone::handle`]
/// for other threads to drive `enable`/`disable`/`connect`/`shutdown`.
pub struct RunningCyclone {
    handle: MultiplexerHandle,
    port: u16,
    worker: Option<JoinHandle<Result<()>>>,
}

impl RunningCyclone {
    /// The port the listener ended up bound to (useful when the
    /// configured port was 0, i.e. ephemeral).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A cheaply cloned, thread-safe handle onto the running reactor.
    pub fn handle(&self) -> MultiplexerHandle {
        self.handle.clone()
    }

    /// Requests an orderly shutdown from a foreign thread: enqueues the
    /// request and returns immediately.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Blocks until the worker thread exits, returning its result.
    pub fn join(mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .unwrap_or_else(|_| Err(Error::runtime("reactor thread panicked"))),
            None => Ok(()),
        }
    }
}

impl Drop for RunningCyclone {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.handle.shutdown();
            let _ = worker.join();
        }
    }
}
