//! Cyclone is a single-machine, single-threaded reactor for composing
//! TCP (and, secondarily, UDP) connections out of a stack of protocol
//! layers: a byte-stream transport at the bottom, an optional TLS layer
//! in the middle, and an application layer on top.
//!
//! The three pieces that make up the core are tightly coupled and are
//! all implemented in this crate:
//!
//! - [`multiplexer`]: the reactor itself — readiness polling (via
//!   [`mio`](https://docs.rs/mio)), a registration table of managers, a
//!   timer heap, and the cross-thread control channel.
//! - [`transport`] and [`layer`]: the per-connection read/write loop,
//!   receive-policy-driven framing, and the up/down-facing contract that
//!   lets layers compose.
//! - [`tls`]: a memory-buffer-driven TLS layer built on
//!   [`rustls`](https://docs.rs/rustls).
//! - [`datagram`]: the secondary, UDP-oriented counterpart to
//!   [`transport`] for connections with no byte-stream framing.
//!
//! # Composing a connection
//!
//! A connection is one concrete type: a [`transport::StreamTransport`]
//! generic over whatever [`layer::Layer`] is mounted on top of it (an
//! application layer directly via [`layer::TransportAdaptor`], or a
//! [`tls::TlsLayer`] wrapping the application). A
//! [`factory::SocketManagerFactory`] builds that type once per accepted
//! connection; [`runtime::Cyclone`] ties configuration, the
//! multiplexer, and the factory together for an application.
//!
//! ```no_run
//! use cyclone::config::Config;
//! use cyclone::runtime::Cyclone;
//!
//! # fn main() -> cyclone::error::Result<()> {
//! let cyclone = Cyclone::new(Config::default());
//! // `start` spawns the reactor thread, binds the listener, and runs an
//! // acceptor that builds a manager per connection via the supplied
//! // factory; see `demos/mirror.rs` for a full example.
//! # let factory: std::sync::Arc<dyn cyclone::pollset::RemoteSocketManagerFactory> = unimplemented!();
//! let running = cyclone.start(factory)?;
//! running.shutdown();
//! running.join()
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod acceptor;
pub mod config;
pub mod datagram;
pub mod error;
pub mod factory;
pub mod layer;
pub mod manager;
pub mod multiplexer;
pub mod pollset;
pub mod runtime;
pub mod socket;
pub mod timer;
pub mod transport;

#[cfg(feature = "tls")]
pub mod tls;

pub use config::Config;
pub use error::{Error, Result};
pub use multiplexer::Multiplexer;
pub use runtime::Cyclone;
