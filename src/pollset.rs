//! Cross-thread entry points into the reactor: the handful of
//! operations a foreign thread may trigger (`enable`/`disable`/
//! `connect`/`shutdown`), and the channel + wake-up pair that carries
//! them onto the reactor thread.
//!
//! There is no byte-oriented wire format here for calls that never
//! leave the process — `crossbeam_channel` plus an `mio::Waker` carries
//! real payloads (a whole `Operation`, a whole `SocketAddr`) directly,
//! rather than opcodes that would need decoding back into them on the
//! other side.

use crate::factory::SocketManagerFactory;
use crate::manager::Operation;
use crate::multiplexer::Multiplexer;
use crate::socket::Socket;
use std::net::SocketAddr;
use std::sync::Arc;

/// A factory usable from the `connect` convenience, which constructs
/// the manager on the reactor thread but is invoked from whichever
/// thread calls `MultiplexerHandle::connect`. Ordinary in-thread
/// factories (`Rc`-based, used by `Acceptor`) need not satisfy this.
pub trait RemoteSocketManagerFactory: SocketManagerFactory + Send + Sync {}
impl<T: SocketManagerFactory + Send + Sync> RemoteSocketManagerFactory for T {}

/// One request queued onto the reactor thread's control channel.
/// Every variant is plain data or a `Send + Sync` factory — never a
/// manager or anything `Rc`-based, since those are reactor-thread
/// confined (see `manager.rs`).
pub enum PollOp {
    /// Re-arm `socket` for `op`.
    Enable(Socket, Operation),
    /// Disarm `socket` for `op`, removing its manager entirely if its
    /// mask becomes empty.
    Disable(Socket, Operation, bool),
    /// Connect to `addr` and hand the result to `factory`, entirely on
    /// the reactor thread.
    Connect(SocketAddr, Arc<dyn RemoteSocketManagerFactory>, Operation),
    /// Begin an orderly shutdown.
    Shutdown,
}

/// A cheaply cloned, `Send + Sync` handle onto a running
/// [`Multiplexer`], usable from any thread. Every method here enqueues
/// a [`PollOp`] and wakes the reactor; none of them touch the
/// multiplexer's internal state directly.
#[derive(Clone)]
pub struct MultiplexerHandle {
    pub(crate) tx: crossbeam_channel::Sender<PollOp>,
    pub(crate) waker: Arc<mio::Waker>,
}

impl MultiplexerHandle {
    fn send(&self, op: PollOp) {
        // A closed channel means the reactor has already shut down;
        // there is nothing left to notify.
        let _ = self.tx.send(op);
        let _ = self.waker.wake();
    }

    /// Re-arm `socket` for `op`.
    pub fn enable(&self, socket: Socket, op: Operation) {
        self.send(PollOp::Enable(socket, op));
    }

    /// Disarm `socket` for `op`.
    pub fn disable(&self, socket: Socket, op: Operation, remove: bool) {
        self.send(PollOp::Disable(socket, op, remove));
    }

    /// Connect to `addr`, constructing the new manager via `factory`
    /// entirely on the reactor thread once the connection completes.
    pub fn connect(&self, addr: SocketAddr, factory: Arc<dyn RemoteSocketManagerFactory>, initial: Operation) {
        self.send(PollOp::Connect(addr, factory, initial));
    }

    /// Begin an orderly shutdown.
    pub fn shutdown(&self) {
        self.send(PollOp::Shutdown);
    }
}

/// Applies one queued request. Called only from the reactor thread,
/// after `poll_once` wakes up because the waker fired.
pub(crate) fn apply(mpx: &Multiplexer, op: PollOp) {
    match op {
        PollOp::Enable(socket, op) => mpx.enable_manager(socket, op),
        PollOp::Disable(socket, mask, remove) => mpx.disable_socket(socket, mask, remove),
        PollOp::Connect(addr, factory, initial) => mpx.handle_connect(addr, factory.as_ref(), initial),
        PollOp::Shutdown => mpx.shutdown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MultiplexerHandle>();
    }
}
