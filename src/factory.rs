//! Socket manager factory: how an acceptor turns a freshly accepted
//! socket into the manager that will own it.

use crate::manager::SharedManager;
use crate::multiplexer::Multiplexer;
use crate::socket::TcpStreamSocket;

/// Builds the manager for each connection an acceptor accepts. One
/// factory instance is shared across every connection accepted through
/// a given listening socket, which is why `make` takes `&self` rather
/// than consuming the factory.
pub trait SocketManagerFactory {
    /// Construct the manager that will own `handle`, already wrapped
    /// for the registration table.
    fn make(&self, handle: TcpStreamSocket, mpx: &Multiplexer) -> SharedManager;
}

/// A factory built from a closure, for the common case where the
/// manager construction has no state of its own beyond what it
/// captures.
pub struct FnFactory<F> {
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn(TcpStreamSocket, &Multiplexer) -> SharedManager,
{
    /// Wrap `build` as a [`SocketManagerFactory`].
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F> SocketManagerFactory for FnFactory<F>
where
    F: Fn(TcpStreamSocket, &Multiplexer) -> SharedManager,
{
    fn make(&self, handle: TcpStreamSocket, mpx: &Multiplexer) -> SharedManager {
        (self.build)(handle, mpx)
    }
}
