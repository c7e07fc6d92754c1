//! Acceptor: the manager bound to a listening socket, turning each
//! incoming connection into a new manager via a
//! [`SocketManagerFactory`] and handing it to the multiplexer.

use crate::error::Error;
use crate::factory::SocketManagerFactory;
use crate::manager::{share, EventResult, ManagerBase, Operation, SocketManager};
use crate::multiplexer::Multiplexer;
use crate::socket::{self, TcpAcceptSocket};
use crate::timer::TimeoutId;
use std::rc::Rc;

/// Owns a listening socket and repeatedly accepts connections off it,
/// handing each to `factory` and registering the result with the
/// multiplexer for reading.
pub struct Acceptor {
    base: ManagerBase,
    factory: Rc<dyn SocketManagerFactory>,
}

impl Acceptor {
    /// Build an acceptor over an already-listening `handle`.
    pub fn new(handle: TcpAcceptSocket, factory: Rc<dyn SocketManagerFactory>) -> Self {
        Self {
            base: ManagerBase::new(handle.0),
            factory,
        }
    }
}

impl SocketManager for Acceptor {
    fn init(&mut self, _mpx: &Multiplexer) -> crate::error::Result<()> {
        Ok(())
    }

    fn handle_read_event(&mut self, mpx: &Multiplexer) -> EventResult {
        // mio registers fds edge-triggered, so a single readiness
        // notification may stand for several pending connections in the
        // backlog; accept in a loop until the call would block, rather
        // than handling one and waiting for the next edge, which might
        // never come.
        let accept_sock = TcpAcceptSocket(self.base.handle());
        loop {
            let accepted = match socket::accept(accept_sock) {
                Some(s) => s,
                None => {
                    if !socket::last_socket_error_is_temporary() {
                        mpx.handle_error(Error::socket_operation_failed(format!(
                            "accepting failed: {}",
                            socket::last_socket_error_as_string()
                        )));
                    }
                    return EventResult::Ok;
                }
            };
            if let Err(e) = socket::nonblocking(accepted.0, true) {
                mpx.handle_error(Error::socket_operation_failed(format!(
                    "nonblocking failed: {e}"
                )));
                continue;
            }
            tracing::debug!(fd = accepted.0.raw_fd(), "accepted connection");
            let mgr = self.factory.make(accepted, mpx);
            mpx.add(mgr, Operation::READ);
        }
    }

    fn handle_write_event(&mut self, mpx: &Multiplexer) -> EventResult {
        mpx.handle_error(Error::runtime(
            "acceptor should not be registered for writing",
        ));
        EventResult::Error
    }

    fn handle_timeout(&mut self, mpx: &Multiplexer, _id: TimeoutId) -> EventResult {
        mpx.handle_error(Error::runtime("acceptor does not use timeouts"));
        EventResult::Error
    }

    fn base(&self) -> &ManagerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ManagerBase {
        &mut self.base
    }
}

/// Convenience wrapper mirroring `share()` for constructing an
/// acceptor's `SharedManager` in one call.
pub fn share_acceptor(handle: TcpAcceptSocket, factory: Rc<dyn SocketManagerFactory>) -> crate::manager::SharedManager {
    share(Acceptor::new(handle, factory))
}
