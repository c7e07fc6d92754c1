//! Stream transport: the `SocketManager` that owns a connected
//! byte-stream socket, pumps bytes in and out of it, and drives the
//! layer stack mounted on top of it.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layer::{Down, Layer};
use crate::manager::{ops, EventResult, ManagerBase, SocketManager};
use crate::multiplexer::Multiplexer;
use crate::socket::{self, Socket, StreamSocket};
use crate::timer::TimeoutId;
use bytes::BytesMut;
use std::time::{Duration, SystemTime};

/// Bounds on how much a layer wants to read before `consume` is called
/// again. `min_size` is the least number of bytes the transport should
/// accumulate before dispatching; `max_size` bounds how large a single
/// `consume` call's slice can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivePolicy {
    pub min_size: usize,
    pub max_size: usize,
}

impl ReceivePolicy {
    /// Wait for exactly `n` bytes before dispatching.
    pub fn exactly(n: usize) -> Self {
        Self { min_size: n, max_size: n }
    }

    /// Dispatch as soon as anything is available, up to `n` bytes.
    pub fn up_to(n: usize) -> Self {
        Self { min_size: 1, max_size: n }
    }

    /// Dispatch once at least `min` bytes are available, capped at `max`.
    pub fn between(min: usize, max: usize) -> Self {
        debug_assert!(min <= max);
        Self { min_size: min, max_size: max }
    }

    /// Stop reading entirely until reconfigured (`min_size` and
    /// `max_size` both zero is interpreted by the transport as "don't
    /// arm reads").
    pub fn stop() -> Self {
        Self { min_size: 0, max_size: 0 }
    }

    fn is_stopped(self) -> bool {
        self.max_size == 0
    }
}

/// The transport's own half of the layer contract: owns the read and
/// write buffers and the socket's interest mask, and is handed to the
/// mounted layer stack as `&mut dyn Down` on every call.
pub struct TransportDown {
    base: ManagerBase,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    min_read_size: usize,
    max_read_size: usize,
    reads_armed: bool,
}

/// Read buffer capacity a transport starts with before its first
/// `configure_next_read` call.
const DEFAULT_READ_SIZE: usize = 2048;

impl TransportDown {
    fn new(handle: Socket, initial_read_size: usize) -> Self {
        let max_read_size = initial_read_size.max(1);
        Self {
            base: ManagerBase::new(handle),
            read_buffer: BytesMut::with_capacity(max_read_size),
            write_buffer: BytesMut::new(),
            min_read_size: 1,
            max_read_size,
            reads_armed: true,
        }
    }
}

impl Down for TransportDown {
    fn configure_next_read(&mut self, policy: ReceivePolicy) {
        if policy.is_stopped() {
            self.reads_armed = false;
            return;
        }
        self.reads_armed = true;
        self.min_read_size = policy.min_size.max(1);
        self.max_read_size = policy.max_size.max(self.min_read_size);
        if self.read_buffer.capacity() < self.max_read_size {
            self.read_buffer
                .reserve(self.max_read_size - self.read_buffer.capacity());
        }
    }

    fn write_buffer(&mut self) -> &mut BytesMut {
        &mut self.write_buffer
    }

    fn enqueue(&mut self, bytes: &[u8]) {
        self.write_buffer.extend_from_slice(bytes);
    }

    fn handle_error(&mut self, mpx: &Multiplexer, err: Error) {
        ops::handle_error(mpx, err);
    }

    fn register_writing(&mut self, mpx: &Multiplexer) {
        ops::register_writing(mpx, &mut self.base);
    }

    fn set_timeout_in(&mut self, mpx: &Multiplexer, duration: Duration) -> TimeoutId {
        ops::set_timeout_in(mpx, &self.base, duration)
    }

    fn set_timeout_at(&mut self, mpx: &Multiplexer, point: SystemTime) -> TimeoutId {
        ops::set_timeout_at(mpx, &self.base, point)
    }
}

/// Owns a connected stream socket and a layer stack `L` mounted on top
/// of it. Bridges OS readiness events to the stack's `Layer` calls.
pub struct StreamTransport<L> {
    down: TransportDown,
    application: L,
    initialized: bool,
    max_consecutive_reads: usize,
    max_consecutive_writes: usize,
    max_consecutive_fetches: usize,
}

impl<L: Layer> StreamTransport<L> {
    /// Build a transport over `socket`, with `application` mounted on
    /// top of it. The three `max_consecutive_*` tunables come from
    /// `config`.
    pub fn new(socket: StreamSocket, application: L, config: &Config) -> Self {
        Self {
            down: TransportDown::new(socket.0, DEFAULT_READ_SIZE),
            application,
            initialized: false,
            max_consecutive_reads: config.max_consecutive_reads,
            max_consecutive_writes: config.max_consecutive_writes,
            max_consecutive_fetches: config.max_consecutive_fetches,
        }
    }

    /// Borrow the mounted application layer.
    pub fn application(&self) -> &L {
        &self.application
    }

    /// Reads at most one OS-level chunk into the read buffer, bounded
    /// by how much room is left before `max_read_size`: a single
    /// `read(2)` never hands the layer above more than the policy's
    /// `max_size` in one `consume` call.
    fn fill_read_buffer(&mut self) -> std::result::Result<usize, Error> {
        let fd = self.down.base.handle().raw_fd();
        let len = self.down.read_buffer.len();
        let spare = self.down.max_read_size.saturating_sub(len);
        if spare == 0 {
            return Ok(0);
        }
        let mut scratch = vec![0u8; spare];
        let n = unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, spare) };
        if n < 0 {
            let err = socket::last_socket_error();
            if socket::last_socket_error_is_temporary() {
                return Ok(0);
            }
            return Err(Error::from(err));
        }
        if n == 0 {
            tracing::debug!(fd, "peer closed the connection");
            return Err(Error::socket_operation_failed("peer closed the connection"));
        }
        let n = n as usize;
        self.down.read_buffer.extend_from_slice(&scratch[..n]);
        Ok(n)
    }

    fn drain_write_buffer(&mut self) -> std::result::Result<bool, Error> {
        let fd = self.down.base.handle().raw_fd();
        while !self.down.write_buffer.is_empty() {
            let n = unsafe {
                libc::write(
                    fd,
                    self.down.write_buffer.as_ptr() as *const libc::c_void,
                    self.down.write_buffer.len(),
                )
            };
            if n < 0 {
                if socket::last_socket_error_is_temporary() {
                    return Ok(false);
                }
                return Err(Error::from(socket::last_socket_error()));
            }
            let _ = self.down.write_buffer.split_to(n as usize);
        }
        Ok(true)
    }
}

impl<L: Layer> SocketManager for StreamTransport<L> {
    fn init(&mut self, mpx: &Multiplexer) -> Result<()> {
        socket::nonblocking(self.down.base.handle(), true)?;
        self.application.init(&mut self.down, mpx)?;
        ops::register_reading(mpx, &mut self.down.base);
        if self.application.has_more_data() {
            ops::register_writing(mpx, &mut self.down.base);
        }
        self.initialized = true;
        Ok(())
    }

    fn handle_read_event(&mut self, mpx: &Multiplexer) -> EventResult {
        if !self.down.reads_armed {
            return EventResult::Done;
        }
        for _ in 0..self.max_consecutive_reads {
            match self.fill_read_buffer() {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    self.down.handle_error(mpx, e);
                    return EventResult::Error;
                }
            }
            if self.down.read_buffer.len() < self.down.min_read_size {
                continue;
            }
            // Copy the accumulated bytes out before handing the stack
            // a mutable `Down` into the very buffer they came from —
            // a layer is free to call `configure_next_read` (which
            // resizes `read_buffer`) from within `consume`.
            let chunk = self.down.read_buffer.split_to(self.down.read_buffer.len());
            match self.application.consume(&mut self.down, mpx, &chunk) {
                EventResult::Ok => {}
                EventResult::Done => return EventResult::Done,
                EventResult::Error => return EventResult::Error,
            }
        }
        if self.application.has_more_data() {
            ops::register_writing(mpx, &mut self.down.base);
        }
        EventResult::Ok
    }

    fn handle_write_event(&mut self, mpx: &Multiplexer) -> EventResult {
        for _ in 0..self.max_consecutive_writes {
            let mut fetches = 0;
            while self.down.write_buffer.is_empty() && self.application.has_more_data() && fetches < self.max_consecutive_fetches {
                fetches += 1;
                match self.application.produce(&mut self.down, mpx) {
                    EventResult::Ok | EventResult::Done => {}
                    EventResult::Error => return EventResult::Error,
                }
            }
            if self.down.write_buffer.is_empty() {
                break;
            }
            match self.drain_write_buffer() {
                Ok(true) => {}
                Ok(false) => return EventResult::Ok,
                Err(e) => {
                    self.down.handle_error(mpx, e);
                    return EventResult::Error;
                }
            }
        }
        if self.down.write_buffer.is_empty() && !self.application.has_more_data() {
            EventResult::Done
        } else {
            EventResult::Ok
        }
    }

    fn handle_timeout(&mut self, mpx: &Multiplexer, id: TimeoutId) -> EventResult {
        self.application.handle_timeout(&mut self.down, mpx, id)
    }

    fn base(&self) -> &ManagerBase {
        &self.down.base
    }

    fn base_mut(&mut self) -> &mut ManagerBase {
        &mut self.down.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_sets_equal_bounds() {
        let p = ReceivePolicy::exactly(7);
        assert_eq!(p.min_size, 7);
        assert_eq!(p.max_size, 7);
    }

    #[test]
    fn up_to_accepts_partial_reads() {
        let p = ReceivePolicy::up_to(100);
        assert_eq!(p.min_size, 1);
        assert_eq!(p.max_size, 100);
    }

    #[test]
    fn between_orders_bounds() {
        let p = ReceivePolicy::between(4, 16);
        assert_eq!(p.min_size, 4);
        assert_eq!(p.max_size, 16);
    }

    #[test]
    fn stop_disables_reads_on_configure() {
        let mut down = TransportDown::new(crate::socket::INVALID_SOCKET, 64);
        down.configure_next_read(ReceivePolicy::stop());
        assert!(!down.reads_armed);
        down.configure_next_read(ReceivePolicy::up_to(32));
        assert!(down.reads_armed);
    }

    #[test]
    fn enqueue_appends_to_write_buffer() {
        let mut down = TransportDown::new(crate::socket::INVALID_SOCKET, 64);
        down.enqueue(b"abc");
        down.enqueue(b"def");
        assert_eq!(&down.write_buffer[..], b"abcdef");
    }
}
