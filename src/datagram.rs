//! Datagram transport: the secondary, UDP-oriented counterpart to
//! [`crate::transport::StreamTransport`].
//!
//! Unlike the stream transport there is no byte-stream framing to
//! speak of: every `recvfrom` is one already-delimited packet, and
//! every outbound write names its own destination. This module carries
//! only that much — raw send/recv bounded by the same
//! `max_consecutive_*` tunables as the stream side — and nothing of
//! the layer-stack machinery in `layer.rs`.

use crate::config::Config;
use crate::error::Error;
use crate::manager::{ops, EventResult, ManagerBase, SocketManager};
use crate::multiplexer::Multiplexer;
use crate::socket::{self, UdpDatagramSocket};
use crate::timer::TimeoutId;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Largest single packet this transport will `recvfrom` in one call.
pub const MAX_DATAGRAM_SIZE: usize = 576;

/// What a [`DatagramManager`] drives per packet: ingest one received
/// datagram, and optionally produce more to send.
pub trait DatagramApplication {
    /// Ingest one datagram received from `from`.
    fn consume(&mut self, mpx: &Multiplexer, from: SocketAddr, bytes: &[u8]) -> EventResult;

    /// Whether there is an outbound packet queued.
    fn has_more_data(&mut self) -> bool;

    /// Pull the next outbound `(destination, payload)` pair, if any.
    fn produce(&mut self) -> Option<(SocketAddr, Vec<u8>)>;

    /// Handle an expired timer.
    fn handle_timeout(&mut self, mpx: &Multiplexer, id: TimeoutId) -> EventResult {
        let _ = (mpx, id);
        EventResult::Ok
    }
}

/// Owns a bound UDP socket and pumps whole datagrams to/from a
/// [`DatagramApplication`], bounded by the same `max_consecutive_*`
/// tunables as the stream transport.
pub struct DatagramManager<A> {
    base: ManagerBase,
    application: A,
    pending_writes: VecDeque<(SocketAddr, Vec<u8>)>,
    max_consecutive_reads: usize,
    max_consecutive_writes: usize,
    max_consecutive_fetches: usize,
}

impl<A: DatagramApplication> DatagramManager<A> {
    /// Build a manager over `socket` with `application` mounted on top.
    pub fn new(socket: UdpDatagramSocket, application: A, config: &Config) -> Self {
        Self {
            base: ManagerBase::new(socket.0),
            application,
            pending_writes: VecDeque::new(),
            max_consecutive_reads: config.max_consecutive_reads,
            max_consecutive_writes: config.max_consecutive_writes,
            max_consecutive_fetches: config.max_consecutive_fetches,
        }
    }

    fn recv_one(&self) -> std::result::Result<Option<(SocketAddr, Vec<u8>)>, Error> {
        let fd: RawFd = self.base.handle().raw_fd();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut src: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut src_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                MAX_DATAGRAM_SIZE,
                0,
                &mut src as *mut _ as *mut libc::sockaddr,
                &mut src_len,
            )
        };
        if n < 0 {
            if socket::last_socket_error_is_temporary() {
                return Ok(None);
            }
            return Err(Error::from(socket::last_socket_error()));
        }
        // An empty packet is a valid (if useless) datagram, not EOF —
        // UDP has no peer-closed signal.
        let addr = sockaddr_to_socketaddr(&src)?;
        Ok(Some((addr, buf[..n as usize].to_vec())))
    }

    fn send_one(&self, to: SocketAddr, bytes: &[u8]) -> std::result::Result<bool, Error> {
        let fd: RawFd = self.base.handle().raw_fd();
        let (raw, len) = socketaddr_to_sockaddr(to);
        let n = unsafe {
            libc::sendto(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
                &raw as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if n < 0 {
            if socket::last_socket_error_is_temporary() {
                return Ok(false);
            }
            return Err(Error::from(socket::last_socket_error()));
        }
        Ok(true)
    }
}

impl<A: DatagramApplication> SocketManager for DatagramManager<A> {
    fn init(&mut self, mpx: &Multiplexer) -> crate::error::Result<()> {
        socket::nonblocking(self.base.handle(), true)?;
        ops::register_reading(mpx, &mut self.base);
        Ok(())
    }

    fn handle_read_event(&mut self, mpx: &Multiplexer) -> EventResult {
        for _ in 0..self.max_consecutive_reads {
            match self.recv_one() {
                Ok(Some((from, bytes))) => {
                    if self.application.consume(mpx, from, &bytes) == EventResult::Error {
                        return EventResult::Error;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    ops::handle_error(mpx, e);
                    return EventResult::Error;
                }
            }
        }
        if self.application.has_more_data() {
            ops::register_writing(mpx, &mut self.base);
        }
        EventResult::Ok
    }

    fn handle_write_event(&mut self, mpx: &Multiplexer) -> EventResult {
        for _ in 0..self.max_consecutive_writes {
            if self.pending_writes.is_empty() {
                let mut fetched = false;
                for _ in 0..self.max_consecutive_fetches {
                    match self.application.produce() {
                        Some(pkt) => {
                            self.pending_writes.push_back(pkt);
                            fetched = true;
                        }
                        None => break,
                    }
                }
                if !fetched {
                    return EventResult::Done;
                }
            }
            let Some((to, bytes)) = self.pending_writes.front().cloned() else {
                return EventResult::Done;
            };
            match self.send_one(to, &bytes) {
                Ok(true) => {
                    self.pending_writes.pop_front();
                }
                Ok(false) => return EventResult::Ok,
                Err(e) => {
                    ops::handle_error(mpx, e);
                    return EventResult::Error;
                }
            }
        }
        if self.pending_writes.is_empty() && !self.application.has_more_data() {
            EventResult::Done
        } else {
            EventResult::Ok
        }
    }

    fn handle_timeout(&mut self, mpx: &Multiplexer, id: TimeoutId) -> EventResult {
        self.application.handle_timeout(mpx, id)
    }

    fn base(&self) -> &ManagerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ManagerBase {
        &mut self.base
    }
}

fn sockaddr_to_socketaddr(storage: &libc::sockaddr_storage) -> crate::error::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr_in: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let addr_in6: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        other => Err(Error::socket_operation_failed(format!(
            "recvfrom returned unsupported address family {other}"
        ))),
    }
}

fn socketaddr_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::rc::Rc;

    /// Echoes every datagram back to its sender, recording what it saw
    /// for the test to assert on.
    struct EchoApplication {
        seen: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
        outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    }

    impl DatagramApplication for EchoApplication {
        fn consume(&mut self, _mpx: &Multiplexer, from: SocketAddr, bytes: &[u8]) -> EventResult {
            self.seen.borrow_mut().push((from, bytes.to_vec()));
            self.outbox.push_back((from, bytes.to_vec()));
            EventResult::Ok
        }
        fn has_more_data(&mut self) -> bool {
            !self.outbox.is_empty()
        }
        fn produce(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
            self.outbox.pop_front()
        }
    }

    #[test]
    fn datagram_round_trip_over_loopback() {
        let any = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        let server_sock = socket::make_udp_datagram_socket(any).unwrap();
        let server_port = socket::port_of(server_sock.0).unwrap();
        let client_sock = socket::make_udp_datagram_socket(any).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let config = Config::default();
        let manager = DatagramManager::new(
            server_sock,
            EchoApplication {
                seen: seen.clone(),
                outbox: VecDeque::new(),
            },
            &config,
        );
        let mpx = Multiplexer::new_for_test();
        let shared = crate::manager::share(manager);
        mpx.add(shared.clone(), crate::manager::Operation::empty());

        let server_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), server_port);
        let fd = client_sock.0.raw_fd();
        let (raw, len) = socketaddr_to_sockaddr(server_addr);
        let payload = b"hello udp";
        let n = unsafe {
            libc::sendto(
                fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                &raw as *const _ as *const libc::sockaddr,
                len,
            )
        };
        assert_eq!(n as usize, payload.len());

        // Drive read handling directly; there is no running reactor
        // loop in this unit test.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let result = shared.borrow_mut().handle_read_event(&mpx);
        assert_eq!(result, EventResult::Ok);
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(&seen.borrow()[0].1, payload);

        socket::close(client_sock.0);
    }
}
