//! The multiplexer: owns the OS poller, the registration table, and
//! the timer set, and is the reactor loop itself.
//!
//! mio's `Poll` already abstracts epoll/kqueue/IOCP behind one type, so
//! there is no separate platform-specific multiplexer class to
//! maintain for each backend — one dependency covers the portability
//! story.
//!
//! The multiplexer is confined to the thread that drives it: its
//! mutable state sits behind a `RefCell`, not a `Mutex`, because
//! nothing outside that thread ever touches it directly. Foreign
//! threads act through [`crate::pollset::MultiplexerHandle`] instead.

use crate::acceptor::Acceptor;
use crate::error::{Error, Result};
use crate::factory::SocketManagerFactory;
use crate::manager::{share, EventResult, Operation, SharedManager};
use crate::pollset::{self, MultiplexerHandle, PollOp, RemoteSocketManagerFactory};
use crate::socket::{self, Socket, TcpStreamSocket};
use crate::timer::TimerSet;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

fn token_of(socket: Socket) -> Token {
    Token(socket.raw_fd() as usize)
}

fn socket_of(token: Token) -> Socket {
    Socket::from_raw_fd(token.0 as RawFd)
}

fn interest_of(mask: Operation) -> Option<Interest> {
    match (mask.contains(Operation::READ), mask.contains(Operation::WRITE)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

struct Inner {
    poll: Poll,
    events: Events,
    registry: HashMap<Socket, SharedManager>,
    /// Sockets currently registered with the OS poller. A manager can
    /// be in `registry` without being in `polled` (a manager with an
    /// empty interest mask, driven only by timers); `mio::Interest`
    /// has no empty variant, so there is nothing to hand
    /// `register`/`reregister` for such a manager.
    polled: HashSet<Socket>,
    timers: TimerSet,
    running: bool,
    shutting_down: bool,
}

/// The reactor. One instance owns one OS poller and every connection
/// registered with it.
pub struct Multiplexer {
    inner: RefCell<Inner>,
    control_tx: crossbeam_channel::Sender<PollOp>,
    control_rx: crossbeam_channel::Receiver<PollOp>,
    waker: Arc<mio::Waker>,
}

impl Multiplexer {
    /// Creates a multiplexer with no listeners or connections yet.
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(Error::from)?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::from)?);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            inner: RefCell::new(Inner {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
                registry: HashMap::new(),
                polled: HashSet::new(),
                timers: TimerSet::new(),
                running: true,
                shutting_down: false,
            }),
            control_tx,
            control_rx,
            waker,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self::new().expect("mio::Poll::new should succeed in tests")
    }

    /// A cheaply cloned, thread-safe handle for triggering `add`/
    /// `enable`/`disable`/`shutdown`/`connect` from another thread.
    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            tx: self.control_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Whether the reactor loop should keep running.
    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Number of managers currently in the registration table.
    pub fn manager_count(&self) -> usize {
        self.inner.borrow().registry.len()
    }

    /// Binds, listens, and registers an [`Acceptor`] for `addr`,
    /// returning the bound port (useful when `addr`'s port is 0).
    pub fn listen(&self, addr: SocketAddr, factory: Rc<dyn SocketManagerFactory>, backlog: i32) -> Result<u16> {
        let (accept_sock, port) = socket::make_tcp_accept_socket(addr, backlog)?;
        let acceptor = share(Acceptor::new(accept_sock, factory));
        self.add(acceptor, Operation::READ);
        Ok(port)
    }

    /// Registers `mgr`, arms it for `initial`, and calls its `init`.
    /// Not thread-safe; must be called from the reactor thread.
    /// Foreign threads go through [`MultiplexerHandle::connect`]
    /// instead.
    pub fn add(&self, mgr: SharedManager, initial: Operation) {
        let socket = mgr.borrow().handle();
        mgr.borrow_mut().base_mut().mask_add(initial);
        if let Err(e) = socket::nonblocking(socket, true) {
            self.handle_error(Error::socket_operation_failed(format!(
                "could not set nonblocking: {e}"
            )));
            return;
        }
        let mask = mgr.borrow().mask();
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(interest) = interest_of(mask) {
                let fd = socket.raw_fd();
                let mut source = SourceFd(&fd);
                if let Err(e) = inner.poll.registry().register(&mut source, token_of(socket), interest) {
                    drop(inner);
                    self.handle_error(Error::from(e));
                    return;
                }
                inner.polled.insert(socket);
            }
            // Always tracked in the registration table, even with an
            // empty mask, so a timer-only manager can still be looked
            // up by `set_timeout`/`remove_manager`.
            inner.registry.insert(socket, mgr.clone());
        }
        if let Err(e) = mgr.borrow_mut().init(self) {
            self.handle_error(e);
        }
    }

    /// Arms `socket` for `mask` if that grows its currently registered
    /// interest. `mask` here is already the manager's full, up to date
    /// mask: called by `manager::ops::register_reading`/
    /// `register_writing`, which mutate `ManagerBase.mask` themselves
    /// (they hold a direct `&mut ManagerBase` into a manager whose
    /// `RefCell` is already borrowed by the in-progress callback, so
    /// this must not re-borrow it via the registry).
    pub(crate) fn enable_socket(&self, socket: Socket, mask: Operation) {
        if let Err(e) = self.reregister_poller(socket, mask) {
            self.handle_error(e);
        }
    }

    /// Arms `op` for `socket`'s manager, looking the manager up in the
    /// registry and growing its `ManagerBase.mask` itself. Unlike
    /// [`Self::enable_socket`], this is the entry point for requests
    /// that did not originate from inside the manager's own callback
    /// (the cross-thread `PollOp::Enable` path), so it is free to
    /// borrow the manager fresh — and must, since nothing else updates
    /// its mask for this path, which would otherwise let the poller's
    /// registered interest drift from `ManagerBase.mask()`.
    pub(crate) fn enable_manager(&self, socket: Socket, op: Operation) {
        let mgr = { self.inner.borrow().registry.get(&socket).cloned() };
        let Some(mgr) = mgr else { return };
        let grew;
        let mask_now;
        {
            let mut m = mgr.borrow_mut();
            grew = m.base_mut().mask_add(op);
            mask_now = m.mask();
        }
        if grew {
            self.enable_socket(socket, mask_now);
        }
    }

    /// Disarms `op` for `socket`; if its mask becomes empty and
    /// `remove` is set, drops the manager entirely.
    pub(crate) fn disable_socket(&self, socket: Socket, op: Operation, remove: bool) {
        let mgr = { self.inner.borrow().registry.get(&socket).cloned() };
        let Some(mgr) = mgr else { return };
        let changed;
        let mask_now;
        {
            let mut m = mgr.borrow_mut();
            changed = m.base_mut().mask_del(op);
            mask_now = m.mask();
        }
        if changed {
            if let Err(e) = self.reregister_poller(socket, mask_now) {
                self.handle_error(e);
                return;
            }
        }
        // A manager whose mask was already empty (a timer-only
        // manager) never registers a mask change, but shutdown still
        // needs to remove it.
        if remove && mask_now.is_empty() {
            self.remove_manager(socket);
        }
    }

    fn reregister_poller(&self, socket: Socket, mask: Operation) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let fd = socket.raw_fd();
        let mut source = SourceFd(&fd);
        let was_polled = inner.polled.contains(&socket);
        match (interest_of(mask), was_polled) {
            (Some(interest), true) => inner
                .poll
                .registry()
                .reregister(&mut source, token_of(socket), interest)
                .map_err(Error::from),
            (Some(interest), false) => {
                let result = inner
                    .poll
                    .registry()
                    .register(&mut source, token_of(socket), interest)
                    .map_err(Error::from);
                if result.is_ok() {
                    inner.polled.insert(socket);
                }
                result
            }
            (None, true) => {
                let result = inner.poll.registry().deregister(&mut source).map_err(Error::from);
                inner.polled.remove(&socket);
                result
            }
            (None, false) => Ok(()),
        }
    }

    /// Unconditionally deregisters and drops `socket`'s manager.
    pub(crate) fn remove_manager(&self, socket: Socket) {
        let mut inner = self.inner.borrow_mut();
        if inner.polled.remove(&socket) {
            let fd = socket.raw_fd();
            let mut source = SourceFd(&fd);
            let _ = inner.poll.registry().deregister(&mut source);
        }
        inner.registry.remove(&socket);
        if inner.shutting_down && inner.registry.is_empty() {
            inner.running = false;
        }
    }

    /// Schedules `manager_of(socket)` to receive `handle_timeout(id)`
    /// at `when`, returning the allocated id. Panics if `socket` is not
    /// currently registered — that indicates a manager scheduled a
    /// timeout for itself after being removed, an invariant violation
    /// rather than a recoverable error.
    pub(crate) fn set_timeout(&self, socket: Socket, when: SystemTime) -> crate::timer::TimeoutId {
        let mgr = {
            self.inner
                .borrow()
                .registry
                .get(&socket)
                .cloned()
                .expect("set_timeout called for an unregistered socket")
        };
        self.inner.borrow_mut().timers.insert(mgr, when)
    }

    /// Logs `err` and initiates shutdown.
    pub fn handle_error(&self, err: Error) {
        tracing::error!(error = %err, "reactor error");
        self.shutdown();
    }

    /// Begins an orderly shutdown: disables every registered manager
    /// for both directions, removing those whose mask becomes empty.
    /// Must be called from the reactor thread; foreign threads use
    /// [`MultiplexerHandle::shutdown`].
    pub fn shutdown(&self) {
        tracing::info!(managers = self.manager_count(), "reactor shutting down");
        let sockets: Vec<Socket> = { self.inner.borrow().registry.keys().copied().collect() };
        for socket in sockets {
            self.disable_socket(socket, Operation::READ | Operation::WRITE, true);
        }
        let mut inner = self.inner.borrow_mut();
        inner.shutting_down = true;
        if inner.registry.is_empty() {
            inner.running = false;
        }
    }

    /// Runs a connection attempt to `addr` entirely on the reactor
    /// thread, handing the resulting socket to `factory`.
    pub(crate) fn handle_connect(&self, addr: SocketAddr, factory: &dyn RemoteSocketManagerFactory, initial: Operation) {
        match socket::make_connected_tcp_stream_socket(addr) {
            Ok(sock) => {
                let mgr = factory.make(sock, self);
                self.add(mgr, initial);
            }
            Err(e) => self.handle_error(e),
        }
    }

    /// Runs the reactor loop until shutdown completes.
    pub fn run(&self) -> Result<()> {
        while self.is_running() {
            self.poll_once(true)?;
        }
        Ok(())
    }

    /// Waits for at most one readiness batch (or the next timer
    /// deadline, or forever if `blocking` and nothing is scheduled),
    /// then dispatches every event and expired timer.
    pub fn poll_once(&self, blocking: bool) -> Result<()> {
        let timeout = self.next_wait(blocking);
        let mut batch: Vec<(Token, bool, bool, bool)> = Vec::new();
        let mut woke = false;
        {
            let mut inner = self.inner.borrow_mut();
            match inner.poll.poll(&mut inner.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(Error::from(e)),
            }
            for event in inner.events.iter() {
                if event.token() == WAKER_TOKEN {
                    woke = true;
                    continue;
                }
                let hup = event.is_error() || (event.is_read_closed() && event.is_write_closed());
                batch.push((event.token(), event.is_readable(), event.is_writable(), hup));
            }
        }
        if woke {
            while let Ok(op) = self.control_rx.try_recv() {
                pollset::apply(self, op);
            }
        }
        self.dispatch_timeouts();
        for (token, readable, writable, hup) in batch {
            self.dispatch_event(socket_of(token), readable, writable, hup);
        }
        Ok(())
    }

    fn next_wait(&self, blocking: bool) -> Option<Duration> {
        if !blocking {
            return Some(Duration::ZERO);
        }
        let deadline = self.inner.borrow().timers.current_timeout()?;
        Some(
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        )
    }

    fn dispatch_timeouts(&self) {
        let expired = self.inner.borrow_mut().timers.pop_expired(SystemTime::now());
        for (mgr, id) in expired {
            let result = mgr.borrow_mut().handle_timeout(self, id);
            if result == EventResult::Error {
                let socket = mgr.borrow().handle();
                self.remove_manager(socket);
            }
        }
    }

    fn dispatch_event(&self, socket: Socket, readable: bool, writable: bool, hup: bool) {
        let mgr = { self.inner.borrow().registry.get(&socket).cloned() };
        let Some(mgr) = mgr else { return };
        if hup {
            self.remove_manager(socket);
            return;
        }
        if readable {
            // Bind the result before matching: the scrutinee's `RefMut`
            // would otherwise stay borrowed for the whole match, and
            // the `Done` arm's `disable_socket` re-borrows this same
            // `RefCell` to delete the manager, panicking with
            // `already mutably borrowed`.
            let result = mgr.borrow_mut().handle_read_event(self);
            match result {
                EventResult::Ok => {}
                EventResult::Done => self.disable_socket(socket, Operation::READ, true),
                EventResult::Error => {
                    self.remove_manager(socket);
                    return;
                }
            }
        }
        if writable {
            let result = mgr.borrow_mut().handle_write_event(self);
            match result {
                EventResult::Ok => {}
                EventResult::Done => self.disable_socket(socket, Operation::WRITE, true),
                EventResult::Error => self.remove_manager(socket),
            }
        }
    }
}

/// Connects to `addr` and hands the new socket to `factory`, entirely
/// from the calling thread. Only safe to call from the reactor thread
/// itself; from any other thread use [`MultiplexerHandle::connect`].
pub fn connect(mpx: &Multiplexer, addr: SocketAddr, factory: Rc<dyn SocketManagerFactory>, initial: Operation) -> Result<()> {
    let sock = socket::make_connected_tcp_stream_socket(addr)?;
    let mgr = factory.make(TcpStreamSocket(sock.0), mpx);
    mpx.add(mgr, initial);
    Ok(())
}
