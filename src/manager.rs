//! The socket manager abstraction: a per-connection actor owning a
//! socket, an interest mask, and the three event handlers the
//! multiplexer calls into.

use crate::multiplexer::Multiplexer;
use crate::socket::Socket;
use crate::timer::TimeoutId;
use std::time::{Duration, SystemTime};

/// Interest mask over `{read, write}`. Transitions are monotone only through [`ManagerBase::mask_add`] /
/// [`ManagerBase::mask_del`]; the bitwise operators below exist for
/// composing constants (`Operation::READ | Operation::WRITE`), not for
/// bypassing that API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation(u8);

impl Operation {
    /// readiness interest
    pub const READ: Operation = Operation(0b01);
    /// writability interest
    pub const WRITE: Operation = Operation(0b10);

    /// The empty mask.
    pub const fn empty() -> Operation {
        Operation(0)
    }

    /// Whether `self` contains every bit of `other`.
    pub const fn contains(self, other: Operation) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn insert(&mut self, other: Operation) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Operation) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Operation {
    type Output = Operation;
    fn bitor(self, rhs: Operation) -> Operation {
        Operation(self.0 | rhs.0)
    }
}

/// Tri-state value returned by every event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    /// More work may remain; keep the manager armed for this direction.
    Ok,
    /// Currently satisfied for this operation; disarm it.
    Done,
    /// An I/O-level failure occurred; delete this manager.
    Error,
}

/// Every concrete manager implements this. `init` is called once by the
/// multiplexer right after registration; the three `handle_*` methods
/// are the readiness/timeout callbacks.
///
/// Managers are reactor-thread-confined: nothing here requires `Send`,
/// and implementations are free to hold `Rc`-based state. The handful
/// of operations a foreign thread may trigger (`enable`/`disable`/
/// `connect`/`shutdown`) cross the control channel as plain data, not
/// as manager values — see `pollset.rs`.
pub trait SocketManager {
    /// Called once after the multiplexer has registered this manager.
    fn init(&mut self, mpx: &Multiplexer) -> crate::error::Result<()>;

    /// Handle a read-readiness event.
    fn handle_read_event(&mut self, mpx: &Multiplexer) -> EventResult;

    /// Handle a write-readiness event.
    fn handle_write_event(&mut self, mpx: &Multiplexer) -> EventResult;

    /// Handle an expired timer previously registered via
    /// `ManagerBase::set_timeout_in`/`set_timeout_at`.
    fn handle_timeout(&mut self, mpx: &Multiplexer, id: TimeoutId) -> EventResult;

    /// Base fields shared by every manager (socket handle + mask).
    fn base(&self) -> &ManagerBase;

    /// Mutable access to the base fields.
    fn base_mut(&mut self) -> &mut ManagerBase;

    /// The managed socket.
    fn handle(&self) -> Socket {
        self.base().handle
    }

    /// The currently registered interest mask.
    fn mask(&self) -> Operation {
        self.base().mask
    }
}

/// Fields and mask bookkeeping shared by every [`SocketManager`]
/// implementation. Destruction (via `Drop`) shuts down then closes the
/// owned socket: a manager's lifetime governs its socket's lifetime.
pub struct ManagerBase {
    handle: Socket,
    mask: Operation,
}

impl ManagerBase {
    /// Construct from a socket that will be registered momentarily.
    pub fn new(handle: Socket) -> Self {
        Self {
            handle,
            mask: Operation::empty(),
        }
    }

    /// The managed socket.
    pub fn handle(&self) -> Socket {
        self.handle
    }

    /// The currently tracked mask. This is purely in-memory bookkeeping;
    /// the multiplexer is the one that keeps the poller's registration
    /// in sync with it.
    pub fn mask(&self) -> Operation {
        self.mask
    }

    /// Adds `flag` to the mask. Returns `true` iff the mask actually
    /// grew.
    pub fn mask_add(&mut self, flag: Operation) -> bool {
        let before = self.mask;
        self.mask.insert(flag);
        self.mask != before
    }

    /// Removes `flag` from the mask. Returns `true` iff the mask
    /// actually shrank.
    pub fn mask_del(&mut self, flag: Operation) -> bool {
        let before = self.mask;
        self.mask.remove(flag);
        self.mask != before
    }
}

impl Drop for ManagerBase {
    fn drop(&mut self) {
        tracing::debug!(fd = self.handle.raw_fd(), "closing manager socket");
        crate::socket::shutdown(self.handle);
        crate::socket::close(self.handle);
    }
}

/// Shared ownership wrapper every manager is stored behind in the
/// registration table, so a manager can be deleted mid-callback without
/// invalidating a reference the multiplexer still holds on the stack.
///
/// A manager may need to outlive its entry in the registration table —
/// a pending timeout can still reference it after it is otherwise
/// removed — which is why this is reference-counted rather than owned
/// outright. Managers never cross the control channel themselves; only
/// plain data describing what to do does (see `pollset.rs`), so they
/// never leave the reactor thread and `Rc`/`RefCell` is the right tool
/// here, not `Arc`/`Mutex`.
pub type SharedManager = std::rc::Rc<std::cell::RefCell<Box<dyn SocketManager>>>;

/// Wraps `mgr` for storage in the registration table.
pub fn share(mgr: impl SocketManager + 'static) -> SharedManager {
    std::rc::Rc::new(std::cell::RefCell::new(Box::new(mgr)))
}

/// Wraps an already-boxed manager (used for managers that crossed the
/// control channel from another thread; see `pollset.rs`).
pub fn share_boxed(mgr: Box<dyn SocketManager>) -> SharedManager {
    std::rc::Rc::new(std::cell::RefCell::new(mgr))
}

/// Helpers a manager implementation calls to talk back to the
/// multiplexer that owns it. These are free functions rather than
/// methods on `ManagerBase` because they need the `Multiplexer`
/// reference that only the caller (inside a `handle_*` callback) has
/// ready to hand; `ManagerBase` itself stores no back-pointer, which
/// keeps managers trivially movable and avoids a self-referential
/// struct.
pub mod ops {
    use super::*;

    /// Idempotently asks the multiplexer to arm `base`'s socket for
    /// reads. `base` is mutated in place (its mask grows); only actually
    /// touches the poller if the mask changed.
    pub fn register_reading(mpx: &Multiplexer, base: &mut ManagerBase) {
        if base.mask_add(Operation::READ) {
            mpx.enable_socket(base.handle(), base.mask());
        }
    }

    /// Idempotently asks the multiplexer to arm `base`'s socket for
    /// writes.
    pub fn register_writing(mpx: &Multiplexer, base: &mut ManagerBase) {
        if base.mask_add(Operation::WRITE) {
            mpx.enable_socket(base.handle(), base.mask());
        }
    }

    /// Requests a timeout `duration` from now on `base`'s socket;
    /// returns the allocated id.
    pub fn set_timeout_in(mpx: &Multiplexer, base: &ManagerBase, duration: Duration) -> TimeoutId {
        mpx.set_timeout(base.handle(), SystemTime::now() + duration)
    }

    /// Requests a timeout at an absolute point in time.
    pub fn set_timeout_at(mpx: &Multiplexer, base: &ManagerBase, point: SystemTime) -> TimeoutId {
        mpx.set_timeout(base.handle(), point)
    }

    /// Forwards an invariant-level error to the multiplexer.
    pub fn handle_error(mpx: &Multiplexer, err: crate::error::Error) {
        mpx.handle_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::INVALID_SOCKET;
    use proptest::prelude::*;

    #[test]
    fn mask_add_reports_growth_only_when_it_grows() {
        let mut base = ManagerBase::new(INVALID_SOCKET);
        assert!(base.mask_add(Operation::READ));
        assert!(!base.mask_add(Operation::READ));
        assert!(base.mask_add(Operation::WRITE));
        assert_eq!(base.mask(), Operation::READ | Operation::WRITE);
    }

    #[test]
    fn mask_del_reports_shrinkage_only_when_it_shrinks() {
        let mut base = ManagerBase::new(INVALID_SOCKET);
        base.mask_add(Operation::READ | Operation::WRITE);
        assert!(base.mask_del(Operation::WRITE));
        assert!(!base.mask_del(Operation::WRITE));
        assert_eq!(base.mask(), Operation::READ);
    }

    #[test]
    fn add_then_del_is_a_no_op_on_the_mask() {
        let mut base = ManagerBase::new(INVALID_SOCKET);
        let before = base.mask();
        base.mask_add(Operation::READ);
        base.mask_del(Operation::READ);
        assert_eq!(base.mask(), before);
    }

    fn operation_from_bits(read: bool, write: bool) -> Operation {
        let mut op = Operation::empty();
        if read {
            op.insert(Operation::READ);
        }
        if write {
            op.insert(Operation::WRITE);
        }
        op
    }

    proptest! {
        /// `mask_add` reports growth iff the mask strictly grew, and the
        /// resulting mask always contains what was just added.
        #[test]
        fn mask_add_is_monotone(read in any::<bool>(), write in any::<bool>()) {
            let flag = operation_from_bits(read, write);
            let mut base = ManagerBase::new(INVALID_SOCKET);
            let before = base.mask();
            let grew = base.mask_add(flag);
            prop_assert!(base.mask().contains(flag));
            prop_assert_eq!(grew, base.mask() != before);
        }

        /// Same invariant for `mask_del`: reports shrinkage iff the mask
        /// strictly shrank, and the removed flag is never left set.
        #[test]
        fn mask_del_is_monotone(
            start_read in any::<bool>(),
            start_write in any::<bool>(),
            del_read in any::<bool>(),
            del_write in any::<bool>(),
        ) {
            let mut base = ManagerBase::new(INVALID_SOCKET);
            base.mask_add(operation_from_bits(start_read, start_write));
            let before = base.mask();
            let flag = operation_from_bits(del_read, del_write);
            let shrank = base.mask_del(flag);
            prop_assert!(!base.mask().contains(flag) || flag.is_empty());
            prop_assert_eq!(shrank, base.mask() != before);
        }

        /// `mask_add(a)` followed by `mask_del(a)` always restores the
        /// original mask — but only when `a` is disjoint from what was
        /// already set: if a bit in `a` was already part of the mask,
        /// `mask_add` is a no-op on it while `mask_del` still clears
        /// it, so the round trip strictly loses that bit. Generate
        /// `flag` as the complement of `start` so every case exercised
        /// actually adds something fresh before removing it.
        #[test]
        fn add_then_del_round_trips(
            start_read in any::<bool>(),
            start_write in any::<bool>(),
            flag_read in any::<bool>(),
            flag_write in any::<bool>(),
        ) {
            let mut base = ManagerBase::new(INVALID_SOCKET);
            base.mask_add(operation_from_bits(start_read, start_write));
            let before = base.mask();
            let flag = operation_from_bits(flag_read && !start_read, flag_write && !start_write);
            base.mask_add(flag);
            base.mask_del(flag);
            prop_assert_eq!(base.mask(), before);
        }
    }
}
