//! Fibers
//!
//! A fiber is a stackful cooperative task: it owns a private stack and a
//! machine context, and is multiplexed with other fibers onto worker threads
//! by the [scheduler](../scheduler/index.html). A fiber runs until it yields
//! or its body returns; it never preempts and is never preempted.
//!
//! Every thread that touches fibers gets a *root fiber* describing its native
//! stack, created lazily by [Fiber::current()](struct.Fiber.html#method.current).
//! Worker threads additionally designate a *dispatch fiber* that hosts the
//! scheduler loop; user fibers always switch back to the dispatch fiber,
//! never directly to another user fiber.
//!
//! ```rust
//! use spindle::fiber::{Fiber, State};
//!
//! let fiber = Fiber::new(Box::new(|| {
//!     Fiber::yield_to_ready();
//! }), 0);
//! fiber.resume();
//! assert_eq!(fiber.state(), State::Ready);
//! fiber.resume();
//! assert_eq!(fiber.state(), State::Term);
//! ```
use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use libc::{c_void, ucontext_t};
use log::{debug, error};
use num_traits::FromPrimitive;

use crate::config::{Config, ConfigVar};
use crate::scheduler;

/// A fiber body. Executed exactly once per reset cycle.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

static FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref STACK_SIZE: Arc<ConfigVar<u32>> =
        Config::lookup_with("fiber.stack_size", 1024 * 1024, "fiber stack size");
}

thread_local! {
    // Fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    // Root fiber owning this thread's native stack.
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Fiber life cycle.
///
/// INIT -> EXEC on first resume; EXEC -> HOLD or READY on yield;
/// READY/HOLD -> EXEC on the next resume; EXEC -> TERM when the body returns,
/// EXEC -> EXCEPT when it panics. Only TERM, EXCEPT and INIT fibers may be
/// reset for reuse.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum State {
    Init = 0,
    Hold = 1,
    Exec = 2,
    Term = 3,
    Ready = 4,
    Except = 5,
}

/// Where control goes once the body has finished: back to the scheduler's
/// dispatch fiber, or back to the thread's own root fiber. Baking the choice
/// into the trampoline keeps the hot yield path branch-free.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Resumer {
    Dispatch,
    Thread,
}

pub struct Fiber {
    id: u64,
    stack_size: usize,
    stack: *mut c_void,
    state: AtomicU8,
    // Outgoing state chosen by a yield; published by the resuming side once
    // the stack switch has fully completed (see switch_from).
    yielded: AtomicU8,
    ctx: UnsafeCell<ucontext_t>,
    cb: UnsafeCell<Option<FiberFn>>,
    resumer: Resumer,
}

// A fiber may be suspended on one thread and resumed on another, dragging its
// stack along. Sharing is sound because the runtime guarantees at most one
// thread holds a fiber in EXEC at a time: ctx and cb are only touched by the
// thread currently running or resuming the fiber, and everything else is
// atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    // Root fiber for the calling thread; no heap stack, born executing.
    fn root() -> Arc<Fiber> {
        let mut ctx: ucontext_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            panic!("getcontext failed");
        }
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!(target: "system", "root fiber created");
        Arc::new(Fiber {
            id: 0,
            stack_size: 0,
            stack: ptr::null_mut(),
            state: AtomicU8::new(State::Exec as u8),
            yielded: AtomicU8::new(State::Hold as u8),
            ctx: UnsafeCell::new(ctx),
            cb: UnsafeCell::new(None),
            resumer: Resumer::Thread,
        })
    }

    /// Create a fiber running `cb` on a private stack. A `stack_size` of 0
    /// uses the `fiber.stack_size` config value (default 1 MiB).
    pub fn new(cb: FiberFn, stack_size: usize) -> Arc<Fiber> {
        Self::with_resumer(cb, stack_size, Resumer::Dispatch)
    }

    // Variant whose body returns control to the thread's root fiber; used for
    // the caller-included scheduler's root dispatch fiber.
    pub(crate) fn new_caller(cb: FiberFn, stack_size: usize) -> Arc<Fiber> {
        Self::with_resumer(cb, stack_size, Resumer::Thread)
    }

    fn with_resumer(cb: FiberFn, stack_size: usize, resumer: Resumer) -> Arc<Fiber> {
        let id = FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let stack_size = if stack_size > 0 {
            stack_size
        } else {
            STACK_SIZE.value() as usize
        };
        let stack = unsafe { libc::malloc(stack_size) };
        if stack.is_null() {
            panic!("fiber {}: failed to allocate a {} byte stack", id, stack_size);
        }
        let fiber = Fiber {
            id,
            stack_size,
            stack,
            state: AtomicU8::new(State::Init as u8),
            yielded: AtomicU8::new(State::Hold as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            cb: UnsafeCell::new(Some(cb)),
            resumer,
        };
        unsafe { fiber.make_context() };
        debug!(target: "system", "fiber {} created, stack {} bytes", id, stack_size);
        Arc::new(fiber)
    }

    // Point the context at the top of our body trampoline.
    //
    // Safety: must not run while the fiber is executing; callers hold the
    // fiber in INIT or a terminal state.
    unsafe fn make_context(&self) {
        let ctx = &mut *self.ctx.get();
        if libc::getcontext(ctx) != 0 {
            panic!("getcontext failed");
        }
        ctx.uc_link = ptr::null_mut();
        ctx.uc_stack.ss_sp = self.stack;
        ctx.uc_stack.ss_size = self.stack_size;
        ctx.uc_stack.ss_flags = 0;
        let entry: extern "C" fn() = match self.resumer {
            Resumer::Dispatch => fiber_entry,
            Resumer::Thread => caller_fiber_entry,
        };
        libc::makecontext(ctx, entry, 0);
    }

    /// Reuse a finished fiber's stack for a new body.
    pub fn reset(&self, cb: FiberFn) {
        assert!(!self.stack.is_null(), "cannot reset a root fiber");
        let state = self.state();
        assert!(
            state == State::Term || state == State::Except || state == State::Init,
            "fiber {} reset while live (state {:?})",
            self.id,
            state
        );
        unsafe {
            *self.cb.get() = Some(cb);
            self.make_context();
        }
        self.set_state(State::Init);
    }

    /// Switch the calling thread from its dispatch fiber into this fiber.
    /// Returns when the fiber yields or finishes; by then the fiber's state
    /// reflects the outcome (READY, HOLD, TERM or EXCEPT).
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state != State::Exec,
            "fiber {} resumed while executing",
            self.id
        );
        let from = scheduler::dispatch_fiber();
        self.switch_from(&from);
    }

    // Resume with the thread's root fiber as the switch-back target; used by
    // the caller-included scheduler to enter its root dispatch fiber.
    pub(crate) fn call(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state != State::Exec,
            "fiber {} called while executing",
            self.id
        );
        let from = thread_fiber();
        self.switch_from(&from);
    }

    fn switch_from(self: &Arc<Self>, from: &Arc<Fiber>) {
        self.yielded.store(State::Hold as u8, Ordering::Relaxed);
        set_current(Some(self.clone()));
        self.set_state(State::Exec);
        unsafe { swap(from, self) };
        // Back on the resuming side: the switch is complete, publish the
        // state the fiber chose before it switched away. Doing it here (and
        // skipping EXEC entries in the queue scan) keeps a second worker from
        // resuming the fiber while its stack switch is still in flight.
        if self.state() == State::Exec {
            let yielded = State::from_u8(self.yielded.load(Ordering::Relaxed)).unwrap();
            self.set_state(yielded);
        }
    }

    // Switch back to the dispatch fiber, leaving `yielded` to be published by
    // the resuming side.
    fn swap_out(self: &Arc<Self>) {
        let to = scheduler::dispatch_fiber();
        set_current(Some(to.clone()));
        unsafe { swap(self, &to) };
    }

    /// Yield, staying parked until something re-schedules this fiber.
    pub fn yield_to_hold() {
        let cur = Fiber::current();
        cur.yielded.store(State::Hold as u8, Ordering::Relaxed);
        cur.swap_out();
    }

    /// Yield, asking to be queued for another run immediately.
    pub fn yield_to_ready() {
        let cur = Fiber::current();
        cur.yielded.store(State::Ready as u8, Ordering::Relaxed);
        cur.swap_out();
    }

    /// Fiber bound to the calling thread, creating the thread's root fiber on
    /// first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT.with(|c| c.borrow().clone()) {
            return fiber;
        }
        let root = Fiber::root();
        CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
        THREAD_FIBER.with(|t| *t.borrow_mut() = Some(root.clone()));
        root
    }

    /// Id of the fiber running on the calling thread; 0 when no fiber has
    /// been set up (or inside a root fiber).
    pub fn current_id() -> u64 {
        // try_with: the logger asks for this from drop paths that can run
        // while thread locals are already being torn down.
        CURRENT
            .try_with(|c| c.borrow().as_ref().map(|f| f.id).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Process-wide count of live fibers, root fibers included.
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst)).unwrap()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if !self.stack.is_null() {
            let state = self.state();
            assert!(
                state == State::Term || state == State::Except || state == State::Init,
                "fiber {} dropped while live (state {:?})",
                self.id,
                state
            );
            unsafe { libc::free(self.stack) };
        }
        debug!(target: "system", "fiber {} destroyed", self.id);
    }
}

pub(crate) fn thread_fiber() -> Arc<Fiber> {
    if let Some(fiber) = THREAD_FIBER.with(|t| t.borrow().clone()) {
        return fiber;
    }
    Fiber::current()
}

fn set_current(fiber: Option<Arc<Fiber>>) {
    CURRENT.with(|c| *c.borrow_mut() = fiber);
}

unsafe fn swap(from: &Fiber, to: &Fiber) {
    if libc::swapcontext(from.ctx.get(), to.ctx.get()) != 0 {
        panic!("swapcontext failed");
    }
}

// Run the body, contain panics, and report the fiber to switch away from.
// The returned pointer stays valid through the final switch because the
// resuming worker holds its own reference for the duration of resume().
fn run_fiber_body() -> *const Fiber {
    let cur = Fiber::current();
    let cb = unsafe { (*cur.cb.get()).take() }.expect("fiber resumed without a body");
    match catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => cur.set_state(State::Term),
        Err(cause) => {
            cur.set_state(State::Except);
            let what = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(
                target: "system",
                "fiber {} body panicked: {}\n{}",
                cur.id,
                what,
                Backtrace::force_capture()
            );
        }
    }
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    raw
}

extern "C" fn fiber_entry() {
    let raw = run_fiber_body();
    let to = scheduler::dispatch_fiber();
    set_current(Some(to.clone()));
    unsafe { swap(&*raw, &to) };
    unreachable!("terminated fiber resumed");
}

extern "C" fn caller_fiber_entry() {
    let raw = run_fiber_body();
    let to = thread_fiber();
    set_current(Some(to.clone()));
    unsafe { swap(&*raw, &to) };
    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            State::Init,
            State::Hold,
            State::Exec,
            State::Term,
            State::Ready,
            State::Except,
        ]
        .iter()
        {
            assert_eq!(State::from_u8(*state as u8), Some(*state));
        }
    }
}
