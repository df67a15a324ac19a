use std::cell::Cell;

use crate::fiber::Fiber;

thread_local! {
    static THREAD_ID: Cell<i64> = Cell::new(0);
}

/// Kernel thread id of the calling thread (`gettid`), cached per thread.
///
/// This is the id the scheduler uses for task affinity, so it must match
/// across every module that compares thread identities.
pub fn thread_id() -> i64 {
    // try_with: callable from destructors running during thread teardown.
    THREAD_ID
        .try_with(|id| {
            if id.get() == 0 {
                id.set(unsafe { libc::syscall(libc::SYS_gettid) as i64 });
            }
            id.get()
        })
        .unwrap_or_else(|_| unsafe { libc::syscall(libc::SYS_gettid) as i64 })
}

/// Id of the fiber running on the calling thread, 0 outside any fiber.
pub fn fiber_id() -> u64 {
    Fiber::current_id()
}
