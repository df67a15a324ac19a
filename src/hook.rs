//! Blocking-call interception
//!
//! Cooperative replacements for the blocking syscalls. Each replacement is
//! gated on a per-thread flag that the scheduler raises while a worker is
//! dispatching: outside the runtime every function falls straight through to
//! the plain `libc` call, so the same code runs hooked and unhooked.
//!
//! Hooked, a time-based call arms a timer and parks the calling fiber; an
//! I/O call registers fd interest with the reactor and parks until the fd is
//! ready, then retries the syscall. Worker threads never block in the
//! kernel on behalf of one fiber.
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use libc::{c_int, c_void};
use log::{error, info};

use crate::config::{Config, ConfigVar};
use crate::fiber::Fiber;
use crate::reactor::{self, Event, Reactor};
use crate::scheduler::Task;
use crate::timer::TimerFn;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(5000);

lazy_static! {
    static ref TCP_CONNECT_TIMEOUT: Arc<ConfigVar<i32>> = {
        let var = Config::lookup_with("tcp.connect.timeout", 5000i32, "tcp connect timeout");
        CONNECT_TIMEOUT_MS.store(var.value() as i64, Ordering::SeqCst);
        var.add_listener(|old: &i32, new: &i32| {
            info!(
                target: "system",
                "tcp connect timeout changed from {} to {}",
                old, new
            );
            CONNECT_TIMEOUT_MS.store(*new as i64, Ordering::SeqCst);
        });
        var
    };
}

/// Whether blocking calls on the current thread are intercepted.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

/// Flip interception for the current thread. Workers enable it on entry.
pub fn set_enabled(enabled: bool) {
    lazy_static::initialize(&TCP_CONNECT_TIMEOUT);
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}

/// Effective `tcp.connect.timeout`, milliseconds.
pub fn connect_timeout_ms() -> u64 {
    lazy_static::initialize(&TCP_CONNECT_TIMEOUT);
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst).max(0) as u64
}

// The hooked context, when there is one to suspend into.
fn cooperative() -> Option<Arc<Reactor>> {
    if !is_enabled() {
        return None;
    }
    reactor::current()
}

// Park the current fiber until the reactor's wheel says `ms` elapsed.
fn sleep_ms(reactor: &Arc<Reactor>, ms: u64) {
    let fiber = Fiber::current();
    let waker = Arc::downgrade(reactor);
    let cb: TimerFn = Arc::new(move || {
        if let Some(reactor) = waker.upgrade() {
            reactor.schedule(Task::fiber(fiber.clone()));
        }
    });
    reactor.add_timer(ms, cb, false);
    Fiber::yield_to_hold();
}

/// Hooked `sleep(3)`.
pub fn sleep(seconds: u32) -> u32 {
    match cooperative() {
        Some(reactor) => {
            sleep_ms(&reactor, seconds as u64 * 1000);
            0
        }
        None => unsafe { libc::sleep(seconds) },
    }
}

/// Hooked `usleep(3)`.
pub fn usleep(usec: u32) -> c_int {
    match cooperative() {
        Some(reactor) => {
            sleep_ms(&reactor, usec as u64 / 1000);
            0
        }
        None => unsafe { libc::usleep(usec) },
    }
}

// Shared retry loop of the I/O hooks: run the syscall, and on EAGAIN park
// the fiber on the fd event, retrying once the reactor wakes it.
fn do_io<F>(fd: RawFd, event: Event, mut io_call: F) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    let reactor = match cooperative() {
        Some(reactor) => reactor,
        None => {
            let n = io_call();
            return if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            };
        }
    };
    loop {
        let n = io_call();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                reactor
                    .add_event(fd, event, None)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                Fiber::yield_to_hold();
                // Resumed: the fd turned ready or the wait was cancelled;
                // either way the next syscall tells the truth.
            }
            _ => return Err(err),
        }
    }
}

/// Hooked `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Event::READ, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

/// Hooked `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

/// Hooked `recv(2)`.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, Event::READ, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// Hooked `send(2)`.
pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, Event::WRITE, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// Hooked `accept(2)`; returns the connected descriptor.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let accepted = do_io(fd, Event::READ, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize
    })?;
    Ok(accepted as RawFd)
}

/// Hooked `close(2)`: outstanding waits on the fd fire before it goes away.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_enabled() {
        if let Some(reactor) = reactor::current() {
            reactor.cancel_all(fd);
        }
    }
    let rt = unsafe { libc::close(fd) };
    if rt != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct ConnectState {
    timed_out: AtomicBool,
}

/// Hooked `connect(2)` with the process-wide `tcp.connect.timeout`.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()> {
    connect_with_timeout(fd, addr, len, connect_timeout_ms())
}

/// Hooked `connect(2)` on a non-blocking socket. A condition timer cancels
/// the WRITE wait when the peer takes longer than `timeout_ms`; the result
/// the kernel recorded is read back through `SO_ERROR`.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    timeout_ms: u64,
) -> io::Result<()> {
    let reactor = match cooperative() {
        Some(reactor) => reactor,
        None => return connect_polling(fd, addr, len, timeout_ms),
    };
    let rt = unsafe { libc::connect(fd, addr, len) };
    if rt == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }
    let state = Arc::new(ConnectState {
        timed_out: AtomicBool::new(false),
    });
    let timer = if timeout_ms != u64::MAX {
        let watched = Arc::downgrade(&state);
        let waker = Arc::downgrade(&reactor);
        Some(reactor.add_condition_timer(
            timeout_ms,
            Arc::new(move || {
                let state = match watched.upgrade() {
                    Some(state) => state,
                    None => return,
                };
                state.timed_out.store(true, Ordering::SeqCst);
                if let Some(reactor) = waker.upgrade() {
                    reactor.cancel_event(fd, Event::WRITE);
                }
            }),
            Arc::downgrade(&state),
            false,
        ))
    } else {
        None
    };
    match reactor.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(timer) = timer {
                timer.cancel();
            }
            if state.timed_out.load(Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            error!(target: "system", "connect: add_event({}, WRITE) failed", fd);
            return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
        }
    }
    so_error(fd)
}

// Unhooked fallback for a non-blocking socket: wait for writability with
// poll(2) instead of parking a fiber.
fn connect_polling(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    timeout_ms: u64,
) -> io::Result<()> {
    let rt = unsafe { libc::connect(fd, addr, len) };
    if rt == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout = if timeout_ms > c_int::MAX as u64 {
        -1
    } else {
        timeout_ms as c_int
    };
    loop {
        let rt = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rt > 0 {
            break;
        }
        if rt == 0 {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
    so_error(fd)
}

fn so_error(fd: RawFd) -> io::Result<()> {
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rt != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}
