use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spindle::fiber::Fiber;
use spindle::hook;
use spindle::reactor::{Event, Reactor};
use spindle::scheduler::Task;

fn init_log() {
    let _ = spindle::log::init();
}

// Non-blocking pipe pair; the read end is the interesting fd.
fn pipe_nonblocking() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rt, 0);
    for fd in fds.iter() {
        let flags = unsafe { libc::fcntl(*fd, libc::F_GETFL, 0) };
        assert!(flags >= 0);
        let rt = unsafe { libc::fcntl(*fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        assert!(rt >= 0);
    }
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn hooked_sleep_suspends_instead_of_blocking() {
    init_log();
    let reactor = Reactor::new(2, false, "sleep");
    let elapsed_ms = Arc::new(AtomicUsize::new(0));
    let slot = elapsed_ms.clone();
    reactor.schedule(Task::call(move || {
        let t0 = Instant::now();
        hook::usleep(300_000);
        hook::usleep(300_000);
        slot.store(t0.elapsed().as_millis() as usize, Ordering::SeqCst);
    }));

    // Mid-sleep both workers should be parked in the reactor, none active.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(reactor.active_threads(), 0);
    assert!(reactor.idle_threads() >= 1);

    reactor.stop();
    let elapsed = elapsed_ms.load(Ordering::SeqCst);
    assert!(
        elapsed >= 580,
        "two 300 ms sleeps finished after only {} ms",
        elapsed
    );
}

#[test]
fn parked_reader_wakes_on_data() {
    init_log();
    let reactor = Reactor::new(2, false, "read");
    let (rfd, wfd) = pipe_nonblocking();
    let got = Arc::new(Mutex::new(None));
    let slot = got.clone();
    reactor.schedule(Task::call(move || {
        let mut buf = [0u8; 8];
        let t0 = Instant::now();
        let n = hook::read(rfd, &mut buf).unwrap();
        *slot.lock().unwrap() = Some((n, buf[0], t0.elapsed()));
    }));

    std::thread::sleep(Duration::from_millis(150));
    let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);

    reactor.stop();
    let got = got.lock().unwrap().take().expect("reader never finished");
    assert_eq!(got.0, 1);
    assert_eq!(got.1, b'x');
    assert!(
        got.2 >= Duration::from_millis(100),
        "read returned before data was written"
    );
    close_fd(rfd);
    close_fd(wfd);
}

#[test]
fn cancel_event_fires_exactly_once() {
    init_log();
    let reactor = Reactor::new(2, false, "cancel");
    let (rfd, wfd) = pipe_nonblocking();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let inner = reactor.clone();
    reactor.schedule(Task::call(move || {
        inner.add_event(rfd, Event::READ, None).unwrap();
        Fiber::yield_to_hold();
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    wait_until("the fiber to register", || reactor.pending_events() == 1);
    assert!(reactor.cancel_event(rfd, Event::READ));
    // The wait was force-completed; nothing is registered any more.
    assert!(!reactor.del_event(rfd, Event::READ));

    reactor.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(reactor.pending_events(), 0);
    close_fd(rfd);
    close_fd(wfd);
}

#[test]
fn del_event_discards_without_firing() {
    init_log();
    let reactor = Reactor::new(2, false, "del");
    let (rfd, wfd) = pipe_nonblocking();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    reactor
        .add_event(
            rfd,
            Event::READ,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    assert_eq!(reactor.pending_events(), 1);

    assert!(reactor.del_event(rfd, Event::READ));
    assert_eq!(reactor.pending_events(), 0);
    assert!(!reactor.del_event(rfd, Event::READ));

    // Data arriving now must not fire the discarded callback.
    let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    reactor.stop();
    close_fd(rfd);
    close_fd(wfd);
}

#[test]
fn callback_event_fires_on_readiness() {
    init_log();
    let reactor = Reactor::new(2, false, "event");
    let (rfd, wfd) = pipe_nonblocking();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    reactor
        .add_event(
            rfd,
            Event::READ,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);

    wait_until("the callback to fire", || {
        fired.load(Ordering::SeqCst) == 1
    });
    assert_eq!(reactor.pending_events(), 0);
    reactor.stop();
    close_fd(rfd);
    close_fd(wfd);
}

#[test]
fn cancel_all_clears_the_fd() {
    init_log();
    let reactor = Reactor::new(2, false, "cancelall");
    let (rfd, wfd) = pipe_nonblocking();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    reactor
        .add_event(
            rfd,
            Event::READ,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    assert!(reactor.cancel_all(rfd));
    assert!(!reactor.cancel_all(rfd));

    wait_until("the cancelled callback", || {
        fired.load(Ordering::SeqCst) == 1
    });
    assert_eq!(reactor.pending_events(), 0);
    reactor.stop();
    close_fd(rfd);
    close_fd(wfd);
}

#[test]
fn caller_included_reactor_drains_hooked_sleepers() {
    init_log();
    let done = Arc::new(AtomicUsize::new(0));
    let reactor = Reactor::new(2, true, "codrain");
    for _ in 0..100 {
        let done = done.clone();
        reactor.schedule(Task::call(move || {
            hook::usleep(5_000);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    reactor.stop();
    assert_eq!(done.load(Ordering::SeqCst), 100, "stop() lost sleepers");
}

#[test]
fn fd_table_grows_past_initial_capacity() {
    init_log();
    let reactor = Reactor::new(1, false, "grow");
    // Push a registration to an fd index beyond the initial 64 slots.
    let mut keep: Vec<(RawFd, RawFd)> = Vec::new();
    while keep.iter().map(|p| p.0).max().unwrap_or(0) < 80 {
        keep.push(pipe_nonblocking());
    }
    let (rfd, wfd) = *keep.last().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    reactor
        .add_event(
            rfd,
            Event::READ,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
    wait_until("the high-fd callback", || fired.load(Ordering::SeqCst) == 1);
    reactor.stop();
    for (r, w) in keep {
        close_fd(r);
        close_fd(w);
    }
}
