//! I/O reactor
//!
//! The [Reactor](struct.Reactor.html) composes the
//! [scheduler](../scheduler/index.html) with a [timer
//! wheel](../timer/index.html) and an epoll descriptor. Rather than burning a
//! dedicated poller thread, it occupies the scheduler's idle path: whenever a
//! worker runs out of fibers it becomes the epoll poller, translating fd
//! readiness and expired deadlines back into scheduled work. A self-pipe
//! doubles as the wake-up for both "new work was queued" and "a nearer timer
//! was armed".
//!
//! ```no_run
//! use spindle::reactor::{Event, Reactor};
//! use std::sync::Arc;
//!
//! let reactor = Reactor::new(2, false, "io");
//! reactor.add_timer(1000, Arc::new(|| println!("tick")), false);
//! reactor.stop();
//! ```
use std::cell::RefCell;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use libc::c_void;
use log::{debug, error};

use crate::error::Error;
use crate::fiber::{Fiber, State};
use crate::scheduler::{self, Schedule, Scheduler, Task, TaskFn};
use crate::timer::{Timer, TimerFn, TimerWheel};

bitflags! {
    /// Event type(s) to register. Bit values match `EPOLLIN`/`EPOLLOUT`.
    pub struct Event: u32 {
        const NONE = 0x0;
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

// What to do when an event fires: resume a fiber or schedule a callback,
// dispatched into the scheduler it was registered under.
struct EventCtx {
    scheduler: Option<Arc<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<TaskFn>,
}

impl EventCtx {
    fn empty() -> EventCtx {
        EventCtx {
            scheduler: None,
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn clear(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

struct FdInner {
    events: Event,
    read: EventCtx,
    write: EventCtx,
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: Event::NONE,
                read: EventCtx::empty(),
                write: EventCtx::empty(),
            }),
        }
    }

    fn ctx_mut(inner: &mut FdInner, event: Event) -> &mut EventCtx {
        match event {
            Event::READ => &mut inner.read,
            Event::WRITE => &mut inner.write,
            _ => panic!("fd context asked for event {:?}", event),
        }
    }

    // Unregister the event and pull out its dispatch target. The caller
    // hands the task to the scheduler only after releasing the fd mutex.
    fn extract(inner: &mut FdInner, event: Event) -> (Arc<Scheduler>, Task) {
        assert!(
            inner.events.contains(event),
            "firing event {:?} that is not registered",
            event
        );
        inner.events.remove(event);
        let ctx = Self::ctx_mut(inner, event);
        let scheduler = ctx
            .scheduler
            .take()
            .expect("registered event without a scheduler");
        let task = match ctx.cb.take() {
            Some(cb) => Task::from_fn(cb),
            None => Task::fiber(ctx.fiber.take().expect("registered event without a target")),
        };
        (scheduler, task)
    }
}

thread_local! {
    static REACTOR: RefCell<Option<Arc<Reactor>>> = RefCell::new(None);
}

/// Reactor driving the calling worker thread.
pub fn current() -> Option<Arc<Reactor>> {
    REACTOR.with(|r| r.borrow().clone())
}

const INITIAL_FD_SLOTS: usize = 64;
const MAX_EPOLL_EVENTS: usize = 256;
const MAX_EPOLL_TIMEOUT_MS: u64 = 5000;

pub struct Reactor {
    sched: Arc<Scheduler>,
    wheel: TimerWheel,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    // Indexed by fd. Entries are created lazily and never move or die while
    // the reactor lives; the vector only ever grows.
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl Reactor {
    /// Build a running reactor: epoll descriptor, self-pipe, fd table, and
    /// the underlying scheduler with its workers already dispatching.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Reactor> {
        let epfd = unsafe { libc::epoll_create(5000) };
        assert!(
            epfd >= 0,
            "epoll_create failed: {}",
            io::Error::last_os_error()
        );
        let mut pipe_fds = [0; 2];
        let rt = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe failed: {}", io::Error::last_os_error());
        let flags = unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) };
        assert!(flags >= 0, "fcntl failed: {}", io::Error::last_os_error());
        let rt = unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) };
        assert!(rt >= 0, "fcntl failed: {}", io::Error::last_os_error());
        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN as u32) | (libc::EPOLLET as u32),
            u64: pipe_fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut event) };
        assert_eq!(rt, 0, "epoll_ctl failed: {}", io::Error::last_os_error());

        let mut slots = Vec::new();
        slots.resize_with(INITIAL_FD_SLOTS, || None);
        let reactor = Arc::new(Reactor {
            sched: Scheduler::build(threads, use_caller, name),
            wheel: TimerWheel::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(slots),
        });
        let waker = Arc::downgrade(&reactor);
        reactor.wheel.set_front_waker(Box::new(move || {
            if let Some(reactor) = waker.upgrade() {
                reactor.tickle();
            }
        }));
        scheduler::init_caller(&reactor);
        scheduler::launch(&reactor);
        reactor
    }

    /// Drain and join. Returns once the queue, the wheel and the pending
    /// event counter are all empty.
    pub fn stop(self: &Arc<Self>) {
        scheduler::shutdown(self);
    }

    /// Pending (registered, not yet fired) fd events.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Arm a timer on the reactor's wheel.
    pub fn add_timer(&self, ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        self.wheel.add_timer(ms, cb, recurring)
    }

    /// Arm a timer that only fires while `cond` still resolves.
    pub fn add_condition_timer<C>(
        &self,
        ms: u64,
        cb: TimerFn,
        cond: Weak<C>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        C: Send + Sync + 'static,
    {
        self.wheel.add_condition_timer(ms, cb, cond, recurring)
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        let index = fd as usize;
        {
            let slots = self.fd_contexts.read().unwrap();
            if let Some(Some(ctx)) = slots.get(index) {
                return ctx.clone();
            }
        }
        let mut slots = self.fd_contexts.write().unwrap();
        if index >= slots.len() {
            let grown = std::cmp::max(index + 1, slots.len() + slots.len() / 2);
            slots.resize_with(grown, || None);
        }
        slots[index]
            .get_or_insert_with(|| Arc::new(FdContext::new(fd)))
            .clone()
    }

    // Lookup without growing; used by the unregister paths.
    fn existing_fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let slots = self.fd_contexts.read().unwrap();
        slots.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Register interest in `event` on `fd`. With a callback the callback is
    /// scheduled when the event fires; without one the *current* fiber is
    /// parked and resumed instead. Registering an event type that is already
    /// registered is a contract violation.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<TaskFn>) -> Result<(), Error> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event wants READ or WRITE, got {:?}",
            event
        );
        let fd_ctx = self.fd_context(fd);
        let mut inner = fd_ctx.inner.lock().unwrap();
        assert!(
            !inner.events.contains(event),
            "event {:?} already registered on fd {}",
            event,
            fd
        );
        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_event = libc::epoll_event {
            events: (libc::EPOLLET as u32) | (inner.events | event).bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep_event) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            error!(
                target: "system",
                "epoll_ctl(op={}, fd={}, events={:?}) failed: {}",
                op, fd, event, err
            );
            return Err(Error::IO(err));
        }
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events |= event;
        let ctx = FdContext::ctx_mut(&mut inner, event);
        debug_assert!(ctx.is_empty(), "stale event context on fd {}", fd);
        ctx.scheduler = Some(scheduler::current().unwrap_or_else(|| self.sched.clone()));
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    State::Exec,
                    "add_event can only park an executing fiber"
                );
                ctx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Unregister without firing. Returns false when nothing was registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let fd_ctx = match self.existing_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }
        let left = inner.events - event;
        if !self.rearm(fd, left) {
            return false;
        }
        inner.events = left;
        FdContext::ctx_mut(&mut inner, event).clear();
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Unregister *and* fire, forcing the pending wait to complete. Returns
    /// false when nothing was registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let fd_ctx = match self.existing_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let fired = {
            let mut inner = fd_ctx.inner.lock().unwrap();
            if !inner.events.contains(event) {
                return false;
            }
            let left = inner.events - event;
            if !self.rearm(fd, left) {
                return false;
            }
            FdContext::extract(&mut inner, event)
        };
        let (scheduler, task) = fired;
        scheduler.schedule(task);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Fire and unregister everything on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let fd_ctx = match self.existing_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut fired = Vec::new();
        {
            let mut inner = fd_ctx.inner.lock().unwrap();
            if inner.events.is_empty() {
                return false;
            }
            if !self.rearm(fd, Event::NONE) {
                return false;
            }
            if inner.events.contains(Event::READ) {
                fired.push(FdContext::extract(&mut inner, Event::READ));
            }
            if inner.events.contains(Event::WRITE) {
                fired.push(FdContext::extract(&mut inner, Event::WRITE));
            }
            debug_assert!(inner.events.is_empty());
        }
        for (scheduler, task) in fired {
            scheduler.schedule(task);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    // Update epoll with the residual mask (MOD) or drop the fd (DEL).
    fn rearm(&self, fd: RawFd, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_event = libc::epoll_event {
            events: (libc::EPOLLET as u32) | left.bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep_event) };
        if rt != 0 {
            error!(
                target: "system",
                "epoll_ctl(op={}, fd={}) failed: {}",
                op,
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    // The composite stop condition also needs the next wheel deadline for
    // the epoll timeout.
    fn stopping_with(&self, next_timeout: &mut u64) -> bool {
        *next_timeout = self.wheel.next_timeout();
        *next_timeout == u64::MAX
            && self.pending_events() == 0
            && self.sched.queue_drained()
    }

    // Fan out whatever epoll reported for one fd.
    fn process_ready(&self, fd: RawFd, ep_events: u32) {
        let fd_ctx = match self.existing_fd_context(fd) {
            Some(ctx) => ctx,
            None => return,
        };
        let mut fired = Vec::new();
        {
            let mut inner = fd_ctx.inner.lock().unwrap();
            let mut ready = Event::NONE;
            if ep_events & (libc::EPOLLIN as u32) != 0 {
                ready |= Event::READ;
            }
            if ep_events & (libc::EPOLLOUT as u32) != 0 {
                ready |= Event::WRITE;
            }
            if ep_events & ((libc::EPOLLERR as u32) | (libc::EPOLLHUP as u32)) != 0 {
                // Let the waiter observe the failure through its own syscall.
                ready |= (Event::READ | Event::WRITE) & inner.events;
            }
            let fire = inner.events & ready;
            if fire.is_empty() {
                return;
            }
            let left = inner.events - fire;
            if !self.rearm(fd_ctx.fd, left) {
                return;
            }
            if fire.contains(Event::READ) {
                fired.push(FdContext::extract(&mut inner, Event::READ));
            }
            if fire.contains(Event::WRITE) {
                fired.push(FdContext::extract(&mut inner, Event::WRITE));
            }
        }
        for (scheduler, task) in fired {
            scheduler.schedule(task);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
    }

    // Body of the idle fiber: the epoll loop.
    fn idle_loop(&self) {
        debug!(target: "system", "reactor {} idle loop entered", self.sched.name());
        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            MAX_EPOLL_EVENTS
        ];
        loop {
            let mut next_timeout = 0u64;
            if self.stopping_with(&mut next_timeout) {
                debug!(target: "system", "reactor {} idle loop exiting", self.sched.name());
                break;
            }
            let timeout = std::cmp::min(next_timeout, MAX_EPOLL_TIMEOUT_MS) as libc::c_int;
            let ready = loop {
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EPOLL_EVENTS as libc::c_int,
                        timeout,
                    )
                };
                if rt >= 0 {
                    break rt as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!(target: "system", "epoll_wait failed: {}", err);
                break 0;
            };
            let mut expired: Vec<TimerFn> = Vec::new();
            self.wheel.collect_expired(&mut expired);
            if !expired.is_empty() {
                let tasks = expired
                    .into_iter()
                    .map(|cb| Task::call(move || cb()))
                    .collect();
                self.sched.schedule_all(tasks);
            }
            for i in 0..ready {
                let event = events[i];
                let fd = event.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }
                self.process_ready(fd, event.events);
            }
            // Let the worker loop drain what we just queued.
            Fiber::yield_to_hold();
        }
    }
}

impl Schedule for Reactor {
    fn base(&self) -> &Scheduler {
        &self.sched
    }

    // One byte down the self-pipe; pointless when nobody is parked in epoll.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const c_void, 1) };
        assert_eq!(rt, 1, "tickle write failed: {}", io::Error::last_os_error());
    }

    fn stopping(&self) -> bool {
        let mut next_timeout = 0u64;
        self.stopping_with(&mut next_timeout)
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn on_thread_start(self: &Arc<Self>) {
        scheduler::set_current(Some(self.sched.clone()));
        REACTOR.with(|r| *r.borrow_mut() = Some(self.clone()));
    }

    fn on_thread_stop(&self) {
        REACTOR.with(|r| *r.borrow_mut() = None);
        scheduler::set_current(None);
        scheduler::set_dispatch(None);
    }
}

impl Deref for Reactor {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
