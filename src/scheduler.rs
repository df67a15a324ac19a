//! M:N fiber scheduler
//!
//! A [Scheduler](struct.Scheduler.html) multiplexes fibers and plain
//! callables onto a small pool of worker threads. Each worker runs a
//! single-threaded cooperative loop: it pulls the next runnable entry from
//! the shared FIFO, resumes it, and re-queues or parks it according to how it
//! yielded. When the queue is empty the worker resumes its *idle fiber*,
//! which subclasses override to do useful work (the
//! [reactor](../reactor/index.html) runs its epoll loop there).
//!
//! With `use_caller` the constructing thread becomes an additional worker: a
//! root dispatch fiber is set up at construction and drained inside
//! [stop()](struct.Scheduler.html#method.stop), which must then be invoked
//! from that same thread.
//!
//! ```rust
//! use spindle::scheduler::{Scheduler, Task};
//!
//! let sched = Scheduler::new(2, false, "work");
//! sched.start();
//! sched.schedule(Task::call(|| println!("hello")));
//! sched.stop();
//! ```
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::thread::JoinHandle;

use log::{debug, info, trace};

use crate::fiber::{Fiber, FiberFn, State};
use crate::hook;
use crate::util;

/// A queued callable.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(TaskFn),
}

/// One queue entry: a fiber or a callable, plus optional thread affinity
/// (-1 means any worker). Consumed exactly once.
pub struct Task {
    pub(crate) kind: TaskKind,
    pub(crate) thread: i64,
}

impl Task {
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread: -1,
        }
    }

    /// A fiber pinned to the worker with the given thread id.
    pub fn fiber_on(fiber: Arc<Fiber>, thread: i64) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread,
        }
    }

    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            thread: -1,
        }
    }

    /// A callable pinned to the worker with the given thread id.
    pub fn call_on<F>(f: F, thread: i64) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            thread,
        }
    }

    pub(crate) fn from_fn(f: TaskFn) -> Task {
        Task {
            kind: TaskKind::Call(f),
            thread: -1,
        }
    }
}

thread_local! {
    // Scheduler driving this worker thread.
    static SCHEDULER: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    // Dispatch fiber user fibers switch back to on this thread.
    static DISPATCH: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Scheduler bound to the calling worker thread.
pub fn current() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|s| s.borrow().clone())
}

/// Dispatch fiber of the calling worker thread.
pub fn main_fiber() -> Option<Arc<Fiber>> {
    DISPATCH.with(|d| d.borrow().clone())
}

pub(crate) fn set_current(scheduler: Option<Arc<Scheduler>>) {
    SCHEDULER.with(|s| *s.borrow_mut() = scheduler);
}

pub(crate) fn set_dispatch(fiber: Option<Arc<Fiber>>) {
    DISPATCH.with(|d| *d.borrow_mut() = fiber);
}

// Switch-back target for Fiber::resume and the yields: the dispatch fiber
// when the thread belongs to a scheduler, the thread's root fiber otherwise.
pub(crate) fn dispatch_fiber() -> Arc<Fiber> {
    main_fiber().unwrap_or_else(crate::fiber::thread_fiber)
}

/// The scheduler's customization surface. The base implementation busy-holds
/// in `idle` and treats `tickle` as a diagnostic; the reactor overrides every
/// method to plug in epoll.
pub trait Schedule: Send + Sync + 'static {
    fn base(&self) -> &Scheduler;

    /// Wake a blocked worker so it re-examines the queue.
    fn tickle(&self) {
        trace!(target: "system", "tickle");
    }

    /// True once no more work can arrive and none is left.
    fn stopping(&self) -> bool {
        self.base().queue_drained()
    }

    /// Body of the idle fiber; resumed whenever a worker finds no work.
    fn idle(&self) {
        trace!(target: "system", "idle");
        while !self.stopping() {
            Fiber::yield_to_hold();
        }
    }

    /// Bind the calling thread to this scheduler.
    fn on_thread_start(self: &Arc<Self>)
    where
        Self: Sized,
    {
        set_current(Some(self.base().arc()));
    }

    /// Tear down the calling thread's binding.
    fn on_thread_stop(&self) {
        set_current(None);
        set_dispatch(None);
    }
}

pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<i64>>,
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: i64,
    weak_self: Weak<Scheduler>,
    // Composite (e.g. the reactor) whose tickle should service this queue.
    ext: RwLock<Option<Weak<dyn Schedule>>>,
}

impl Scheduler {
    /// Build an idle scheduler with `threads` workers. With `use_caller` the
    /// constructing thread counts as one of them and must later invoke
    /// [stop()](#method.stop) itself.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let scheduler = Self::build(threads, use_caller, name);
        init_caller(&scheduler);
        scheduler
    }

    pub(crate) fn build(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler {} needs at least one thread", name);
        let (thread_count, root_thread) = if use_caller {
            (threads - 1, util::thread_id())
        } else {
            (threads, -1)
        };
        Arc::new_cyclic(|weak| Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_fiber: Mutex::new(None),
            root_thread,
            weak_self: weak.clone(),
            ext: RwLock::new(None),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Scheduler> {
        self.weak_self.upgrade().expect("scheduler deallocated")
    }

    pub(crate) fn set_ext(&self, ext: Weak<dyn Schedule>) {
        *self.ext.write().unwrap() = Some(ext);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel ids of the worker threads (the caller's id included in
    /// caller-included mode). Spawned workers register themselves, so right
    /// after [start()](#method.start) the roster may still be filling up.
    pub fn thread_ids(&self) -> Vec<i64> {
        self.thread_ids.lock().unwrap().clone()
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    pub fn idle_threads(&self) -> usize {
        self.idle_threads.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads() > 0
    }

    /// Enqueue one entry. The first entry into an empty queue wakes a worker.
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let need_tickle = queue.is_empty();
            queue.push_back(task);
            need_tickle
        };
        if need_tickle {
            self.tickle_ext();
        }
    }

    /// Enqueue a batch under one lock acquisition, keeping the entries
    /// adjacent in the queue. Wakes a worker at most once.
    pub fn schedule_all(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let need_tickle = queue.is_empty();
            queue.extend(tasks);
            need_tickle
        };
        if need_tickle {
            self.tickle_ext();
        }
    }

    // Route the wake-up through the composite when there is one.
    fn tickle_ext(&self) {
        let ext = self.ext.read().unwrap().clone();
        if let Some(ext) = ext.and_then(|weak| weak.upgrade()) {
            ext.tickle();
        } else {
            trace!(target: "system", "tickle");
        }
    }

    // Base stop condition: drain requested and nothing in flight.
    pub(crate) fn queue_drained(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_threads() == 0
    }

    /// Spawn the worker threads and begin dispatching.
    pub fn start(self: &Arc<Self>) {
        launch(self);
    }

    /// Request a graceful drain and wait for every worker to finish.
    pub fn stop(self: &Arc<Self>) {
        shutdown(self);
    }
}

impl Schedule for Scheduler {
    fn base(&self) -> &Scheduler {
        self
    }
}

// Shared constructor tail: register the composite for dynamic tickle and, in
// caller-included mode, turn the constructing thread into a worker-to-be by
// creating its root dispatch fiber.
pub(crate) fn init_caller<T: Schedule>(this: &Arc<T>) {
    let weak: Weak<T> = Arc::downgrade(this);
    let ext: Weak<dyn Schedule> = weak;
    this.base().set_ext(ext);
    let base = this.base();
    if base.root_thread == -1 {
        return;
    }
    Fiber::current();
    assert!(
        current().is_none(),
        "thread already runs a scheduler, cannot construct {} with use_caller",
        base.name
    );
    let runner = this.clone();
    let root = Fiber::new_caller(Box::new(move || run(runner)) as FiberFn, 0);
    this.on_thread_start();
    set_dispatch(Some(root.clone()));
    *base.root_fiber.lock().unwrap() = Some(root);
    base.thread_ids.lock().unwrap().push(base.root_thread);
}

pub(crate) fn launch<T: Schedule>(this: &Arc<T>) {
    let base = this.base();
    let mut threads = base.threads.lock().unwrap();
    if !base.stopping.load(Ordering::SeqCst) {
        return;
    }
    base.stopping.store(false, Ordering::SeqCst);
    assert!(threads.is_empty(), "scheduler {} restarted", base.name);
    for i in 0..base.thread_count {
        let runner = this.clone();
        let handle = thread::Builder::new()
            .name(format!("{}_{}", base.name, i))
            .spawn(move || run(runner))
            .expect("failed to spawn worker thread");
        threads.push(handle);
    }
}

pub(crate) fn shutdown<T: Schedule>(this: &Arc<T>) {
    let base = this.base();
    base.auto_stop.store(true, Ordering::SeqCst);
    let root = base.root_fiber.lock().unwrap().clone();
    if let Some(ref root) = root {
        if base.thread_count == 0
            && (root.state() == State::Term || root.state() == State::Init)
        {
            info!(target: "system", "scheduler {} stopped", base.name);
            base.stopping.store(true, Ordering::SeqCst);
            if this.stopping() {
                return;
            }
        }
    }
    if base.root_thread != -1 {
        assert_eq!(
            util::thread_id(),
            base.root_thread,
            "stop() of caller-included scheduler {} must run on its constructing thread",
            base.name
        );
    } else if let Some(cur) = current() {
        assert!(
            !Arc::ptr_eq(&cur, &base.arc()),
            "stop() must not run on a worker of scheduler {}",
            base.name
        );
    }
    base.stopping.store(true, Ordering::SeqCst);
    for _ in 0..base.thread_count {
        this.tickle();
    }
    if root.is_some() {
        this.tickle();
    }
    if let Some(root) = root {
        if !this.stopping() {
            root.call();
        }
    }
    let threads = std::mem::replace(&mut *base.threads.lock().unwrap(), Vec::new());
    for handle in threads {
        handle.join().expect("worker thread panicked");
    }
    if base.root_thread == util::thread_id() {
        this.on_thread_stop();
    }
}

// Per-worker dispatch loop; also the body of the caller thread's root fiber.
fn run<T: Schedule>(this: Arc<T>) {
    debug!(target: "system", "scheduler {} worker running", this.base().name);
    hook::set_enabled(true);
    this.on_thread_start();
    let tid = util::thread_id();
    {
        let base = this.base();
        if tid != base.root_thread {
            set_dispatch(Some(Fiber::current()));
            base.thread_ids.lock().unwrap().push(tid);
        }
    }
    let idle_fiber = {
        let idler = this.clone();
        Fiber::new(Box::new(move || idler.idle()) as FiberFn, 0)
    };
    let mut cb_fiber: Option<Arc<Fiber>> = None;
    loop {
        let base = this.base();
        let mut task: Option<TaskKind> = None;
        let mut tickle_me = false;
        let mut is_active = false;
        {
            let mut queue = base.queue.lock().unwrap();
            let mut i = 0;
            while i < queue.len() {
                let pinned_elsewhere = {
                    let entry = &queue[i];
                    entry.thread != -1 && entry.thread != tid
                };
                if pinned_elsewhere {
                    // Someone else must take it; hand the wake-up on.
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                if let TaskKind::Fiber(ref fiber) = queue[i].kind {
                    // Still switching out on another worker; leave it queued.
                    if fiber.state() == State::Exec {
                        i += 1;
                        continue;
                    }
                }
                task = queue.remove(i).map(|entry| entry.kind);
                base.active_threads.fetch_add(1, Ordering::SeqCst);
                is_active = true;
                break;
            }
            tickle_me |= task.is_some() && i < queue.len();
        }
        if tickle_me {
            this.tickle();
        }
        // A fiber may have finished between being queued and being pulled.
        let task = match task {
            Some(TaskKind::Fiber(ref fiber))
                if fiber.state() == State::Term || fiber.state() == State::Except =>
            {
                None
            }
            other => other,
        };
        match task {
            Some(TaskKind::Fiber(fiber)) => {
                fiber.resume();
                base.active_threads.fetch_sub(1, Ordering::SeqCst);
                if fiber.state() == State::Ready {
                    base.schedule(Task::fiber(fiber));
                }
            }
            Some(TaskKind::Call(cb)) => {
                let fiber = match cb_fiber.take() {
                    Some(fiber) => {
                        fiber.reset(cb);
                        fiber
                    }
                    None => Fiber::new(cb, 0),
                };
                fiber.resume();
                base.active_threads.fetch_sub(1, Ordering::SeqCst);
                match fiber.state() {
                    State::Ready => base.schedule(Task::fiber(fiber)),
                    State::Term | State::Except => cb_fiber = Some(fiber),
                    // Parked in some wait queue which now owns a reference.
                    _ => {}
                }
            }
            None => {
                if is_active {
                    base.active_threads.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                if idle_fiber.state() == State::Term {
                    debug!(target: "system", "scheduler {} idle fiber terminated", base.name);
                    break;
                }
                base.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                base.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    // The wake-up that got us here may have been consumed by this worker
    // alone; pass it on so the remaining pollers notice the drain too.
    this.tickle();
    let exiting_on_root = util::thread_id() == this.base().root_thread;
    if !exiting_on_root {
        this.on_thread_stop();
    }
    debug!(target: "system", "scheduler worker exiting");
}
