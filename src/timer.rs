//! Timer wheel
//!
//! An ordered set of deadline-bearing callbacks. The wheel answers "how long
//! until the next deadline" for the reactor's epoll wait and hands back the
//! expired callbacks afterwards. Deadlines are wall-clock milliseconds; a
//! backwards clock jump past one hour flushes every timer once rather than
//! stalling them forever.
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

/// A timer callback. Shared so recurring timers can fire it repeatedly.
pub type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

pub struct Timer {
    // Absolute deadline in ms. Only mutated after the timer has been removed
    // from the ordered set, so the set's ordering stays coherent.
    deadline: AtomicU64,
    period: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<TimerFn>>,
    wheel: Weak<WheelCore>,
}

impl Timer {
    fn new(ms: u64, cb: TimerFn, recurring: bool, wheel: &Arc<WheelCore>) -> Arc<Timer> {
        Arc::new(Timer {
            deadline: AtomicU64::new(clock::now_ms() + ms),
            period: AtomicU64::new(ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            wheel: Arc::downgrade(wheel),
        })
    }

    fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }

    pub fn period(&self) -> u64 {
        self.period.load(Ordering::Relaxed)
    }

    pub fn recurring(&self) -> bool {
        self.recurring
    }

    /// Drop the timer from its wheel and release the callback. Returns false
    /// if it already fired (non-recurring) or was cancelled before.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let core = match self.wheel.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut inner = core.inner.write().unwrap();
        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        inner.timers.take(&TimerKey(self.clone()));
        true
    }

    /// Rebase the deadline to now + period. Fails on a fired or cancelled
    /// timer.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let core = match self.wheel.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut inner = core.inner.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        if inner.timers.take(&TimerKey(self.clone())).is_none() {
            return false;
        }
        // A refresh only pushes the deadline later, so it cannot become the
        // new earliest timer.
        self.deadline
            .store(clock::now_ms() + self.period(), Ordering::Relaxed);
        inner.timers.insert(TimerKey(self.clone()));
        true
    }

    /// Change the period and re-arm, measuring from now or from the original
    /// start. `reset(period, false)` with an unchanged period is a no-op.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == self.period() && !from_now {
            return true;
        }
        let core = match self.wheel.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let at_front = {
            let mut inner = core.inner.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            if inner.timers.take(&TimerKey(self.clone())).is_none() {
                return false;
            }
            let start = if from_now {
                clock::now_ms()
            } else {
                self.deadline().saturating_sub(self.period())
            };
            self.period.store(ms, Ordering::Relaxed);
            self.deadline.store(start + ms, Ordering::Relaxed);
            insert_locked(&mut inner, self.clone())
        };
        if at_front {
            core.notify_front();
        }
        true
    }
}

// Set ordering: deadline ascending, object identity as the tie break so
// distinct timers with coincident deadlines order deterministically.
#[derive(Clone)]
struct TimerKey(Arc<Timer>);

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TimerKey {}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .deadline()
            .cmp(&other.0.deadline())
            .then_with(|| Arc::as_ptr(&self.0).cmp(&Arc::as_ptr(&other.0)))
    }
}

struct Inner {
    timers: BTreeSet<TimerKey>,
    // One front-insert notification per quiet period; reset when the reactor
    // next computes its timeout.
    tickled: bool,
    prev_time: u64,
}

pub(crate) struct WheelCore {
    inner: RwLock<Inner>,
    on_front: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl WheelCore {
    fn notify_front(&self) {
        let waker = self.on_front.lock().unwrap();
        if let Some(ref waker) = *waker {
            waker();
        }
    }
}

fn insert_locked(inner: &mut Inner, timer: Arc<Timer>) -> bool {
    inner.timers.insert(TimerKey(timer.clone()));
    let at_front = match inner.timers.iter().next() {
        Some(first) => Arc::ptr_eq(&first.0, &timer) && !inner.tickled,
        None => false,
    };
    if at_front {
        inner.tickled = true;
    }
    at_front
}

/// Ordered set of timers with rollover detection.
pub struct TimerWheel {
    core: Arc<WheelCore>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            core: Arc::new(WheelCore {
                inner: RwLock::new(Inner {
                    timers: BTreeSet::new(),
                    tickled: false,
                    prev_time: clock::now_ms(),
                }),
                on_front: Mutex::new(None),
            }),
        }
    }

    // Invoked when an insertion produces a new earliest deadline; the reactor
    // points this at its tickle so a too-long epoll timeout gets cut short.
    pub(crate) fn set_front_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        *self.core.on_front.lock().unwrap() = Some(waker);
    }

    /// Arm a timer `ms` milliseconds from now.
    pub fn add_timer(&self, ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        let timer = Timer::new(ms, cb, recurring, &self.core);
        let at_front = {
            let mut inner = self.core.inner.write().unwrap();
            insert_locked(&mut inner, timer.clone())
        };
        if at_front {
            self.core.notify_front();
        }
        timer
    }

    /// Arm a timer whose callback only runs while `cond` still upgrades to a
    /// live owner at fire time.
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
        let guarded: TimerFn = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, guarded, recurring)
    }

    /// Milliseconds until the earliest deadline: 0 when overdue, `u64::MAX`
    /// when the wheel is empty.
    pub fn next_timeout(&self) -> u64 {
        let mut inner = self.core.inner.write().unwrap();
        inner.tickled = false;
        let next = match inner.timers.iter().next() {
            Some(first) => first.0.deadline(),
            None => return u64::MAX,
        };
        let now = clock::now_ms();
        if now >= next {
            0
        } else {
            next - now
        }
    }

    /// Dequeue every expired timer, pushing its callback into `out`.
    /// Recurring timers are re-armed at now + period; non-recurring ones
    /// release their callback.
    pub fn collect_expired(&self, out: &mut Vec<TimerFn>) {
        let now = clock::now_ms();
        {
            let inner = self.core.inner.read().unwrap();
            if inner.timers.is_empty() {
                return;
            }
        }
        let mut inner = self.core.inner.write().unwrap();
        let rollover = detect_rollover(&mut inner, now);
        if !rollover {
            match inner.timers.iter().next() {
                Some(first) if first.0.deadline() > now => return,
                None => return,
                _ => {}
            }
        }
        let mut expired = Vec::new();
        loop {
            let due = match inner.timers.iter().next() {
                Some(first) => rollover || first.0.deadline() <= now,
                None => false,
            };
            if !due {
                break;
            }
            let key = inner.timers.pop_first().unwrap();
            expired.push(key.0);
        }
        out.reserve(expired.len());
        for timer in expired {
            let mut cb = timer.cb.lock().unwrap();
            if timer.recurring {
                let armed = match *cb {
                    Some(ref armed) => armed.clone(),
                    None => continue,
                };
                out.push(armed);
                drop(cb);
                timer
                    .deadline
                    .store(now + timer.period(), Ordering::Relaxed);
                inner.timers.insert(TimerKey(timer));
            } else if let Some(released) = cb.take() {
                out.push(released);
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.core.inner.read().unwrap().timers.is_empty()
    }
}

// A backwards jump of more than an hour is treated as the clock being set
// back; everything fires once instead of waiting out the phantom interval.
fn detect_rollover(inner: &mut Inner, now: u64) -> bool {
    let rollover =
        now < inner.prev_time && now < inner.prev_time.saturating_sub(CLOCK_ROLLOVER_MS);
    inner.prev_time = now;
    rollover
}
