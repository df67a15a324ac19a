use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spindle::fiber::Fiber;
use spindle::scheduler::{Scheduler, Task};
use spindle::util;

fn init_log() {
    let _ = spindle::log::init();
}

#[test]
fn single_worker_runs_in_submission_order() {
    init_log();
    let order = Arc::new(Mutex::new(Vec::new()));
    let sched = Scheduler::new(1, false, "fifo");
    sched.start();
    for i in 0..100usize {
        let order = order.clone();
        sched.schedule(Task::call(move || {
            order.lock().unwrap().push(i);
        }));
    }
    sched.stop();
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 100);
    assert!(order.windows(2).all(|w| w[0] < w[1]), "order was not FIFO");
}

#[test]
fn bulk_schedule_keeps_entries_adjacent() {
    init_log();
    let order = Arc::new(Mutex::new(Vec::new()));
    let sched = Scheduler::new(1, false, "bulk");
    sched.start();
    let tasks = (0..50usize)
        .map(|i| {
            let order = order.clone();
            Task::call(move || {
                order.lock().unwrap().push(i);
            })
        })
        .collect();
    sched.schedule_all(tasks);
    sched.stop();
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..50usize).collect::<Vec<_>>());
}

#[test]
fn caller_included_drains_before_stop_returns() {
    init_log();
    let done = Arc::new(AtomicUsize::new(0));
    let sched = Scheduler::new(4, true, "drain");
    sched.start();
    for _ in 0..200 {
        let done = done.clone();
        sched.schedule(Task::call(move || {
            // Unhooked outside a reactor, so this briefly blocks the worker.
            spindle::hook::usleep(2_000);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    sched.stop();
    assert_eq!(done.load(Ordering::SeqCst), 200, "stop() lost queued work");
}

#[test]
fn pinned_tasks_run_on_their_thread() {
    init_log();
    let sched = Scheduler::new(2, false, "pinned");
    sched.start();
    // Spawned workers register their ids asynchronously.
    let deadline = Instant::now() + Duration::from_secs(5);
    while sched.thread_ids().len() < 2 {
        assert!(Instant::now() < deadline, "workers never registered");
        std::thread::sleep(Duration::from_millis(1));
    }
    let target = sched.thread_ids()[0];
    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..20 {
        let seen = seen.clone();
        sched.schedule(Task::call_on(
            move || {
                seen.lock().unwrap().push(util::thread_id());
            },
            target,
        ));
    }
    sched.stop();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    assert!(
        seen.iter().all(|tid| *tid == target),
        "pinned task ran on a foreign thread"
    );
}

#[test]
fn ready_yield_requeues_the_fiber() {
    init_log();
    let passes = Arc::new(AtomicUsize::new(0));
    let sched = Scheduler::new(1, false, "ready");
    sched.start();
    let counter = passes.clone();
    sched.schedule(Task::call(move || {
        for _ in 0..3 {
            counter.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
        }
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    sched.stop();
    assert_eq!(passes.load(Ordering::SeqCst), 4);
}

#[test]
fn scheduling_a_plain_fiber_works() {
    init_log();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let fiber = Fiber::new(
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        0,
    );
    let sched = Scheduler::new(2, false, "fibers");
    sched.start();
    sched.schedule(Task::fiber(fiber));
    sched.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
