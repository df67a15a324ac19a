use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spindle::reactor::Reactor;
use spindle::timer::Timer;

fn init_log() {
    let _ = spindle::log::init();
}

fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn one_shot_fires_once() {
    init_log();
    let reactor = Reactor::new(2, false, "oneshot");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let timer = reactor.add_timer(
        100,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        false,
    );
    wait_until("the timer", || fired.load(Ordering::SeqCst) == 1);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    // Fired means the callback is gone; refresh and cancel both refuse.
    assert!(!timer.refresh());
    assert!(!timer.cancel());
    reactor.stop();
}

#[test]
fn front_insertion_shortens_the_wait() {
    init_log();
    let reactor = Reactor::new(1, false, "front");
    // Park the poller on a long deadline first, then arm a short one; the
    // short timer must still fire on time.
    let long_guard = reactor.add_timer(30_000, Arc::new(|| {}), false);
    std::thread::sleep(Duration::from_millis(50));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let t0 = Instant::now();
    reactor.add_timer(
        100,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        false,
    );
    wait_until("the short timer", || fired.load(Ordering::SeqCst) == 1);
    assert!(
        t0.elapsed() < Duration::from_secs(2),
        "short timer waited out the long deadline"
    );
    assert!(long_guard.cancel());
    reactor.stop();
}

#[test]
fn recurring_timer_respects_reset() {
    init_log();
    let reactor = Reactor::new(2, false, "recurring");
    let fire_times = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let handle: Arc<Mutex<Option<Arc<Timer>>>> = Arc::new(Mutex::new(None));

    let times = fire_times.clone();
    let rearm = handle.clone();
    let timer = reactor.add_timer(
        60,
        Arc::new(move || {
            let mut times = times.lock().unwrap();
            times.push(Instant::now());
            if times.len() == 3 {
                if let Some(ref timer) = *rearm.lock().unwrap() {
                    assert!(timer.reset(150, true));
                }
            }
        }),
        true,
    );
    *handle.lock().unwrap() = Some(timer.clone());

    std::thread::sleep(Duration::from_millis(1000));
    assert!(timer.cancel());
    reactor.stop();

    let times = fire_times.lock().unwrap();
    assert!(
        times.len() >= 5,
        "recurring timer only fired {} times",
        times.len()
    );
    // After the third fire the period is 150 ms; the steady-state gaps at the
    // tail must honor it (the fire racing the reset itself is skipped).
    for pair in times[times.len() - 3..].windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(140),
            "post-reset gap was only {:?}",
            gap
        );
    }
}

#[test]
fn condition_timer_skips_dead_witness() {
    init_log();
    let reactor = Reactor::new(2, false, "cond");
    let fired = Arc::new(AtomicUsize::new(0));

    let witness = Arc::new(());
    let counter = fired.clone();
    reactor.add_condition_timer(
        100,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        Arc::downgrade(&witness),
        false,
    );
    drop(witness);

    let live_witness = Arc::new(());
    let counter = fired.clone();
    reactor.add_condition_timer(
        100,
        Arc::new(move || {
            counter.fetch_add(10, Ordering::SeqCst);
        }),
        Arc::downgrade(&live_witness),
        false,
    );

    std::thread::sleep(Duration::from_millis(400));
    reactor.stop();
    drop(live_witness);
    assert_eq!(
        fired.load(Ordering::SeqCst),
        10,
        "only the timer with a live witness may fire"
    );
}

#[test]
fn cancel_prevents_firing() {
    init_log();
    let reactor = Reactor::new(1, false, "cancel");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let timer = reactor.add_timer(
        150,
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        false,
    );
    assert!(timer.cancel());
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    reactor.stop();
}
