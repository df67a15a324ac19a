use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use spindle::config::Config;
use spindle::fiber::Fiber;

#[test]
fn lookup_with_creates_with_default() {
    let var = Config::lookup_with("test.simple.port", 8080u16, "a port");
    assert_eq!(var.value(), 8080);
    // Second lookup returns the same variable.
    let again = Config::lookup_with("test.simple.port", 1u16, "a port");
    assert_eq!(again.value(), 8080);
}

#[test]
fn lookup_rejects_wrong_type() {
    Config::lookup_with("test.typed.value", 10i64, "typed");
    assert!(Config::lookup::<String>("test.typed.value").is_none());
    assert!(Config::lookup::<i64>("test.typed.value").is_some());
}

#[test]
fn set_fires_listeners_with_old_and_new() {
    let var = Config::lookup_with("test.listener.value", 1i32, "listened");
    let observed = Arc::new(Mutex::new(Vec::new()));
    let log = observed.clone();
    let key = var.add_listener(move |old: &i32, new: &i32| {
        log.lock().unwrap().push((*old, *new));
    });

    var.set(2);
    var.set(2); // unchanged, must not fire
    var.set(5);
    assert_eq!(*observed.lock().unwrap(), vec![(1, 2), (2, 5)]);

    var.del_listener(key);
    var.set(9);
    assert_eq!(observed.lock().unwrap().len(), 2);
}

#[test]
fn yaml_load_updates_registered_vars() {
    let var = Config::lookup_with("test.yaml.threads", 4u32, "worker count");
    Config::load_yaml_str("test:\n  yaml:\n    threads: 16").unwrap();
    assert_eq!(var.value(), 16);
}

#[test]
fn yaml_load_with_wrong_type_is_skipped() {
    let var = Config::lookup_with("test.badtype.count", 3u32, "a count");
    Config::load_yaml_str("test:\n  badtype:\n    count: not_a_number").unwrap();
    assert_eq!(var.value(), 3, "bad value must leave the var untouched");
}

#[test]
fn yaml_values_wait_for_late_registration() {
    Config::load_yaml_str("test:\n  pending:\n    size: 777").unwrap();
    let var = Config::lookup_with("test.pending.size", 1u64, "late");
    assert_eq!(var.value(), 777);
}

#[test]
fn sequences_deserialize_into_vecs() {
    let var = Config::lookup_with(
        "test.seq.names",
        vec!["a".to_string()],
        "a name list",
    );
    Config::load_yaml_str("test:\n  seq:\n    names: [x, y, z]").unwrap();
    assert_eq!(var.value(), vec!["x", "y", "z"]);
}

#[test]
fn dump_contains_registered_vars() {
    Config::lookup_with("test.dump.flag", true, "a flag");
    let dump = Config::dump().unwrap();
    assert!(dump.contains("test.dump.flag"));
}

// Stack size propagation: configured before the first fiber exists, changed
// between constructions.
#[test]
fn fiber_stack_size_follows_config() {
    Config::load_yaml_str("fiber:\n  stack_size: 2097152").unwrap();
    let first = Fiber::new(Box::new(|| {}), 0);
    assert_eq!(first.stack_size(), 2 * 1024 * 1024);

    let var = Config::lookup::<u32>("fiber.stack_size").expect("registered by fiber::new");
    var.set(524288);
    let second = Fiber::new(Box::new(|| {}), 0);
    assert_eq!(second.stack_size(), 512 * 1024);

    first.resume();
    second.resume();
}

#[test]
fn tcp_connect_timeout_listener_updates_global() {
    let hits = Arc::new(AtomicUsize::new(0));
    // Force hook initialization so the variable and its listener exist.
    spindle::hook::set_enabled(false);
    let var = Config::lookup::<i32>("tcp.connect.timeout").expect("registered by the hook layer");
    let count = hits.clone();
    var.add_listener(move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    var.set(1234);
    assert_eq!(spindle::hook::connect_timeout_ms(), 1234);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    var.set(5000);
}
