//! Spindle is a cooperative fiber runtime: stackful fibers multiplexed onto
//! a small pool of worker threads by an M:N scheduler, with an epoll-driven
//! reactor filling the scheduler's idle path and a hook layer that turns
//! blocking calls into fiber suspensions. Configuration comes from a dynamic
//! typed registry loadable from YAML.
//!
//! ```rust
//! use spindle::reactor::Reactor;
//! use spindle::scheduler::Task;
//! use spindle::hook;
//!
//! let reactor = Reactor::new(2, false, "example");
//! reactor.schedule(Task::call(|| {
//!     hook::usleep(10_000);
//!     println!("slept without blocking a worker");
//! }));
//! reactor.stop();
//! ```
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate num_derive;

pub mod clock;
pub mod coio;
pub mod config;
pub mod error;
pub mod fiber;
pub mod hook;
pub mod log;
pub mod reactor;
pub mod scheduler;
pub mod timer;
pub mod util;
