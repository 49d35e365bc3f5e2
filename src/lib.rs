//! # testkit-reactor 🧰
//!
//! > Drive event-loop code to completion from synchronous tests
//!
//! **testkit-reactor** lets a plain, blocking test wait on a computation that
//! runs on an event loop, with a timeout, interrupt handling and a report of
//! everything the loop was still holding afterwards.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use testkit_reactor::prelude::*;
//!
//! let reactor = Reactor::new();
//! let spinner = Spinner::new(reactor.clone());
//!
//! let answer = spinner
//!     .run(Duration::from_secs(1), || {
//!         let sleeper = reactor.clone();
//!         reactor.spawn(async move {
//!             sleeper.sleep(Duration::from_millis(5)).await;
//!             Ok(42)
//!         })
//!     })
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```
//!
//! ## Features
//!
//! - 📬 **Deferreds** - Fire-once results with callbacks and unhandled failure tracking
//! - 🔁 **Reactor** - Timers, tasks, sockets and worker threads on one loop
//! - 🌀 **Spinner** - Block on the loop with timeouts, interrupts and junk reports
//! - 🧪 **RunTest** - Set up, body, cleanups and tear down with one reported outcome

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod deferred;
pub mod error;
pub mod reactor;
pub mod result;
pub mod runtest;
pub mod spinner;

/// Prelude for convenient imports
///
/// ```rust
/// use testkit_reactor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::deferred::{
        extract_result, trap_unhandled_failures, AssertionFailed, Deferred, Failure,
        IntoDeferred, SkipTest,
    };
    pub use crate::error::{Error, Result};
    pub use crate::reactor::{DelayedCall, Reactor, ReactorConfig};
    pub use crate::result::{RecordingResult, TestResult};
    pub use crate::runtest::{Details, Outcome, RunTest, RunTestConfig, TestPhases};
    pub use crate::spinner::{Junk, Spinner, SpinnerConfig};
}

// Re-exports
pub use error::{Error, Result};
