//! Pinna Core
//!
//! Asynchronous-result building blocks for the Pinna request pipeline.
//!
//! # Architecture
//!
//! - **Possibility**: tri-state container (empty / value / error)
//! - **Promise**: single-assignment future with continuations delivered on a
//!   requested [`Queue`], plus [`when_all`] for collecting many promises
//! - **Queues**: named worker pools ([`Queue`], [`QueueManager`]) that host
//!   request execution and continuation delivery
//! - **Error Handling**: unified, cloneable [`Error`] and [`Result`]
//!
//! # Example
//!
//! ```rust
//! use pinna_core::{when_all, Possibility, Promise, Queue};
//!
//! let answer = Promise::deferred(|promise| promise.accept(42));
//! let failed = Promise::rejected(pinna_core::Error::Cancelled);
//!
//! let results = when_all(vec![answer, failed]).wait().unwrap();
//! assert_eq!(results[0], Possibility::Value(42));
//! assert!(results[1].is_error());
//!
//! Promise::accepted("hello").then_on(
//!     |greeting| println!("{greeting}"),
//!     |error| eprintln!("{error}"),
//!     &Queue::inline(),
//! );
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod possibility;
pub mod promise;
pub mod queue;

pub use error::{Error, Result, TransportErrorKind};
pub use possibility::{Possibility, PossibilityState};
pub use promise::{when_all, Promise, PromiseState, ANONYMOUS_PROMISE_NAME};
pub use queue::{Queue, QueueManager, COMMON_QUEUE_NAME};
