//! # Rate Gate
//! Many external resources (APIs, queues) enforce a sliding-window rate
//! limit: no more than N calls within any trailing time frame. This crate
//! provides an admission controller that enforces such a limit on the
//! caller's side: callers `acquire` a slot before doing their work and
//! release it afterwards, and the gate makes sure that at most `limit`
//! executions are in flight or completed within any trailing `interval`.
//! Waiters are admitted in the order they asked, and a waiter that no longer
//! wants to wait can bail out through a cancellation token.
//!
//! # Example
//! Here, we create a gate that admits 2 executions every second and push
//! three jobs through it. The first two run immediately, the third is held
//! back until a full second after the first completion.
//! ```
//! # use std::time::Duration;
//! # use rate_gate::RateGate;
//! # use tokio::time::Instant;
//! # #[tokio::main]
//! # async fn main() {
//!     let gate = RateGate::new(Duration::from_secs(1), 2).unwrap();
//!     let start = Instant::now();
//!     for i in 0..3 {
//!         let permit = gate.acquire().await;
//!         println!("job {} admitted at {:?}", i, Instant::now() - start);
//!         permit.release(true);
//!     }
//!
//!     // job 0 admitted at 12.1µs
//!     // job 1 admitted at 26.701µs
//!     // job 2 admitted at 1.002s
//! # }
//! ```
//!
//! An execution that should not count toward the limit (say, a request that
//! failed before reaching the resource) can be released with
//! `permit.release(false)`, giving its slot back to the window.

mod error;
mod gate;

pub use error::Error;
pub use gate::{RateGate, ReleaseHandle};
