//! Internal utilities: spin backoff and backoff randomization.
//!
//! These helpers are intentionally minimal and dependency-free; both
//! exist to keep the wait loops in the primitives bounded and fair.

mod backoff;
mod rng;

pub use backoff::Backoff;
pub use rng::XorShift64;
