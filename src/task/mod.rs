//! Cancelable task results and collective completion coordination.
//!
//! [`AsyncResult`] is the unit everything here is built from: a
//! single-assignment, cancelable holder of a task's eventual value or
//! failure. The coordination layer ([`invoke_all`], [`invoke_any`],
//! [`CompletionQueue`]) composes AsyncResults with an external
//! [`Execute`] implementation; it never runs work itself.

mod async_result;
mod completion;
mod executor;
mod state;

pub use async_result::{AsyncResult, Cause, JoinError, Panicked, TaskFn};
pub use completion::{
    invoke_all, invoke_all_timeout, invoke_any, invoke_any_timeout, CompletionQueue, InvokeError,
};
pub use executor::{Execute, RejectedError, ThreadExecutor};
pub use state::RunState;
