//! lb_core: shared plumbing for the Lockbox storage crates
//!
//! - `context`: hierarchical cancellation / deadline / value carrier passed
//!   explicitly to every operation
//! - `result` : async result alias, panic capture, error composition and
//!   batch fan-out
//! - `error`  : cancellation reasons and composite error types
//! - `logging`: tracing subscriber setup

pub mod context;
pub mod error;
pub mod logging;
pub mod result;

pub use context::{CancelFunc, CancelSource, Context};
pub use error::{AggregateError, BoxError, Cancelled, Error, WrappedError};
pub use result::AsyncResult;
