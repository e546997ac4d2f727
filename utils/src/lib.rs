//! Small helpers shared by the `ostree-container` crates. Generally only add
//! things here that only depend on the standard library and the tracing stack.
//!
mod iterators;
pub use iterators::*;
mod tracing_util;
pub use tracing_util::*;
