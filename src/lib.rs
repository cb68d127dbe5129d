//! WHATWG-style streams with a transform stream that couples a writable
//! side to a readable side under a shared backpressure signal.

mod platform;
pub mod streams;

pub use platform::{MaybeSend, MaybeSync, PlatformFuture, SharedPtr};
pub use streams::*;
