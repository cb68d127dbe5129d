//! Platform-specific type aliases and trait bounds
//!
//! This module provides conditional compilation for single-threaded (Rc-based)
//! vs multi-threaded (Arc-based) implementations.
//!
//! - `send` feature (default): Uses Arc and requires Send+Sync bounds
//! - `local` feature: Uses Rc and removes Send+Sync requirements. When both
//!   features are enabled, `local` wins.

// ============================================================================
// MULTI-THREADED (send feature - default)
// ============================================================================
#[cfg(not(feature = "local"))]
pub use std::sync::{Arc as SharedPtr, Weak as SharedWeak};

#[cfg(not(feature = "local"))]
pub use futures::future::BoxFuture as PlatformFuture;

#[cfg(not(feature = "local"))]
pub trait MaybeSend: Send {}
#[cfg(not(feature = "local"))]
impl<T: Send> MaybeSend for T {}

#[cfg(not(feature = "local"))]
pub trait MaybeSync: Sync {}
#[cfg(not(feature = "local"))]
impl<T: Sync> MaybeSync for T {}

// Type alias for boxed futures with proper Send bounds
#[cfg(not(feature = "local"))]
pub type PlatformBoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

// Type alias for boxed QueuingStrategy trait objects
#[cfg(not(feature = "local"))]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + Send + 'static>;

// ============================================================================
// SINGLE-THREADED (local feature)
// ============================================================================
#[cfg(feature = "local")]
pub use std::rc::{Rc as SharedPtr, Weak as SharedWeak};

#[cfg(feature = "local")]
pub use futures::future::LocalBoxFuture as PlatformFuture;

#[cfg(feature = "local")]
pub trait MaybeSend {}
#[cfg(feature = "local")]
impl<T> MaybeSend for T {}

#[cfg(feature = "local")]
pub trait MaybeSync {}
#[cfg(feature = "local")]
impl<T> MaybeSync for T {}

// Type alias for boxed futures without Send bounds for local feature
#[cfg(feature = "local")]
pub type PlatformBoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + 'a>>;

// Type alias for boxed QueuingStrategy trait objects without Send
#[cfg(feature = "local")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;
