pub mod error;
pub mod readable;
pub mod transform;
pub mod writable;

mod backpressure;

use std::task::Waker;

// Re-export main types
pub use error::*;
pub use readable::*;
pub use transform::*;
pub use writable::*;

pub type StreamResult<T> = Result<T, StreamError>;

/// Type-level marker for unlocked streams
pub struct Unlocked;
/// Type-level marker for locked streams
pub struct Locked;

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk. A failing size function errors the
    /// endpoint that asked for it.
    fn size(&self, chunk: &T) -> StreamResult<usize>;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<usize> {
        Ok(1)
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> StreamResult<usize> {
        Ok(chunk.len())
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> StreamResult<usize> {
        Ok(chunk.len())
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Strategy backed by a caller-supplied size function.
///
/// ```rust
/// use transform_streams::{QueuingStrategy, SizeQueuingStrategy, StreamError};
///
/// let strategy = SizeQueuingStrategy::new(16, |chunk: &Vec<u32>| -> Result<usize, StreamError> {
///     if chunk.is_empty() {
///         Err(StreamError::TypeError("empty chunk".into()))
///     } else {
///         Ok(chunk.len() * 4)
///     }
/// });
/// assert_eq!(strategy.size(&vec![1, 2]).unwrap(), 8);
/// assert!(strategy.size(&Vec::new()).is_err());
/// ```
#[derive(Clone)]
pub struct SizeQueuingStrategy<F> {
    high_water_mark: usize,
    size: F,
}

impl<F> SizeQueuingStrategy<F> {
    pub const fn new(high_water_mark: usize, size: F) -> Self {
        Self {
            high_water_mark,
            size,
        }
    }
}

impl<T, F> QueuingStrategy<T> for SizeQueuingStrategy<F>
where
    F: Fn(&T) -> StreamResult<usize>,
{
    fn size(&self, chunk: &T) -> StreamResult<usize> {
        (self.size)(chunk)
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Wakers waiting on one endpoint condition. Lives inside the endpoint's
/// locked state, so it carries no lock of its own.
#[derive(Default, Debug)]
pub(crate) struct WakerSet(Vec<Waker>);

impl WakerSet {
    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.0.iter().any(|w| w.will_wake(waker)) {
            self.0.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.0.drain(..) {
            waker.wake();
        }
    }
}
