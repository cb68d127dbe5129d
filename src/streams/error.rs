use std::{error::Error, fmt, sync::Arc};

/// Failure reasons surfaced by endpoints and the transform coordinator.
///
/// Once an endpoint has recorded a stored error, every later operation on
/// that endpoint reports a clone of it. Clones of [`StreamError::Other`]
/// share their payload, so equality on that variant is pointer identity.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The readable side was canceled by its reader.
    Canceled(Option<String>),
    /// The writable side was aborted by its writer.
    Aborted(Option<String>),
    Closing,
    Closed,
    TaskDropped,
    /// An operation was attempted in a state that does not allow it.
    TypeError(String),
    /// The transform stream was terminated through its controller.
    Terminated,
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StreamError::Canceled(a), StreamError::Canceled(b)) => a == b,
            (StreamError::Aborted(a), StreamError::Aborted(b)) => a == b,
            (StreamError::Closing, StreamError::Closing) => true,
            (StreamError::Closed, StreamError::Closed) => true,
            (StreamError::TaskDropped, StreamError::TaskDropped) => true,
            (StreamError::TypeError(a), StreamError::TypeError(b)) => a == b,
            (StreamError::Terminated, StreamError::Terminated) => true,
            (StreamError::Other(a), StreamError::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use transform_streams::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct ParseError;
///
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "parse error")
///     }
/// }
///
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn example() -> Result<(), StreamError> {
///     Err(ParseError)?;
///     Ok(())
/// }
/// assert!(example().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Canceled(Some(reason)) => write!(f, "Stream was canceled: {}", reason),
            StreamError::Canceled(None) => write!(f, "Stream operation was canceled"),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::Closing => write!(f, "Stream is closing"),
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::TypeError(msg) => write!(f, "TypeError: {}", msg),
            StreamError::Terminated => write!(f, "the stream has been terminated"),
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
