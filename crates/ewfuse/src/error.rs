use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

/// Failure raised while building, compiling or launching a fused kernel.
///
/// Every variant is reported before any device work is issued, except
/// [`FuseError::Device`] which may also surface from the launch itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FuseError {
    /// Malformed postfix stream, unknown operation or missing operand metadata.
    #[error("invalid expression: {message}")]
    Construction { message: String },
    /// Operand extents that cannot be broadcast against each other.
    #[error("incompatible shapes: {message}")]
    ShapeCompatibility { message: String },
    /// Layouts the fused kernels cannot address (rank > 2 outside plain elementwise work).
    #[error("unsupported shape: {message}")]
    UnsupportedShape { message: String },
    /// The device compiler rejected the rendered source.
    #[error("kernel compilation failed: {message}")]
    Compilation { message: String },
    /// Driver, memory or launch failure.
    #[error("device failure: {message}")]
    Device { message: String },
}

pub type FuseResult<T> = Result<T, FuseError>;

impl FuseError {
    pub fn construction(message: impl Into<String>) -> Self {
        FuseError::Construction {
            message: message.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        FuseError::ShapeCompatibility {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        FuseError::UnsupportedShape {
            message: message.into(),
        }
    }

    pub fn compilation(message: impl Into<String>) -> Self {
        FuseError::Compilation {
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        FuseError::Device {
            message: message.into(),
        }
    }
}

pub fn lock_named<'a, T>(mutex: &'a Mutex<T>, name: &str) -> FuseResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| FuseError::device(format!("{name} mutex poisoned")))
}
