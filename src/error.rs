//! syncr error types

use crate::tensor::DType;

/// syncr result type
pub type Result<T> = std::result::Result<T, Error>;

/// syncr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Parameter set failed construction-time verification
    #[error("verification failed: {reason}")]
    VerificationFailed {
        /// Description of what went wrong
        reason: String,
    },

    /// The reduction protocol was driven out of order
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of what went wrong
        reason: String,
    },

    /// DType mismatch between a gradient and its bucket
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// A gradient does not match what its bucket slot expects
    #[error("gradient mismatch: {reason}")]
    GradientMismatch {
        /// Description of what went wrong
        reason: String,
    },

    /// A collective operation failed
    #[error("{op} failed: {reason}")]
    CommunicationFailed {
        /// The collective that failed
        op: &'static str,
        /// Description of what went wrong
        reason: String,
    },

    /// Internal lock poisoned by a panicking thread
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::ProtocolViolation {
            reason: "marked twice".into(),
        };
        assert_eq!(e.to_string(), "protocol violation: marked twice");
    }

    #[test]
    fn test_dtype_mismatch_display() {
        let e = Error::DTypeMismatch {
            expected: DType::F32,
            got: DType::F64,
        };
        assert_eq!(e.to_string(), "dtype mismatch: expected f32, got f64");
    }

    #[test]
    fn test_communication_failed_display() {
        let e = Error::CommunicationFailed {
            op: "allreduce",
            reason: "peer disconnected".into(),
        };
        assert_eq!(e.to_string(), "allreduce failed: peer disconnected");
    }

    #[test]
    fn test_all_variants_display_nonempty() {
        let errors: Vec<Error> = vec![
            Error::InvalidArgument {
                arg: "tensors",
                reason: "empty".into(),
            },
            Error::VerificationFailed {
                reason: "size mismatch".into(),
            },
            Error::ProtocolViolation {
                reason: "x".into(),
            },
            Error::DTypeMismatch {
                expected: DType::F16,
                got: DType::BF16,
            },
            Error::GradientMismatch {
                reason: "sparse where dense expected".into(),
            },
            Error::CommunicationFailed {
                op: "broadcast",
                reason: "x".into(),
            },
            Error::LockPoisoned("reducer state"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
