//! Emission errors
//!
//! Most of this crate's failure modes are impossible states (a patch
//! outside the buffer, an orbyte left unconsumed) and panic; `EmitError`
//! covers the conditions the host can actually hit and handle.

/// Error while producing or installing native code
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("pc-relative displacement out of range: {0}")]
    RelativeOutOfRange(i64),
    #[error("executable mapping failed: {0}")]
    Map(String),
}
