/// Recoverable failures of mapping operations.
///
/// None of these are retried internally; the caller decides.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    /// No physical frame (or region slot) was available.
    #[error("out of memory")]
    OutOfMemory,
    /// No free virtual range of the requested size exists where it was asked for.
    #[error("no free virtual range of the requested size")]
    RangeUnavailable,
    /// Caller programming error: zero length, misalignment, length or permission mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
