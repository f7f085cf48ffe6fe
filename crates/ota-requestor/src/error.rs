use thiserror::Error;

/// Error taxonomy for the OTA requestor, narrowed from the shared taxonomy in
/// spec.md §7 to the kinds this crate's operations can actually raise.
#[derive(Debug, Error)]
pub enum OtaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation invoked while the requestor was in the wrong state")]
    IncorrectState,
    #[error("no provider is available for the requested fabric")]
    NotFound,
    #[error("operation timed out")]
    Timeout,
    #[error("provider reported Busy")]
    Busy,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("storage error: {0}")]
    Storage(#[from] device_storage::StorageError),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}
