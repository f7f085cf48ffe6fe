use thiserror::Error;

/// Error taxonomy for the fabric table and its entries. Mirrors the
/// `CHIP_ERROR_*` discriminants the original raises from the equivalent
/// calls (`CHIP_ERROR_INVALID_ARGUMENT`, `CHIP_ERROR_NO_MEMORY`, ...), kept
/// as distinct variants rather than collapsed into a string so callers can
/// match on credential-validation failures for diagnostics.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("fabric table has no free slot")]
    NoMemory,
    #[error("operation invoked while the entry or table was in the wrong state")]
    IncorrectState,
    #[error("no matching fabric, slot, or storage entry was found")]
    NotFound,
    #[error("ICAC fabric id does not match NOC fabric id")]
    FabricMismatchOnIca,
    #[error("root fabric id does not match NOC fabric id")]
    WrongCertDn,
    #[error("certificate chain is not trusted")]
    CertNotTrusted,
    #[error("storage error: {0}")]
    Storage(#[from] device_storage::StorageError),
    #[error("crypto error: {0}")]
    Crypto(#[from] fabric_crypto::CryptoError),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<fabric_certs::CertError> for FabricError {
    fn from(err: fabric_certs::CertError) -> Self {
        use fabric_certs::CertError::*;
        match err {
            FabricMismatchOnIca => FabricError::FabricMismatchOnIca,
            WrongCertDn => FabricError::WrongCertDn,
            CertNotTrusted => FabricError::CertNotTrusted,
            BufferTooLarge(n) => FabricError::InvalidArgument(format!("certificate buffer exceeds MAX_CERT_LEN: {n} bytes")),
            other => FabricError::Internal(other.to_string()),
        }
    }
}
