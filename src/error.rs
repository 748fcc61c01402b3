use thiserror::Error;

/// Failure kinds for the artifact and journal pipelines.
///
/// Nothing here is retried. Decode failures drop one artifact and the scan
/// continues; only `PrivilegeNotAvailable` is fatal to the process.
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum ScanError {
    #[error("debug privilege could not be acquired")]
    PrivilegeNotAvailable,

    #[error("artifact is {0} bytes, below the 256-byte minimum")]
    TooShort(usize),

    #[error("unrecognized artifact format")]
    UnsupportedFormat,

    #[error("system decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trust service refused verification: {0}")]
    TrustServiceDenied(String),

    #[error("cryptographic service unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("change journal query failed: {0}")]
    JournalQueryFailed(String),
}
