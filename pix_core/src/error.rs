use thiserror::Error;

/// Error taxonomy shared by the charge codec and its callers.
///
/// `Configuration` is the only fatal class: a charge must never be
/// emitted with a broken merchant key, because the payer keeps the QR
/// forever. Everything external degrades instead of propagating.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
