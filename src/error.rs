use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid enrollment: {0}")]
    InvalidEnrollment(String),
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("Stake below minimum: {0}")]
    BelowMinimumStake(String),
    #[error("Lock period active: {0}")]
    LockPeriodActive(String),
    #[error("Unsupported pair: {0}")]
    UnsupportedPair(String),
    #[error("Quote expired: {0}")]
    QuoteExpired(String),
    #[error("Concurrent modification, retry the operation")]
    ConcurrentModification,
    #[error("Denied by security policy: {0}")]
    SecurityDenied(String),
    #[error("Bridge confirmation timed out: {0}")]
    BridgeTimeout(String),
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether the caller may safely resubmit the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrentModification)
    }

    /// Stable machine-readable code for the RPC envelope.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::InvalidEnrollment(_) => "invalid_enrollment",
            LedgerError::InsufficientFunds(_) => "insufficient_funds",
            LedgerError::BelowMinimumStake(_) => "below_minimum_stake",
            LedgerError::LockPeriodActive(_) => "lock_period_active",
            LedgerError::UnsupportedPair(_) => "unsupported_pair",
            LedgerError::QuoteExpired(_) => "quote_expired",
            LedgerError::ConcurrentModification => "concurrent_modification",
            LedgerError::SecurityDenied(_) => "security_denied",
            LedgerError::BridgeTimeout(_) => "bridge_timeout",
            LedgerError::UnsupportedChain(_) => "unsupported_chain",
            LedgerError::InvalidRequest(_) => "invalid_request",
            LedgerError::Storage(_) => "storage_error",
        }
    }
}
