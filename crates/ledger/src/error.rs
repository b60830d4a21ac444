//! Error types for the ledger engine.

use thiserror::Error;

/// Errors that can occur in ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Out-of-bound amount, quantity or installment count, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A debit would drive a balance negative
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    /// Not enough unpledged quota value to secure a credit
    #[error("Insufficient collateral: {0}")]
    InsufficientCollateral(String),

    /// An approval queue item has already been decided
    #[error("Already decided: {0}")]
    AlreadyDecided(String),

    /// A pending transaction has already been settled
    #[error("Already settled: {0}")]
    AlreadySettled(String),

    /// Invalid engine configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The payment gateway could not create a charge; the transaction stays pending
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// The payment gateway refused the charge; the transaction is cancelled
    #[error("Charge rejected: {0}")]
    ChargeRejected(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Quota not found: {0}")]
    QuotaNotFound(String),

    #[error("Credit not found: {0}")]
    CreditNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// The caller is not allowed to perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The entity is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Idempotency guards are reported as errors but mean "nothing left to do"
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(self, LedgerError::AlreadyDecided(_) | LedgerError::AlreadySettled(_))
    }

    /// Errors caused by the caller's input rather than by the ledger itself
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            LedgerError::Configuration(_)
                | LedgerError::Storage(_)
                | LedgerError::Serialization(_)
                | LedgerError::Internal(_)
        )
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
