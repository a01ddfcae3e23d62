use crate::domain::payment::PaymentState;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to the caller of `create`.
#[derive(Error, Debug, Diagnostic)]
pub enum CreateError {
    #[error("super-account does not resolve")]
    #[diagnostic(code(outpay::unknown_account))]
    UnknownAccount,

    #[error("mandate does not resolve")]
    #[diagnostic(code(outpay::unknown_mandate))]
    UnknownMandate,

    #[error("invalid payment intent: {0}")]
    #[diagnostic(code(outpay::invalid_intent))]
    InvalidIntent(&'static str),

    #[error("internal engine error")]
    #[diagnostic(code(outpay::internal))]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors surfaced to callers of the remaining commands.
#[derive(Error, Debug, Diagnostic)]
pub enum StateError {
    #[error("payment is in state {actual:?}, which does not permit this command")]
    #[diagnostic(code(outpay::wrong_state))]
    WrongState { actual: PaymentState },

    #[error("unknown payment")]
    #[diagnostic(code(outpay::unknown_payment))]
    UnknownPayment,

    #[error("insufficient funds to cover the quoted source amount")]
    #[diagnostic(code(outpay::insufficient_funds))]
    InsufficientFunds,

    #[error("internal engine error")]
    #[diagnostic(code(outpay::internal))]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The closed error set reported by the streaming layer.
///
/// `classify` partitions these into terminal, retryable and done; the
/// lifecycle handlers never branch on individual variants beyond that.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentError {
    // Client-caused, terminal.
    #[error("invalid payment pointer")]
    InvalidPaymentPointer,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("unknown source asset")]
    UnknownSourceAsset,
    #[error("unknown payment target")]
    UnknownPaymentTarget,
    #[error("invalid source amount")]
    InvalidSourceAmount,
    #[error("invalid destination amount")]
    InvalidDestinationAmount,
    #[error("delivery cannot be enforced")]
    UnenforceableDelivery,
    #[error("destination query failed")]
    QueryFailed,

    // Server or transient, retryable.
    #[error("invalid slippage")]
    InvalidSlippage,
    #[error("invalid quote")]
    InvalidQuote,
    #[error("invoice already paid")]
    InvoiceAlreadyPaid,
    #[error("connector error")]
    ConnectorError,
    #[error("connection establishment failed")]
    EstablishmentFailed,
    #[error("unknown destination asset")]
    UnknownDestinationAsset,
    #[error("destination asset conflict")]
    DestinationAssetConflict,
    #[error("external rate unavailable")]
    ExternalRateUnavailable,
    #[error("rate probe failed")]
    RateProbeFailed,
    #[error("insufficient exchange rate")]
    InsufficientExchangeRate,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("closed by receiver")]
    ClosedByReceiver,
    #[error("incompatible receive max")]
    IncompatibleReceiveMax,
    #[error("receiver protocol violation")]
    ReceiverProtocolViolation,
    #[error("max safe encryption limit reached")]
    MaxSafeEncryptionLimit,
}

/// How a `PaymentError` drives the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Client-caused; the payment moves to `Cancelling` carrying the error.
    Terminal,
    /// Transient; the attempt is retried under the per-state bound.
    Retryable,
    /// The destination is already satisfied; the payment completes.
    Done,
}

/// Pure classification of the streaming error set.
pub fn classify(error: &PaymentError) -> ErrorClass {
    use PaymentError::*;
    match error {
        InvalidPaymentPointer | InvalidCredentials | UnknownSourceAsset | UnknownPaymentTarget
        | InvalidSourceAmount | InvalidDestinationAmount | UnenforceableDelivery | QueryFailed => {
            ErrorClass::Terminal
        }
        InvoiceAlreadyPaid => ErrorClass::Done,
        InvalidSlippage | InvalidQuote | ConnectorError | EstablishmentFailed
        | UnknownDestinationAsset | DestinationAssetConflict | ExternalRateUnavailable
        | RateProbeFailed | InsufficientExchangeRate | IdleTimeout | ClosedByReceiver
        | IncompatibleReceiveMax | ReceiverProtocolViolation | MaxSafeEncryptionLimit => {
            ErrorClass::Retryable
        }
    }
}

/// Engine-originated terminal error codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleError {
    #[error("cancelled by API")]
    CancelledByAPI,
    #[error("quote expired before activation")]
    QuoteExpired,
    #[error("retries exhausted")]
    RetriesExhausted,
    #[error("quoting failed after retries")]
    QuoteFailed,
    #[error("sending failed after retries")]
    SendFailed,
}

/// The error code persisted on a payment row: either the streaming layer's
/// verdict or an engine-originated lifecycle code. Terminal for cancelled
/// payments, last-attempt for rows still being retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentFailure {
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Faults raised by payment store implementations.
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    #[error("payment {0} already exists")]
    #[diagnostic(code(outpay::store::duplicate))]
    Duplicate(Uuid),

    #[error("client token already bound to payment {existing}")]
    #[diagnostic(code(outpay::store::duplicate_token))]
    DuplicateClientToken { existing: Uuid },

    #[error("payment {0} not found")]
    #[diagnostic(code(outpay::store::missing))]
    Missing(Uuid),

    #[error("illegal transition from {from:?} to {to:?}")]
    #[diagnostic(code(outpay::store::invalid_transition))]
    InvalidTransition { from: PaymentState, to: PaymentState },

    #[error("commit violates invariant: {0}")]
    #[diagnostic(code(outpay::store::invariant))]
    InvariantViolation(&'static str),

    #[error("storage backend error: {0}")]
    #[diagnostic(code(outpay::store::backend))]
    Backend(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("row serialization: {err}"))
    }
}

/// Faults raised by the accounting capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountingError {
    #[error("account not known to the accounting service")]
    UnknownAccount,
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("accounting service unavailable: {0}")]
    Unavailable(String),
}

/// Faults raised by the rates capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatesError {
    #[error("rates service unavailable: {0}")]
    Unavailable(String),
}

/// Faults raised while opening or closing a streaming plugin.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin connect failed: {0}")]
    Connect(String),
    #[error("plugin close failed: {0}")]
    Close(String),
}
