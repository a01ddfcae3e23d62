use super::payment::{
    DestinationAccount, Payment, PaymentPatch, PaymentTarget, PaymentType, Quote, SourceAccount,
};
use crate::error::{AccountingError, PaymentError, PluginError, RatesError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Wall-clock source, injected so deadlines are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A balance movement, idempotent per `transfer_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub source_account_id: Uuid,
    pub destination_account_id: Uuid,
    pub amount: u64,
    /// Stable idempotency key, e.g. `"fund:{transfer_id}"` or
    /// `"cancel:{payment_id}"`.
    pub transfer_key: String,
}

#[async_trait]
/// Interface to the external accounting service.
pub trait AccountingService: Send + Sync {
    /// Moves funds between accounts. Redelivery of the same `transfer_key`
    /// causes no additional balance movement.
    async fn create_transfer(&self, transfer: Transfer) -> Result<(), AccountingError>;
    /// Cumulative amount streamed out of an account, if the account is known.
    async fn get_total_sent(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError>;
    /// Current balance of an account, if the account is known.
    async fn get_balance(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError>;
}

#[async_trait]
/// Interface to the external exchange-rate service.
pub trait RatesService: Send + Sync {
    /// Rates quoted against `base_asset`, keyed by asset code.
    async fn prices(&self, base_asset: &str) -> Result<HashMap<String, Decimal>, RatesError>;
}

/// Parameters for the streaming rate probe.
#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub destination: DestinationAccount,
    pub target: PaymentTarget,
    pub slippage: Decimal,
    pub prices: Option<HashMap<String, Decimal>>,
}

/// The streaming layer's priced plan, before the engine stamps deadlines.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamQuote {
    pub target_type: PaymentType,
    pub min_delivery_amount: u64,
    pub max_source_amount: u64,
    pub min_exchange_rate: Decimal,
    pub low_exchange_rate_estimate: Decimal,
    pub high_exchange_rate_estimate: Decimal,
}

/// Parameters for the packetized send.
#[derive(Debug, Clone)]
pub struct PayRequest {
    pub destination: DestinationAccount,
    pub quote: Quote,
    /// Amount already sent in earlier attempts, read back from accounting,
    /// so re-entry never double-delivers.
    pub progress_offset: u64,
}

/// Result of a finished send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayOutcome {
    pub amount_sent: u64,
    pub amount_delivered: u64,
}

#[async_trait]
/// Interface to the streaming micro-payment library.
pub trait StreamingService: Send + Sync {
    /// Resolves the destination behind a payment pointer or invoice.
    async fn setup_payment(
        &self,
        plugin: &dyn Plugin,
        target: &PaymentTarget,
    ) -> Result<DestinationAccount, PaymentError>;

    /// Probes the exchange rate and prices the payment.
    async fn start_quote(
        &self,
        plugin: &dyn Plugin,
        request: QuoteRequest,
    ) -> Result<StreamQuote, PaymentError>;

    /// Streams the remaining amount, starting from `progress_offset`.
    async fn pay(&self, plugin: &dyn Plugin, request: PayRequest)
        -> Result<PayOutcome, PaymentError>;
}

#[async_trait]
/// Interface to the account service that mints per-payment sub-accounts.
pub trait SubAccountFactory: Send + Sync {
    async fn create_sub_account(
        &self,
        super_account_id: Uuid,
    ) -> Result<SourceAccount, AccountingError>;
}

#[async_trait]
/// A scoped connection to the streaming network for one source account.
pub trait Plugin: Send + Sync {
    fn account_id(&self) -> Uuid;
    async fn close(self: Box<Self>) -> Result<(), PluginError>;
}

#[async_trait]
/// Mints plugins. Callers must close every plugin they open, on every exit
/// path; leaked plugins stall the streaming backend.
pub trait PluginFactory: Send + Sync {
    async fn open(&self, source_account_id: Uuid) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Paging direction for `list_by_account`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListDirection {
    Forward,
    Backward,
}

/// One page of payments plus the extra-row probes the list contract requires.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPage {
    pub items: Vec<Payment>,
    pub has_next: bool,
    pub has_previous: bool,
}

#[async_trait]
/// An exclusively locked payment row.
///
/// Holding the lock grants sole mutation rights on the row. `commit`
/// validates the aggregate invariants, persists the patch and releases the
/// lock; dropping the lock without committing rolls the attempt back.
pub trait PaymentLock: Send {
    fn payment(&self) -> &Payment;
    async fn commit(self: Box<Self>, patch: PaymentPatch) -> Result<Payment, StoreError>;
}

pub type PaymentLockBox = Box<dyn PaymentLock>;

#[async_trait]
/// Interface for persisting and retrieving payment rows.
pub trait PaymentStore: Send + Sync {
    /// Persists a freshly admitted payment. Fails on duplicate id or on a
    /// `(super_account_id, client_token)` pair that is already bound.
    async fn insert(&self, payment: Payment) -> Result<(), StoreError>;

    /// Retrieves a payment by id.
    async fn get(&self, id: Uuid) -> Result<Option<Payment>, StoreError>;

    /// Looks up the payment bound to a create idempotency token.
    async fn get_by_client_token(
        &self,
        super_account_id: Uuid,
        token: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Locks a row for exclusive mutation, waiting for any current holder.
    async fn lock(&self, id: Uuid) -> Result<Option<PaymentLockBox>, StoreError>;

    /// Locks the first eligible row, skipping rows held by other workers.
    /// Rows are visited fairly, oldest `updated_at` first.
    async fn next_eligible(&self, now: DateTime<Utc>) -> Result<Option<PaymentLockBox>, StoreError>;

    /// Cursor paging over the payments visible to an account (its own
    /// sub-account payments and those it funds as a super-account).
    async fn list_by_account(
        &self,
        account_id: Uuid,
        cursor: Option<Uuid>,
        limit: usize,
        direction: ListDirection,
    ) -> Result<PaymentPage, StoreError>;
}

pub type PaymentStoreArc = Arc<dyn PaymentStore>;
