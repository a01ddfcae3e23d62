use crate::config::EngineConfig;
use crate::domain::payment::{Intent, Payment, PaymentPatch, PaymentState};
use crate::domain::ports::{
    AccountingService, Clock, ListDirection, PaymentLock, PaymentPage, PaymentStore,
    PluginFactory, RatesService, StreamingService, SubAccountFactory, Transfer,
};
use crate::error::{
    AccountingError, CreateError, LifecycleError, PaymentFailure, StateError, StoreError,
};
use std::sync::Arc;
use uuid::Uuid;

/// Everything the engine talks to, passed in explicitly. No process-wide
/// singletons; tests wire their own record.
pub struct Dependencies {
    pub store: Arc<dyn PaymentStore>,
    pub accounting: Arc<dyn AccountingService>,
    pub rates: Arc<dyn RatesService>,
    pub streaming: Arc<dyn StreamingService>,
    pub sub_accounts: Arc<dyn SubAccountFactory>,
    pub plugins: Arc<dyn PluginFactory>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

/// The command surface of the engine: the only authorized mutator besides
/// the worker pool. Every mutating command runs against an exclusively
/// locked row, so it serializes with the workers on that payment.
#[derive(Clone)]
pub struct OutgoingPayments {
    deps: Arc<Dependencies>,
}

impl OutgoingPayments {
    pub fn new(deps: Arc<Dependencies>) -> Self {
        Self { deps }
    }

    /// Admits a payment: validates the intent, mints a sub-account under
    /// the funding super-account and persists the `Quoting` row.
    ///
    /// A `client_token` makes the call idempotent: retries with the same
    /// token return the originally admitted payment.
    pub async fn create(
        &self,
        intent: Intent,
        super_account_id: Uuid,
        client_token: Option<String>,
    ) -> Result<Payment, CreateError> {
        intent.validate()?;

        if let Some(token) = &client_token {
            if let Some(existing) = self
                .deps
                .store
                .get_by_client_token(super_account_id, token)
                .await
                .map_err(internal_create)?
            {
                return Ok(existing);
            }
        }

        let source_account = self
            .deps
            .sub_accounts
            .create_sub_account(super_account_id)
            .await
            .map_err(|error| match error {
                AccountingError::UnknownAccount => CreateError::UnknownAccount,
                other => internal_create(other),
            })?;

        let now = self.deps.clock.now();
        let payment = Payment::admit(intent, super_account_id, source_account, client_token, now);
        match self.deps.store.insert(payment.clone()).await {
            Ok(()) => {
                tracing::info!(payment = %payment.id, super_account = %super_account_id, "payment admitted");
                Ok(payment)
            }
            // Lost a create race on the same token; hand back the winner.
            Err(StoreError::DuplicateClientToken { existing }) => self
                .deps
                .store
                .get(existing)
                .await
                .map_err(internal_create)?
                .ok_or_else(|| internal_create(StoreError::Missing(existing))),
            Err(error) => Err(internal_create(error)),
        }
    }

    /// Approves a quoted payment: `Ready -> Activated`.
    pub async fn approve(&self, id: Uuid) -> Result<Payment, StateError> {
        let lock = self.lock(id).await?;
        let payment = lock.payment();
        if payment.state != PaymentState::Ready {
            return Err(StateError::WrongState {
                actual: payment.state,
            });
        }
        lock.commit(PaymentPatch {
            state: Some(PaymentState::Activated),
            state_attempts: Some(0),
            ..PaymentPatch::default()
        })
        .await
        .map_err(internal_state)
    }

    /// Cancels a quoted payment: `Ready -> Cancelling(CancelledByAPI)`.
    pub async fn cancel(&self, id: Uuid) -> Result<Payment, StateError> {
        let lock = self.lock(id).await?;
        let payment = lock.payment();
        if payment.state != PaymentState::Ready {
            return Err(StateError::WrongState {
                actual: payment.state,
            });
        }
        let now = self.deps.clock.now();
        lock.commit(PaymentPatch {
            state: Some(PaymentState::Cancelling),
            state_attempts: Some(0),
            error: Some(Some(PaymentFailure::Lifecycle(
                LifecycleError::CancelledByAPI,
            ))),
            process_at: Some(Some(now)),
            ..PaymentPatch::default()
        })
        .await
        .map_err(internal_state)
    }

    /// Administrative requote of a cancelled payment: back to `Quoting`
    /// with a clean slate.
    pub async fn requote(&self, id: Uuid) -> Result<Payment, StateError> {
        let lock = self.lock(id).await?;
        let payment = lock.payment();
        if payment.state != PaymentState::Cancelled {
            return Err(StateError::WrongState {
                actual: payment.state,
            });
        }
        let now = self.deps.clock.now();
        lock.commit(PaymentPatch {
            state: Some(PaymentState::Quoting),
            state_attempts: Some(0),
            quote: Some(None),
            error: Some(None),
            process_at: Some(Some(now)),
            ..PaymentPatch::default()
        })
        .await
        .map_err(internal_state)
    }

    /// Reserves the quoted source amount from the super-account and starts
    /// the send: `Activated -> Sending`.
    ///
    /// The accounting transfer is keyed by `transfer_id`, so a retried
    /// `fund` moves no additional funds.
    pub async fn fund(
        &self,
        id: Uuid,
        amount: u64,
        transfer_id: Uuid,
    ) -> Result<Payment, StateError> {
        let lock = self.lock(id).await?;
        let payment = lock.payment().clone();
        if payment.state != PaymentState::Activated {
            return Err(StateError::WrongState {
                actual: payment.state,
            });
        }
        let quote = payment
            .quote
            .as_ref()
            .ok_or_else(|| internal_state(StoreError::InvariantViolation(
                "activated payment without a quote",
            )))?;

        let now = self.deps.clock.now();
        if quote.expired(now) {
            // The deadline has passed; expire the quote rather than fund it.
            lock.commit(expire_patch(now))
                .await
                .map_err(internal_state)?;
            return Err(StateError::WrongState {
                actual: PaymentState::Cancelling,
            });
        }
        if amount < quote.max_source_amount {
            return Err(StateError::InsufficientFunds);
        }

        self.deps
            .accounting
            .create_transfer(Transfer {
                source_account_id: payment.super_account_id,
                destination_account_id: payment.account_id,
                amount,
                transfer_key: format!("fund:{transfer_id}"),
            })
            .await
            .map_err(|error| match error {
                AccountingError::InsufficientBalance => StateError::InsufficientFunds,
                other => internal_state(other),
            })?;

        tracing::info!(payment = %id, amount, transfer = %transfer_id, "payment funded");
        lock.commit(PaymentPatch {
            state: Some(PaymentState::Sending),
            state_attempts: Some(0),
            error: Some(None),
            process_at: Some(Some(now)),
            ..PaymentPatch::default()
        })
        .await
        .map_err(internal_state)
    }

    pub async fn get(&self, id: Uuid) -> Result<Payment, StateError> {
        self.deps
            .store
            .get(id)
            .await
            .map_err(internal_state)?
            .ok_or(StateError::UnknownPayment)
    }

    pub async fn list_by_account(
        &self,
        account_id: Uuid,
        cursor: Option<Uuid>,
        limit: usize,
        direction: ListDirection,
    ) -> Result<PaymentPage, StateError> {
        self.deps
            .store
            .list_by_account(account_id, cursor, limit, direction)
            .await
            .map_err(internal_state)
    }

    async fn lock(
        &self,
        id: Uuid,
    ) -> Result<crate::domain::ports::PaymentLockBox, StateError> {
        self.deps
            .store
            .lock(id)
            .await
            .map_err(internal_state)?
            .ok_or(StateError::UnknownPayment)
    }
}

/// The patch committed when a quote lapses before funding.
pub(crate) fn expire_patch(now: chrono::DateTime<chrono::Utc>) -> PaymentPatch {
    PaymentPatch {
        state: Some(PaymentState::Cancelling),
        state_attempts: Some(0),
        error: Some(Some(PaymentFailure::Lifecycle(LifecycleError::QuoteExpired))),
        process_at: Some(Some(now)),
        ..PaymentPatch::default()
    }
}

fn internal_create(error: impl std::error::Error + Send + Sync + 'static) -> CreateError {
    CreateError::Internal(Box::new(error))
}

fn internal_state(error: impl std::error::Error + Send + Sync + 'static) -> StateError {
    StateError::Internal(Box::new(error))
}
