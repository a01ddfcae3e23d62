//! State handlers for the worker loop.
//!
//! Each handler receives an exclusively locked payment plus the injected
//! capabilities, performs its external effects first, and returns the patch
//! the worker commits in one transaction. Failures from the streaming layer
//! are classified and become patches; infrastructure faults surface as
//! `HandlerFault` so the worker rolls the attempt back without touching
//! `state_attempts`.

use super::engine::Dependencies;
use super::worker::ShutdownGuard;
use crate::config::EngineConfig;
use crate::domain::payment::{
    DestinationAccount, Payment, PaymentPatch, PaymentState, Quote,
};
use crate::domain::ports::{
    AccountingService, Clock, PayRequest, Plugin, PluginFactory, QuoteRequest, RatesService,
    StreamQuote, StreamingService, Transfer,
};
use crate::error::{
    classify, AccountingError, ErrorClass, LifecycleError, PaymentError, PaymentFailure,
    PluginError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::time::timeout;

/// Faults the handlers cannot classify. The worker rolls back and the row
/// becomes eligible again; no checkpoint is written.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFault {
    #[error("shutdown requested")]
    Shutdown,
    #[error("accounting fault: {0}")]
    Accounting(#[from] AccountingError),
    #[error("plugin fault: {0}")]
    Plugin(#[from] PluginError),
    #[error("payment row violates an invariant: {0}")]
    Invariant(&'static str),
}

/// Retry bound for the states the worker retries in. `None` means the
/// state retries without bound (`Cancelling` must eventually drain).
pub(crate) fn max_attempts(config: &EngineConfig, state: PaymentState) -> Option<u32> {
    match state {
        PaymentState::Quoting => Some(config.max_quote_attempts),
        PaymentState::Sending => Some(config.max_send_attempts),
        _ => None,
    }
}

/// Probes the rate and prices the payment, then rests it in `Ready` (or
/// `Activated` when the intent auto-approves).
pub async fn handle_quoting(
    deps: &Dependencies,
    payment: &Payment,
    shutdown: &mut ShutdownGuard,
) -> Result<PaymentPatch, HandlerFault> {
    if shutdown.is_shutdown() {
        return Err(HandlerFault::Shutdown);
    }

    let limit = deps.config.external_call_timeout;
    let prices = match timeout(limit, deps.rates.prices(&payment.source_account.asset_code)).await
    {
        Ok(Ok(prices)) => Some(prices),
        Ok(Err(error)) => {
            tracing::warn!(payment = %payment.id, %error, "rate lookup failed");
            return Ok(quote_failure(
                deps,
                payment,
                PaymentError::ExternalRateUnavailable,
            ));
        }
        Err(_) => {
            tracing::warn!(payment = %payment.id, "rate lookup timed out");
            return Ok(quote_failure(
                deps,
                payment,
                PaymentError::ExternalRateUnavailable,
            ));
        }
    };

    if shutdown.is_shutdown() {
        return Err(HandlerFault::Shutdown);
    }
    let plugin = deps.plugins.open(payment.source_account.id).await?;
    let probed = probe_quote(deps, payment, &*plugin, prices).await;
    close_plugin(payment, plugin).await;

    match probed {
        Ok((destination, stream_quote)) => {
            let now = deps.clock.now();
            let deadline = now + deps.config.quote_lifespan;
            let quote = Quote {
                timestamp: now,
                activation_deadline: deadline,
                target_type: stream_quote.target_type,
                min_delivery_amount: stream_quote.min_delivery_amount,
                max_source_amount: stream_quote.max_source_amount,
                min_exchange_rate: stream_quote.min_exchange_rate,
                low_exchange_rate_estimate: stream_quote.low_exchange_rate_estimate,
                high_exchange_rate_estimate: stream_quote.high_exchange_rate_estimate,
            };
            let next = if payment.intent.auto_approve {
                PaymentState::Activated
            } else {
                PaymentState::Ready
            };
            Ok(PaymentPatch {
                state: Some(next),
                state_attempts: Some(0),
                quote: Some(Some(quote)),
                destination_account: Some(Some(destination)),
                error: Some(None),
                // The row becomes eligible again exactly when the quote
                // lapses, which is what drives expiration.
                process_at: Some(Some(deadline)),
            })
        }
        Err(error) => Ok(quote_failure(deps, payment, error)),
    }
}

async fn probe_quote(
    deps: &Dependencies,
    payment: &Payment,
    plugin: &dyn Plugin,
    prices: Option<HashMap<String, Decimal>>,
) -> Result<(DestinationAccount, StreamQuote), PaymentError> {
    let limit = deps.config.external_call_timeout;
    let destination = match timeout(
        limit,
        deps.streaming.setup_payment(plugin, &payment.intent.target),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(PaymentError::EstablishmentFailed),
    };
    let stream_quote = match timeout(
        limit,
        deps.streaming.start_quote(
            plugin,
            QuoteRequest {
                destination: destination.clone(),
                target: payment.intent.target.clone(),
                slippage: deps.config.slippage,
                prices,
            },
        ),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(PaymentError::RateProbeFailed),
    };
    Ok((destination, stream_quote))
}

/// Ready and Activated rows reach the worker only once their quote has
/// lapsed; expire them. A not-yet-expired row (a scheduling race) is just
/// re-armed for its deadline.
pub async fn handle_funding(
    deps: &Dependencies,
    payment: &Payment,
) -> Result<PaymentPatch, HandlerFault> {
    let now = deps.clock.now();
    match &payment.quote {
        Some(quote) if quote.expired(now) => Ok(cancelling_patch(
            PaymentFailure::Lifecycle(LifecycleError::QuoteExpired),
            now,
        )),
        Some(quote) => Ok(PaymentPatch {
            process_at: Some(Some(quote.activation_deadline)),
            ..PaymentPatch::default()
        }),
        None => Err(HandlerFault::Invariant("resting payment without a quote")),
    }
}

/// Streams the funded amount, resuming from the progress accounting has
/// already recorded so re-entry never double-delivers.
pub async fn handle_sending(
    deps: &Dependencies,
    payment: &Payment,
    shutdown: &mut ShutdownGuard,
) -> Result<PaymentPatch, HandlerFault> {
    let quote = payment
        .quote
        .clone()
        .ok_or(HandlerFault::Invariant("sending payment without a quote"))?;
    let destination = payment
        .destination_account
        .clone()
        .ok_or(HandlerFault::Invariant(
            "sending payment without a destination",
        ))?;

    if shutdown.is_shutdown() {
        return Err(HandlerFault::Shutdown);
    }

    let limit = deps.config.external_call_timeout;
    let progress = match timeout(limit, deps.accounting.get_total_sent(payment.account_id)).await
    {
        Ok(Ok(Some(sent))) => sent,
        Ok(Ok(None)) => return Err(AccountingError::UnknownAccount.into()),
        Ok(Err(error)) => return Err(error.into()),
        Err(_) => return Err(AccountingError::Unavailable("timed out".into()).into()),
    };

    if shutdown.is_shutdown() {
        return Err(HandlerFault::Shutdown);
    }
    let plugin = deps.plugins.open(payment.source_account.id).await?;
    let sent = match timeout(
        limit,
        deps.streaming.pay(
            &*plugin,
            PayRequest {
                destination,
                quote,
                progress_offset: progress,
            },
        ),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(PaymentError::IdleTimeout),
    };
    close_plugin(payment, plugin).await;

    match sent {
        Ok(outcome) => {
            tracing::info!(
                payment = %payment.id,
                amount_sent = outcome.amount_sent,
                amount_delivered = outcome.amount_delivered,
                "streaming send finished"
            );
            Ok(completed_patch())
        }
        Err(error) => Ok(send_failure(deps, payment, error)),
    }
}

/// Reverses unreserved source funds to the super-account and settles the
/// row in `Cancelled`. Accounting trouble keeps the row in `Cancelling`;
/// the refund key makes redelivery harmless.
pub async fn handle_cancelling(
    deps: &Dependencies,
    payment: &Payment,
    shutdown: &mut ShutdownGuard,
) -> Result<PaymentPatch, HandlerFault> {
    if shutdown.is_shutdown() {
        return Err(HandlerFault::Shutdown);
    }

    let now = deps.clock.now();
    match refund_source(deps, payment).await {
        Ok(refunded) => {
            if refunded > 0 {
                tracing::info!(payment = %payment.id, refunded, "source funds returned");
            }
            Ok(PaymentPatch {
                state: Some(PaymentState::Cancelled),
                state_attempts: Some(0),
                process_at: Some(None),
                ..PaymentPatch::default()
            })
        }
        Err(error) => {
            let attempts = payment.state_attempts + 1;
            tracing::warn!(payment = %payment.id, attempts, %error, "refund attempt failed");
            Ok(PaymentPatch {
                state_attempts: Some(attempts),
                process_at: Some(Some(now + deps.config.backoff(attempts))),
                ..PaymentPatch::default()
            })
        }
    }
}

async fn refund_source(deps: &Dependencies, payment: &Payment) -> Result<u64, AccountingError> {
    let limit = deps.config.external_call_timeout;
    let balance = match timeout(limit, deps.accounting.get_balance(payment.account_id)).await {
        Ok(Ok(balance)) => balance.unwrap_or(0),
        Ok(Err(error)) => return Err(error),
        Err(_) => return Err(AccountingError::Unavailable("timed out".into())),
    };
    if balance == 0 {
        return Ok(0);
    }
    let transfer = Transfer {
        source_account_id: payment.account_id,
        destination_account_id: payment.super_account_id,
        amount: balance,
        transfer_key: format!("cancel:{}", payment.id),
    };
    match timeout(limit, deps.accounting.create_transfer(transfer)).await {
        Ok(Ok(())) => Ok(balance),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(AccountingError::Unavailable("timed out".into())),
    }
}

fn quote_failure(deps: &Dependencies, payment: &Payment, error: PaymentError) -> PaymentPatch {
    retryable_failure(
        deps,
        payment,
        error,
        deps.config.max_quote_attempts,
        LifecycleError::QuoteFailed,
    )
}

fn send_failure(deps: &Dependencies, payment: &Payment, error: PaymentError) -> PaymentPatch {
    retryable_failure(
        deps,
        payment,
        error,
        deps.config.max_send_attempts,
        LifecycleError::SendFailed,
    )
}

fn retryable_failure(
    deps: &Dependencies,
    payment: &Payment,
    error: PaymentError,
    bound: u32,
    exhausted: LifecycleError,
) -> PaymentPatch {
    let now = deps.clock.now();
    match classify(&error) {
        ErrorClass::Done => completed_patch(),
        ErrorClass::Terminal => cancelling_patch(PaymentFailure::Payment(error), now),
        ErrorClass::Retryable => {
            let attempts = payment.state_attempts + 1;
            if attempts > bound {
                tracing::warn!(payment = %payment.id, %error, "retries exhausted");
                cancelling_patch(PaymentFailure::Lifecycle(exhausted), now)
            } else {
                tracing::debug!(payment = %payment.id, attempts, %error, "retry scheduled");
                PaymentPatch {
                    state_attempts: Some(attempts),
                    error: Some(Some(PaymentFailure::Payment(error))),
                    process_at: Some(Some(now + deps.config.backoff(attempts))),
                    ..PaymentPatch::default()
                }
            }
        }
    }
}

pub(crate) fn cancelling_patch(failure: PaymentFailure, now: DateTime<Utc>) -> PaymentPatch {
    PaymentPatch {
        state: Some(PaymentState::Cancelling),
        state_attempts: Some(0),
        error: Some(Some(failure)),
        process_at: Some(Some(now)),
        ..PaymentPatch::default()
    }
}

fn completed_patch() -> PaymentPatch {
    PaymentPatch {
        state: Some(PaymentState::Completed),
        state_attempts: Some(0),
        error: Some(None),
        process_at: Some(None),
        ..PaymentPatch::default()
    }
}

async fn close_plugin(payment: &Payment, plugin: Box<dyn Plugin>) {
    if let Err(error) = plugin.close().await {
        tracing::warn!(payment = %payment.id, %error, "failed to close plugin");
    }
}
