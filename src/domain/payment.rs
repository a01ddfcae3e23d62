use crate::error::{CreateError, PaymentFailure, StoreError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle states of an outgoing payment.
///
/// `Quoting` is the initial state; `Completed` and `Cancelled` are terminal
/// and retained for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    Quoting,
    Ready,
    Activated,
    Sending,
    Cancelling,
    Completed,
    Cancelled,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Cancelled)
    }

    /// Whether a committed transition from `self` to `next` is legal.
    ///
    /// Same-state commits (retry bookkeeping) are legal for the states the
    /// worker retries in. `Cancelled -> Quoting` is the administrative
    /// requote; `Quoting -> Completed` covers an invoice that turns out to
    /// be already paid.
    pub fn can_transition(&self, next: PaymentState) -> bool {
        use PaymentState::*;
        matches!(
            (self, next),
            (Quoting, Quoting)
                | (Quoting, Ready)
                | (Quoting, Activated)
                | (Quoting, Cancelling)
                | (Quoting, Completed)
                | (Ready, Activated)
                | (Ready, Cancelling)
                | (Activated, Sending)
                | (Activated, Cancelling)
                | (Sending, Sending)
                | (Sending, Completed)
                | (Sending, Cancelling)
                | (Cancelling, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelled, Quoting)
        )
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentState::Quoting => "quoting",
            PaymentState::Ready => "ready",
            PaymentState::Activated => "activated",
            PaymentState::Sending => "sending",
            PaymentState::Cancelling => "cancelling",
            PaymentState::Completed => "completed",
            PaymentState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What the user asked the engine to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentTarget {
    /// Send a fixed source amount to a payment pointer.
    FixedSend {
        payment_pointer: String,
        amount_to_send: u64,
    },
    /// Pay an invoice for whatever it still owes.
    Invoice { invoice_url: String },
}

/// Immutable user intent captured at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(flatten)]
    pub target: PaymentTarget,
    pub auto_approve: bool,
}

impl Intent {
    /// Exhaustive admission check for the intent.
    pub fn validate(&self) -> Result<(), CreateError> {
        match &self.target {
            PaymentTarget::FixedSend {
                payment_pointer,
                amount_to_send,
            } => {
                if payment_pointer.is_empty() {
                    return Err(CreateError::InvalidIntent("payment pointer is empty"));
                }
                if *amount_to_send == 0 {
                    return Err(CreateError::InvalidIntent("amount to send is zero"));
                }
                Ok(())
            }
            PaymentTarget::Invoice { invoice_url } => {
                if invoice_url.is_empty() {
                    return Err(CreateError::InvalidIntent("invoice url is empty"));
                }
                Ok(())
            }
        }
    }
}

/// The sub-account the engine spends from, captured at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAccount {
    pub id: Uuid,
    pub asset_code: String,
    pub asset_scale: u8,
}

/// The receiving side, captured when the destination is first resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationAccount {
    pub asset_code: String,
    pub asset_scale: u8,
    pub url: String,
}

/// Whether the quote fixes the amount sent or the amount delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentType {
    FixedSend,
    FixedDelivery,
}

/// A priced plan, honoured until `activation_deadline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub timestamp: DateTime<Utc>,
    pub activation_deadline: DateTime<Utc>,
    pub target_type: PaymentType,
    pub min_delivery_amount: u64,
    pub max_source_amount: u64,
    pub min_exchange_rate: Decimal,
    pub low_exchange_rate_estimate: Decimal,
    pub high_exchange_rate_estimate: Decimal,
}

impl Quote {
    /// The deadline instant itself counts as expired.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.activation_deadline <= now
    }
}

/// The outgoing payment aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub state: PaymentState,
    /// Consecutive retry attempts in the current state.
    pub state_attempts: u32,
    pub intent: Intent,
    /// Sub-account created for this payment at admission.
    pub account_id: Uuid,
    /// Parent account funding the payment.
    pub super_account_id: Uuid,
    pub source_account: SourceAccount,
    pub destination_account: Option<DestinationAccount>,
    pub quote: Option<Quote>,
    pub error: Option<PaymentFailure>,
    /// Earliest instant the worker pool may pick the row up again.
    pub process_at: Option<DateTime<Utc>>,
    /// Caller-supplied idempotency token for `create`.
    pub client_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Admit a fresh payment in `Quoting`, eligible immediately.
    pub fn admit(
        intent: Intent,
        super_account_id: Uuid,
        source_account: SourceAccount,
        client_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: PaymentState::Quoting,
            state_attempts: 0,
            intent,
            account_id: source_account.id,
            super_account_id,
            source_account,
            destination_account: None,
            quote: None,
            error: None,
            process_at: Some(now),
            client_token,
            created_at: now,
            updated_at: now,
        }
    }

    /// The worker's eligibility predicate: due per `process_at`, and either
    /// in a worker-actionable state or resting on an expired quote.
    pub fn eligible(&self, now: DateTime<Utc>) -> bool {
        let due = match self.process_at {
            Some(at) => at <= now,
            None => false,
        };
        if !due {
            return false;
        }
        match self.state {
            PaymentState::Quoting | PaymentState::Sending | PaymentState::Cancelling => true,
            PaymentState::Ready | PaymentState::Activated => {
                self.quote.as_ref().is_some_and(|q| q.expired(now))
            }
            PaymentState::Completed | PaymentState::Cancelled => false,
        }
    }

    /// Invariant gate run by every store commit.
    pub fn validate_patch(&self, patch: &PaymentPatch) -> Result<(), StoreError> {
        let next_state = patch.state.unwrap_or(self.state);
        if self.state.is_terminal() && next_state == self.state {
            return Err(StoreError::InvalidTransition {
                from: self.state,
                to: next_state,
            });
        }
        if next_state != self.state && !self.state.can_transition(next_state) {
            return Err(StoreError::InvalidTransition {
                from: self.state,
                to: next_state,
            });
        }
        let next_attempts = patch.state_attempts.unwrap_or(self.state_attempts);
        if next_state != self.state && next_attempts != 0 {
            return Err(StoreError::InvariantViolation(
                "state_attempts must reset to zero on a state change",
            ));
        }
        let quote_present = match &patch.quote {
            Some(next_quote) => next_quote.is_some(),
            None => self.quote.is_some(),
        };
        if matches!(
            next_state,
            PaymentState::Ready | PaymentState::Activated | PaymentState::Sending
        ) && !quote_present
        {
            return Err(StoreError::InvariantViolation(
                "quote must be present in Ready, Activated and Sending",
            ));
        }
        Ok(())
    }

    /// Apply a validated patch, stamping `updated_at`.
    pub fn apply_patch(&mut self, patch: PaymentPatch, now: DateTime<Utc>) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(attempts) = patch.state_attempts {
            self.state_attempts = attempts;
        }
        if let Some(quote) = patch.quote {
            self.quote = quote;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(destination) = patch.destination_account {
            self.destination_account = destination;
        }
        if let Some(process_at) = patch.process_at {
            self.process_at = process_at;
        }
        self.updated_at = now;
    }
}

/// Partial update committed together with a state transition.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears a nullable
/// column.
#[derive(Debug, Clone, Default)]
pub struct PaymentPatch {
    pub state: Option<PaymentState>,
    pub state_attempts: Option<u32>,
    pub quote: Option<Option<Quote>>,
    pub error: Option<Option<PaymentFailure>>,
    pub destination_account: Option<Option<DestinationAccount>>,
    pub process_at: Option<Option<DateTime<Utc>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn fixed_send_intent() -> Intent {
        Intent {
            target: PaymentTarget::FixedSend {
                payment_pointer: "$wallet.example/alice".to_string(),
                amount_to_send: 1000,
            },
            auto_approve: false,
        }
    }

    fn source_account() -> SourceAccount {
        SourceAccount {
            id: Uuid::new_v4(),
            asset_code: "USD".to_string(),
            asset_scale: 2,
        }
    }

    fn quote_at(now: DateTime<Utc>) -> Quote {
        Quote {
            timestamp: now,
            activation_deadline: now + std::time::Duration::from_secs(5),
            target_type: PaymentType::FixedSend,
            min_delivery_amount: 990,
            max_source_amount: 1000,
            min_exchange_rate: dec!(0.99),
            low_exchange_rate_estimate: dec!(0.99),
            high_exchange_rate_estimate: dec!(1.01),
        }
    }

    #[test]
    fn test_legal_transitions() {
        use PaymentState::*;
        assert!(Quoting.can_transition(Ready));
        assert!(Quoting.can_transition(Activated));
        assert!(Quoting.can_transition(Completed));
        assert!(Ready.can_transition(Activated));
        assert!(Ready.can_transition(Cancelling));
        assert!(Activated.can_transition(Sending));
        assert!(Sending.can_transition(Sending));
        assert!(Sending.can_transition(Completed));
        assert!(Cancelling.can_transition(Cancelled));
        assert!(Cancelled.can_transition(Quoting));
    }

    #[test]
    fn test_illegal_transitions() {
        use PaymentState::*;
        assert!(!Completed.can_transition(Quoting));
        assert!(!Completed.can_transition(Sending));
        assert!(!Cancelled.can_transition(Sending));
        assert!(!Ready.can_transition(Sending));
        assert!(!Quoting.can_transition(Sending));
        assert!(!Sending.can_transition(Ready));
    }

    #[test]
    fn test_intent_validation() {
        assert!(fixed_send_intent().validate().is_ok());

        let zero = Intent {
            target: PaymentTarget::FixedSend {
                payment_pointer: "$wallet.example/alice".to_string(),
                amount_to_send: 0,
            },
            auto_approve: false,
        };
        assert!(matches!(
            zero.validate(),
            Err(CreateError::InvalidIntent(_))
        ));

        let empty_url = Intent {
            target: PaymentTarget::Invoice {
                invoice_url: String::new(),
            },
            auto_approve: false,
        };
        assert!(matches!(
            empty_url.validate(),
            Err(CreateError::InvalidIntent(_))
        ));
    }

    #[test]
    fn test_admitted_payment_is_eligible() {
        let payment = Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, t0());
        assert_eq!(payment.state, PaymentState::Quoting);
        assert_eq!(payment.state_attempts, 0);
        assert!(payment.eligible(t0()));
    }

    #[test]
    fn test_ready_payment_eligible_only_after_deadline() {
        let now = t0();
        let mut payment =
            Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, now);
        let quote = quote_at(now);
        let deadline = quote.activation_deadline;
        payment.state = PaymentState::Ready;
        payment.quote = Some(quote);
        payment.process_at = Some(deadline);

        assert!(!payment.eligible(now));
        // The deadline instant itself counts as expired.
        assert!(payment.eligible(deadline));
    }

    #[test]
    fn test_patch_rejects_illegal_transition() {
        let payment = Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, t0());
        let patch = PaymentPatch {
            state: Some(PaymentState::Sending),
            quote: Some(Some(quote_at(t0()))),
            ..PaymentPatch::default()
        };
        assert!(matches!(
            payment.validate_patch(&patch),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_patch_requires_attempt_reset_on_state_change() {
        let payment = Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, t0());
        let patch = PaymentPatch {
            state: Some(PaymentState::Ready),
            state_attempts: Some(3),
            quote: Some(Some(quote_at(t0()))),
            ..PaymentPatch::default()
        };
        assert!(matches!(
            payment.validate_patch(&patch),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_patch_requires_quote_for_ready() {
        let payment = Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, t0());
        let patch = PaymentPatch {
            state: Some(PaymentState::Ready),
            state_attempts: Some(0),
            ..PaymentPatch::default()
        };
        assert!(matches!(
            payment.validate_patch(&patch),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_terminal_rows_are_immutable() {
        let mut payment =
            Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, t0());
        payment.state = PaymentState::Cancelled;
        payment.error = Some(PaymentFailure::Lifecycle(LifecycleError::CancelledByAPI));

        let touch = PaymentPatch {
            state_attempts: Some(1),
            ..PaymentPatch::default()
        };
        assert!(payment.validate_patch(&touch).is_err());

        // The administrative requote is the single exception.
        let requote = PaymentPatch {
            state: Some(PaymentState::Quoting),
            state_attempts: Some(0),
            quote: Some(None),
            error: Some(None),
            process_at: Some(Some(t0())),
            ..PaymentPatch::default()
        };
        assert!(payment.validate_patch(&requote).is_ok());
    }

    #[test]
    fn test_apply_patch_stamps_updated_at() {
        let mut payment =
            Payment::admit(fixed_send_intent(), Uuid::new_v4(), source_account(), None, t0());
        let later = t0() + std::time::Duration::from_secs(1);
        payment.apply_patch(
            PaymentPatch {
                state: Some(PaymentState::Ready),
                state_attempts: Some(0),
                quote: Some(Some(quote_at(t0()))),
                ..PaymentPatch::default()
            },
            later,
        );
        assert_eq!(payment.state, PaymentState::Ready);
        assert_eq!(payment.updated_at, later);
    }

    #[test]
    fn test_intent_serde_roundtrip() {
        let intent = fixed_send_intent();
        let json = serde_json::to_string(&intent).unwrap();
        let back: Intent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, intent);
    }
}
