//! In-process reference implementations of the capability ports.
//!
//! The simulator keeps a toy ledger, resolves payment pointers locally and
//! streams instantly. The demo binary runs on it, and the integration
//! suites drive the retry and terminal paths through its fault injection
//! hooks (`fail_*` queues).

use crate::domain::payment::{DestinationAccount, PaymentTarget, PaymentType, SourceAccount};
use crate::domain::ports::{
    AccountingService, PayOutcome, PayRequest, Plugin, PluginFactory, QuoteRequest, RatesService,
    StreamQuote, StreamingService, SubAccountFactory, Transfer,
};
use crate::error::{AccountingError, PaymentError, PluginError, RatesError};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
struct AccountState {
    balance: u64,
    total_sent: u64,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Uuid, AccountState>,
    /// Applied transfer keys; redelivery is a no-op.
    transfers: HashMap<String, u64>,
    fail_ops: u32,
}

/// A toy double-entry ledger acting as both the accounting service and the
/// sub-account factory.
#[derive(Clone)]
pub struct SimulatedLedger {
    asset_code: String,
    asset_scale: u8,
    state: Arc<Mutex<LedgerState>>,
}

impl SimulatedLedger {
    pub fn new(asset_code: &str, asset_scale: u8) -> Self {
        Self {
            asset_code: asset_code.to_string(),
            asset_scale,
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    pub fn asset_code(&self) -> &str {
        &self.asset_code
    }

    pub fn register_account(&self, id: Uuid, balance: u64) {
        let mut state = self.state.lock().unwrap();
        state.accounts.insert(
            id,
            AccountState {
                balance,
                total_sent: 0,
            },
        );
    }

    pub fn balance_of(&self, id: Uuid) -> Option<u64> {
        self.state.lock().unwrap().accounts.get(&id).map(|a| a.balance)
    }

    pub fn total_sent_of(&self, id: Uuid) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(&id)
            .map(|a| a.total_sent)
    }

    pub fn transfer_count(&self) -> usize {
        self.state.lock().unwrap().transfers.len()
    }

    /// Makes the next `n` accounting calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_ops = n;
    }

    /// Out-of-band packet accounting: the streaming layer consumes source
    /// funds and grows `total_sent` as packets leave.
    fn record_streamed(&self, id: Uuid, amount: u64) {
        let mut state = self.state.lock().unwrap();
        let account = state.accounts.entry(id).or_default();
        account.balance = account.balance.saturating_sub(amount);
        account.total_sent += amount;
    }

    fn check_fault(state: &mut LedgerState) -> Result<(), AccountingError> {
        if state.fail_ops > 0 {
            state.fail_ops -= 1;
            return Err(AccountingError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountingService for SimulatedLedger {
    async fn create_transfer(&self, transfer: Transfer) -> Result<(), AccountingError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fault(&mut state)?;
        if state.transfers.contains_key(&transfer.transfer_key) {
            return Ok(());
        }
        if !state.accounts.contains_key(&transfer.destination_account_id) {
            return Err(AccountingError::UnknownAccount);
        }
        let source_balance = state
            .accounts
            .get(&transfer.source_account_id)
            .ok_or(AccountingError::UnknownAccount)?
            .balance;
        if source_balance < transfer.amount {
            return Err(AccountingError::InsufficientBalance);
        }
        if let Some(source) = state.accounts.get_mut(&transfer.source_account_id) {
            source.balance -= transfer.amount;
        }
        if let Some(destination) = state.accounts.get_mut(&transfer.destination_account_id) {
            destination.balance += transfer.amount;
        }
        state.transfers.insert(transfer.transfer_key, transfer.amount);
        Ok(())
    }

    async fn get_total_sent(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fault(&mut state)?;
        Ok(state.accounts.get(&account_id).map(|a| a.total_sent))
    }

    async fn get_balance(&self, account_id: Uuid) -> Result<Option<u64>, AccountingError> {
        let mut state = self.state.lock().unwrap();
        Self::check_fault(&mut state)?;
        Ok(state.accounts.get(&account_id).map(|a| a.balance))
    }
}

#[async_trait]
impl SubAccountFactory for SimulatedLedger {
    async fn create_sub_account(
        &self,
        super_account_id: Uuid,
    ) -> Result<SourceAccount, AccountingError> {
        let mut state = self.state.lock().unwrap();
        if !state.accounts.contains_key(&super_account_id) {
            return Err(AccountingError::UnknownAccount);
        }
        let id = Uuid::new_v4();
        state.accounts.insert(id, AccountState::default());
        Ok(SourceAccount {
            id,
            asset_code: self.asset_code.clone(),
            asset_scale: self.asset_scale,
        })
    }
}

/// Serves a fixed price table.
pub struct StaticRates {
    prices: HashMap<String, Decimal>,
    failures: Mutex<u32>,
}

impl StaticRates {
    pub fn new(prices: HashMap<String, Decimal>) -> Self {
        Self {
            prices,
            failures: Mutex::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }
}

#[async_trait]
impl RatesService for StaticRates {
    async fn prices(&self, _base_asset: &str) -> Result<HashMap<String, Decimal>, RatesError> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(RatesError::Unavailable("injected fault".into()));
        }
        Ok(self.prices.clone())
    }
}

/// A scripted failure for a `pay` attempt, optionally with partial progress
/// already streamed before the failure hit.
#[derive(Debug, Clone, Copy)]
pub struct PayFailure {
    pub error: PaymentError,
    pub sent_before_failure: u64,
}

impl PayFailure {
    pub fn new(error: PaymentError) -> Self {
        Self {
            error,
            sent_before_failure: 0,
        }
    }

    pub fn after_sending(error: PaymentError, sent: u64) -> Self {
        Self {
            error,
            sent_before_failure: sent,
        }
    }
}

#[derive(Default)]
struct StreamScript {
    setup_failures: VecDeque<PaymentError>,
    quote_failures: VecDeque<PaymentError>,
    pay_failures: VecDeque<PayFailure>,
    invoice_amounts: HashMap<String, u64>,
}

/// Deterministic streaming layer: pointers resolve locally, quotes are
/// struck at par and a send finishes in one shot unless a scripted failure
/// is queued.
#[derive(Clone)]
pub struct SimulatedStreaming {
    ledger: SimulatedLedger,
    script: Arc<Mutex<StreamScript>>,
}

impl SimulatedStreaming {
    pub fn new(ledger: SimulatedLedger) -> Self {
        Self {
            ledger,
            script: Arc::new(Mutex::new(StreamScript::default())),
        }
    }

    pub fn fail_setup(&self, error: PaymentError) {
        self.script.lock().unwrap().setup_failures.push_back(error);
    }

    pub fn fail_quote(&self, error: PaymentError) {
        self.script.lock().unwrap().quote_failures.push_back(error);
    }

    pub fn fail_pay(&self, failure: PayFailure) {
        self.script.lock().unwrap().pay_failures.push_back(failure);
    }

    /// Registers an invoice and the amount it still owes.
    pub fn register_invoice(&self, url: &str, amount: u64) {
        self.script
            .lock()
            .unwrap()
            .invoice_amounts
            .insert(url.to_string(), amount);
    }
}

#[async_trait]
impl StreamingService for SimulatedStreaming {
    async fn setup_payment(
        &self,
        _plugin: &dyn Plugin,
        target: &PaymentTarget,
    ) -> Result<DestinationAccount, PaymentError> {
        if let Some(error) = self.script.lock().unwrap().setup_failures.pop_front() {
            return Err(error);
        }
        let url = match target {
            PaymentTarget::FixedSend {
                payment_pointer, ..
            } => {
                if !payment_pointer.starts_with('$') {
                    return Err(PaymentError::InvalidPaymentPointer);
                }
                payment_pointer.clone()
            }
            PaymentTarget::Invoice { invoice_url } => {
                if !invoice_url.starts_with("http") {
                    return Err(PaymentError::UnknownPaymentTarget);
                }
                invoice_url.clone()
            }
        };
        Ok(DestinationAccount {
            asset_code: self.ledger.asset_code.clone(),
            asset_scale: self.ledger.asset_scale,
            url,
        })
    }

    async fn start_quote(
        &self,
        _plugin: &dyn Plugin,
        request: QuoteRequest,
    ) -> Result<StreamQuote, PaymentError> {
        let par = Decimal::ONE;
        let floor_rate = par - request.slippage;
        let (target_type, max_source, min_delivery) = {
            let mut script = self.script.lock().unwrap();
            if let Some(error) = script.quote_failures.pop_front() {
                return Err(error);
            }
            match &request.target {
                PaymentTarget::FixedSend { amount_to_send, .. } => {
                    let min = (Decimal::from(*amount_to_send) * floor_rate)
                        .floor()
                        .to_u64()
                        .unwrap_or(0);
                    (PaymentType::FixedSend, *amount_to_send, min)
                }
                PaymentTarget::Invoice { invoice_url } => {
                    let amount = *script
                        .invoice_amounts
                        .get(invoice_url)
                        .ok_or(PaymentError::UnknownPaymentTarget)?;
                    let max = (Decimal::from(amount) * (par + request.slippage))
                        .ceil()
                        .to_u64()
                        .unwrap_or(u64::MAX);
                    (PaymentType::FixedDelivery, max, amount)
                }
            }
        };
        Ok(StreamQuote {
            target_type,
            min_delivery_amount: min_delivery,
            max_source_amount: max_source,
            min_exchange_rate: floor_rate,
            low_exchange_rate_estimate: floor_rate,
            high_exchange_rate_estimate: par + request.slippage,
        })
    }

    async fn pay(
        &self,
        plugin: &dyn Plugin,
        request: PayRequest,
    ) -> Result<PayOutcome, PaymentError> {
        let scripted = self.script.lock().unwrap().pay_failures.pop_front();
        let remaining = request
            .quote
            .max_source_amount
            .saturating_sub(request.progress_offset);
        if let Some(failure) = scripted {
            let partial = failure.sent_before_failure.min(remaining);
            if partial > 0 {
                self.ledger.record_streamed(plugin.account_id(), partial);
            }
            return Err(failure.error);
        }
        self.ledger.record_streamed(plugin.account_id(), remaining);
        Ok(PayOutcome {
            amount_sent: remaining,
            amount_delivered: remaining,
        })
    }
}

/// Counts of plugin connections handed out and returned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PluginStats {
    pub opened: usize,
    pub closed: usize,
}

/// Plugin factory whose plugins go nowhere; it exists to account for every
/// open/close pair.
#[derive(Clone, Default)]
pub struct LoopbackPlugins {
    stats: Arc<Mutex<PluginStats>>,
    connect_failures: Arc<Mutex<u32>>,
}

impl LoopbackPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> PluginStats {
        *self.stats.lock().unwrap()
    }

    pub fn fail_next_connect(&self, n: u32) {
        *self.connect_failures.lock().unwrap() = n;
    }
}

struct LoopbackPlugin {
    account_id: Uuid,
    stats: Arc<Mutex<PluginStats>>,
}

#[async_trait]
impl Plugin for LoopbackPlugin {
    fn account_id(&self) -> Uuid {
        self.account_id
    }

    async fn close(self: Box<Self>) -> Result<(), PluginError> {
        self.stats.lock().unwrap().closed += 1;
        Ok(())
    }
}

#[async_trait]
impl PluginFactory for LoopbackPlugins {
    async fn open(&self, source_account_id: Uuid) -> Result<Box<dyn Plugin>, PluginError> {
        {
            let mut failures = self.connect_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PluginError::Connect("injected fault".into()));
            }
        }
        self.stats.lock().unwrap().opened += 1;
        Ok(Box::new(LoopbackPlugin {
            account_id: source_account_id,
            stats: self.stats.clone(),
        }))
    }
}
