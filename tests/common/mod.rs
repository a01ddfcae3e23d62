#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use outpay::application::engine::{Dependencies, OutgoingPayments};
use outpay::application::worker::{process_next, shutdown_channel, ShutdownGuard, ShutdownTx};
use outpay::config::EngineConfig;
use outpay::domain::payment::{Intent, Payment, PaymentTarget};
use outpay::infrastructure::clock::ManualClock;
use outpay::infrastructure::in_memory::InMemoryPaymentStore;
use outpay::infrastructure::simulator::{
    LoopbackPlugins, SimulatedLedger, SimulatedStreaming, StaticRates,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A full engine over the simulator adapters, an in-memory store and a
/// manual clock, stepped deterministically with `step`.
pub struct Harness {
    pub deps: Arc<Dependencies>,
    pub engine: OutgoingPayments,
    pub ledger: SimulatedLedger,
    pub streaming: Arc<SimulatedStreaming>,
    pub rates: Arc<StaticRates>,
    pub plugins: Arc<LoopbackPlugins>,
    pub clock: Arc<ManualClock>,
    pub super_account: Uuid,
    shutdown: ShutdownTx,
    guard: ShutdownGuard,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let ledger = SimulatedLedger::new("USD", 2);
        let super_account = Uuid::new_v4();
        ledger.register_account(super_account, 100_000);

        let streaming = Arc::new(SimulatedStreaming::new(ledger.clone()));
        let rates = Arc::new(StaticRates::new(HashMap::from([(
            "USD".to_string(),
            Decimal::ONE,
        )])));
        let plugins = Arc::new(LoopbackPlugins::new());

        let deps = Arc::new(Dependencies {
            store: Arc::new(InMemoryPaymentStore::new(clock.clone())),
            accounting: Arc::new(ledger.clone()),
            rates: rates.clone(),
            streaming: streaming.clone(),
            sub_accounts: Arc::new(ledger.clone()),
            plugins: plugins.clone(),
            clock: clock.clone(),
            config,
        });
        let engine = OutgoingPayments::new(deps.clone());
        let (shutdown, _rx) = shutdown_channel();
        let guard = ShutdownGuard::new(&shutdown);

        Self {
            deps,
            engine,
            ledger,
            streaming,
            rates,
            plugins,
            clock,
            super_account,
            shutdown,
            guard,
        }
    }

    /// One worker scheduling step. Returns whether a transition committed.
    pub async fn step(&mut self) -> bool {
        process_next(&self.deps, &mut self.guard).await.unwrap()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Skips past any scheduled retry backoff.
    pub fn advance_past_backoff(&self) {
        self.advance(self.deps.config.backoff_max + Duration::from_millis(1));
    }

    pub async fn get(&self, id: Uuid) -> Payment {
        self.engine.get(id).await.unwrap()
    }

    pub fn assert_plugins_balanced(&self) {
        let stats = self.plugins.stats();
        assert_eq!(
            stats.opened, stats.closed,
            "every opened plugin must be closed"
        );
    }
}

pub fn fixed_send(pointer: &str, amount: u64, auto_approve: bool) -> Intent {
    Intent {
        target: PaymentTarget::FixedSend {
            payment_pointer: pointer.to_string(),
            amount_to_send: amount,
        },
        auto_approve,
    }
}

pub fn invoice(url: &str, auto_approve: bool) -> Intent {
    Intent {
        target: PaymentTarget::Invoice {
            invoice_url: url.to_string(),
        },
        auto_approve,
    }
}
