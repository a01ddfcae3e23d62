use clap::Parser;
use miette::Result;
use outpay::application::engine::{Dependencies, OutgoingPayments};
use outpay::application::worker::WorkerPool;
use outpay::config::EngineConfig;
use outpay::domain::payment::{Intent, Payment, PaymentState, PaymentTarget};
use outpay::infrastructure::clock::SystemClock;
use outpay::infrastructure::in_memory::InMemoryPaymentStore;
use outpay::infrastructure::simulator::{
    LoopbackPlugins, SimulatedLedger, SimulatedStreaming, StaticRates,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Drive one auto-approved payment through the engine against the bundled
/// simulator adapters.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Amount to send, in minor units of the source asset
    #[arg(long, default_value_t = 1000)]
    amount: u64,

    /// Destination payment pointer
    #[arg(long, default_value = "$wallet.example/alice")]
    destination: String,

    /// Worker parallelism
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let clock = Arc::new(SystemClock);
    let ledger = SimulatedLedger::new("USD", 2);
    let super_account = Uuid::new_v4();
    ledger.register_account(super_account, cli.amount.saturating_mul(10).max(10_000));

    let config = EngineConfig {
        worker_count: cli.workers,
        worker_idle_interval: Duration::from_millis(25),
        ..EngineConfig::default()
    };
    let deps = Arc::new(Dependencies {
        store: Arc::new(InMemoryPaymentStore::new(clock.clone())),
        accounting: Arc::new(ledger.clone()),
        rates: Arc::new(StaticRates::new(HashMap::from([(
            "USD".to_string(),
            Decimal::ONE,
        )]))),
        streaming: Arc::new(SimulatedStreaming::new(ledger.clone())),
        sub_accounts: Arc::new(ledger.clone()),
        plugins: Arc::new(LoopbackPlugins::new()),
        clock,
        config,
    });

    let engine = OutgoingPayments::new(deps.clone());
    let pool = WorkerPool::start(deps.clone());

    let payment = engine
        .create(
            Intent {
                target: PaymentTarget::FixedSend {
                    payment_pointer: cli.destination.clone(),
                    amount_to_send: cli.amount,
                },
                auto_approve: true,
            },
            super_account,
            None,
        )
        .await?;

    let activated = wait_until(&engine, payment.id, |p| {
        p.state == PaymentState::Activated || p.state.is_terminal()
    })
    .await?;
    if activated.state != PaymentState::Activated {
        pool.shutdown().await;
        println!("payment {} {}: {:?}", activated.id, activated.state, activated.error);
        return Ok(());
    }
    let max_source_amount = activated
        .quote
        .as_ref()
        .map(|q| q.max_source_amount)
        .ok_or_else(|| miette::miette!("activated payment carries no quote"))?;

    engine
        .fund(activated.id, max_source_amount, Uuid::new_v4())
        .await?;

    let done = wait_until(&engine, payment.id, |p| p.state.is_terminal()).await?;
    pool.shutdown().await;

    let total_sent = ledger.total_sent_of(done.account_id).unwrap_or(0);
    match done.state {
        PaymentState::Completed => {
            println!(
                "payment {} completed: sent {} {} to {}",
                done.id,
                total_sent,
                ledger.asset_code(),
                cli.destination
            );
        }
        _ => {
            println!("payment {} {}: {:?}", done.id, done.state, done.error);
        }
    }
    Ok(())
}

async fn wait_until<F>(engine: &OutgoingPayments, id: Uuid, done: F) -> Result<Payment>
where
    F: Fn(&Payment) -> bool,
{
    for _ in 0..400 {
        let payment = engine.get(id).await?;
        if done(&payment) {
            return Ok(payment);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(miette::miette!("timed out waiting for payment {id}"))
}
