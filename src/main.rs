use clap::{Args, Parser, Subcommand};
use installments::application::plan_creation::PlanCreationService;
use installments::application::scheduler::DuePaymentScheduler;
use installments::config::{PlanPolicy, ProcessorConfig, SchedulerConfig, WebhookConfig};
use installments::domain::clock::SystemClock;
use installments::domain::money::Amount;
use installments::domain::ports::{PaymentStore, PlanStore, SharedPaymentStore, SharedPlanStore};
use installments::domain::retry::RetryPolicy;
use installments::infrastructure::charge::HttpChargeProcessor;
use installments::infrastructure::host::{LoggingOrderJournal, StaticCustomerDirectory};
use installments::infrastructure::in_memory::InMemoryBillingStore;
#[cfg(feature = "storage-rocksdb")]
use installments::infrastructure::rocksdb::RocksDbBillingStore;
use installments::infrastructure::webhook::WebhookNotifier;
use installments::interfaces::csv::order_reader::{OrderReader, OrderRecord};
use installments::interfaces::csv::plan_writer::{PlanOutcomeRow, PlanWriter};
use installments::telemetry;
use miette::{IntoDiagnostic, Result};
use rust_decimal::Decimal;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true, env = "INSTALLMENTS_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create installment plans for the orders in a CSV file
    CreatePlans(CreatePlansArgs),
    /// Charge every installment that is due now
    Run(RunArgs),
}

#[derive(Args)]
struct CreatePlansArgs {
    /// Orders CSV with an `order_id,customer_id,total` header
    input: PathBuf,

    /// Orders below this total are paid in full and get no plan
    #[arg(long, env = "INSTALLMENTS_MIN_TOTAL", default_value = "100.00")]
    min_total: Decimal,

    #[arg(
        long,
        env = "INSTALLMENTS_COUNT",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    installments: u32,

    #[arg(long, env = "INSTALLMENTS_FREQUENCY_DAYS", default_value_t = 30)]
    frequency_days: u32,
}

#[derive(Args)]
struct RunArgs {
    /// Base URL of the payment processor API
    #[arg(long, env = "INSTALLMENTS_PROCESSOR_URL")]
    processor_url: String,

    #[arg(long, env = "INSTALLMENTS_PROCESSOR_KEY", hide_env_values = true)]
    processor_key: String,

    #[arg(long, env = "INSTALLMENTS_CUSTOMER_PREFIX", default_value = "cus_")]
    customer_prefix: String,

    #[arg(long, env = "INSTALLMENTS_CURRENCY", default_value = "EUR")]
    currency: String,

    #[arg(long, env = "INSTALLMENTS_CHARGE_TIMEOUT_SECS", default_value_t = 30)]
    charge_timeout_secs: u64,

    #[arg(
        long,
        env = "INSTALLMENTS_BATCH_SIZE",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    batch_size: u64,

    #[arg(long, env = "INSTALLMENTS_CLAIM_TTL_SECS", default_value_t = 900)]
    claim_ttl_secs: u64,

    /// Endpoint notified when an installment is abandoned
    #[arg(long, env = "INSTALLMENTS_WEBHOOK_URL")]
    webhook_url: Option<String>,

    #[arg(long, env = "INSTALLMENTS_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    #[arg(long, env = "INSTALLMENTS_WEBHOOK_TIMEOUT_SECS", default_value_t = 5)]
    webhook_timeout_secs: u64,
}

type Stores = (SharedPlanStore, SharedPaymentStore);

fn shared<S>(store: S) -> Stores
where
    S: PlanStore + PaymentStore + Clone + 'static,
{
    (Arc::new(store.clone()), Arc::new(store))
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    match db_path {
        Some(path) => Ok(shared(RocksDbBillingStore::open(path).into_diagnostic()?)),
        None => Ok(shared(InMemoryBillingStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    if db_path.is_some() {
        warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }
    Ok(shared(InMemoryBillingStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let cli = Cli::parse();
    let stores = open_stores(cli.db_path.as_deref())?;

    match cli.command {
        Command::CreatePlans(args) => create_plans(stores, args).await,
        Command::Run(args) => run(stores, args).await,
    }
}

async fn create_plans((plans, _): Stores, args: CreatePlansArgs) -> Result<()> {
    let policy = PlanPolicy {
        min_total: Amount::positive(args.min_total).into_diagnostic()?,
        installments_count: args.installments,
        frequency_days: args.frequency_days,
    };
    let service = PlanCreationService::new(
        plans,
        Arc::new(LoggingOrderJournal),
        Arc::new(SystemClock),
        policy,
    );

    let file = File::open(args.input).into_diagnostic()?;
    let reader = OrderReader::new(file);
    let stdout = io::stdout();
    let mut writer = PlanWriter::new(stdout.lock());

    for (record, order) in (1u64..).zip(reader.orders()) {
        let row = match order {
            Ok(order) => create_plan(&service, record, order).await,
            Err(e) => {
                warn!(record, error = %e, "Unreadable order row");
                PlanOutcomeRow {
                    record,
                    order_id: None,
                    plan_id: None,
                    outcome: "error".to_string(),
                }
            }
        };
        writer.write(&row).into_diagnostic()?;
    }

    writer.flush().into_diagnostic()?;
    Ok(())
}

async fn create_plan(
    service: &PlanCreationService,
    record: u64,
    order: OrderRecord,
) -> PlanOutcomeRow {
    match service
        .create(order.order_id, order.customer_id, order.total)
        .await
    {
        Ok(outcome) => PlanOutcomeRow {
            record,
            order_id: Some(order.order_id),
            plan_id: outcome.plan_id(),
            outcome: outcome.as_str().to_string(),
        },
        Err(e) => {
            warn!(record, order_id = order.order_id, error = %e, "Plan creation failed");
            PlanOutcomeRow {
                record,
                order_id: Some(order.order_id),
                plan_id: None,
                outcome: "error".to_string(),
            }
        }
    }
}

async fn run((plans, payments): Stores, args: RunArgs) -> Result<()> {
    let processor_config = ProcessorConfig {
        currency: args.currency.clone(),
        ..ProcessorConfig::new(args.processor_url, args.processor_key)
    };
    let processor = HttpChargeProcessor::new(&processor_config).into_diagnostic()?;

    let webhook_config = WebhookConfig {
        url: args.webhook_url,
        secret: args.webhook_secret.map(Into::into),
        timeout: Duration::from_secs(args.webhook_timeout_secs),
        currency: args.currency,
    };
    let notifier = Arc::new(
        WebhookNotifier::new(
            &webhook_config,
            Arc::new(StaticCustomerDirectory::new()),
            Arc::new(SystemClock),
        )
        .into_diagnostic()?,
    );
    if !notifier.is_enabled() {
        info!("No webhook configured, abandoned installments are only logged");
    }

    let config = SchedulerConfig {
        charge_timeout: Duration::from_secs(args.charge_timeout_secs),
        batch_size: usize::try_from(args.batch_size).into_diagnostic()?,
        claim_ttl: Duration::from_secs(args.claim_ttl_secs),
        retry_policy: RetryPolicy::default(),
        customer_ref_prefix: args.customer_prefix,
    };
    let scheduler = DuePaymentScheduler::new(
        plans,
        payments,
        Arc::new(processor),
        notifier.clone(),
        Arc::new(SystemClock),
        config,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current payment");
            on_signal.cancel();
        }
    });

    let report = scheduler.run(&cancel).await.into_diagnostic()?;
    notifier.flush().await;

    println!("{}", report);
    Ok(())
}
