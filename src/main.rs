use billing_session::application::config::{RestoreNotify, SessionConfig};
use billing_session::application::session::BillingSession;
use billing_session::domain::credentials::Credentials;
use billing_session::domain::event::BillingEvent;
use billing_session::domain::flow::{FlowOutcome, PendingPurchaseFlow};
use billing_session::domain::ports::PendingFlowStoreBox;
use billing_session::domain::product::ProductId;
use billing_session::error::{self, BillingError, codes};
use billing_session::infrastructure::in_memory::{InMemoryBillingService, InMemoryPendingFlowStore};
#[cfg(feature = "storage-rocksdb")]
use billing_session::infrastructure::rocksdb::RocksDBPendingFlowStore;
use billing_session::interfaces::catalog::Catalog;
use billing_session::interfaces::csv::command_reader::{CommandReader, HostAction, HostCommand};
use billing_session::interfaces::csv::ownership_writer::OwnershipWriter;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command script (CSV with `action, product` columns)
    script: PathBuf,

    /// JSON catalog seeding the in-memory billing service
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, pending purchase
    /// flows are kept in RocksDB across runs.
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[arg(long, env = "BILLING_LICENSE_KEY")]
    license_key: Option<String>,

    /// Reject purchases whose order id was issued for another merchant
    #[arg(long, env = "BILLING_MERCHANT_ID")]
    merchant_id: Option<String>,

    /// Timeout for each billing service call in milliseconds, 0 to disable
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Which products a restore announces as purchased
    #[arg(long, value_enum, default_value_t = RestoreNotify::NewlyPresent)]
    restore_notify: RestoreNotify,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let catalog = match &cli.catalog {
        Some(path) => Catalog::from_reader(File::open(path).into_diagnostic()?).into_diagnostic()?,
        None => Catalog::default(),
    };
    let service = InMemoryBillingService::seeded(catalog.listings, catalog.owned);
    if !BillingSession::is_service_available(&service) {
        eprintln!("Billing service is unavailable");
    }

    let timeout = (cli.timeout_ms > 0).then(|| Duration::from_millis(cli.timeout_ms));
    let config = SessionConfig::default()
        .with_operation_timeout(timeout)
        .with_restore_notify(cli.restore_notify);
    let flow_store = open_flow_store(cli.db_path)?;

    let session = BillingSession::new(Arc::new(service.clone()), flow_store, config);
    let mut events = session.events();

    let credentials = Credentials::new(cli.license_key, cli.merchant_id);
    let initialized = session.initialize(credentials).await;
    report_events(&mut events);
    initialized.into_diagnostic()?;

    // Process the script
    let file = File::open(cli.script).into_diagnostic()?;
    for command in CommandReader::new(file).commands() {
        match command {
            Ok(command) => {
                if let Err(e) = run_command(&session, &service, &command).await {
                    eprintln!("Error processing command: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
        report_events(&mut events);
    }

    let records = session.purchase_records();
    session.release().await;

    // Output final ownership
    let stdout = io::stdout();
    let mut writer = OwnershipWriter::new(stdout.lock());
    writer.write_records(&records).into_diagnostic()?;

    Ok(())
}

fn open_flow_store(db_path: Option<PathBuf>) -> Result<PendingFlowStoreBox> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => Ok(Box::new(
            RocksDBPendingFlowStore::open(path).into_diagnostic()?,
        )),
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Box::new(InMemoryPendingFlowStore::new()))
        }
        None => Ok(Box::new(InMemoryPendingFlowStore::new())),
    }
}

async fn run_command(
    session: &BillingSession,
    service: &InMemoryBillingService,
    command: &HostCommand,
) -> error::Result<()> {
    match command.action {
        HostAction::Purchase => {
            let product = command.require_product()?;
            session.purchase(product).await?;
            eprintln!("launched: {}", product);
        }
        HostAction::Subscribe => {
            let product = command.require_product()?;
            session.subscribe(product).await?;
            eprintln!("launched: {}", product);
        }
        HostAction::Complete => {
            let flow = pending_flow_for(session, command.require_product()?)?;
            // Flows launched by an earlier run are unknown to this service.
            let record = match service.fulfil_flow(&flow.request_token).await {
                Some(record) => record,
                None => InMemoryBillingService::mint_purchase(&flow.product_id, flow.kind),
            };
            session
                .resolve_purchase_flow(&flow.request_token, FlowOutcome::Success(record))
                .await?;
        }
        HostAction::Cancel => {
            let flow = pending_flow_for(session, command.require_product()?)?;
            session
                .resolve_purchase_flow(&flow.request_token, FlowOutcome::Cancelled)
                .await?;
            eprintln!("cancelled: {}", flow.product_id);
        }
        HostAction::Fail => {
            let flow = pending_flow_for(session, command.require_product()?)?;
            let outcome = FlowOutcome::Error {
                code: codes::ERROR,
                cause: "purchase flow failed".to_string(),
            };
            session
                .resolve_purchase_flow(&flow.request_token, outcome)
                .await?;
        }
        HostAction::Consume => {
            let product = command.require_product()?;
            session.consume(product).await?;
            eprintln!("consumed: {}", product);
        }
        HostAction::Restore => {
            session.restore_owned_purchases().await?;
            eprintln!("restored");
        }
        HostAction::Details => {
            let product = command.require_product()?;
            for listing in session
                .query_listing_details(std::slice::from_ref(product))
                .await?
            {
                eprintln!("listing: {}", listing);
            }
        }
        HostAction::SubscriptionDetails => {
            let product = command.require_product()?;
            for listing in session
                .query_subscription_details(std::slice::from_ref(product))
                .await?
            {
                eprintln!("listing: {}", listing);
            }
        }
        HostAction::Release => session.release().await,
    }
    Ok(())
}

fn pending_flow_for(
    session: &BillingSession,
    product: &ProductId,
) -> error::Result<PendingPurchaseFlow> {
    session
        .pending_purchase_flows()
        .into_iter()
        .find(|flow| &flow.product_id == product)
        .ok_or_else(|| BillingError::InvalidCommand(format!("no pending purchase flow for {}", product)))
}

fn report_events(events: &mut broadcast::Receiver<BillingEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => eprintln!("event: {}", event),
            Err(TryRecvError::Lagged(missed)) => eprintln!("event: {} events dropped", missed),
            Err(_) => break,
        }
    }
}
