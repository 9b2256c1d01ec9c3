use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use btn_ledger::bridge::{BridgeCoordinator, ChainAdapter, SimulatedChainAdapter};
use btn_ledger::config::LedgerConfig;
use btn_ledger::exchange::{ExchangeEngine, FixedRateProvider, HttpRateProvider, RateProvider};
use btn_ledger::history::TransactionLog;
use btn_ledger::ledger::Ledger;
use btn_ledger::processor::TransactionProcessor;
use btn_ledger::registry::{AccountRegistry, RegistryEvent};
use btn_ledger::rpc::RpcServer;
use btn_ledger::security::SecurityPolicy;
use btn_ledger::staking::StakingEngine;
use btn_ledger::storage::Storage;

#[derive(Parser)]
#[command(name = "btn_ledger", about = "Multi-currency wallet ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ledger node
    Start {
        #[arg(long, default_value = "ledger.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Start { config }) => config,
        None => "ledger.toml".to_string(),
    };
    let config = LedgerConfig::load_or_default(&config_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.node.log_level.clone())),
        )
        .init();

    let storage = match Storage::open(&config.node.db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to open storage at {}: {}", config.node.db_path, e);
            std::process::exit(1);
        }
    };

    let ledger = Arc::new(Ledger::with_storage(storage.clone()));
    if let Err(e) = ledger.verify_books() {
        eprintln!("Ledger audit failed, refusing to start: {}", e);
        std::process::exit(1);
    }
    info!("ledger audit passed");

    let security = Arc::new(SecurityPolicy::new());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RegistryEvent>();
    let mut registry = AccountRegistry::with_storage(storage.clone());
    registry.set_event_sender(event_tx);
    let registry = Arc::new(Mutex::new(registry));

    {
        let security = security.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    RegistryEvent::AccountCreated { account_id } => {
                        security.init_baseline(&account_id);
                    }
                }
            }
        });
    }

    let rates: Arc<dyn RateProvider> = match &config.node.rate_feed_url {
        Some(url) => Arc::new(HttpRateProvider::new(url.clone())),
        None => {
            warn!("no rate feed configured, using the fixed rate table");
            Arc::new(FixedRateProvider::new())
        }
    };

    let staking = Arc::new(StakingEngine::with_storage(
        config.staking.clone(),
        ledger.clone(),
        storage.clone(),
    ));
    let exchange = Arc::new(ExchangeEngine::new(
        config.exchange.clone(),
        rates,
        ledger.clone(),
    ));
    // TODO: swap SimulatedChainAdapter for the real per-chain adapters
    // once the bridge relayer endpoints are deployed
    let adapter: Arc<dyn ChainAdapter> = Arc::new(SimulatedChainAdapter);
    let bridge = Arc::new(BridgeCoordinator::with_storage(
        config.bridge.clone(),
        adapter,
        ledger.clone(),
        storage.clone(),
    ));
    let history = Arc::new(TransactionLog::with_storage(storage));

    let processor = Arc::new(TransactionProcessor::new(
        registry.clone(),
        security,
        ledger,
        staking,
        exchange.clone(),
        bridge.clone(),
        history,
    ));

    let server = RpcServer::new(processor, registry, exchange, bridge, config.node.rpc_port);
    server.start().await;
}
