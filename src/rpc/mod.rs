pub mod handlers;
pub mod types;

use axum::routing::{get, post};
use axum::Router;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::bridge::BridgeCoordinator;
use crate::exchange::ExchangeEngine;
use crate::processor::TransactionProcessor;
use crate::registry::AccountRegistry;

#[derive(Clone)]
pub struct RpcState {
    pub processor: Arc<TransactionProcessor>,
    pub registry: Arc<Mutex<AccountRegistry>>,
    pub exchange: Arc<ExchangeEngine>,
    pub bridge: Arc<BridgeCoordinator>,
}

pub struct RpcServer {
    state: RpcState,
    bind_addr: String,
}

impl RpcServer {
    pub fn new(
        processor: Arc<TransactionProcessor>,
        registry: Arc<Mutex<AccountRegistry>>,
        exchange: Arc<ExchangeEngine>,
        bridge: Arc<BridgeCoordinator>,
        port: u16,
    ) -> Self {
        Self {
            state: RpcState {
                processor,
                registry,
                exchange,
                bridge,
            },
            bind_addr: format!("0.0.0.0:{}", port),
        }
    }

    pub fn router(state: RpcState) -> Router {
        Router::new()
            .route("/wallet/create", post(handlers::create_wallet))
            .route("/wallet/balance", get(handlers::wallet_balance))
            .route("/wallet/portfolio", get(handlers::wallet_portfolio))
            .route("/wallet/verify-enrollment", post(handlers::verify_enrollment))
            .route("/transaction/send", post(handlers::send))
            .route("/transaction/receive", post(handlers::receive))
            .route("/transaction/cancel", post(handlers::cancel))
            .route("/transaction/history", get(handlers::history))
            .route("/staking/stake", post(handlers::stake))
            .route("/staking/unstake", post(handlers::unstake))
            .route("/staking/claim", post(handlers::claim))
            .route("/exchange/quote", post(handlers::quote))
            .route("/exchange/execute", post(handlers::execute_exchange))
            .route("/exchange/currencies", get(handlers::exchange_currencies))
            .route("/bridge/chains", get(handlers::bridge_chains))
            .route("/bridge/estimate-fee", post(handlers::bridge_estimate_fee))
            .route("/bridge/confirmed", post(handlers::bridge_confirmed))
            .route("/bridge/failed", post(handlers::bridge_failed))
            .route("/api/info", get(handlers::node_info))
            .route("/api/health", get(handlers::health))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub async fn start(self) {
        let app = Self::router(self.state);

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .expect("Failed to bind RPC server");

        info!("RPC server listening on {}", self.bind_addr);
        axum::serve(listener, app).await.expect("RPC server failed");
    }
}
