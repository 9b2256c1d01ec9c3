use axum::extract::{Query, State};
use axum::{debug_handler, Json};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::types::*;
use super::RpcState;
use crate::error::LedgerError;
use crate::exchange::Quote;
use crate::registry::{AuthFactorKind, CreateAccountSpec, Currency};
use crate::security::AuthContext;

fn fail<T>(e: LedgerError) -> Json<Envelope<T>> {
    warn!("request rejected: {}", e);
    Json(Envelope::err(&e))
}

/// Handle POST /wallet/create
#[debug_handler]
pub async fn create_wallet(
    State(state): State<RpcState>,
    Json(req): Json<CreateWalletRequest>,
) -> Json<Envelope<CreateWalletResponse>> {
    debug!(enable_2fa = req.enable_2fa, enable_biometric = req.enable_biometric, "wallet/create");
    let spec = CreateAccountSpec {
        password: req.password,
        enable_two_factor: req.enable_2fa,
        enable_biometric: req.enable_biometric,
        biometric_template: req.biometric_data,
    };
    match state.processor.create_account(spec) {
        Ok(created) => {
            let addresses = created
                .account
                .addresses
                .iter()
                .map(|(family, addr)| (format!("{:?}", family).to_lowercase(), addr.clone()))
                .collect();
            Json(Envelope::ok(CreateWalletResponse {
                address: created.account.primary_address().to_string(),
                account_id: created.account.id.clone(),
                addresses,
                two_factor_secret: created.two_factor_secret,
            }))
        }
        Err(e) => fail(e),
    }
}

/// Handle GET /wallet/balance?address=
pub async fn wallet_balance(
    State(state): State<RpcState>,
    Query(query): Query<AddressQuery>,
) -> Json<Envelope<std::collections::HashMap<Currency, Decimal>>> {
    match state.processor.balances(&query.address) {
        Ok(balances) => {
            let data = balances
                .into_iter()
                .map(|(currency, balance)| (currency, balance.available))
                .collect();
            Json(Envelope::ok(data))
        }
        Err(e) => fail(e),
    }
}

/// Handle GET /wallet/portfolio?address=
pub async fn wallet_portfolio(
    State(state): State<RpcState>,
    Query(query): Query<AddressQuery>,
) -> Json<Envelope<PortfolioResponse>> {
    match state.processor.portfolio(&query.address) {
        Ok((balances, stakes)) => {
            let balances = balances
                .into_iter()
                .map(|(currency, b)| {
                    (
                        currency,
                        PortfolioEntry {
                            available: b.available,
                            locked: b.locked,
                        },
                    )
                })
                .collect();
            let stakes = stakes
                .into_iter()
                .map(|(p, pending_reward)| StakeView {
                    currency: p.currency,
                    principal: p.principal,
                    apy_basis_points: p.apy_basis_points,
                    started_at: p.started_at,
                    pending_reward,
                })
                .collect();
            Json(Envelope::ok(PortfolioResponse { balances, stakes }))
        }
        Err(e) => fail(e),
    }
}

/// Handle POST /wallet/verify-enrollment
pub async fn verify_enrollment(
    State(state): State<RpcState>,
    Json(req): Json<VerifyEnrollmentRequest>,
) -> Json<Envelope<serde_json::Value>> {
    let factor = match req.factor.as_str() {
        "two_factor" => AuthFactorKind::TwoFactor,
        "biometric" => AuthFactorKind::Biometric,
        other => {
            return fail(LedgerError::InvalidRequest(format!(
                "unknown factor: {}",
                other
            )))
        }
    };
    let account_id = {
        let registry = state.registry.lock().unwrap_or_else(|p| p.into_inner());
        match registry.lookup_by_address(&req.address) {
            Ok(account) => account.id.clone(),
            Err(e) => return fail(e),
        }
    };
    let now = chrono::Utc::now().timestamp();
    let result = {
        let mut registry = state.registry.lock().unwrap_or_else(|p| p.into_inner());
        registry.verify_enrollment(&account_id, factor, &req.proof, now)
    };
    match result {
        Ok(()) => Json(Envelope::ok(serde_json::json!({ "enrolled": true }))),
        Err(e) => fail(e),
    }
}

/// Handle POST /transaction/send
pub async fn send(
    State(state): State<RpcState>,
    Json(req): Json<SendRequest>,
) -> Json<Envelope<SendResponse>> {
    if req.cross_chain && req.target_chain.is_none() {
        return fail(LedgerError::InvalidRequest(
            "cross_chain send requires target_chain".to_string(),
        ));
    }
    let ctx = AuthContext {
        two_factor_code: req.two_factor_code,
        biometric_presented: req.biometric_presented,
    };
    let target_chain = if req.cross_chain { req.target_chain } else { None };
    match state
        .processor
        .send(&req.from, &req.to, req.amount, req.currency, target_chain, &ctx)
        .await
    {
        Ok(tx) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /transaction/receive
pub async fn receive(
    State(state): State<RpcState>,
    Json(req): Json<ReceiveRequest>,
) -> Json<Envelope<SendResponse>> {
    let reference = req.reference.unwrap_or_else(|| "external".to_string());
    match state
        .processor
        .receive(&req.to, req.amount, req.currency, &reference)
    {
        Ok(tx) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /transaction/cancel
pub async fn cancel(
    State(state): State<RpcState>,
    Json(req): Json<CancelRequest>,
) -> Json<Envelope<SendResponse>> {
    match state.processor.cancel(&req.transaction_id) {
        Ok(tx) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle GET /transaction/history?address=
pub async fn history(
    State(state): State<RpcState>,
    Query(query): Query<AddressQuery>,
) -> Json<Envelope<Vec<HistoryItem>>> {
    let items = state
        .processor
        .history_for(&query.address, 0)
        .into_iter()
        .map(HistoryItem::from)
        .collect();
    Json(Envelope::ok(items))
}

/// Handle POST /staking/stake
pub async fn stake(
    State(state): State<RpcState>,
    Json(req): Json<StakeRequest>,
) -> Json<Envelope<SendResponse>> {
    let ctx = AuthContext {
        two_factor_code: req.two_factor_code,
        biometric_presented: req.biometric_presented,
    };
    match state
        .processor
        .stake(&req.address, req.currency, req.amount, req.apy_basis_points, &ctx)
        .await
    {
        Ok((tx, _)) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /staking/unstake
pub async fn unstake(
    State(state): State<RpcState>,
    Json(req): Json<UnstakeRequest>,
) -> Json<Envelope<SendResponse>> {
    let ctx = AuthContext {
        two_factor_code: req.two_factor_code,
        biometric_presented: req.biometric_presented,
    };
    match state
        .processor
        .unstake(&req.address, req.currency, req.amount, &ctx)
        .await
    {
        Ok(tx) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /staking/claim
pub async fn claim(
    State(state): State<RpcState>,
    Json(req): Json<ClaimRequest>,
) -> Json<Envelope<ClaimResponse>> {
    let ctx = AuthContext {
        two_factor_code: req.two_factor_code,
        biometric_presented: req.biometric_presented,
    };
    match state
        .processor
        .claim_reward(&req.address, req.currency, &ctx)
        .await
    {
        Ok((tx, reward)) => Json(Envelope::ok(ClaimResponse {
            transaction_id: tx.id,
            reward,
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /exchange/quote
pub async fn quote(
    State(state): State<RpcState>,
    Json(req): Json<QuoteRequest>,
) -> Json<Envelope<QuoteResponse>> {
    let now = chrono::Utc::now().timestamp();
    match state
        .exchange
        .quote(req.from_currency, req.to_currency, req.amount, now)
        .await
    {
        Ok(q) => Json(Envelope::ok(QuoteResponse {
            rate: q.rate,
            fee: q.fee,
            output_amount: q.output_amount,
            quoted_at: q.quoted_at,
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /exchange/execute
pub async fn execute_exchange(
    State(state): State<RpcState>,
    Json(req): Json<ExecuteExchangeRequest>,
) -> Json<Envelope<SendResponse>> {
    let ctx = AuthContext {
        two_factor_code: req.two_factor_code,
        biometric_presented: req.biometric_presented,
    };
    let prior = match (req.quoted_rate, req.quoted_at) {
        (Some(rate), Some(quoted_at)) => Some(Quote {
            from_currency: req.from_currency,
            to_currency: req.to_currency,
            amount: req.amount,
            rate,
            fee: Decimal::ZERO,
            output_amount: Decimal::ZERO,
            quoted_at,
        }),
        _ => None,
    };
    match state
        .processor
        .exchange(
            &req.address,
            req.from_currency,
            req.to_currency,
            req.amount,
            prior.as_ref(),
            &ctx,
        )
        .await
    {
        Ok((tx, _)) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle GET /exchange/currencies
pub async fn exchange_currencies(State(state): State<RpcState>) -> Json<Envelope<Vec<Currency>>> {
    Json(Envelope::ok(state.exchange.supported_currencies()))
}

/// Handle GET /bridge/chains
pub async fn bridge_chains(State(state): State<RpcState>) -> Json<Envelope<Vec<ChainView>>> {
    let chains = state
        .bridge
        .supported_chains()
        .into_iter()
        .map(|c| ChainView {
            id: c.name.to_lowercase().replace(' ', "-"),
            name: c.name.clone(),
            symbol: c.symbol.clone(),
        })
        .collect();
    Json(Envelope::ok(chains))
}

/// Handle POST /bridge/estimate-fee
pub async fn bridge_estimate_fee(
    State(state): State<RpcState>,
    Json(req): Json<EstimateFeeRequest>,
) -> Json<Envelope<EstimateFeeResponse>> {
    match state.bridge.estimate_fee(&req.target_chain, req.amount) {
        Ok(fee) => Json(Envelope::ok(EstimateFeeResponse { fee })),
        Err(e) => fail(e),
    }
}

/// Handle POST /bridge/confirmed (adapter callback)
pub async fn bridge_confirmed(
    State(state): State<RpcState>,
    Json(req): Json<BridgeConfirmedRequest>,
) -> Json<Envelope<SendResponse>> {
    match state.processor.bridge_confirmed(&req.lock_id) {
        Ok(tx) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle POST /bridge/failed (adapter callback)
pub async fn bridge_failed(
    State(state): State<RpcState>,
    Json(req): Json<BridgeFailedRequest>,
) -> Json<Envelope<SendResponse>> {
    match state.processor.bridge_failed(&req.lock_id, &req.reason) {
        Ok(tx) => Json(Envelope::ok(SendResponse {
            transaction_id: tx.id,
            status: tx.status.as_str().to_string(),
        })),
        Err(e) => fail(e),
    }
}

/// Handle GET /api/info
pub async fn node_info() -> Json<Envelope<NodeInfo>> {
    Json(Envelope::ok(NodeInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: "bituncoin-mainnet".to_string(),
        node_type: "ledger-node".to_string(),
    }))
}

/// Handle GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
