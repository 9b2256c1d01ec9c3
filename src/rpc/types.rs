// Request/response DTOs for the HTTP API
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::history::Transaction;
use crate::registry::Currency;

/// Response envelope the client expects on every endpoint.
#[derive(Serialize, Debug)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(e: &LedgerError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
                retryable: e.is_retryable(),
            }),
        }
    }
}

// --- wallet ---

#[derive(Deserialize, Debug)]
pub struct CreateWalletRequest {
    #[serde(default)]
    pub enable_2fa: bool,
    #[serde(default)]
    pub enable_biometric: bool,
    #[serde(default)]
    pub biometric_data: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct CreateWalletResponse {
    pub address: String,
    pub account_id: String,
    pub addresses: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_factor_secret: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AddressQuery {
    pub address: String,
}

#[derive(Deserialize, Debug)]
pub struct VerifyEnrollmentRequest {
    pub address: String,
    /// "two_factor" or "biometric"
    pub factor: String,
    pub proof: String,
}

#[derive(Serialize, Debug)]
pub struct PortfolioEntry {
    pub available: Decimal,
    pub locked: Decimal,
}

#[derive(Serialize, Debug)]
pub struct StakeView {
    pub currency: Currency,
    pub principal: Decimal,
    pub apy_basis_points: u32,
    pub started_at: i64,
    pub pending_reward: Decimal,
}

#[derive(Serialize, Debug)]
pub struct PortfolioResponse {
    pub balances: std::collections::HashMap<Currency, PortfolioEntry>,
    pub stakes: Vec<StakeView>,
}

// --- transactions ---

#[derive(Deserialize, Debug)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub cross_chain: bool,
    #[serde(default)]
    pub target_chain: Option<String>,
    #[serde(default)]
    pub two_factor_code: Option<String>,
    #[serde(default)]
    pub biometric_presented: bool,
}

#[derive(Serialize, Debug)]
pub struct SendResponse {
    pub transaction_id: String,
    pub status: String,
}

#[derive(Deserialize, Debug)]
pub struct ReceiveRequest {
    pub to: String,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CancelRequest {
    pub transaction_id: String,
}

#[derive(Serialize, Debug)]
pub struct HistoryItem {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee: Decimal,
    pub cross_chain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: i64,
}

impl From<Transaction> for HistoryItem {
    fn from(tx: Transaction) -> Self {
        Self {
            id: tx.id,
            kind: tx.kind.as_str().to_string(),
            status: tx.status.as_str().to_string(),
            from: tx.from,
            to: tx.to,
            amount: tx.amount,
            currency: tx.currency,
            fee: tx.fee,
            cross_chain: tx.cross_chain,
            target_chain: tx.target_chain,
            reason: tx.reason,
            timestamp: tx.created_at,
        }
    }
}

// --- staking ---

#[derive(Deserialize, Debug)]
pub struct StakeRequest {
    pub address: String,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub apy_basis_points: Option<u32>,
    #[serde(default)]
    pub two_factor_code: Option<String>,
    #[serde(default)]
    pub biometric_presented: bool,
}

#[derive(Deserialize, Debug)]
pub struct UnstakeRequest {
    pub address: String,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub two_factor_code: Option<String>,
    #[serde(default)]
    pub biometric_presented: bool,
}

#[derive(Deserialize, Debug)]
pub struct ClaimRequest {
    pub address: String,
    pub currency: Currency,
    #[serde(default)]
    pub two_factor_code: Option<String>,
    #[serde(default)]
    pub biometric_presented: bool,
}

#[derive(Serialize, Debug)]
pub struct ClaimResponse {
    pub transaction_id: String,
    pub reward: Decimal,
}

// --- exchange ---

#[derive(Deserialize, Debug)]
pub struct QuoteRequest {
    pub from_currency: Currency,
    pub to_currency: Currency,
    pub amount: Decimal,
}

#[derive(Serialize, Debug)]
pub struct QuoteResponse {
    pub rate: Decimal,
    pub fee: Decimal,
    pub output_amount: Decimal,
    pub quoted_at: i64,
}

#[derive(Deserialize, Debug)]
pub struct ExecuteExchangeRequest {
    pub address: String,
    pub from_currency: Currency,
    pub to_currency: Currency,
    pub amount: Decimal,
    /// Quote the client is executing against, if any.
    #[serde(default)]
    pub quoted_rate: Option<Decimal>,
    #[serde(default)]
    pub quoted_at: Option<i64>,
    #[serde(default)]
    pub two_factor_code: Option<String>,
    #[serde(default)]
    pub biometric_presented: bool,
}

// --- bridge ---

#[derive(Deserialize, Debug)]
pub struct EstimateFeeRequest {
    pub target_chain: String,
    pub amount: Decimal,
}

#[derive(Serialize, Debug)]
pub struct EstimateFeeResponse {
    pub fee: Decimal,
}

#[derive(Deserialize, Debug)]
pub struct BridgeConfirmedRequest {
    pub lock_id: String,
}

#[derive(Deserialize, Debug)]
pub struct BridgeFailedRequest {
    pub lock_id: String,
    pub reason: String,
}

#[derive(Serialize, Debug)]
pub struct ChainView {
    pub id: String,
    pub name: String,
    pub symbol: String,
}

// --- node ---

#[derive(Serialize, Debug)]
pub struct NodeInfo {
    pub version: String,
    pub network: String,
    pub node_type: String,
}
