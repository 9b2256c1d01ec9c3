//! Transaction records and the per-address history log

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::registry::types::Currency;
use crate::storage::Storage;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Send,
    Receive,
    Stake,
    Unstake,
    ClaimReward,
    Exchange,
    CrossChain,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Send => "send",
            TransactionKind::Receive => "receive",
            TransactionKind::Stake => "stake",
            TransactionKind::Unstake => "unstake",
            TransactionKind::ClaimReward => "claim_reward",
            TransactionKind::Exchange => "exchange",
            TransactionKind::CrossChain => "cross_chain",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Applied,
    Failed,
    AwaitingBridge,
    Reverted,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Applied | TransactionStatus::Failed | TransactionStatus::Reverted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Applied => "applied",
            TransactionStatus::Failed => "failed",
            TransactionStatus::AwaitingBridge => "awaiting_bridge",
            TransactionStatus::Reverted => "reverted",
        }
    }
}

/// A wallet transaction as surfaced to the client. `from`/`to` are
/// chain addresses; the engine resolves them to accounts internally.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub fee: Decimal,
    pub cross_chain: bool,
    pub target_chain: Option<String>,
    pub reason: Option<String>,
    pub created_at: i64,
    pub applied_at: Option<i64>,
}

#[derive(Default)]
struct LogInner {
    by_id: HashMap<String, Transaction>,
    by_address: HashMap<String, Vec<String>>,
}

/// Transaction history, indexed by id and by participating address.
pub struct TransactionLog {
    inner: Mutex<LogInner>,
    storage: Option<Arc<Storage>>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        let log = Self::new();
        {
            let mut inner = lock(&log.inner);
            let mut txs = storage.all_transactions();
            txs.sort_by_key(|tx| tx.created_at);
            for tx in txs {
                index(&mut inner, tx);
            }
        }
        Self {
            storage: Some(storage),
            ..log
        }
    }

    pub fn add(&self, tx: Transaction) -> Result<(), LedgerError> {
        let mut inner = lock(&self.inner);
        if inner.by_id.contains_key(&tx.id) {
            return Err(LedgerError::InvalidRequest(format!(
                "transaction {} already recorded",
                tx.id
            )));
        }
        self.persist(&tx)?;
        index(&mut inner, tx);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Transaction, LedgerError> {
        let inner = lock(&self.inner);
        inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))
    }

    /// Move a transaction to a new status. Terminal states are recorded
    /// exactly once: a transaction already terminal is never rewritten.
    pub fn update_status(
        &self,
        id: &str,
        status: TransactionStatus,
        reason: Option<String>,
    ) -> Result<Transaction, LedgerError> {
        let mut inner = lock(&self.inner);
        let tx = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))?;
        if tx.status.is_terminal() {
            return Err(LedgerError::InvalidRequest(format!(
                "transaction {} already terminal ({:?})",
                id, tx.status
            )));
        }
        tx.status = status;
        if status == TransactionStatus::Applied {
            tx.applied_at = Some(chrono::Utc::now().timestamp());
        }
        if reason.is_some() {
            tx.reason = reason;
        }
        let tx = tx.clone();
        self.persist(&tx)?;
        Ok(tx)
    }

    /// Newest-first history for an address, optionally filtered by kind.
    pub fn for_address(
        &self,
        address: &str,
        kind: Option<TransactionKind>,
        limit: usize,
    ) -> Vec<Transaction> {
        let inner = lock(&self.inner);
        let ids = match inner.by_address.get(address) {
            Some(ids) => ids,
            None => return Vec::new(),
        };
        let mut txs: Vec<Transaction> = ids
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|tx| kind.map(|k| tx.kind == k).unwrap_or(true))
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if limit > 0 {
            txs.truncate(limit);
        }
        txs
    }

    fn persist(&self, tx: &Transaction) -> Result<(), LedgerError> {
        if let Some(storage) = &self.storage {
            storage.save_transaction(tx)?;
        }
        Ok(())
    }
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

fn index(inner: &mut LogInner, tx: Transaction) {
    if !tx.from.is_empty() {
        inner
            .by_address
            .entry(tx.from.clone())
            .or_default()
            .push(tx.id.clone());
    }
    if !tx.to.is_empty() && tx.to != tx.from {
        inner
            .by_address
            .entry(tx.to.clone())
            .or_default()
            .push(tx.id.clone());
    }
    inner.by_id.insert(tx.id.clone(), tx);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
