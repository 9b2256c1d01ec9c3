//! Balance and journal record types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::registry::types::{AccountId, Currency};

/// Balance for one (account, currency). `version` is monotonic and
/// bumped on every committed mutation (optimistic concurrency).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Balance {
    pub available: Decimal,
    pub locked: Decimal,
    pub version: u64,
}

impl Balance {
    pub fn zero() -> Self {
        Self {
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
            version: 0,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::zero()
    }
}

/// Which bucket of a balance a journal delta applies to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BalanceBucket {
    Available,
    Locked,
}

/// Why a journal entry exists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Send,
    Receive,
    Stake,
    Unstake,
    ClaimReward,
    ExchangeOut,
    ExchangeIn,
    BridgeEscrow,
    BridgeRelease,
    BridgeRefund,
}

/// Immutable, append-only journal record. The available (resp. locked)
/// balance of an account/currency is the running sum of deltas for that
/// bucket; entries are never deleted or rewritten.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JournalEntry {
    pub id: u64,
    pub account_id: AccountId,
    pub currency: Currency,
    pub bucket: BalanceBucket,
    pub delta: Decimal,
    pub kind: EntryKind,
    pub related_tx: String,
    pub timestamp: i64,
}

/// One constituent write of a multi-entry atomic operation.
#[derive(Clone, Copy, Debug)]
pub struct LedgerOp {
    pub currency: Currency,
    pub bucket: BalanceBucket,
    pub delta: Decimal,
    pub kind: EntryKind,
}

impl LedgerOp {
    pub fn new(currency: Currency, bucket: BalanceBucket, delta: Decimal, kind: EntryKind) -> Self {
        Self {
            currency,
            bucket,
            delta,
            kind,
        }
    }
}
