//! Persistence: one sled keyspace, JSON values, prefixed keys

use serde::{de::DeserializeOwned, Serialize};

use crate::bridge::BridgeIntent;
use crate::error::LedgerError;
use crate::history::Transaction;
use crate::ledger::AccountBook;
use crate::registry::types::Account;
use crate::staking::StakePosition;

pub struct Storage {
    db: sled::Db,
}

impl Storage {
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let db = sled::open(path).map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Storage { db })
    }

    // Generic Helper: Put
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), LedgerError> {
        let serialized =
            serde_json::to_vec(value).map_err(|e| LedgerError::Storage(e.to_string()))?;
        self.db
            .insert(key.as_bytes(), serialized)
            .map(|_| ())
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    // Generic Helper: Get
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LedgerError> {
        match self.db.get(key.as_bytes()) {
            Ok(Some(data)) => {
                let deserialized = serde_json::from_slice(&data)
                    .map_err(|e| LedgerError::Storage(e.to_string()))?;
                Ok(Some(deserialized))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Storage(e.to_string())),
        }
    }

    fn delete(&self, key: &str) -> Result<(), LedgerError> {
        self.db
            .remove(key.as_bytes())
            .map(|_| ())
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        self.db
            .scan_prefix(prefix.as_bytes())
            .filter_map(|item| item.ok())
            .filter_map(|(_, data)| serde_json::from_slice(&data).ok())
            .collect()
    }

    // --- Specific Accessors ---

    // 1. Accounts
    pub fn save_account(&self, account: &Account) -> Result<(), LedgerError> {
        self.put(&format!("account:{}", account.id), account)
    }

    pub fn all_accounts(&self) -> Vec<Account> {
        self.scan_prefix("account:")
    }

    // 2. Ledger books (balances + that account's journal slice)
    pub fn save_book(&self, account_id: &str, book: &AccountBook) -> Result<(), LedgerError> {
        self.put(&format!("book:{}", account_id), book)
    }

    pub fn all_books(&self) -> Vec<(String, AccountBook)> {
        self.db
            .scan_prefix(b"book:")
            .filter_map(|item| item.ok())
            .filter_map(|(key, data)| {
                let key = String::from_utf8(key.to_vec()).ok()?;
                let account_id = key.strip_prefix("book:")?.to_string();
                let book: AccountBook = serde_json::from_slice(&data).ok()?;
                Some((account_id, book))
            })
            .collect()
    }

    // 3. Transactions
    pub fn save_transaction(&self, tx: &Transaction) -> Result<(), LedgerError> {
        self.put(&format!("tx:{}", tx.id), tx)
    }

    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.scan_prefix("tx:")
    }

    // 4. Stake positions
    pub fn save_position(&self, position: &StakePosition) -> Result<(), LedgerError> {
        self.put(
            &format!("stake:{}:{}", position.account_id, position.currency),
            position,
        )
    }

    pub fn delete_position(&self, account_id: &str, currency: &str) -> Result<(), LedgerError> {
        self.delete(&format!("stake:{}:{}", account_id, currency))
    }

    pub fn all_positions(&self) -> Vec<StakePosition> {
        self.scan_prefix("stake:")
    }

    // 5. Bridge intents
    pub fn save_intent(&self, intent: &BridgeIntent) -> Result<(), LedgerError> {
        self.put(&format!("bridge:{}", intent.transaction_id), intent)
    }

    pub fn all_intents(&self) -> Vec<BridgeIntent> {
        self.scan_prefix("bridge:")
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BalanceBucket, EntryKind, Ledger};
    use crate::registry::types::Currency;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    #[test]
    fn test_books_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();

        {
            let storage = Arc::new(Storage::open(&path).unwrap());
            let ledger = Ledger::with_storage(storage.clone());
            ledger
                .apply_delta(
                    "alice",
                    Currency::Btn,
                    BalanceBucket::Available,
                    Decimal::new(750, 0),
                    EntryKind::Receive,
                    "seed",
                )
                .unwrap();
            storage.flush().unwrap();
        }

        let storage = Arc::new(Storage::open(&path).unwrap());
        let ledger = Ledger::with_storage(storage);
        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, Decimal::new(750, 0));
        assert_eq!(ledger.journal("alice").len(), 1);
        ledger.verify_books().unwrap();

        // Entry ids keep increasing after a reload
        let entry = ledger
            .apply_delta(
                "alice",
                Currency::Btn,
                BalanceBucket::Available,
                Decimal::new(1, 0),
                EntryKind::Receive,
                "tx2",
            )
            .unwrap();
        assert_eq!(entry.id, 2);
    }

    #[test]
    fn test_position_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_str().unwrap()).unwrap();
        let position = StakePosition {
            account_id: "alice".to_string(),
            currency: Currency::Btn,
            principal: Decimal::new(100, 0),
            started_at: 0,
            last_accrual_at: 0,
            apy_basis_points: 500,
        };
        storage.save_position(&position).unwrap();
        assert_eq!(storage.all_positions().len(), 1);
        storage.delete_position("alice", "BTN").unwrap();
        assert!(storage.all_positions().is_empty());
    }
}
