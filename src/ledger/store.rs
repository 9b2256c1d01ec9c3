//! Authoritative balance store with an append-only journal
//!
//! Concurrency model: one lock per account (single writer per account).
//! Single-entry deltas go through an optimistic snapshot/commit cycle
//! with a bounded retry budget; multi-entry batches hold the account's
//! critical section for their whole validation + append. Cross-account
//! transfers take both locks in lexicographic account-id order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{Balance, BalanceBucket, EntryKind, JournalEntry, LedgerOp};
use crate::error::LedgerError;
use crate::registry::types::{AccountId, Currency};
use crate::storage::Storage;

const MAX_APPLY_RETRIES: u32 = 5;

/// Per-account balances plus that account's slice of the journal.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AccountBook {
    pub balances: HashMap<Currency, Balance>,
    pub journal: Vec<JournalEntry>,
}

impl AccountBook {
    pub fn balance(&self, currency: Currency) -> Balance {
        self.balances.get(&currency).copied().unwrap_or_default()
    }

    fn bucket_value(&self, currency: Currency, bucket: BalanceBucket) -> Decimal {
        let bal = self.balance(currency);
        match bucket {
            BalanceBucket::Available => bal.available,
            BalanceBucket::Locked => bal.locked,
        }
    }

    fn apply_entry(&mut self, entry: &JournalEntry) {
        let bal = self.balances.entry(entry.currency).or_default();
        match entry.bucket {
            BalanceBucket::Available => bal.available += entry.delta,
            BalanceBucket::Locked => bal.locked += entry.delta,
        }
        bal.version += 1;
        self.journal.push(entry.clone());
    }

    /// Recompute running sums and compare against the stored balances.
    pub fn verify(&self) -> Result<(), (Currency, Decimal, Decimal)> {
        let mut sums: HashMap<(Currency, BalanceBucket), Decimal> = HashMap::new();
        for entry in &self.journal {
            *sums.entry((entry.currency, entry.bucket)).or_default() += entry.delta;
        }
        for (currency, bal) in &self.balances {
            let available = sums
                .get(&(*currency, BalanceBucket::Available))
                .copied()
                .unwrap_or_default();
            if available != bal.available {
                return Err((*currency, bal.available, available));
            }
            let locked = sums
                .get(&(*currency, BalanceBucket::Locked))
                .copied()
                .unwrap_or_default();
            if locked != bal.locked {
                return Err((*currency, bal.locked, locked));
            }
        }
        Ok(())
    }
}

pub struct Ledger {
    books: Mutex<HashMap<AccountId, Arc<Mutex<AccountBook>>>>,
    next_entry_id: AtomicU64,
    storage: Option<Arc<Storage>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            books: Mutex::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        let ledger = Self::new();
        let mut max_id = 0u64;
        {
            let mut books = lock(&ledger.books);
            for (account_id, book) in storage.all_books() {
                for entry in &book.journal {
                    max_id = max_id.max(entry.id);
                }
                books.insert(account_id, Arc::new(Mutex::new(book)));
            }
        }
        ledger.next_entry_id.store(max_id + 1, Ordering::SeqCst);
        Self {
            storage: Some(storage),
            ..ledger
        }
    }

    fn book(&self, account_id: &str) -> Arc<Mutex<AccountBook>> {
        let mut books = lock(&self.books);
        books
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccountBook::default())))
            .clone()
    }

    /// Zero balance (not an error) for a currency never touched.
    pub fn get_balance(&self, account_id: &str, currency: Currency) -> Balance {
        let book = self.book(account_id);
        let guard = lock(&book);
        guard.balance(currency)
    }

    pub fn balances(&self, account_id: &str) -> HashMap<Currency, Balance> {
        let book = self.book(account_id);
        let guard = lock(&book);
        guard.balances.clone()
    }

    pub fn journal(&self, account_id: &str) -> Vec<JournalEntry> {
        let book = self.book(account_id);
        let guard = lock(&book);
        guard.journal.clone()
    }

    /// Apply a single delta with optimistic concurrency: snapshot the
    /// balance version, validate, then commit only if the version is
    /// unchanged. Bounded retries before surfacing the conflict.
    pub fn apply_delta(
        &self,
        account_id: &str,
        currency: Currency,
        bucket: BalanceBucket,
        delta: Decimal,
        kind: EntryKind,
        related_tx: &str,
    ) -> Result<JournalEntry, LedgerError> {
        let book = self.book(account_id);
        for attempt in 0..MAX_APPLY_RETRIES {
            let snapshot = {
                let guard = lock(&book);
                guard.balance(currency)
            };
            let current = match bucket {
                BalanceBucket::Available => snapshot.available,
                BalanceBucket::Locked => snapshot.locked,
            };
            if delta < Decimal::ZERO && current + delta < Decimal::ZERO {
                return Err(LedgerError::InsufficientFunds(format!(
                    "{} {:?} balance {} cannot absorb {}",
                    currency, bucket, current, delta
                )));
            }

            let entry = self.new_entry(account_id, currency, bucket, delta, kind, related_tx);
            let mut guard = lock(&book);
            if guard.balance(currency).version != snapshot.version {
                debug!(
                    account = account_id,
                    %currency,
                    attempt,
                    "version conflict on apply_delta, retrying"
                );
                continue;
            }
            guard.apply_entry(&entry);
            self.persist(account_id, &guard);
            return Ok(entry);
        }
        warn!(account = account_id, %currency, "apply_delta retries exhausted");
        Err(LedgerError::ConcurrentModification)
    }

    /// Apply all constituent entries of a multi-entry operation under
    /// one critical section: either every entry commits or none do.
    pub fn apply_batch(
        &self,
        account_id: &str,
        ops: &[LedgerOp],
        related_tx: &str,
    ) -> Result<Vec<JournalEntry>, LedgerError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let book = self.book(account_id);
        let mut guard = lock(&book);

        // Validate the whole batch against projected balances first.
        let mut projected: HashMap<(Currency, BalanceBucket), Decimal> = HashMap::new();
        for op in ops {
            let value = projected
                .entry((op.currency, op.bucket))
                .or_insert_with(|| guard.bucket_value(op.currency, op.bucket));
            *value += op.delta;
            if *value < Decimal::ZERO {
                return Err(LedgerError::InsufficientFunds(format!(
                    "{} {:?} balance would go negative",
                    op.currency, op.bucket
                )));
            }
        }

        let mut entries = Vec::with_capacity(ops.len());
        for op in ops {
            let entry =
                self.new_entry(account_id, op.currency, op.bucket, op.delta, op.kind, related_tx);
            guard.apply_entry(&entry);
            entries.push(entry);
        }
        self.persist(account_id, &guard);
        Ok(entries)
    }

    /// Cross-account transfer: debit `from`, credit `to`, both locks
    /// held, acquired in lexicographic order to prevent deadlock.
    pub fn transfer(
        &self,
        from: &str,
        to: &str,
        currency: Currency,
        amount: Decimal,
        related_tx: &str,
    ) -> Result<(JournalEntry, JournalEntry), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidRequest(
                "transfer amount must be positive".to_string(),
            ));
        }
        if from == to {
            return Err(LedgerError::InvalidRequest(
                "transfer to self".to_string(),
            ));
        }

        let from_book = self.book(from);
        let to_book = self.book(to);
        let (mut from_guard, mut to_guard) = if from < to {
            let f = lock(&from_book);
            let t = lock(&to_book);
            (f, t)
        } else {
            let t = lock(&to_book);
            let f = lock(&from_book);
            (f, t)
        };

        let available = from_guard.balance(currency).available;
        if available < amount {
            return Err(LedgerError::InsufficientFunds(format!(
                "{} available {} short of {}",
                currency, available, amount
            )));
        }

        let debit = self.new_entry(
            from,
            currency,
            BalanceBucket::Available,
            -amount,
            EntryKind::Send,
            related_tx,
        );
        let credit = self.new_entry(
            to,
            currency,
            BalanceBucket::Available,
            amount,
            EntryKind::Receive,
            related_tx,
        );
        from_guard.apply_entry(&debit);
        to_guard.apply_entry(&credit);
        self.persist(from, &from_guard);
        self.persist(to, &to_guard);
        Ok((debit, credit))
    }

    /// Audit every book: stored balances must equal journal running sums.
    pub fn verify_books(&self) -> Result<(), LedgerError> {
        let handles: Vec<(AccountId, Arc<Mutex<AccountBook>>)> = {
            let books = lock(&self.books);
            books.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (account_id, book) in handles {
            let guard = lock(&book);
            if let Err((currency, stored, computed)) = guard.verify() {
                return Err(LedgerError::Storage(format!(
                    "journal mismatch for {}/{}: stored {}, journal sum {}",
                    account_id, currency, stored, computed
                )));
            }
        }
        Ok(())
    }

    fn new_entry(
        &self,
        account_id: &str,
        currency: Currency,
        bucket: BalanceBucket,
        delta: Decimal,
        kind: EntryKind,
        related_tx: &str,
    ) -> JournalEntry {
        JournalEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::SeqCst),
            account_id: account_id.to_string(),
            currency,
            bucket,
            delta,
            kind,
            related_tx: related_tx.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn persist(&self, account_id: &str, book: &AccountBook) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_book(account_id, book) {
                warn!(account = account_id, "book persist failed: {}", e);
            }
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn seeded(account: &str, amount: &str) -> Ledger {
        let ledger = Ledger::new();
        ledger
            .apply_delta(
                account,
                Currency::Btn,
                BalanceBucket::Available,
                dec(amount),
                EntryKind::Receive,
                "seed",
            )
            .unwrap();
        ledger
    }

    #[test]
    fn test_zero_balance_for_untouched_currency() {
        let ledger = Ledger::new();
        let bal = ledger.get_balance("alice", Currency::Eth);
        assert_eq!(bal.available, Decimal::ZERO);
        assert_eq!(bal.version, 0);
    }

    #[test]
    fn test_apply_delta_insufficient() {
        let ledger = seeded("alice", "100");
        let err = ledger
            .apply_delta(
                "alice",
                Currency::Btn,
                BalanceBucket::Available,
                dec("-150"),
                EntryKind::Send,
                "tx1",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds(_)));
        // Rejected mutation leaves the book unchanged
        assert_eq!(ledger.get_balance("alice", Currency::Btn).available, dec("100"));
        assert_eq!(ledger.journal("alice").len(), 1);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let ledger = seeded("alice", "100");
        let ops = [
            LedgerOp::new(Currency::Btn, BalanceBucket::Available, dec("-100"), EntryKind::Stake),
            LedgerOp::new(Currency::Btn, BalanceBucket::Locked, dec("100"), EntryKind::Stake),
            // Second debit overdraws: whole batch must fail
            LedgerOp::new(Currency::Btn, BalanceBucket::Available, dec("-1"), EntryKind::Send),
        ];
        assert!(ledger.apply_batch("alice", &ops, "tx1").is_err());
        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, dec("100"));
        assert_eq!(bal.locked, Decimal::ZERO);

        let good = [
            LedgerOp::new(Currency::Btn, BalanceBucket::Available, dec("-60"), EntryKind::Stake),
            LedgerOp::new(Currency::Btn, BalanceBucket::Locked, dec("60"), EntryKind::Stake),
        ];
        ledger.apply_batch("alice", &good, "tx2").unwrap();
        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, dec("40"));
        assert_eq!(bal.locked, dec("60"));
        ledger.verify_books().unwrap();
    }

    #[test]
    fn test_transfer_and_journal_sums() {
        let ledger = seeded("alice", "1000");
        ledger
            .transfer("alice", "bob", Currency::Btn, dec("400"), "tx1")
            .unwrap();
        assert_eq!(ledger.get_balance("alice", Currency::Btn).available, dec("600"));
        assert_eq!(ledger.get_balance("bob", Currency::Btn).available, dec("400"));
        ledger.verify_books().unwrap();
    }

    #[test]
    fn test_transfer_to_self_rejected() {
        let ledger = seeded("alice", "10");
        assert!(ledger
            .transfer("alice", "alice", Currency::Btn, dec("1"), "tx")
            .is_err());
    }

    #[test]
    fn test_concurrent_sends_never_overdraw() {
        let ledger = Arc::new(seeded("alice", "100"));
        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(thread::spawn(move || {
                ledger.transfer("alice", "bob", Currency::Btn, dec("30"), &format!("tx{}", i))
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let applied = results.iter().filter(|r| r.is_ok()).count();
        let failed = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds(_))))
            .count();

        // Exactly the prefix that fits the balance applies: 3 x 30 = 90
        assert_eq!(applied, 3);
        assert_eq!(failed, 7);
        assert_eq!(ledger.get_balance("alice", Currency::Btn).available, dec("10"));
        assert_eq!(ledger.get_balance("bob", Currency::Btn).available, dec("90"));
        ledger.verify_books().unwrap();
    }

    #[test]
    fn test_opposite_direction_transfers_no_deadlock() {
        let ledger = Arc::new(Ledger::new());
        for account in ["alice", "bob"] {
            ledger
                .apply_delta(
                    account,
                    Currency::Btn,
                    BalanceBucket::Available,
                    dec("1000"),
                    EntryKind::Receive,
                    "seed",
                )
                .unwrap();
        }
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            handles.push(thread::spawn(move || {
                ledger.transfer(from, to, Currency::Btn, dec("1"), &format!("tx{}", i))
            }));
        }
        for h in handles {
            h.join().unwrap().unwrap();
        }
        let total = ledger.get_balance("alice", Currency::Btn).available
            + ledger.get_balance("bob", Currency::Btn).available;
        assert_eq!(total, dec("2000"));
        ledger.verify_books().unwrap();
    }
}
