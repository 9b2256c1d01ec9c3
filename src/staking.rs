//! Staking: locked balances and time-based reward accrual
//!
//! One position per (account, currency). Accrual is lazy: rewards are
//! computed from `last_accrual_at` on every read or claim, never by a
//! background clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StakingConfig;
use crate::error::LedgerError;
use crate::ledger::{BalanceBucket, EntryKind, Ledger, LedgerOp};
use crate::registry::types::{AccountId, Currency};
use crate::storage::Storage;

pub const SECONDS_PER_YEAR: i64 = 365 * 24 * 60 * 60;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StakePosition {
    pub account_id: AccountId,
    pub currency: Currency,
    pub principal: Decimal,
    pub started_at: i64,
    pub last_accrual_at: i64,
    pub apy_basis_points: u32,
}

/// Reward accrued between `last_accrual_at` and `now`. Pure function.
pub fn accrue(position: &StakePosition, now: i64) -> Decimal {
    if now <= position.last_accrual_at {
        return Decimal::ZERO;
    }
    let elapsed = Decimal::from(now - position.last_accrual_at);
    let rate = Decimal::from(position.apy_basis_points) / Decimal::from(10_000u32);
    position.principal * rate * elapsed / Decimal::from(SECONDS_PER_YEAR)
}

pub struct StakingEngine {
    config: StakingConfig,
    ledger: Arc<Ledger>,
    positions: Mutex<HashMap<(AccountId, Currency), StakePosition>>,
    storage: Option<Arc<Storage>>,
}

impl StakingEngine {
    pub fn new(config: StakingConfig, ledger: Arc<Ledger>) -> Self {
        Self {
            config,
            ledger,
            positions: Mutex::new(HashMap::new()),
            storage: None,
        }
    }

    pub fn with_storage(config: StakingConfig, ledger: Arc<Ledger>, storage: Arc<Storage>) -> Self {
        let engine = Self::new(config, ledger);
        {
            let mut positions = lock(&engine.positions);
            for pos in storage.all_positions() {
                positions.insert((pos.account_id.clone(), pos.currency), pos);
            }
        }
        Self {
            storage: Some(storage),
            ..engine
        }
    }

    pub fn default_apy_basis_points(&self) -> u32 {
        self.config.default_apy_basis_points
    }

    /// Move `amount` from available into the locked bucket and open (or
    /// grow) the account's position for that currency. Growing an
    /// existing position settles its accrued reward first so past
    /// rewards keep their old principal.
    pub fn stake(
        &self,
        account_id: &str,
        currency: Currency,
        amount: Decimal,
        apy_basis_points: u32,
        tx_id: &str,
        now: i64,
    ) -> Result<StakePosition, LedgerError> {
        if amount < self.config.min_stake {
            return Err(LedgerError::BelowMinimumStake(format!(
                "{} is below the {} minimum of {}",
                amount, currency, self.config.min_stake
            )));
        }

        let mut positions = lock(&self.positions);
        let key = (account_id.to_string(), currency);

        let mut ops = vec![
            LedgerOp::new(currency, BalanceBucket::Available, -amount, EntryKind::Stake),
            LedgerOp::new(currency, BalanceBucket::Locked, amount, EntryKind::Stake),
        ];
        let pending_reward = positions
            .get(&key)
            .map(|pos| accrue(pos, now))
            .unwrap_or(Decimal::ZERO);
        if pending_reward > Decimal::ZERO {
            ops.push(LedgerOp::new(
                currency,
                BalanceBucket::Available,
                pending_reward,
                EntryKind::ClaimReward,
            ));
        }
        self.ledger.apply_batch(account_id, &ops, tx_id)?;

        let position = match positions.get_mut(&key) {
            Some(pos) => {
                pos.principal += amount;
                pos.last_accrual_at = now;
                pos.clone()
            }
            None => {
                let pos = StakePosition {
                    account_id: account_id.to_string(),
                    currency,
                    principal: amount,
                    started_at: now,
                    last_accrual_at: now,
                    apy_basis_points,
                };
                positions.insert(key, pos.clone());
                pos
            }
        };
        self.persist(&position);
        info!(account = account_id, %currency, %amount, "stake opened");
        Ok(position)
    }

    /// Realize accrued reward into available balance and reset the
    /// accrual clock. Principal is unchanged.
    pub fn claim_reward(
        &self,
        account_id: &str,
        currency: Currency,
        tx_id: &str,
        now: i64,
    ) -> Result<Decimal, LedgerError> {
        let mut positions = lock(&self.positions);
        let key = (account_id.to_string(), currency);
        let position = positions
            .get_mut(&key)
            .ok_or_else(|| LedgerError::NotFound(format!("stake position {}/{}", account_id, currency)))?;

        let reward = accrue(position, now);
        if reward > Decimal::ZERO {
            self.ledger.apply_delta(
                account_id,
                currency,
                BalanceBucket::Available,
                reward,
                EntryKind::ClaimReward,
                tx_id,
            )?;
        }
        position.last_accrual_at = now;
        let position = position.clone();
        self.persist(&position);
        Ok(reward)
    }

    /// Return `amount` of principal from locked to available once the
    /// lock period has elapsed. Accrued reward is settled in the same
    /// batch so it is never lost to the principal reduction.
    pub fn unstake(
        &self,
        account_id: &str,
        currency: Currency,
        amount: Decimal,
        tx_id: &str,
        now: i64,
    ) -> Result<StakePosition, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidRequest(
                "unstake amount must be positive".to_string(),
            ));
        }
        let mut positions = lock(&self.positions);
        let key = (account_id.to_string(), currency);
        let position = positions
            .get_mut(&key)
            .ok_or_else(|| LedgerError::NotFound(format!("stake position {}/{}", account_id, currency)))?;

        let locked_for = now - position.started_at;
        if locked_for < self.config.lock_period_secs {
            return Err(LedgerError::LockPeriodActive(format!(
                "{}s of the {}s lock period remain",
                self.config.lock_period_secs - locked_for,
                self.config.lock_period_secs
            )));
        }
        if amount > position.principal {
            return Err(LedgerError::InsufficientFunds(format!(
                "unstake {} exceeds principal {}",
                amount, position.principal
            )));
        }

        let mut ops = vec![
            LedgerOp::new(currency, BalanceBucket::Locked, -amount, EntryKind::Unstake),
            LedgerOp::new(currency, BalanceBucket::Available, amount, EntryKind::Unstake),
        ];
        let reward = accrue(position, now);
        if reward > Decimal::ZERO {
            ops.push(LedgerOp::new(
                currency,
                BalanceBucket::Available,
                reward,
                EntryKind::ClaimReward,
            ));
        }
        self.ledger.apply_batch(account_id, &ops, tx_id)?;

        position.principal -= amount;
        position.last_accrual_at = now;
        let snapshot = position.clone();
        if snapshot.principal == Decimal::ZERO {
            positions.remove(&key);
            if let Some(storage) = &self.storage {
                let _ = storage.delete_position(account_id, currency.code());
            }
        } else {
            self.persist(&snapshot);
        }
        info!(account = account_id, %currency, %amount, "unstaked");
        Ok(snapshot)
    }

    pub fn position(&self, account_id: &str, currency: Currency) -> Option<StakePosition> {
        let positions = lock(&self.positions);
        positions.get(&(account_id.to_string(), currency)).cloned()
    }

    pub fn positions_for(&self, account_id: &str) -> Vec<StakePosition> {
        let positions = lock(&self.positions);
        positions
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect()
    }

    fn persist(&self, position: &StakePosition) {
        if let Some(storage) = &self.storage {
            let _ = storage.save_position(position);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BalanceBucket;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn engine_with_funds(amount: &str) -> (StakingEngine, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::new());
        ledger
            .apply_delta(
                "alice",
                Currency::Btn,
                BalanceBucket::Available,
                dec(amount),
                EntryKind::Receive,
                "seed",
            )
            .unwrap();
        let config = StakingConfig {
            min_stake: dec("10"),
            lock_period_secs: 30 * 24 * 60 * 60,
            default_apy_basis_points: 500,
        };
        (StakingEngine::new(config, ledger.clone()), ledger)
    }

    #[test]
    fn test_accrual_example() {
        // 500 BTN at 5% APY for exactly one year accrues 25 BTN
        let position = StakePosition {
            account_id: "alice".to_string(),
            currency: Currency::Btn,
            principal: dec("500"),
            started_at: 0,
            last_accrual_at: 0,
            apy_basis_points: 500,
        };
        assert_eq!(accrue(&position, SECONDS_PER_YEAR), dec("25"));
        assert_eq!(accrue(&position, 0), Decimal::ZERO);
    }

    #[test]
    fn test_stake_moves_available_to_locked() {
        let (engine, ledger) = engine_with_funds("1000");
        engine
            .stake("alice", Currency::Btn, dec("500"), 500, "tx1", 0)
            .unwrap();
        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, dec("500"));
        assert_eq!(bal.locked, dec("500"));
        ledger.verify_books().unwrap();
    }

    #[test]
    fn test_stake_below_minimum() {
        let (engine, _) = engine_with_funds("1000");
        let err = engine
            .stake("alice", Currency::Btn, dec("5"), 500, "tx1", 0)
            .unwrap_err();
        assert!(matches!(err, LedgerError::BelowMinimumStake(_)));
    }

    #[test]
    fn test_stake_insufficient_funds() {
        let (engine, ledger) = engine_with_funds("100");
        let err = engine
            .stake("alice", Currency::Btn, dec("200"), 500, "tx1", 0)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds(_)));
        assert_eq!(ledger.get_balance("alice", Currency::Btn).locked, Decimal::ZERO);
    }

    #[test]
    fn test_unstake_before_lock_period() {
        let (engine, _) = engine_with_funds("1000");
        engine
            .stake("alice", Currency::Btn, dec("500"), 500, "tx1", 0)
            .unwrap();
        let err = engine
            .unstake("alice", Currency::Btn, dec("500"), "tx2", 100)
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockPeriodActive(_)));
    }

    #[test]
    fn test_unstake_after_lock_period_returns_exact_amount() {
        let (engine, ledger) = engine_with_funds("1000");
        let lock_period = 30 * 24 * 60 * 60;
        engine
            .stake("alice", Currency::Btn, dec("500"), 0, "tx1", 0)
            .unwrap();
        engine
            .unstake("alice", Currency::Btn, dec("500"), "tx2", lock_period)
            .unwrap();
        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, dec("1000"));
        assert_eq!(bal.locked, Decimal::ZERO);
        // Fully drained position is closed
        assert!(engine.position("alice", Currency::Btn).is_none());
        ledger.verify_books().unwrap();
    }

    #[test]
    fn test_claim_reward_resets_clock() {
        let (engine, ledger) = engine_with_funds("1000");
        engine
            .stake("alice", Currency::Btn, dec("500"), 500, "tx1", 0)
            .unwrap();
        let reward = engine
            .claim_reward("alice", Currency::Btn, "tx2", SECONDS_PER_YEAR)
            .unwrap();
        assert_eq!(reward, dec("25"));

        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, dec("525"));
        assert_eq!(bal.locked, dec("500"));

        // Clock reset: immediate second claim yields nothing
        let reward = engine
            .claim_reward("alice", Currency::Btn, "tx3", SECONDS_PER_YEAR)
            .unwrap();
        assert_eq!(reward, Decimal::ZERO);
        ledger.verify_books().unwrap();
    }

    #[test]
    fn test_restake_settles_pending_reward() {
        let (engine, ledger) = engine_with_funds("1000");
        engine
            .stake("alice", Currency::Btn, dec("500"), 500, "tx1", 0)
            .unwrap();
        // A year later, stake 100 more: the 25 reward on the old
        // principal is realized in the same batch.
        let position = engine
            .stake("alice", Currency::Btn, dec("100"), 500, "tx2", SECONDS_PER_YEAR)
            .unwrap();
        assert_eq!(position.principal, dec("600"));
        let bal = ledger.get_balance("alice", Currency::Btn);
        assert_eq!(bal.available, dec("425")); // 1000 - 500 - 100 + 25
        assert_eq!(bal.locked, dec("600"));
        ledger.verify_books().unwrap();
    }
}
