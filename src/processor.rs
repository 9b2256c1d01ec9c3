//! Transaction orchestration: validate, authorize, delegate, record
//!
//! Every flow runs request -> SecurityPolicy.authorize -> engine ->
//! journal append -> transaction record. Funds errors and exhausted
//! retry budgets surface immediately as Failed; nothing is retried
//! here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bridge::{BridgeCoordinator, BridgeOutcome};
use crate::error::LedgerError;
use crate::exchange::{ExchangeEngine, Quote};
use crate::history::{Transaction, TransactionKind, TransactionLog, TransactionStatus};
use crate::ledger::{Balance, BalanceBucket, EntryKind, Ledger};
use crate::registry::{Account, AccountRegistry, CreateAccountSpec, CreatedAccount, Currency};
use crate::security::{AuthContext, Decision, SecurityPolicy};
use crate::staking::{accrue, StakePosition, StakingEngine};

pub struct TransactionProcessor {
    registry: Arc<Mutex<AccountRegistry>>,
    security: Arc<SecurityPolicy>,
    ledger: Arc<Ledger>,
    staking: Arc<StakingEngine>,
    exchange: Arc<ExchangeEngine>,
    bridge: Arc<BridgeCoordinator>,
    history: Arc<TransactionLog>,
}

impl TransactionProcessor {
    pub fn new(
        registry: Arc<Mutex<AccountRegistry>>,
        security: Arc<SecurityPolicy>,
        ledger: Arc<Ledger>,
        staking: Arc<StakingEngine>,
        exchange: Arc<ExchangeEngine>,
        bridge: Arc<BridgeCoordinator>,
        history: Arc<TransactionLog>,
    ) -> Self {
        Self {
            registry,
            security,
            ledger,
            staking,
            exchange,
            bridge,
            history,
        }
    }

    pub fn create_account(&self, spec: CreateAccountSpec) -> Result<CreatedAccount, LedgerError> {
        let created = lock(&self.registry).create_account(spec)?;
        self.security.init_baseline(&created.account.id);
        Ok(created)
    }

    pub fn balances(&self, address: &str) -> Result<HashMap<Currency, Balance>, LedgerError> {
        let account = self.resolve(address)?;
        Ok(self.ledger.balances(&account.id))
    }

    pub fn history_for(&self, address: &str, limit: usize) -> Vec<Transaction> {
        self.history.for_address(address, None, limit)
    }

    pub fn transaction(&self, id: &str) -> Result<Transaction, LedgerError> {
        self.history.get(id)
    }

    /// Send funds to another address, or across chains when
    /// `target_chain` is set. Cross-chain sends park in AwaitingBridge
    /// and resolve asynchronously via the bridge driver.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        currency: Currency,
        target_chain: Option<String>,
        ctx: &AuthContext,
    ) -> Result<Transaction, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidRequest(
                "send amount must be positive".to_string(),
            ));
        }
        let cross_chain = target_chain.is_some();
        let kind = if cross_chain {
            TransactionKind::CrossChain
        } else {
            TransactionKind::Send
        };
        let from_account = self.resolve(from)?;
        self.require(self.security.authorize(&from_account, kind, amount, ctx, now()))?;

        if cross_chain {
            let target = target_chain.unwrap_or_default();
            let fee = self.bridge.estimate_fee(&target, amount)?;
            let tx = self.open_tx(kind, from, to, amount, currency, fee, Some(target.clone()));
            self.history.add(tx.clone())?;

            if let Err(e) = self
                .bridge
                .initiate(&from_account.id, currency, amount, &target, &tx.id)
            {
                self.history
                    .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                return Err(e);
            }
            let tx = self
                .history
                .update_status(&tx.id, TransactionStatus::AwaitingBridge, None)?;
            self.spawn_bridge_driver(tx.id.clone());
            Ok(tx)
        } else {
            let to_account = self.resolve(to)?;
            let tx = self.open_tx(kind, from, to, amount, currency, Decimal::ZERO, None);
            self.history.add(tx.clone())?;

            match self
                .ledger
                .transfer(&from_account.id, &to_account.id, currency, amount, &tx.id)
            {
                Ok(_) => {
                    info!(tx = %tx.id, %amount, %currency, "send applied");
                    self.history
                        .update_status(&tx.id, TransactionStatus::Applied, None)
                }
                Err(e) => {
                    self.history
                        .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                    Err(e)
                }
            }
        }
    }

    /// Credit an inbound transfer observed on the wallet's own chain.
    pub fn receive(
        &self,
        to: &str,
        amount: Decimal,
        currency: Currency,
        reference: &str,
    ) -> Result<Transaction, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidRequest(
                "receive amount must be positive".to_string(),
            ));
        }
        let account = self.resolve(to)?;
        let tx = self.open_tx(
            TransactionKind::Receive,
            reference,
            to,
            amount,
            currency,
            Decimal::ZERO,
            None,
        );
        self.history.add(tx.clone())?;
        match self.ledger.apply_delta(
            &account.id,
            currency,
            BalanceBucket::Available,
            amount,
            EntryKind::Receive,
            &tx.id,
        ) {
            Ok(_) => self
                .history
                .update_status(&tx.id, TransactionStatus::Applied, None),
            Err(e) => {
                self.history
                    .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub async fn stake(
        &self,
        address: &str,
        currency: Currency,
        amount: Decimal,
        apy_basis_points: Option<u32>,
        ctx: &AuthContext,
    ) -> Result<(Transaction, StakePosition), LedgerError> {
        let account = self.resolve(address)?;
        self.require(
            self.security
                .authorize(&account, TransactionKind::Stake, amount, ctx, now()),
        )?;
        let apy = apy_basis_points.unwrap_or_else(|| self.staking.default_apy_basis_points());
        let tx = self.open_tx(
            TransactionKind::Stake,
            address,
            address,
            amount,
            currency,
            Decimal::ZERO,
            None,
        );
        self.history.add(tx.clone())?;
        match self
            .staking
            .stake(&account.id, currency, amount, apy, &tx.id, now())
        {
            Ok(position) => {
                let tx = self
                    .history
                    .update_status(&tx.id, TransactionStatus::Applied, None)?;
                Ok((tx, position))
            }
            Err(e) => {
                self.history
                    .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub async fn unstake(
        &self,
        address: &str,
        currency: Currency,
        amount: Decimal,
        ctx: &AuthContext,
    ) -> Result<Transaction, LedgerError> {
        let account = self.resolve(address)?;
        self.require(
            self.security
                .authorize(&account, TransactionKind::Unstake, amount, ctx, now()),
        )?;
        let tx = self.open_tx(
            TransactionKind::Unstake,
            address,
            address,
            amount,
            currency,
            Decimal::ZERO,
            None,
        );
        self.history.add(tx.clone())?;
        match self
            .staking
            .unstake(&account.id, currency, amount, &tx.id, now())
        {
            Ok(_) => self
                .history
                .update_status(&tx.id, TransactionStatus::Applied, None),
            Err(e) => {
                self.history
                    .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub async fn claim_reward(
        &self,
        address: &str,
        currency: Currency,
        ctx: &AuthContext,
    ) -> Result<(Transaction, Decimal), LedgerError> {
        let account = self.resolve(address)?;
        self.require(self.security.authorize(
            &account,
            TransactionKind::ClaimReward,
            Decimal::ZERO,
            ctx,
            now(),
        ))?;
        let tx = self.open_tx(
            TransactionKind::ClaimReward,
            address,
            address,
            Decimal::ZERO,
            currency,
            Decimal::ZERO,
            None,
        );
        self.history.add(tx.clone())?;
        match self.staking.claim_reward(&account.id, currency, &tx.id, now()) {
            Ok(reward) => {
                let mut tx = self
                    .history
                    .update_status(&tx.id, TransactionStatus::Applied, None)?;
                tx.amount = reward;
                Ok((tx, reward))
            }
            Err(e) => {
                self.history
                    .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub async fn exchange(
        &self,
        address: &str,
        from_currency: Currency,
        to_currency: Currency,
        amount: Decimal,
        prior_quote: Option<&Quote>,
        ctx: &AuthContext,
    ) -> Result<(Transaction, Quote), LedgerError> {
        let account = self.resolve(address)?;
        self.require(
            self.security
                .authorize(&account, TransactionKind::Exchange, amount, ctx, now()),
        )?;
        let tx = self.open_tx(
            TransactionKind::Exchange,
            address,
            address,
            amount,
            from_currency,
            Decimal::ZERO,
            None,
        );
        self.history.add(tx.clone())?;
        match self
            .exchange
            .execute(
                &account.id,
                from_currency,
                to_currency,
                amount,
                prior_quote,
                &tx.id,
                now(),
            )
            .await
        {
            Ok(quote) => {
                let mut tx = self
                    .history
                    .update_status(&tx.id, TransactionStatus::Applied, None)?;
                tx.fee = quote.fee;
                Ok((tx, quote))
            }
            Err(e) => {
                self.history
                    .update_status(&tx.id, TransactionStatus::Failed, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Cancel a transaction that has not reached a ledger mutation.
    /// Anything past Pending can only be undone by compensating flows.
    pub fn cancel(&self, tx_id: &str) -> Result<Transaction, LedgerError> {
        let tx = self.history.get(tx_id)?;
        if tx.status != TransactionStatus::Pending {
            return Err(LedgerError::InvalidRequest(format!(
                "transaction {} is {:?}, only pending transactions can be cancelled",
                tx_id, tx.status
            )));
        }
        self.history.update_status(
            tx_id,
            TransactionStatus::Reverted,
            Some("cancelled by caller".to_string()),
        )
    }

    /// Adapter callback: the target chain confirmed the mint.
    pub fn bridge_confirmed(&self, lock_id: &str) -> Result<Transaction, LedgerError> {
        let tx_id = self.bridge.on_bridge_confirmed(lock_id)?;
        self.finalize_bridge(&tx_id, &BridgeOutcome::Committed);
        self.history.get(&tx_id)
    }

    /// Adapter callback: the transfer failed upstream.
    pub fn bridge_failed(&self, lock_id: &str, reason: &str) -> Result<Transaction, LedgerError> {
        let tx_id = self.bridge.on_bridge_failed(lock_id, reason)?;
        self.finalize_bridge(&tx_id, &BridgeOutcome::Aborted(reason.to_string()));
        self.history.get(&tx_id)
    }

    /// Balances plus stake detail for the portfolio view.
    pub fn portfolio(
        &self,
        address: &str,
    ) -> Result<(HashMap<Currency, Balance>, Vec<(StakePosition, Decimal)>), LedgerError> {
        let account = self.resolve(address)?;
        let balances = self.ledger.balances(&account.id);
        let ts = now();
        let positions = self
            .staking
            .positions_for(&account.id)
            .into_iter()
            .map(|p| {
                let pending = accrue(&p, ts);
                (p, pending)
            })
            .collect();
        Ok((balances, positions))
    }

    fn resolve(&self, address: &str) -> Result<Account, LedgerError> {
        let registry = lock(&self.registry);
        registry.lookup_by_address(address).map(|a| a.clone())
    }

    fn require(&self, decision: Decision) -> Result<(), LedgerError> {
        match decision {
            Decision::Allow => Ok(()),
            Decision::Require2Fa => Err(LedgerError::SecurityDenied(
                "two-factor code required".to_string(),
            )),
            Decision::RequireBiometric => Err(LedgerError::SecurityDenied(
                "biometric confirmation required".to_string(),
            )),
            Decision::Deny(reason) => Err(LedgerError::SecurityDenied(reason)),
        }
    }

    fn open_tx(
        &self,
        kind: TransactionKind,
        from: &str,
        to: &str,
        amount: Decimal,
        currency: Currency,
        fee: Decimal,
        target_chain: Option<String>,
    ) -> Transaction {
        Transaction {
            id: Uuid::new_v4().to_string(),
            kind,
            status: TransactionStatus::Pending,
            from: from.to_string(),
            to: to.to_string(),
            amount,
            currency,
            fee,
            cross_chain: target_chain.is_some(),
            target_chain,
            reason: None,
            created_at: now(),
            applied_at: None,
        }
    }

    fn spawn_bridge_driver(&self, tx_id: String) {
        let bridge = self.bridge.clone();
        let history = self.history.clone();
        tokio::spawn(async move {
            let outcome = bridge.execute(&tx_id).await;
            let (status, reason) = match &outcome {
                BridgeOutcome::Committed => (TransactionStatus::Applied, None),
                BridgeOutcome::Aborted(reason) => {
                    (TransactionStatus::Reverted, Some(reason.clone()))
                }
            };
            // A callback may have finalized the record already
            if let Err(e) = history.update_status(&tx_id, status, reason) {
                debug!(tx = %tx_id, "bridge driver finalize skipped: {}", e);
            }
        });
    }

    fn finalize_bridge(&self, tx_id: &str, outcome: &BridgeOutcome) {
        let (status, reason) = match outcome {
            BridgeOutcome::Committed => (TransactionStatus::Applied, None),
            BridgeOutcome::Aborted(reason) => {
                (TransactionStatus::Reverted, Some(reason.clone()))
            }
        };
        if let Err(e) = self.history.update_status(tx_id, status, reason) {
            debug!(tx = tx_id, "bridge finalize skipped: {}", e);
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
