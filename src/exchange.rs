//! Currency exchange: quotes and atomic same-account conversions

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ExchangeConfig;
use crate::error::LedgerError;
use crate::ledger::{BalanceBucket, EntryKind, Ledger, LedgerOp};
use crate::registry::types::Currency;

/// External rate feed seam. Returns units of `to` per one unit of
/// `from`, or None when the pair is not quoted.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn rate(&self, from: Currency, to: Currency) -> Option<Decimal>;
}

/// Fixed USD-denominated rate table. Seeds match the original feed's
/// base prices; tests and offline nodes run against this provider.
pub struct FixedRateProvider {
    base_usd: Mutex<HashMap<Currency, Decimal>>,
}

impl FixedRateProvider {
    pub fn new() -> Self {
        let mut base_usd = HashMap::new();
        base_usd.insert(Currency::Btn, Decimal::new(15, 0));
        base_usd.insert(Currency::Gld, Decimal::new(10, 0));
        base_usd.insert(Currency::Btc, Decimal::new(45_000, 0));
        base_usd.insert(Currency::Eth, Decimal::new(3_000, 0));
        base_usd.insert(Currency::Usdt, Decimal::ONE);
        base_usd.insert(Currency::Bnb, Decimal::new(300, 0));
        Self {
            base_usd: Mutex::new(base_usd),
        }
    }

    /// Override a base price (used by tests to simulate price movement).
    pub fn set_base_usd(&self, currency: Currency, price: Decimal) {
        let mut base = self.base_usd.lock().unwrap_or_else(|p| p.into_inner());
        base.insert(currency, price);
    }
}

impl Default for FixedRateProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    async fn rate(&self, from: Currency, to: Currency) -> Option<Decimal> {
        let base = self.base_usd.lock().unwrap_or_else(|p| p.into_inner());
        let from_usd = base.get(&from)?;
        let to_usd = base.get(&to)?;
        if to_usd.is_zero() {
            return None;
        }
        Some(from_usd / to_usd)
    }
}

#[derive(Deserialize)]
struct RateResponse {
    rate: String,
}

/// Rate feed over HTTP: `GET {endpoint}/rate?base=BTN&quote=USDT`
/// answering `{"rate": "15.0"}`.
pub struct HttpRateProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRateProvider {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn rate(&self, from: Currency, to: Currency) -> Option<Decimal> {
        let url = format!("{}/rate?base={}&quote={}", self.endpoint, from, to);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("rate feed unreachable: {}", e);
                return None;
            }
        };
        let body: RateResponse = resp.json().await.ok()?;
        Decimal::from_str(&body.rate).ok()
    }
}

/// A priced conversion offer. `output_amount = (amount - fee) * rate`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Quote {
    pub from_currency: Currency,
    pub to_currency: Currency,
    pub amount: Decimal,
    pub rate: Decimal,
    pub fee: Decimal,
    pub output_amount: Decimal,
    pub quoted_at: i64,
}

pub struct ExchangeEngine {
    config: ExchangeConfig,
    rates: Arc<dyn RateProvider>,
    ledger: Arc<Ledger>,
}

impl ExchangeEngine {
    pub fn new(config: ExchangeConfig, rates: Arc<dyn RateProvider>, ledger: Arc<Ledger>) -> Self {
        Self {
            config,
            rates,
            ledger,
        }
    }

    pub async fn quote(
        &self,
        from: Currency,
        to: Currency,
        amount: Decimal,
        now: i64,
    ) -> Result<Quote, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidRequest(
                "exchange amount must be positive".to_string(),
            ));
        }
        if from == to {
            return Err(LedgerError::UnsupportedPair(format!("{} -> {}", from, to)));
        }
        let rate = self
            .rates
            .rate(from, to)
            .await
            .ok_or_else(|| LedgerError::UnsupportedPair(format!("{} -> {}", from, to)))?;

        let fee = amount * Decimal::from(self.config.fee_basis_points) / Decimal::from(10_000u32);
        let output_amount = (amount - fee) * rate;
        Ok(Quote {
            from_currency: from,
            to_currency: to,
            amount,
            rate,
            fee,
            output_amount,
            quoted_at: now,
        })
    }

    /// Execute a conversion at a fresh quote. A caller-supplied quote
    /// older than the TTL whose rate disagrees with the re-quote beyond
    /// the slippage tolerance is rejected; there is no stale-quote
    /// execution path.
    pub async fn execute(
        &self,
        account_id: &str,
        from: Currency,
        to: Currency,
        amount: Decimal,
        prior: Option<&Quote>,
        tx_id: &str,
        now: i64,
    ) -> Result<Quote, LedgerError> {
        let fresh = self.quote(from, to, amount, now).await?;

        if let Some(prior) = prior {
            let age = now - prior.quoted_at;
            if age > self.config.quote_ttl_secs && !prior.rate.is_zero() {
                let drift = ((fresh.rate - prior.rate) / prior.rate).abs();
                let tolerance = Decimal::from(self.config.slippage_tolerance_basis_points)
                    / Decimal::from(10_000u32);
                if drift > tolerance {
                    return Err(LedgerError::QuoteExpired(format!(
                        "quote is {}s old and rate moved {} (tolerance {})",
                        age, drift, tolerance
                    )));
                }
            }
        }

        let ops = [
            LedgerOp::new(from, BalanceBucket::Available, -amount, EntryKind::ExchangeOut),
            LedgerOp::new(
                to,
                BalanceBucket::Available,
                fresh.output_amount,
                EntryKind::ExchangeIn,
            ),
        ];
        self.ledger.apply_batch(account_id, &ops, tx_id)?;
        debug!(
            account = account_id,
            %from,
            %to,
            %amount,
            output = %fresh.output_amount,
            "exchange executed"
        );
        Ok(fresh)
    }

    pub fn supported_currencies(&self) -> Vec<Currency> {
        Currency::ALL.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BalanceBucket;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn setup(funds: &str) -> (ExchangeEngine, Arc<Ledger>, Arc<FixedRateProvider>) {
        let ledger = Arc::new(Ledger::new());
        ledger
            .apply_delta(
                "alice",
                Currency::Btn,
                BalanceBucket::Available,
                dec(funds),
                EntryKind::Receive,
                "seed",
            )
            .unwrap();
        let rates = Arc::new(FixedRateProvider::new());
        let engine = ExchangeEngine::new(ExchangeConfig::default(), rates.clone(), ledger.clone());
        (engine, ledger, rates)
    }

    #[tokio::test]
    async fn test_quote_math() {
        let (engine, _, _) = setup("1000");
        // 100 BTN -> USDT at 15 USD/BTN: fee 10 bps = 0.1 BTN
        let q = engine
            .quote(Currency::Btn, Currency::Usdt, dec("100"), 0)
            .await
            .unwrap();
        assert_eq!(q.rate, dec("15"));
        assert_eq!(q.fee, dec("0.1"));
        assert_eq!(q.output_amount, dec("1498.5"));
    }

    #[tokio::test]
    async fn test_same_pair_rejected() {
        let (engine, _, _) = setup("1000");
        let err = engine
            .quote(Currency::Btn, Currency::Btn, dec("1"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnsupportedPair(_)));
    }

    #[tokio::test]
    async fn test_execute_debits_and_credits_atomically() {
        let (engine, ledger, _) = setup("1000");
        engine
            .execute("alice", Currency::Btn, Currency::Usdt, dec("100"), None, "tx1", 0)
            .await
            .unwrap();
        assert_eq!(ledger.get_balance("alice", Currency::Btn).available, dec("900"));
        assert_eq!(
            ledger.get_balance("alice", Currency::Usdt).available,
            dec("1498.5")
        );
        ledger.verify_books().unwrap();
    }

    #[tokio::test]
    async fn test_execute_insufficient_funds_leaves_ledger_untouched() {
        let (engine, ledger, _) = setup("50");
        let err = engine
            .execute("alice", Currency::Btn, Currency::Usdt, dec("100"), None, "tx1", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds(_)));
        assert_eq!(ledger.get_balance("alice", Currency::Btn).available, dec("50"));
        assert_eq!(
            ledger.get_balance("alice", Currency::Usdt).available,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_stale_quote_with_drift_expires() {
        let (engine, _, rates) = setup("1000");
        let now = 100;
        let prior = engine
            .quote(Currency::Btn, Currency::Usdt, dec("100"), now)
            .await
            .unwrap();

        // Price moves well beyond the 50 bps tolerance
        rates.set_base_usd(Currency::Btn, dec("20"));

        let err = engine
            .execute(
                "alice",
                Currency::Btn,
                Currency::Usdt,
                dec("100"),
                Some(&prior),
                "tx1",
                now + 30,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::QuoteExpired(_)));
    }

    #[tokio::test]
    async fn test_fresh_quote_executes_despite_drift() {
        let (engine, ledger, rates) = setup("1000");
        let now = 100;
        let prior = engine
            .quote(Currency::Btn, Currency::Usdt, dec("100"), now)
            .await
            .unwrap();
        rates.set_base_usd(Currency::Btn, dec("20"));

        // Quote still within TTL: re-quoted and executed at the new rate
        let q = engine
            .execute(
                "alice",
                Currency::Btn,
                Currency::Usdt,
                dec("100"),
                Some(&prior),
                "tx1",
                now + 5,
            )
            .await
            .unwrap();
        assert_eq!(q.rate, dec("20"));
        assert_eq!(
            ledger.get_balance("alice", Currency::Usdt).available,
            dec("1998.0")
        );
    }
}
