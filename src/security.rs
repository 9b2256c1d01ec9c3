//! Security policy gating every mutating operation
//!
//! Decision logic: deny flagged accounts, require enrolled-but-absent
//! strong factors, and apply the rolling-amount fraud heuristic. The
//! only side effect is the per-account rolling transfer statistics,
//! updated under the stats lock (single writer per account).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::history::TransactionKind;
use crate::registry::auth;
use crate::registry::types::{Account, AccountId, AuthFactorKind};

/// Trailing window for the per-account average transfer size.
const RISK_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;
/// Transfers above this multiple of the trailing average trip the heuristic.
const RISK_MULTIPLIER: u32 = 3;
/// Minimum observations before the heuristic has a usable baseline.
const RISK_MIN_SAMPLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Require2Fa,
    RequireBiometric,
    Deny(String),
}

/// What the caller presented alongside the request.
#[derive(Debug, Default, Clone)]
pub struct AuthContext {
    pub two_factor_code: Option<String>,
    pub biometric_presented: bool,
}

#[derive(Debug, Default)]
struct RiskStats {
    /// (timestamp, amount) of recent transfers, oldest first.
    transfers: VecDeque<(i64, Decimal)>,
    flagged: bool,
}

impl RiskStats {
    fn prune(&mut self, now: i64) {
        while let Some((ts, _)) = self.transfers.front() {
            if now - ts > RISK_WINDOW_SECS {
                self.transfers.pop_front();
            } else {
                break;
            }
        }
    }

    fn trailing_average(&self) -> Option<Decimal> {
        if self.transfers.len() < RISK_MIN_SAMPLES {
            return None;
        }
        let sum: Decimal = self.transfers.iter().map(|(_, amt)| *amt).sum();
        Some(sum / Decimal::from(self.transfers.len() as u64))
    }
}

pub struct SecurityPolicy {
    stats: Mutex<HashMap<AccountId, RiskStats>>,
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the risk baseline for a freshly created account.
    pub fn init_baseline(&self, account_id: &str) {
        let mut stats = lock(&self.stats);
        stats.entry(account_id.to_string()).or_default();
    }

    pub fn flag_fraud(&self, account_id: &str) {
        let mut stats = lock(&self.stats);
        stats.entry(account_id.to_string()).or_default().flagged = true;
        warn!(account = account_id, "account flagged for fraud");
    }

    pub fn is_flagged(&self, account_id: &str) -> bool {
        let stats = lock(&self.stats);
        stats.get(account_id).map(|s| s.flagged).unwrap_or(false)
    }

    /// Evaluate whether `account` may perform `kind` for `amount`.
    /// Idempotent apart from the rolling statistics update on Allow.
    pub fn authorize(
        &self,
        account: &Account,
        kind: TransactionKind,
        amount: Decimal,
        ctx: &AuthContext,
        now: i64,
    ) -> Decision {
        let mut stats = lock(&self.stats);
        let entry = stats.entry(account.id.clone()).or_default();
        if entry.flagged {
            return Decision::Deny("account is flagged for fraud".to_string());
        }

        // Enrolled factors must be presented with the request.
        if account.factor_active(AuthFactorKind::TwoFactor) {
            match &ctx.two_factor_code {
                None => return Decision::Require2Fa,
                Some(code) => {
                    let valid = account
                        .factor(AuthFactorKind::TwoFactor)
                        .and_then(|f| f.totp_secret.as_deref())
                        .map(|s| auth::verify_code(s, code, now))
                        .unwrap_or(false);
                    if !valid {
                        // A wrong code is an active failure, not an absent factor
                        return Decision::Deny("invalid two-factor code".to_string());
                    }
                }
            }
        }
        if account.factor_active(AuthFactorKind::Biometric) && !ctx.biometric_presented {
            return Decision::RequireBiometric;
        }

        if kind == TransactionKind::CrossChain && !account.strong_factor_active() {
            return Decision::Deny(
                "cross-chain transfers require an enrolled strong auth factor".to_string(),
            );
        }

        let is_transfer = matches!(kind, TransactionKind::Send | TransactionKind::CrossChain);
        if is_transfer {
            entry.prune(now);
            if let Some(avg) = entry.trailing_average() {
                let threshold = avg * Decimal::from(RISK_MULTIPLIER);
                if amount > threshold && !account.strong_factor_active() {
                    debug!(
                        account = %account.id,
                        %amount,
                        %threshold,
                        "transfer exceeds rolling risk threshold"
                    );
                    return Decision::Deny(format!(
                        "amount {} exceeds the rolling risk threshold {}",
                        amount, threshold
                    ));
                }
            }
            entry.transfers.push_back((now, amount));
        }

        Decision::Allow
    }
}

impl Default for SecurityPolicy {
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
    use crate::registry::{AccountRegistry, CreateAccountSpec};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn plain_account() -> Account {
        let mut reg = AccountRegistry::new();
        reg.create_account(CreateAccountSpec::default()).unwrap().account
    }

    #[test]
    fn test_allow_by_default() {
        let policy = SecurityPolicy::new();
        let account = plain_account();
        let now = chrono::Utc::now().timestamp();
        let d = policy.authorize(
            &account,
            TransactionKind::Send,
            dec("10"),
            &AuthContext::default(),
            now,
        );
        assert_eq!(d, Decision::Allow);
    }

    #[test]
    fn test_flagged_account_denied() {
        let policy = SecurityPolicy::new();
        let account = plain_account();
        policy.flag_fraud(&account.id);
        let d = policy.authorize(
            &account,
            TransactionKind::Send,
            dec("1"),
            &AuthContext::default(),
            0,
        );
        assert!(matches!(d, Decision::Deny(_)));
    }

    #[test]
    fn test_cross_chain_needs_strong_factor() {
        let policy = SecurityPolicy::new();
        let account = plain_account();
        let d = policy.authorize(
            &account,
            TransactionKind::CrossChain,
            dec("1"),
            &AuthContext::default(),
            0,
        );
        assert!(matches!(d, Decision::Deny(_)));
    }

    #[test]
    fn test_enrolled_two_factor_required_and_verified() {
        let mut reg = AccountRegistry::new();
        let created = reg
            .create_account(CreateAccountSpec {
                enable_two_factor: true,
                ..Default::default()
            })
            .unwrap();
        let secret = created.two_factor_secret.unwrap();
        let now = chrono::Utc::now().timestamp();
        let code = crate::registry::auth::current_code(&secret, now).unwrap();
        reg.verify_enrollment(&created.account.id, AuthFactorKind::TwoFactor, &code, now)
            .unwrap();
        let account = reg.lookup(&created.account.id).unwrap().clone();

        let policy = SecurityPolicy::new();
        // Absent code: factor must be presented
        let d = policy.authorize(
            &account,
            TransactionKind::Send,
            dec("1"),
            &AuthContext::default(),
            now,
        );
        assert_eq!(d, Decision::Require2Fa);

        // Wrong code: denied outright
        let d = policy.authorize(
            &account,
            TransactionKind::Send,
            dec("1"),
            &AuthContext {
                two_factor_code: Some("000000x".to_string()),
                biometric_presented: false,
            },
            now,
        );
        assert!(matches!(d, Decision::Deny(_)));

        // Fresh valid code: allowed
        let code = crate::registry::auth::current_code(&secret, now).unwrap();
        let d = policy.authorize(
            &account,
            TransactionKind::Send,
            dec("1"),
            &AuthContext {
                two_factor_code: Some(code),
                biometric_presented: false,
            },
            now,
        );
        assert_eq!(d, Decision::Allow);
    }

    #[test]
    fn test_rolling_threshold_denies_outliers() {
        let policy = SecurityPolicy::new();
        let account = plain_account();
        let now = chrono::Utc::now().timestamp();
        let ctx = AuthContext::default();

        for i in 0..3 {
            let d = policy.authorize(&account, TransactionKind::Send, dec("10"), &ctx, now + i);
            assert_eq!(d, Decision::Allow);
        }
        // Average is 10; 3x threshold is 30, so 31 trips the heuristic
        let d = policy.authorize(&account, TransactionKind::Send, dec("31"), &ctx, now + 10);
        assert!(matches!(d, Decision::Deny(_)));
        // At the threshold is still fine
        let d = policy.authorize(&account, TransactionKind::Send, dec("30"), &ctx, now + 11);
        assert_eq!(d, Decision::Allow);
    }
}
