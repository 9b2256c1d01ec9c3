//! Account registry: identity, addresses, auth factor lifecycle

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::info;

use super::address::derive_address;
use super::auth;
use super::types::{
    Account, AccountId, AuthFactor, AuthFactorKind, ChainFamily, FactorStatus,
};
use crate::error::LedgerError;
use crate::storage::Storage;

/// Events emitted by the registry for downstream consumers
/// (SecurityPolicy seeds its risk baseline from AccountCreated).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    AccountCreated { account_id: AccountId },
}

/// Requested shape of a new account.
#[derive(Debug, Default, Clone)]
pub struct CreateAccountSpec {
    pub password: Option<String>,
    pub enable_two_factor: bool,
    pub enable_biometric: bool,
    pub biometric_template: Option<String>,
}

/// Creation result; the one-time-code secret is only surfaced here,
/// at creation time.
#[derive(Debug, Clone)]
pub struct CreatedAccount {
    pub account: Account,
    pub two_factor_secret: Option<String>,
}

pub struct AccountRegistry {
    accounts: HashMap<AccountId, Account>,
    by_address: HashMap<String, AccountId>,
    storage: Option<Arc<Storage>>,
    events: Option<mpsc::UnboundedSender<RegistryEvent>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            by_address: HashMap::new(),
            storage: None,
            events: None,
        }
    }

    pub fn with_storage(storage: Arc<Storage>) -> Self {
        let mut reg = Self::new();
        for account in storage.all_accounts() {
            for addr in account.addresses.values() {
                reg.by_address.insert(addr.clone(), account.id.clone());
            }
            reg.accounts.insert(account.id.clone(), account);
        }
        reg.storage = Some(storage);
        reg
    }

    pub fn set_event_sender(&mut self, tx: mpsc::UnboundedSender<RegistryEvent>) {
        self.events = Some(tx);
    }

    /// Create a new account with one address per chain family. Requested
    /// auth factors start as pending enrollment; the password-equivalent
    /// factor is active immediately since presenting it is its own proof.
    pub fn create_account(&mut self, spec: CreateAccountSpec) -> Result<CreatedAccount, LedgerError> {
        if spec.enable_biometric && spec.biometric_template.is_none() {
            return Err(LedgerError::InvalidEnrollment(
                "biometric enrollment requires a template".to_string(),
            ));
        }

        let id = generate_account_id();
        let now = chrono::Utc::now().timestamp();

        let mut addresses = HashMap::new();
        for family in [ChainFamily::Bituncoin, ChainFamily::Bitcoin, ChainFamily::Ethereum] {
            addresses.insert(family, derive_address(family));
        }

        let mut auth_factors = HashMap::new();
        if let Some(password) = &spec.password {
            auth_factors.insert(
                AuthFactorKind::Password,
                AuthFactor {
                    kind: AuthFactorKind::Password,
                    status: FactorStatus::Active,
                    secret_hash: Some(auth::hash_secret(password)?),
                    totp_secret: None,
                    requested_at: now,
                    enrolled_at: Some(now),
                },
            );
        }
        let mut two_factor_secret = None;
        if spec.enable_two_factor {
            let secret = auth::generate_factor_secret();
            auth_factors.insert(
                AuthFactorKind::TwoFactor,
                AuthFactor {
                    kind: AuthFactorKind::TwoFactor,
                    status: FactorStatus::PendingEnrollment,
                    secret_hash: None,
                    totp_secret: Some(secret.clone()),
                    requested_at: now,
                    enrolled_at: None,
                },
            );
            two_factor_secret = Some(secret);
        }
        if spec.enable_biometric {
            let template = spec.biometric_template.as_deref().unwrap_or_default();
            auth_factors.insert(
                AuthFactorKind::Biometric,
                AuthFactor {
                    kind: AuthFactorKind::Biometric,
                    status: FactorStatus::PendingEnrollment,
                    secret_hash: Some(auth::hash_secret(template)?),
                    totp_secret: None,
                    requested_at: now,
                    enrolled_at: None,
                },
            );
        }

        let account = Account {
            id: id.clone(),
            addresses,
            auth_factors,
            created_at: now,
        };

        for addr in account.addresses.values() {
            self.by_address.insert(addr.clone(), id.clone());
        }
        self.accounts.insert(id.clone(), account.clone());
        self.persist(&account)?;

        if let Some(tx) = &self.events {
            let _ = tx.send(RegistryEvent::AccountCreated { account_id: id });
        }
        info!(account = %account.id, "account created");

        Ok(CreatedAccount {
            account,
            two_factor_secret,
        })
    }

    /// Complete the verification step for a pending factor.
    pub fn verify_enrollment(
        &mut self,
        account_id: &str,
        kind: AuthFactorKind,
        proof: &str,
        now: i64,
    ) -> Result<(), LedgerError> {
        let account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", account_id)))?;
        let factor = account.auth_factors.get_mut(&kind).ok_or_else(|| {
            LedgerError::InvalidEnrollment(format!("factor {:?} was never requested", kind))
        })?;
        if factor.status != FactorStatus::PendingEnrollment {
            return Err(LedgerError::InvalidEnrollment(format!(
                "factor {:?} is not pending enrollment",
                kind
            )));
        }

        let verified = match kind {
            AuthFactorKind::TwoFactor => factor
                .totp_secret
                .as_deref()
                .map(|s| auth::verify_code(s, proof, now))
                .unwrap_or(false),
            AuthFactorKind::Biometric | AuthFactorKind::Password => factor
                .secret_hash
                .as_deref()
                .map(|h| auth::verify_secret(proof, h))
                .unwrap_or(false),
        };
        if !verified {
            return Err(LedgerError::InvalidEnrollment(
                "verification proof rejected".to_string(),
            ));
        }

        factor.status = FactorStatus::Active;
        factor.enrolled_at = Some(now);
        let account = account.clone();
        self.persist(&account)?;
        info!(account = %account_id, factor = ?kind, "auth factor enrolled");
        Ok(())
    }

    pub fn lookup(&self, account_id: &str) -> Result<&Account, LedgerError> {
        self.accounts
            .get(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {}", account_id)))
    }

    pub fn lookup_by_address(&self, address: &str) -> Result<&Account, LedgerError> {
        let id = self
            .by_address
            .get(address)
            .ok_or_else(|| LedgerError::NotFound(format!("address {}", address)))?;
        self.lookup(id)
    }

    pub fn all_accounts(&self) -> Vec<&Account> {
        self.accounts.values().collect()
    }

    fn persist(&self, account: &Account) -> Result<(), LedgerError> {
        if let Some(storage) = &self.storage {
            storage.save_account(account)?;
        }
        Ok(())
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_account_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_account_addresses() {
        let mut reg = AccountRegistry::new();
        let created = reg.create_account(CreateAccountSpec::default()).unwrap();
        assert_eq!(created.account.addresses.len(), 3);
        assert!(created.account.primary_address().starts_with("btn"));

        let found = reg
            .lookup_by_address(created.account.primary_address())
            .unwrap();
        assert_eq!(found.id, created.account.id);
    }

    #[test]
    fn test_biometric_requires_template() {
        let mut reg = AccountRegistry::new();
        let err = reg
            .create_account(CreateAccountSpec {
                enable_biometric: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidEnrollment(_)));
    }

    #[test]
    fn test_two_factor_enrollment_lifecycle() {
        let mut reg = AccountRegistry::new();
        let created = reg
            .create_account(CreateAccountSpec {
                enable_two_factor: true,
                ..Default::default()
            })
            .unwrap();
        let id = created.account.id.clone();
        let secret = created.two_factor_secret.unwrap();

        // Factor is pending until verified, so not yet active
        assert!(!created.account.factor_active(AuthFactorKind::TwoFactor));

        let now = chrono::Utc::now().timestamp();
        assert!(reg
            .verify_enrollment(&id, AuthFactorKind::TwoFactor, "999999a", now)
            .is_err());

        let code = auth::current_code(&secret, now).unwrap();
        reg.verify_enrollment(&id, AuthFactorKind::TwoFactor, &code, now)
            .unwrap();
        assert!(reg.lookup(&id).unwrap().factor_active(AuthFactorKind::TwoFactor));

        // Second verification attempt is rejected: no longer pending
        assert!(reg
            .verify_enrollment(&id, AuthFactorKind::TwoFactor, &code, now)
            .is_err());
    }

    #[test]
    fn test_lookup_unknown() {
        let reg = AccountRegistry::new();
        assert!(matches!(
            reg.lookup("missing"),
            Err(LedgerError::NotFound(_))
        ));
    }
}
