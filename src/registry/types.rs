//! Account and currency type definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Account identifier - opaque hex string, globally unique
pub type AccountId = String;

/// Supported currencies. The set is closed; the wire format is the
/// uppercase ticker.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Btn,  // Bituncoin
    Btc,  // Bitcoin
    Eth,  // Ethereum
    Usdt, // Tether
    Bnb,  // Binance Coin
    Gld,  // Gold-Coin (legacy support)
}

/// Chain family an address format belongs to. One address is derived
/// per family, shared by every currency in it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Bituncoin,
    Bitcoin,
    Ethereum,
}

impl Currency {
    pub const ALL: [Currency; 6] = [
        Currency::Btn,
        Currency::Btc,
        Currency::Eth,
        Currency::Usdt,
        Currency::Bnb,
        Currency::Gld,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Btn => "BTN",
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Usdt => "USDT",
            Currency::Bnb => "BNB",
            Currency::Gld => "GLD",
        }
    }

    pub fn chain_family(&self) -> ChainFamily {
        match self {
            Currency::Btn | Currency::Gld => ChainFamily::Bituncoin,
            Currency::Btc => ChainFamily::Bitcoin,
            Currency::Eth | Currency::Usdt | Currency::Bnb => ChainFamily::Ethereum,
        }
    }

    /// Chain registry key for cross-chain routing.
    pub fn native_chain(&self) -> &'static str {
        match self {
            Currency::Btn => "bituncoin",
            Currency::Gld => "goldcoin",
            Currency::Btc => "bitcoin",
            Currency::Eth | Currency::Usdt => "ethereum",
            Currency::Bnb => "binance",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTN" => Ok(Currency::Btn),
            "BTC" => Ok(Currency::Btc),
            "ETH" => Ok(Currency::Eth),
            "USDT" => Ok(Currency::Usdt),
            "BNB" => Ok(Currency::Bnb),
            "GLD" => Ok(Currency::Gld),
            other => Err(format!("unknown currency: {}", other)),
        }
    }
}

/// Auth factor kinds an account can enroll
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthFactorKind {
    Password,
    TwoFactor,
    Biometric,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FactorStatus {
    PendingEnrollment,
    Active,
    Disabled,
}

/// One enrolled (or pending) auth factor.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuthFactor {
    pub kind: AuthFactorKind,
    pub status: FactorStatus,
    /// Argon2 hash for password / biometric-template factors.
    pub secret_hash: Option<String>,
    /// Shared secret for one-time codes (hex).
    pub totp_secret: Option<String>,
    pub requested_at: i64,
    pub enrolled_at: Option<i64>,
}

/// Main account structure. Owned exclusively by the registry; only the
/// registry mutates auth factors and addresses.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Account {
    pub id: AccountId,
    pub addresses: HashMap<ChainFamily, String>,
    pub auth_factors: HashMap<AuthFactorKind, AuthFactor>,
    pub created_at: i64,
}

impl Account {
    pub fn factor(&self, kind: AuthFactorKind) -> Option<&AuthFactor> {
        self.auth_factors.get(&kind)
    }

    pub fn factor_active(&self, kind: AuthFactorKind) -> bool {
        self.factor(kind)
            .map(|f| f.status == FactorStatus::Active)
            .unwrap_or(false)
    }

    /// True when at least one strong factor (2FA or biometric) is active.
    pub fn strong_factor_active(&self) -> bool {
        self.factor_active(AuthFactorKind::TwoFactor) || self.factor_active(AuthFactorKind::Biometric)
    }

    /// The native-chain address the client treats as the wallet address.
    pub fn primary_address(&self) -> &str {
        self.addresses
            .get(&ChainFamily::Bituncoin)
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn address_for(&self, currency: Currency) -> Option<&str> {
        self.addresses
            .get(&currency.chain_family())
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_roundtrip() {
        for c in Currency::ALL {
            assert_eq!(c.code().parse::<Currency>().unwrap(), c);
        }
        assert!("DOGE".parse::<Currency>().is_err());
    }

    #[test]
    fn test_chain_families() {
        assert_eq!(Currency::Btn.chain_family(), ChainFamily::Bituncoin);
        assert_eq!(Currency::Gld.chain_family(), ChainFamily::Bituncoin);
        assert_eq!(Currency::Usdt.chain_family(), ChainFamily::Ethereum);
    }
}
