use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub staking: StakingConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    pub rpc_port: u16,
    pub db_path: String,
    pub log_level: String,
    #[serde(default)]
    pub rate_feed_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StakingConfig {
    /// Minimum stake per position, in currency units.
    pub min_stake: Decimal,
    pub lock_period_secs: i64,
    pub default_apy_basis_points: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExchangeConfig {
    pub fee_basis_points: u32,
    pub quote_ttl_secs: i64,
    pub slippage_tolerance_basis_points: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    pub confirm_window_secs: u64,
    pub initial_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub fee_basis_points: u32,
    /// Flat network fee added on top of the percentage fee.
    pub network_fee: Decimal,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            min_stake: Decimal::new(10, 0),
            lock_period_secs: 30 * 24 * 60 * 60,
            default_apy_basis_points: 500,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            fee_basis_points: 10,
            quote_ttl_secs: 10,
            slippage_tolerance_basis_points: 50,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            confirm_window_secs: 3600,
            initial_poll_interval_ms: 2000,
            max_poll_interval_ms: 60_000,
            fee_basis_points: 100,
            network_fee: Decimal::new(1, 3), // 0.001
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                rpc_port: 9100,
                db_path: "./data/ledger".to_string(),
                log_level: "info".to_string(),
                rate_feed_url: None,
            },
            staking: StakingConfig::default(),
            exchange: ExchangeConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl LedgerConfig {
    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        println!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        eprintln!("Config parse error in {}: {}. Using defaults.", path, e);
                        Self::default()
                    }
                },
                Err(e) => {
                    eprintln!("Could not read {}: {}. Using defaults.", path, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LedgerConfig::default();
        assert_eq!(cfg.staking.lock_period_secs, 2_592_000);
        assert_eq!(cfg.exchange.fee_basis_points, 10);
        assert_eq!(cfg.bridge.confirm_window_secs, 3600);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [node]
            rpc_port = 9200
            db_path = "/tmp/ledger"
            log_level = "debug"

            [staking]
            min_stake = "25"
            lock_period_secs = 60
            default_apy_basis_points = 700
        "#;
        let cfg: LedgerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.node.rpc_port, 9200);
        assert_eq!(cfg.staking.min_stake, Decimal::new(25, 0));
        // Sections not present fall back to defaults
        assert_eq!(cfg.exchange.quote_ttl_secs, 10);
    }
}
