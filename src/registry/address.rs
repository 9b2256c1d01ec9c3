//! Per-chain-family address derivation
//!
//! Key custody lives in the external signer; the registry only derives
//! the public display addresses. Format per family: `btn` + 40 hex
//! chars of the hashed public key for the native chain, `Btu` prefix
//! for Bitcoin-style, `0x` for Ethereum-style.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::types::ChainFamily;
use crate::error::LedgerError;

/// Derive a fresh address for a chain family from a new keypair.
pub fn derive_address(family: ChainFamily) -> String {
    let key = SigningKey::generate(&mut OsRng);
    address_from_pubkey(family, &key.verifying_key().to_bytes())
}

fn address_from_pubkey(family: ChainFamily, pubkey: &[u8]) -> String {
    let digest = Sha256::digest(pubkey);
    let body = hex::encode(&digest[..20]);
    match family {
        ChainFamily::Bituncoin => format!("btn{}", body),
        ChainFamily::Bitcoin => format!("Btu{}", body),
        ChainFamily::Ethereum => format!("0x{}", body),
    }
}

/// Validate an address shape without consulting the registry.
pub fn validate_address(address: &str) -> Result<(), LedgerError> {
    let ok = (address.starts_with("btn") && address.len() == 43)
        || (address.starts_with("Btu") && address.len() == 43)
        || (address.starts_with("0x") && address.len() == 42);
    if ok {
        Ok(())
    } else {
        Err(LedgerError::InvalidRequest(format!(
            "invalid address format: {}",
            address
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_formats() {
        let native = derive_address(ChainFamily::Bituncoin);
        assert!(native.starts_with("btn"));
        assert_eq!(native.len(), 43);
        validate_address(&native).unwrap();

        let eth = derive_address(ChainFamily::Ethereum);
        assert!(eth.starts_with("0x"));
        assert_eq!(eth.len(), 42);
        validate_address(&eth).unwrap();
    }

    #[test]
    fn test_addresses_are_unique() {
        let a = derive_address(ChainFamily::Bitcoin);
        let b = derive_address(ChainFamily::Bitcoin);
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(validate_address("hello").is_err());
        assert!(validate_address("0xdeadbeef").is_err());
    }
}
