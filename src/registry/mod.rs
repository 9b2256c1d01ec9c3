pub mod address;
pub mod auth;
pub mod store;
pub mod types;

pub use store::{AccountRegistry, CreateAccountSpec, CreatedAccount, RegistryEvent};
pub use types::{Account, AccountId, AuthFactorKind, ChainFamily, Currency, FactorStatus};
