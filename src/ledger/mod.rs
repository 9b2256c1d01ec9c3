pub mod store;
pub mod types;

pub use store::{AccountBook, Ledger};
pub use types::{Balance, BalanceBucket, EntryKind, JournalEntry, LedgerOp};
