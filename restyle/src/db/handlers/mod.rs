//! Repository implementations, one per table, each borrowing a connection for its lifetime.

pub mod accounts;
pub mod jobs;
pub mod ledger;

pub use accounts::Accounts;
pub use jobs::Jobs;
pub use ledger::Ledger;
