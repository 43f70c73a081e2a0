pub mod accounts;
pub mod jobs;
pub mod ledger;
