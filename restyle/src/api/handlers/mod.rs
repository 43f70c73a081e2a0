//! HTTP request handlers for all API endpoints.
//!
//! # Handler Modules
//!
//! - [`accounts`]: Balance, ledger history, reconciliation and admin credit grants
//! - [`jobs`]: Job submission, status and history
//! - [`presets`]: Room type, style and intensity presets
//! - [`worker`]: The signed worker entry point the execution channel calls
//!
//! # Authentication
//!
//! User-facing handlers take [`crate::auth::CurrentAccount`], which reads the account id set by
//! the authenticating proxy. The worker handler verifies the delivery signature instead.
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`] which converts to an HTTP status code and a JSON
//! error body.

pub mod accounts;
pub mod jobs;
pub mod presets;
pub mod worker;
