//! Request identity.
//!
//! Authentication happens upstream: a proxy in front of this service authenticates the user and
//! forwards a stable account id in a trusted header (`auth.proxy_header.header_name`, default
//! `x-restyle-account`). Handlers take [`current_account::CurrentAccount`] to require it, or
//! [`current_account::AdminAccount`] to additionally require membership in
//! `auth.admin_accounts`.
//!
//! The worker entry point does not use these extractors; it is authenticated by the delivery
//! signature instead (see [`crate::channel::signing`]).

pub mod current_account;

pub use current_account::{AdminAccount, CurrentAccount};
