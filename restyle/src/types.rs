//! Common type definitions.
//!
//! - [`AccountId`]: stable identity handed to us by the authenticating proxy
//! - [`JobId`]: generation job identifier, also the correlation id pairing a charge with its
//!   refund in the ledger
//! - [`abbrev_uuid`]: abbreviate UUIDs to first 8 chars for logging

use uuid::Uuid;

// Type aliases for IDs
pub type AccountId = String;
pub type JobId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
