//! Database layer for data persistence and access.
//!
//! This module implements the data access layer using SQLx with PostgreSQL.
//! It follows the Repository pattern to provide clean abstractions over database operations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   Store     │  (crate::store - what the services see)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers - queries)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models - database records)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`handlers`]: Repository implementations
//! - [`models`]: Database record structures matching table schemas
//! - [`errors`]: Database-specific error types
//!
//! # Guarantees pushed down to PostgreSQL
//!
//! - Job status changes are conditional updates (`WHERE status = $from`), never read-then-write.
//! - `credit_ledger` carries partial unique indexes for one charge and one refund per job, and
//!   an append-only trigger.
//! - Balance updates carry their own guard (`credits + delta >= 0`).

pub mod errors;
pub mod handlers;
pub mod models;
