//! Shared pagination types for API query parameters.
//!
//! Job history uses a timestamp cursor (`before`), the ledger uses offset pagination
//! (`skip`/`limit`). Limits arrive as query strings, hence `DisplayFromStr`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

/// Default number of jobs per history page.
pub const DEFAULT_JOB_LIMIT: i64 = 20;

/// Maximum number of jobs per history page.
pub const MAX_JOB_LIMIT: i64 = 50;

/// Default number of ledger entries per page.
pub const DEFAULT_LIMIT: i64 = 50;

/// Maximum number of ledger entries per page.
pub const MAX_LIMIT: i64 = 200;

/// Cursor parameters for job history, newest first.
#[serde_as]
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct CursorPagination {
    /// Maximum number of jobs to return (default: 20, max: 50)
    #[param(default = 20, minimum = 1, maximum = 50)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub limit: Option<i64>,

    /// Only jobs created strictly before this RFC 3339 timestamp
    pub before: Option<DateTime<Utc>>,
}

impl CursorPagination {
    #[inline]
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT)
    }
}

/// Offset pagination for ledger listings.
#[serde_as]
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct Pagination {
    /// Number of items to skip (default: 0)
    #[param(default = 0, minimum = 0)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub skip: Option<i64>,

    /// Maximum number of items to return (default: 50, max: 200)
    #[param(default = 50, minimum = 1, maximum = 200)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub limit: Option<i64>,
}

impl Pagination {
    #[inline]
    pub fn skip(&self) -> i64 {
        self.skip.unwrap_or(0).max(0)
    }

    #[inline]
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}
