//! API request and response data models.

pub mod accounts;
pub mod jobs;
pub mod pagination;
pub mod worker;
