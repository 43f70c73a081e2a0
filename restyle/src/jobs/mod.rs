//! Job lifecycle services.
//!
//! - [`dispatcher::Dispatcher`]: client-facing submission (charge, then enqueue)
//! - [`reconciler::WorkerReconciler`]: channel-facing execution (run once, refund on failure)
//! - [`prompt`]: presets and request composition shared by both

pub mod dispatcher;
pub mod prompt;
pub mod reconciler;

pub use dispatcher::{Dispatcher, JobSubmission, SubmitError};
pub use reconciler::{ReconcileError, RunOutcome, WorkerReconciler};
