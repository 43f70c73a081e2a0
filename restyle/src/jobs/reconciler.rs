//! The worker side of a job: run it once, whatever the channel delivers.
//!
//! ```text
//! run(job_id)
//!   ├─ load ── missing ──▶ NotFound
//!   ├─ status != queued ──▶ AlreadyHandled
//!   ├─ CAS queued → running ── lost ──▶ AlreadyHandled
//!   ├─ provider.generate → keep last N → persist each → insert outputs
//!   │     └─ any error ──▶ CAS running → failed, refund ──▶ Failed
//!   └─ CAS running → succeeded ──▶ Succeeded
//! ```
//!
//! Datastore errors before the failure is recorded propagate as [`ReconcileError`] so the
//! channel redelivers. Once a failure is recorded the outcome is final and acknowledged.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::prompt;
use crate::{
    assets::{AssetError, AssetPath, AssetStore},
    db::{
        errors::DbError,
        models::jobs::{JobDBResponse, JobOutputCreateDBRequest, JobStatus, JobTransition},
    },
    metering::{CreditMeter, RefundOutcome},
    providers::{ImageProvider, ProviderError},
    store::{JobStore, SharedStore},
    types::{JobId, abbrev_uuid},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NotFound,
    /// The job was not `queued` (or another delivery claimed it first); nothing was done
    AlreadyHandled { status: JobStatus },
    Succeeded { outputs: usize },
    /// The failure is recorded on the job. `refund` is `None` when the refund itself faulted;
    /// that is logged and counted, not retried.
    Failed { error: String, refund: Option<RefundOutcome> },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Database(#[from] DbError),
}

/// Anything that fails a running job. The display text is what lands in `jobs.error`.
#[derive(Debug, Error)]
enum ExecutionError {
    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("no_outputs")]
    NoOutputs,

    #[error("asset_persist_failed: {0}")]
    Asset(#[from] AssetError),

    #[error("db_insert_outputs_failed")]
    InsertOutputs(#[source] DbError),
}

impl ExecutionError {
    fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Provider(_) => "provider",
            ExecutionError::NoOutputs => "no_outputs",
            ExecutionError::Asset(_) => "assets",
            ExecutionError::InsertOutputs(_) => "insert_outputs",
        }
    }
}

#[derive(Clone)]
pub struct WorkerReconciler {
    store: SharedStore,
    meter: CreditMeter,
    provider: Arc<dyn ImageProvider>,
    assets: Arc<dyn AssetStore>,
}

impl WorkerReconciler {
    pub fn new(store: SharedStore, meter: CreditMeter, provider: Arc<dyn ImageProvider>, assets: Arc<dyn AssetStore>) -> Self {
        Self {
            store,
            meter,
            provider,
            assets,
        }
    }

    #[instrument(skip(self), fields(job_id = %abbrev_uuid(&job_id)), err)]
    pub async fn run(&self, job_id: JobId) -> Result<RunOutcome, ReconcileError> {
        let Some(job) = self.store.get_job(job_id).await? else {
            warn!("Worker invoked for unknown job");
            counter!("restyle_worker_runs_total", "outcome" => "not_found").increment(1);
            return Ok(RunOutcome::NotFound);
        };

        if job.status != JobStatus::Queued {
            info!(status = %job.status, "Job already handled, acknowledging");
            counter!("restyle_worker_runs_total", "outcome" => "already_handled").increment(1);
            return Ok(RunOutcome::AlreadyHandled { status: job.status });
        }

        if !self.store.transition(job_id, JobStatus::Queued, &JobTransition::start()).await? {
            let status = self.current_status(job_id).await?;
            info!(%status, "Another delivery claimed the job");
            counter!("restyle_worker_runs_total", "outcome" => "already_handled").increment(1);
            return Ok(RunOutcome::AlreadyHandled { status });
        }

        let started = Instant::now();
        let result = self.execute(&job).await;
        histogram!("restyle_generation_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(outputs) => {
                if !self.store.transition(job_id, JobStatus::Running, &JobTransition::succeed()).await? {
                    warn!("Job left running before success was recorded");
                }
                counter!("restyle_worker_runs_total", "outcome" => "succeeded").increment(1);
                info!(outputs, "Job succeeded");
                Ok(RunOutcome::Succeeded { outputs })
            }
            Err(e) => self.fail(&job, e).await,
        }
    }

    /// Generate, keep the last `images_per_job`, persist and record the outputs
    async fn execute(&self, job: &JobDBResponse) -> Result<usize, ExecutionError> {
        let request = prompt::generation_request(job);
        let mut urls = self.provider.generate(&request).await?;
        if urls.is_empty() {
            return Err(ExecutionError::NoOutputs);
        }

        // The provider may prepend auxiliary images (e.g. the edge map)
        let expected = self.meter.pricing().images_per_job.max(1) as usize;
        let urls = urls.split_off(urls.len().saturating_sub(expected));

        let persisted = try_join_all(urls.iter().enumerate().map(|(index, url)| {
            let path = AssetPath {
                account_id: job.account_id.clone(),
                job_id: job.id,
                index,
            };
            async move { self.assets.persist(url, &path).await }
        }))
        .await?;

        let rows: Vec<_> = persisted
            .into_iter()
            .enumerate()
            .map(|(index, image_url)| JobOutputCreateDBRequest {
                index: index as i32,
                image_url,
            })
            .collect();

        let inserted = self.store.insert_outputs(job.id, &rows).await.map_err(ExecutionError::InsertOutputs)?;
        Ok(inserted.len())
    }

    async fn fail(&self, job: &JobDBResponse, e: ExecutionError) -> Result<RunOutcome, ReconcileError> {
        let message = e.to_string();
        warn!(error = %message, kind = e.kind(), "Job execution failed");

        if !self.store.transition(job.id, JobStatus::Running, &JobTransition::fail(message.clone())).await? {
            let status = self.current_status(job.id).await?;
            warn!(%status, "Job left running before failure was recorded");
            return Ok(RunOutcome::AlreadyHandled { status });
        }
        counter!("restyle_worker_runs_total", "outcome" => "failed", "kind" => e.kind()).increment(1);

        let cost = self.meter.pricing().cost_per_job();
        let refund = match self.meter.refund_if_charged(&job.account_id, job.id, cost).await {
            Ok(outcome) => Some(outcome),
            Err(refund_err) => {
                counter!("restyle_ledger_faults_total", "phase" => "worker_refund").increment(1);
                error!(error = %refund_err, "Refund failed for failed job; needs manual reconciliation");
                None
            }
        };

        Ok(RunOutcome::Failed { error: message, refund })
    }

    async fn current_status(&self, job_id: JobId) -> Result<JobStatus, ReconcileError> {
        Ok(self.store.get_job(job_id).await?.ok_or(DbError::NotFound)?.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::models::{
            jobs::{Intensity, JobCreateDBRequest},
            ledger::LedgerReason,
        },
        metering::{ChargeMode, Pricing},
        store::{AccountStore, LedgerStore, MemoryStore},
        test_utils::{RecordingAssetStore, ScriptedProvider},
    };

    const PRICING: Pricing = Pricing {
        free_quota: 5,
        images_per_job: 4,
        unit_price: 1,
    };

    struct Harness {
        store: Arc<MemoryStore>,
        meter: CreditMeter,
        provider: Arc<ScriptedProvider>,
        assets: Arc<RecordingAssetStore>,
        reconciler: WorkerReconciler,
    }

    fn harness(provider: ScriptedProvider, assets: RecordingAssetStore) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let meter = CreditMeter::new(store.clone(), PRICING);
        let provider = Arc::new(provider);
        let assets = Arc::new(assets);
        let reconciler = WorkerReconciler::new(store.clone(), meter.clone(), provider.clone(), assets.clone());
        Harness {
            store,
            meter,
            provider,
            assets,
            reconciler,
        }
    }

    /// A queued job charged the way the dispatcher would
    async fn charged_job(h: &Harness, account: &str, mode: ChargeMode) -> JobId {
        h.store.upsert_account(account).await.unwrap();
        if mode == ChargeMode::Paid {
            h.store.adjust_credits(account, 4).await.unwrap();
        }
        let id = JobId::new_v4();
        h.store
            .create_job(&JobCreateDBRequest {
                id,
                account_id: account.to_string(),
                input_image_url: "https://img.example.com/room.jpg".to_string(),
                room_type: "Bedroom".to_string(),
                style: "Japandi".to_string(),
                intensity: Intensity::Low,
                model: "acme/model:v1".to_string(),
                params: serde_json::json!({ "num_samples": "4" }),
            })
            .await
            .unwrap();
        h.meter.charge(account, id, 4, mode).await.unwrap();
        id
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://provider/out-{i}.png")).collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_success_persists_outputs_in_order() {
        let h = harness(ScriptedProvider::succeeding(urls(4)), RecordingAssetStore::default());
        let job_id = charged_job(&h, "acct", ChargeMode::Free).await;

        assert_eq!(h.reconciler.run(job_id).await.unwrap(), RunOutcome::Succeeded { outputs: 4 });

        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.started_at.is_some() && job.finished_at.is_some());
        let indexes: Vec<_> = job.outputs.iter().map(|o| o.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(job.outputs[2].image_url, RecordingAssetStore::url_for("acct", job_id, 2));

        // Prompt was assembled from the stored job
        let request = h.provider.last_request().unwrap();
        assert!(request.prompt.starts_with("Bedroom interior restyling, Japandi style"));
        assert_eq!(request.image_url, "https://img.example.com/room.jpg");

        // The charge stays spent
        assert_eq!(h.store.get_account("acct").await.unwrap().unwrap().free_used, 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_keeps_last_n_outputs() {
        let h = harness(ScriptedProvider::succeeding(urls(6)), RecordingAssetStore::default());
        let job_id = charged_job(&h, "acct", ChargeMode::Free).await;

        assert_eq!(h.reconciler.run(job_id).await.unwrap(), RunOutcome::Succeeded { outputs: 4 });

        let sources = h.assets.sources();
        assert_eq!(sources.len(), 4);
        for i in 2..6 {
            assert!(sources.contains(&(format!("https://provider/out-{i}.png"), i - 2)));
        }
        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.outputs.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test_log::test(tokio::test)]
    async fn test_repeated_delivery_runs_once() {
        let h = harness(ScriptedProvider::succeeding(urls(4)), RecordingAssetStore::default());
        let job_id = charged_job(&h, "acct", ChargeMode::Free).await;

        let (first, second) = tokio::join!(h.reconciler.run(job_id), h.reconciler.run(job_id));
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, RunOutcome::Succeeded { .. })).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| matches!(o, RunOutcome::AlreadyHandled { .. })).count(), 1);

        // A later redelivery is acknowledged without work
        assert_eq!(
            h.reconciler.run(job_id).await.unwrap(),
            RunOutcome::AlreadyHandled {
                status: JobStatus::Succeeded
            }
        );

        assert_eq!(h.provider.calls(), 1);
        assert_eq!(h.store.get_job(job_id).await.unwrap().unwrap().outputs.len(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_provider_failure_refunds_free_quota() {
        let h = harness(ScriptedProvider::failing("quota exceeded"), RecordingAssetStore::default());
        let job_id = charged_job(&h, "acct", ChargeMode::Free).await;
        assert_eq!(h.store.get_account("acct").await.unwrap().unwrap().free_used, 4);

        let outcome = h.reconciler.run(job_id).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                error: "quota exceeded".to_string(),
                refund: Some(RefundOutcome::Refunded {
                    reason: LedgerReason::FreeQuotaRefundFailed,
                    amount: 4
                }),
            }
        );

        let job = h.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("quota exceeded"));
        assert!(job.outputs.is_empty());
        assert_eq!(h.store.get_account("acct").await.unwrap().unwrap().free_used, 0);

        let reasons: Vec<_> = h.store.list_entries("acct", 0, 10).await.unwrap().into_iter().map(|e| e.reason).collect();
        assert_eq!(reasons, vec![LedgerReason::FreeQuotaRefundFailed, LedgerReason::FreeQuotaUsed]);

        // Redelivery after the failure changes nothing
        assert_eq!(
            h.reconciler.run(job_id).await.unwrap(),
            RunOutcome::AlreadyHandled { status: JobStatus::Failed }
        );
        assert_eq!(h.store.list_entries("acct", 0, 10).await.unwrap().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_output_fails_and_refunds_credits() {
        let h = harness(ScriptedProvider::succeeding(vec![]), RecordingAssetStore::default());
        let job_id = charged_job(&h, "acct", ChargeMode::Paid).await;
        assert_eq!(h.store.get_account("acct").await.unwrap().unwrap().credits, 0);

        let RunOutcome::Failed { error, refund } = h.reconciler.run(job_id).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(error, "no_outputs");
        assert!(refund.unwrap().is_refunded());
        assert_eq!(h.store.get_account("acct").await.unwrap().unwrap().credits, 4);
        assert_eq!(h.assets.sources().len(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_asset_failure_fails_job() {
        let h = harness(ScriptedProvider::succeeding(urls(4)), RecordingAssetStore::failing());
        let job_id = charged_job(&h, "acct", ChargeMode::Free).await;

        let RunOutcome::Failed { error, refund } = h.reconciler.run(job_id).await.unwrap() else {
            panic!("expected failure");
        };
        assert!(error.starts_with("asset_persist_failed"));
        assert!(refund.unwrap().is_refunded());
        assert!(h.store.get_job(job_id).await.unwrap().unwrap().outputs.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_output_insert_failure_fails_job() {
        let h = harness(ScriptedProvider::succeeding(urls(4)), RecordingAssetStore::default());
        let job_id = charged_job(&h, "acct", ChargeMode::Free).await;
        // Occupy index 0 so the batch insert violates the (job, index) key
        h.store
            .insert_outputs(
                job_id,
                &[JobOutputCreateDBRequest {
                    index: 0,
                    image_url: "https://stale".to_string(),
                }],
            )
            .await
            .unwrap();

        let RunOutcome::Failed { error, .. } = h.reconciler.run(job_id).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(error, "db_insert_outputs_failed");
        assert_eq!(h.store.get_job(job_id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let h = harness(ScriptedProvider::succeeding(urls(4)), RecordingAssetStore::default());
        assert_eq!(h.reconciler.run(JobId::new_v4()).await.unwrap(), RunOutcome::NotFound);
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_uncharged_job_fails_without_refund() {
        let h = harness(ScriptedProvider::failing("boom"), RecordingAssetStore::default());
        h.store.upsert_account("acct").await.unwrap();
        let id = JobId::new_v4();
        h.store
            .create_job(&JobCreateDBRequest {
                id,
                account_id: "acct".to_string(),
                input_image_url: "https://img.example.com/room.jpg".to_string(),
                room_type: "Kitchen".to_string(),
                style: "Industrial".to_string(),
                intensity: Intensity::High,
                model: "acme/model".to_string(),
                params: serde_json::json!({}),
            })
            .await
            .unwrap();

        let RunOutcome::Failed { refund, .. } = h.reconciler.run(id).await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(refund, Some(RefundOutcome::NotCharged));
    }
}
