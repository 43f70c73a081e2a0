//! In-process execution channel: signed webhook delivery to our own worker endpoint.
//!
//! ```text
//! LocalChannel::enqueue(job_id)
//!   └─ send_tx.try_send(delivery) ─────────────────────────┐   (full/closed → ChannelError)
//!                                                           │
//!              ┌────────────────────────────────────────────┘
//!              ▼
//!         run_sender (spawned task):
//!              ├─ recv from send_rx
//!              ├─ acquire semaphore permit (caps concurrency)
//!              └─ spawn deliver():
//!                   for delay in retry_schedule:
//!                     ├─ sleep(delay)
//!                     ├─ sign with a fresh timestamp
//!                     └─ POST; 2xx → done, permanent 4xx → give up, else retry
//! ```
//!
//! Buffered or in-flight deliveries are dropped on shutdown; the affected jobs stay `queued`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use reqwest::StatusCode;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ChannelError, ExecutionChannel, RunJobMessage, signing};
use crate::{
    config::LocalChannelConfig,
    types::{JobId, abbrev_uuid},
};

/// A delivery waiting to be sent. The message id stays the same across retries.
#[derive(Debug)]
struct Delivery {
    job_id: JobId,
    msg_id: String,
    body: String,
}

#[derive(Debug, PartialEq, Eq)]
enum DeliveryOutcome {
    Delivered { attempts: usize },
    Rejected { status: u16 },
    Exhausted,
    Cancelled,
}

pub struct LocalChannel {
    send_tx: mpsc::Sender<Delivery>,
}

impl LocalChannel {
    /// Create the channel and spawn its background sender task.
    pub fn spawn(target: String, secret: String, config: &LocalChannelConfig, shutdown: CancellationToken) -> Result<Self, ChannelError> {
        if signing::decode_secret(&secret).is_none() {
            return Err(ChannelError::InvalidSecret);
        }

        let (send_tx, send_rx) = mpsc::channel::<Delivery>(config.channel_capacity);
        let http_client = reqwest::Client::builder().timeout(config.timeout).build()?;

        let sender = Sender {
            target,
            secret,
            http_client,
            retry_schedule: config.retry_schedule_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        };
        tokio::spawn(run_sender(send_rx, Arc::new(sender), config.max_concurrent_sends, shutdown));

        Ok(Self { send_tx })
    }
}

#[async_trait::async_trait]
impl ExecutionChannel for LocalChannel {
    async fn enqueue(&self, job_id: JobId) -> Result<(), ChannelError> {
        let delivery = Delivery {
            job_id,
            msg_id: format!("msg_{}", Uuid::new_v4().simple()),
            body: serde_json::to_string(&RunJobMessage { job_id })?,
        };

        self.send_tx.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

struct Sender {
    target: String,
    secret: String,
    http_client: reqwest::Client,
    retry_schedule: Vec<Duration>,
}

impl Sender {
    async fn deliver(&self, delivery: &Delivery, shutdown: &CancellationToken) -> DeliveryOutcome {
        for (attempt, delay) in self.retry_schedule.iter().enumerate() {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    _ = shutdown.cancelled() => return DeliveryOutcome::Cancelled,
                }
            }

            let timestamp = Utc::now().timestamp();
            let Some(signature) = signing::sign_payload(&delivery.msg_id, timestamp, delivery.body.as_bytes(), &self.secret) else {
                return DeliveryOutcome::Rejected { status: 0 };
            };

            let response = self
                .http_client
                .post(&self.target)
                .header("Content-Type", "application/json")
                .header(signing::HEADER_ID, &delivery.msg_id)
                .header(signing::HEADER_TIMESTAMP, timestamp.to_string())
                .header(signing::HEADER_SIGNATURE, signature)
                .header("webhook-version", "1")
                .body(delivery.body.clone())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    return DeliveryOutcome::Delivered { attempts: attempt + 1 };
                }
                Ok(response) if is_permanent(response.status()) => {
                    return DeliveryOutcome::Rejected {
                        status: response.status().as_u16(),
                    };
                }
                Ok(response) => {
                    tracing::warn!(
                        job_id = %abbrev_uuid(&delivery.job_id),
                        attempt = attempt + 1,
                        status = response.status().as_u16(),
                        "Worker delivery failed, will retry"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %abbrev_uuid(&delivery.job_id),
                        attempt = attempt + 1,
                        error = %e,
                        "Worker delivery failed, will retry"
                    );
                }
            }
        }
        DeliveryOutcome::Exhausted
    }
}

/// 4xx responses other than timeouts and rate limits will not change on retry
fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS
}

/// Long-lived task that receives deliveries and performs HTTP delivery with retries.
async fn run_sender(mut rx: mpsc::Receiver<Delivery>, sender: Arc<Sender>, max_concurrent_sends: usize, shutdown: CancellationToken) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent_sends));

    loop {
        let delivery = tokio::select! {
            d = rx.recv() => {
                match d {
                    Some(d) => d,
                    None => {
                        tracing::debug!("Worker delivery channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!("Worker delivery sender received shutdown signal");
                break;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!("Worker delivery semaphore closed");
                break;
            }
        };

        let sender = sender.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let job_id = abbrev_uuid(&delivery.job_id);

            match sender.deliver(&delivery, &shutdown).await {
                DeliveryOutcome::Delivered { attempts } => {
                    counter!("restyle_worker_deliveries_total", "outcome" => "delivered").increment(1);
                    tracing::debug!(job_id = %job_id, attempts, "Worker delivery acknowledged");
                }
                DeliveryOutcome::Rejected { status } => {
                    counter!("restyle_worker_deliveries_total", "outcome" => "rejected").increment(1);
                    tracing::error!(job_id = %job_id, status, "Worker rejected delivery, giving up");
                }
                DeliveryOutcome::Exhausted => {
                    counter!("restyle_worker_deliveries_total", "outcome" => "exhausted").increment(1);
                    tracing::error!(job_id = %job_id, "Worker delivery retries exhausted, job left queued");
                }
                DeliveryOutcome::Cancelled => {
                    tracing::debug!(job_id = %job_id, "Worker delivery cancelled by shutdown");
                }
            }
        });
    }

    tracing::debug!("Worker delivery sender task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "whsec_c2VjcmV0LWtleS1mb3ItdGVzdGluZw==";

    fn sender(target: String, schedule: &[u64]) -> Sender {
        Sender {
            target,
            secret: SECRET.to_string(),
            http_client: reqwest::Client::new(),
            retry_schedule: schedule.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    fn delivery() -> Delivery {
        let job_id = JobId::new_v4();
        Delivery {
            job_id,
            msg_id: "msg_test".to_string(),
            body: serde_json::to_string(&RunJobMessage { job_id }).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_delivery_is_signed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/worker/run-job"))
            .and(header_exists(signing::HEADER_SIGNATURE))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let sender = sender(format!("{}/internal/worker/run-job", mock_server.uri()), &[0]);
        let delivery = delivery();
        let outcome = sender.deliver(&delivery, &CancellationToken::new()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });

        let requests = mock_server.received_requests().await.unwrap();
        let request = &requests[0];
        assert_eq!(request.body, delivery.body.as_bytes());
        assert_eq!(
            signing::verify_delivery(&request.headers, &request.body, SECRET, Duration::from_secs(60)),
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let sender = sender(mock_server.uri(), &[0, 0, 0]);
        let outcome = sender.deliver(&delivery(), &CancellationToken::new()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });

        // same message id on every attempt
        let requests = mock_server.received_requests().await.unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.headers.get(signing::HEADER_ID).unwrap().clone()).collect();
        assert!(ids.iter().all(|id| id == "msg_test"));
    }

    #[tokio::test]
    async fn test_permanent_rejection_stops_retrying() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;

        let sender = sender(mock_server.uri(), &[0, 0, 0]);
        let outcome = sender.deliver(&delivery(), &CancellationToken::new()).await;
        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 401 });
    }

    #[tokio::test]
    async fn test_network_errors_exhaust_schedule() {
        let sender = sender("http://127.0.0.1:1".to_string(), &[0, 0]);
        let outcome = sender.deliver(&delivery(), &CancellationToken::new()).await;
        assert_eq!(outcome, DeliveryOutcome::Exhausted);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_retry() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let sender = sender("http://127.0.0.1:1".to_string(), &[60]);
        assert_eq!(sender.deliver(&delivery(), &shutdown).await, DeliveryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_enqueue_reports_full_and_closed() {
        let (send_tx, rx) = mpsc::channel(1);
        let channel = LocalChannel { send_tx };

        assert!(channel.enqueue(JobId::new_v4()).await.is_ok());
        assert!(matches!(channel.enqueue(JobId::new_v4()).await, Err(ChannelError::Full)));

        drop(rx);
        assert!(matches!(channel.enqueue(JobId::new_v4()).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let shutdown = CancellationToken::new();
        let channel = LocalChannel::spawn(mock_server.uri(), SECRET.to_string(), &LocalChannelConfig::default(), shutdown.clone()).unwrap();
        let job_id = JobId::new_v4();
        channel.enqueue(job_id).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..100 {
            received = mock_server.received_requests().await.unwrap();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let message: RunJobMessage = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(message.job_id, job_id);

        shutdown.cancel();
    }

    #[test]
    fn test_permanent_statuses() {
        assert!(is_permanent(StatusCode::NOT_FOUND));
        assert!(is_permanent(StatusCode::UNAUTHORIZED));
        assert!(!is_permanent(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_permanent(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let result = LocalChannel::spawn(
            "http://localhost".to_string(),
            "not-a-secret".to_string(),
            &LocalChannelConfig::default(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(ChannelError::InvalidSecret)));
    }
}
