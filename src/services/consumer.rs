//! Pulls job messages off the queue and runs them under a concurrency limit.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::services::decoder::decode_job;
use crate::services::pipeline::{Disposition, PipelineOrchestrator};
use crate::services::queue::{Delivery, MessageQueue};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_in_flight: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// How long in-flight jobs may run after shutdown before they are aborted.
    pub shutdown_grace: Duration,
    /// Deliveries after which a message that keeps failing is dropped.
    pub max_delivery_attempts: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            poll_interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(30),
            max_delivery_attempts: 5,
        }
    }
}

/// How a delivery was settled with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
    /// Redelivery was wanted but the message ran out of attempts.
    Dropped,
}

impl Settlement {
    fn as_str(self) -> &'static str {
        match self {
            Settlement::Acked => "acked",
            Settlement::Nacked => "nacked",
            Settlement::Dropped => "dropped",
        }
    }
}

pub struct MessageConsumer {
    queue: Arc<dyn MessageQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    config: ConsumerConfig,
    permits: Arc<Semaphore>,
}

impl MessageConsumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
        config: ConsumerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            queue,
            orchestrator,
            config,
            permits,
        }
    }

    /// Consume until `shutdown` flips to true (or its sender is dropped), then
    /// drain in-flight jobs for up to the grace period.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_in_flight = self.config.max_in_flight,
            max_delivery_attempts = self.config.max_delivery_attempts,
            "Starting job consumer loop"
        );

        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self.queue.receive().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No jobs available, sleeping");
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to receive from queue, will retry");
                    if self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.handle(delivery).await
            });
        }

        info!(in_flight = tasks.len(), "Shutdown requested, draining in-flight jobs");

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Grace period expired, aborting in-flight jobs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("Job consumer stopped");
    }

    /// Process one delivery end to end and settle it with the queue.
    pub async fn handle(&self, delivery: Delivery) -> Settlement {
        debug!(
            message_id = %delivery.message_id,
            attempt = delivery.delivery_attempt(),
            "Received job message"
        );

        let disposition = match AssertUnwindSafe(self.dispatch(&delivery)).catch_unwind().await {
            Ok(disposition) => disposition,
            Err(_) => {
                error!(message_id = %delivery.message_id, "Job task panicked");
                Disposition::Redeliver
            }
        };

        let settlement = self.settle(&delivery, disposition).await;
        metrics::counter!("pixelpipe_messages_total", "outcome" => settlement.as_str())
            .increment(1);
        settlement
    }

    async fn dispatch(&self, delivery: &Delivery) -> Disposition {
        let decoded = match decode_job(delivery.data.as_bytes()) {
            Ok(decoded) => decoded,
            Err(rejection) => {
                warn!(
                    message_id = %delivery.message_id,
                    job_id = rejection.job_id().unwrap_or_default(),
                    error = %rejection,
                    "Rejecting invalid job message"
                );
                if let Err(e) = self.orchestrator.record_rejection(&rejection).await {
                    error!(
                        message_id = %delivery.message_id,
                        error = %e,
                        "Failed to record rejected job"
                    );
                }
                return Disposition::Ack;
            }
        };

        match self.orchestrator.process(&decoded).await {
            Ok(outcome) => outcome.disposition,
            Err(e) => {
                error!(
                    message_id = %delivery.message_id,
                    job_id = %decoded.job.job_id,
                    error = %e,
                    "Unexpected failure processing job"
                );
                Disposition::Redeliver
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, disposition: Disposition) -> Settlement {
        let exhausted = delivery.delivery_attempt() >= self.config.max_delivery_attempts;
        let settlement = match disposition {
            Disposition::Ack => Settlement::Acked,
            Disposition::Redeliver if exhausted => {
                error!(
                    message_id = %delivery.message_id,
                    attempts = delivery.delivery_attempt(),
                    "Message exhausted its delivery attempts, dropping"
                );
                Settlement::Dropped
            }
            Disposition::Redeliver => Settlement::Nacked,
        };

        let settled = match settlement {
            Settlement::Nacked => self.queue.nack(delivery).await,
            Settlement::Acked | Settlement::Dropped => self.queue.ack(delivery).await,
        };
        if let Err(e) = settled {
            // The message stays in the processing list and is recovered on restart.
            error!(message_id = %delivery.message_id, error = %e, "Failed to settle message");
        }

        settlement
    }

    /// Wait out the poll interval. Returns true if shutdown was requested meanwhile.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}

fn log_join(joined: Result<Settlement, tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(error = %e, "Job task failed");
        }
    }
}
