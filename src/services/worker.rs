//! Queue workers: dequeue pipeline jobs and drive the orchestrator.
//!
//! The fast and slow pools are sized separately so HWP conversions cannot
//! starve PDF/DOCX throughput. A job that exceeds its queue timeout or
//! fails with a retryable error goes back through the queue's own retry
//! policy; exhausted jobs are written to the DLQ.

use std::sync::Arc;

use super::errors::ErrorCode;
use super::pipeline::{PipelineOrchestrator, PipelineRequest};
use super::queue_service::{JobType, PipelineJob, QueueService};
use super::storage_service::StorageService;
use crate::config::AnalysisMode;

pub struct WorkerPool {
    queue: Arc<QueueService>,
    storage: Arc<StorageService>,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<QueueService>,
        storage: Arc<StorageService>,
        orchestrator: Arc<PipelineOrchestrator>,
    ) -> Self {
        Self { queue, storage, orchestrator }
    }

    /// Spawn `fast_workers` + `slow_workers` long-running tasks.
    pub fn spawn(self: Arc<Self>, fast_workers: usize, slow_workers: usize) {
        for i in 0..fast_workers {
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                pool.worker_loop(JobType::FastPipeline, i).await;
            });
        }
        for i in 0..slow_workers {
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                pool.worker_loop(JobType::SlowPipeline, i).await;
            });
        }
        tracing::info!(
            "[worker] spawned {} fast and {} slow workers",
            fast_workers,
            slow_workers
        );
    }

    async fn worker_loop(&self, job_type: JobType, index: usize) {
        tracing::info!("[worker] {}-{} started", job_type.as_str(), index);
        loop {
            let job = match self.queue.dequeue(job_type).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("[worker] dequeue error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                },
            };

            tracing::info!(
                "[worker] {}-{} picked job {} (retry {})",
                job_type.as_str(),
                index,
                job.job_id,
                job.retry_count
            );
            self.process(job_type, job).await;
        }
    }

    pub async fn process(&self, job_type: JobType, job: PipelineJob) {
        let deadline = job_type.timeout();
        let result = tokio::time::timeout(deadline, self.execute(&job)).await;

        let (code, message) = match result {
            Ok(Ok(())) => return,
            Ok(Err((code, message))) => (code, message),
            Err(_) => (
                ErrorCode::Timeout,
                format!("job exceeded the {}s queue timeout", deadline.as_secs()),
            ),
        };

        if code.is_retryable() {
            match self.queue.requeue_with_backoff(job.clone()).await {
                Ok(true) => return,
                Ok(false) => {},
                Err(e) => tracing::error!("[worker] requeue failed: {}", e),
            }
        }

        // Retry budget spent (or permanent error): dead-letter it
        if let Err(e) = self.queue.add_to_dlq(&job, code, &message, None).await {
            tracing::error!("[worker] failed to write DLQ entry for {}: {}", job.job_id, e);
        }
    }

    async fn execute(&self, job: &PipelineJob) -> Result<(), (ErrorCode, String)> {
        let file_bytes = self
            .storage
            .download(&job.file_path)
            .await
            .map_err(|e| (ErrorCode::StorageError, e.to_string()))?;

        let request = PipelineRequest {
            file_bytes,
            filename: job.file_name.clone(),
            user_id: job.user_id.clone(),
            job_id: job.job_id.clone(),
            mode: AnalysisMode::parse_mode(&job.mode),
            candidate_id: job.candidate_id.clone(),
            is_retry: job.is_retry,
            // A retry that already saved once comes back as a duplicate
            // update, which never debits; only the explicit flag skips here
            skip_credit_deduction: job.skip_credit_deduction,
        };

        let outcome = self.orchestrator.run(request).await;
        if outcome.success {
            return Ok(());
        }

        let code = outcome
            .error_code
            .as_deref()
            .map(ErrorCode::parse_code)
            .unwrap_or(ErrorCode::Unknown);
        Err((code, outcome.error.unwrap_or_else(|| "pipeline failed".to_string())))
    }
}
