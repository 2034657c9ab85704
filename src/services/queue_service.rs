//! Job queue with file-type routing and a dead-letter queue.
//!
//! Two queues with separate timeouts: fast (PDF/DOCX, 5 min) and slow
//! (HWP/HWPX, 20 min) so document conversion cannot starve the cheap
//! path. Jobs that exhaust their retries land in the DLQ: a list of ids
//! plus one JSON hash per entry with a 30 day TTL, replayable with the
//! original kwargs.

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::errors::ErrorCode;

const FAST_QUEUE_KEY: &str = "queue:fast";
const SLOW_QUEUE_KEY: &str = "queue:slow";
const DLQ_KEY: &str = "dlq:failed_jobs";
const DLQ_META_PREFIX: &str = "dlq:meta:";
const DLQ_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FastPipeline,
    SlowPipeline,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastPipeline => "fast_pipeline",
            Self::SlowPipeline => "slow_pipeline",
        }
    }

    pub fn queue_key(&self) -> &'static str {
        match self {
            Self::FastPipeline => FAST_QUEUE_KEY,
            Self::SlowPipeline => SLOW_QUEUE_KEY,
        }
    }

    /// Job execution deadline.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::FastPipeline => Duration::from_secs(5 * 60),
            Self::SlowPipeline => Duration::from_secs(20 * 60),
        }
    }

    /// Back-off intervals between the (at most 2) retry attempts.
    pub fn retry_intervals(&self) -> [Duration; 2] {
        match self {
            Self::FastPipeline => [Duration::from_secs(30), Duration::from_secs(60)],
            Self::SlowPipeline => [Duration::from_secs(60), Duration::from_secs(120)],
        }
    }

    pub const MAX_RETRIES: u32 = 2;
}

/// Routing is a pure function of the file extension.
pub fn route_by_extension(file_name: &str) -> JobType {
    let ext = file_name.rsplit_once('.').map(|(_, e)| e.to_lowercase()).unwrap_or_default();
    if ext == "hwp" || ext == "hwpx" { JobType::SlowPipeline } else { JobType::FastPipeline }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub job_id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub candidate_id: Option<String>,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub skip_credit_deduction: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub job_type: Option<JobType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub job_id: String,
    pub user_id: String,
    pub job_type: String,
    pub error_message: String,
    pub error_type: String,
    pub retry_count: u32,
    pub failed_at: String,
    pub job_kwargs: PipelineJob,
    pub last_traceback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub queue_job_id: String,
    pub status: &'static str,
    pub job_type: JobType,
}

#[derive(Debug, Serialize)]
pub struct DlqStats {
    pub total: usize,
    pub by_job_type: HashMap<String, usize>,
    pub by_error_type: HashMap<String, usize>,
    pub by_user: Vec<(String, usize)>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue not available")]
    NotAvailable,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("DLQ entry not found: {0}")]
    EntryNotFound(String),
}

pub struct QueueService {
    connection: Option<ConnectionManager>,
}

impl QueueService {
    /// Connect to Redis; an empty URL disables the queue subsystem.
    pub async fn connect(redis_url: &str) -> Self {
        if redis_url.is_empty() {
            tracing::warn!("[queue] REDIS_URL not configured - queue disabled");
            return Self { connection: None };
        }

        match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(connection) => {
                    tracing::info!("[queue] connected (fast/slow queues ready)");
                    Self { connection: Some(connection) }
                },
                Err(e) => {
                    tracing::error!("[queue] failed to connect: {}", e);
                    Self { connection: None }
                },
            },
            Err(e) => {
                tracing::error!("[queue] invalid redis URL: {}", e);
                Self { connection: None }
            },
        }
    }

    pub fn is_available(&self) -> bool {
        self.connection.is_some()
    }

    fn conn(&self) -> Result<ConnectionManager, QueueError> {
        self.connection.clone().ok_or(QueueError::NotAvailable)
    }

    // ------------------------------------------------------------------
    // Enqueue / dequeue
    // ------------------------------------------------------------------

    /// Route by file extension and push onto the matching queue.
    pub async fn enqueue_pipeline(&self, mut job: PipelineJob) -> Result<QueuedJob, QueueError> {
        let job_type = route_by_extension(&job.file_name);
        job.job_type = Some(job_type);

        let mut conn = self.conn()?;
        let payload = serde_json::to_string(&job)?;
        let () = conn.lpush(job_type.queue_key(), payload).await?;

        tracing::info!(
            "[queue] routed {} ({}) to {} queue",
            job.file_name,
            job.job_id,
            job_type.as_str()
        );

        Ok(QueuedJob {
            job_id: job.job_id.clone(),
            queue_job_id: format!("{}-{}", job_type.as_str(), job.job_id),
            status: "queued",
            job_type,
        })
    }

    /// Blocking pop with a short poll timeout so workers can observe
    /// shutdown.
    pub async fn dequeue(&self, job_type: JobType) -> Result<Option<PipelineJob>, QueueError> {
        let mut conn = self.conn()?;
        let result: Option<(String, String)> = conn.brpop(job_type.queue_key(), 5.0).await?;
        match result {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Re-enqueue a failed job after its back-off interval. Returns false
    /// when the retry budget is spent (the caller then writes to the DLQ).
    pub async fn requeue_with_backoff(&self, mut job: PipelineJob) -> Result<bool, QueueError> {
        let job_type = job.job_type.unwrap_or_else(|| route_by_extension(&job.file_name));
        if job.retry_count >= JobType::MAX_RETRIES {
            return Ok(false);
        }

        let interval = job_type.retry_intervals()[job.retry_count as usize];
        job.retry_count += 1;
        job.is_retry = true;

        let mut conn = self.conn()?;
        let payload = serde_json::to_string(&job)?;
        let key = job_type.queue_key();

        tracing::info!(
            "[queue] retry {}/{} for {} in {}s",
            job.retry_count,
            JobType::MAX_RETRIES,
            job.job_id,
            interval.as_secs()
        );

        // Delayed re-enqueue without blocking the worker
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let result: Result<(), redis::RedisError> = conn.lpush(key, payload).await;
            if let Err(e) = result {
                tracing::error!("[queue] delayed requeue failed: {}", e);
            }
        });

        Ok(true)
    }

    // ------------------------------------------------------------------
    // Back-pressure
    // ------------------------------------------------------------------

    pub async fn queue_depth(&self, job_type: JobType) -> usize {
        let Ok(mut conn) = self.conn() else { return 0 };
        conn.llen::<_, usize>(job_type.queue_key()).await.unwrap_or(0)
    }

    /// Admission control probe: reject or defer new HWP uploads while the
    /// slow queue is backed up.
    pub async fn should_throttle(&self, threshold: usize) -> bool {
        let depth = self.queue_depth(JobType::SlowPipeline).await;
        let throttle = depth > threshold;
        if throttle {
            tracing::warn!("[queue] BACKPRESSURE: slow queue depth {} > {}", depth, threshold);
        }
        throttle
    }

    pub async fn queue_stats(&self) -> HashMap<&'static str, usize> {
        let mut stats = HashMap::new();
        stats.insert("fast", self.queue_depth(JobType::FastPipeline).await);
        stats.insert("slow", self.queue_depth(JobType::SlowPipeline).await);
        stats
    }

    // ------------------------------------------------------------------
    // Dead-letter queue
    // ------------------------------------------------------------------

    /// Record a permanently failed job. Error messages and tracebacks are
    /// bounded so one pathological failure cannot bloat Redis.
    pub async fn add_to_dlq(
        &self,
        job: &PipelineJob,
        error_code: ErrorCode,
        error_message: &str,
        traceback: Option<&str>,
    ) -> Result<String, QueueError> {
        let mut conn = self.conn()?;

        let dlq_id = format!("dlq-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let job_type =
            job.job_type.unwrap_or_else(|| route_by_extension(&job.file_name));

        let entry = DlqEntry {
            dlq_id: dlq_id.clone(),
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            job_type: job_type.as_str().to_string(),
            error_message: error_message.chars().take(1000).collect(),
            error_type: error_code.as_str().to_string(),
            retry_count: job.retry_count,
            failed_at: Utc::now().to_rfc3339(),
            job_kwargs: job.clone(),
            last_traceback: traceback.map(|t| t.chars().take(5000).collect()),
        };

        let meta_key = format!("{}{}", DLQ_META_PREFIX, dlq_id);
        let payload = serde_json::to_string(&entry)?;
        let () = conn.hset(&meta_key, "data", payload).await?;
        let () = conn.expire(&meta_key, DLQ_TTL_SECONDS).await?;
        let () = conn.lpush(DLQ_KEY, &dlq_id).await?;

        tracing::info!(
            "[dlq] added job {} as {} (type: {}, error: {})",
            job.job_id,
            dlq_id,
            job_type.as_str(),
            error_code.as_str()
        );
        Ok(dlq_id)
    }

    pub async fn dlq_entries(
        &self,
        limit: usize,
        offset: usize,
        job_type: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Vec<DlqEntry>, QueueError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> =
            conn.lrange(DLQ_KEY, offset as isize, (offset + limit * 2) as isize - 1).await?;

        let mut entries = Vec::new();
        for dlq_id in ids {
            let Some(entry) = self.fetch_entry(&mut conn, &dlq_id).await? else { continue };
            if let Some(filter) = job_type {
                if entry.job_type != filter {
                    continue;
                }
            }
            if let Some(filter) = user_id {
                if entry.user_id != filter {
                    continue;
                }
            }
            entries.push(entry);
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    pub async fn dlq_entry(&self, dlq_id: &str) -> Result<Option<DlqEntry>, QueueError> {
        let mut conn = self.conn()?;
        self.fetch_entry(&mut conn, dlq_id).await
    }

    async fn fetch_entry(
        &self,
        conn: &mut ConnectionManager,
        dlq_id: &str,
    ) -> Result<Option<DlqEntry>, QueueError> {
        let payload: Option<String> =
            conn.hget(format!("{}{}", DLQ_META_PREFIX, dlq_id), "data").await?;
        match payload {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    pub async fn dlq_count(&self) -> usize {
        let Ok(mut conn) = self.conn() else { return 0 };
        conn.llen::<_, usize>(DLQ_KEY).await.unwrap_or(0)
    }

    pub async fn remove_from_dlq(&self, dlq_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.lrem(DLQ_KEY, 1, dlq_id).await?;
        let () = conn.del(format!("{}{}", DLQ_META_PREFIX, dlq_id)).await?;
        Ok(removed > 0)
    }

    /// Replay a dead job with its exact original kwargs. The entry leaves
    /// the DLQ only after the re-enqueue succeeds.
    pub async fn retry_from_dlq(&self, dlq_id: &str) -> Result<QueuedJob, QueueError> {
        let entry = self
            .dlq_entry(dlq_id)
            .await?
            .ok_or_else(|| QueueError::EntryNotFound(dlq_id.to_string()))?;

        let mut job = entry.job_kwargs;
        job.retry_count = 0;
        job.is_retry = true;

        let queued = self.enqueue_pipeline(job).await?;
        self.remove_from_dlq(dlq_id).await?;

        tracing::info!("[dlq] retried job {} from {}", queued.job_id, dlq_id);
        Ok(queued)
    }

    /// Drop entries; with `older_than_days` only entries past the cutoff
    /// are removed.
    pub async fn clear_dlq(&self, older_than_days: Option<i64>) -> Result<usize, QueueError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = conn.lrange(DLQ_KEY, 0, -1).await?;
        let cutoff = older_than_days.map(|days| Utc::now() - chrono::Duration::days(days));

        let mut deleted = 0usize;
        for dlq_id in ids {
            if let Some(cutoff) = cutoff {
                let Some(entry) = self.fetch_entry(&mut conn, &dlq_id).await? else { continue };
                let failed_at = chrono::DateTime::parse_from_rfc3339(&entry.failed_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                if failed_at >= cutoff {
                    continue;
                }
            }
            if self.remove_from_dlq(&dlq_id).await? {
                deleted += 1;
            }
        }

        tracing::info!("[dlq] cleared {} entries", deleted);
        Ok(deleted)
    }

    pub async fn dlq_stats(&self) -> Result<DlqStats, QueueError> {
        let total = self.dlq_count().await;
        let entries = self.dlq_entries(1000, 0, None, None).await?;

        let mut by_job_type: HashMap<String, usize> = HashMap::new();
        let mut by_error_type: HashMap<String, usize> = HashMap::new();
        let mut by_user: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            *by_job_type.entry(entry.job_type.clone()).or_insert(0) += 1;
            *by_error_type.entry(entry.error_type.clone()).or_insert(0) += 1;
            *by_user.entry(entry.user_id.clone()).or_insert(0) += 1;
        }

        let mut users: Vec<(String, usize)> = by_user.into_iter().collect();
        users.sort_by(|a, b| b.1.cmp(&a.1));
        users.truncate(10);

        Ok(DlqStats { total, by_job_type, by_error_type, by_user: users })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_is_pure_extension_function() {
        assert_eq!(route_by_extension("resume.pdf"), JobType::FastPipeline);
        assert_eq!(route_by_extension("resume.docx"), JobType::FastPipeline);
        assert_eq!(route_by_extension("resume.HWP"), JobType::SlowPipeline);
        assert_eq!(route_by_extension("resume.hwpx"), JobType::SlowPipeline);
        assert_eq!(route_by_extension("no_extension"), JobType::FastPipeline);
    }

    #[test]
    fn test_retry_policies() {
        let fast = JobType::FastPipeline;
        assert_eq!(fast.timeout(), Duration::from_secs(300));
        assert_eq!(fast.retry_intervals(), [Duration::from_secs(30), Duration::from_secs(60)]);

        let slow = JobType::SlowPipeline;
        assert_eq!(slow.timeout(), Duration::from_secs(1200));
        assert_eq!(slow.retry_intervals(), [Duration::from_secs(60), Duration::from_secs(120)]);
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = PipelineJob {
            job_id: "job-1".to_string(),
            user_id: "user-1".to_string(),
            file_path: "u/1.pdf".to_string(),
            file_name: "resume.pdf".to_string(),
            mode: "phase_1".to_string(),
            candidate_id: None,
            is_retry: false,
            skip_credit_deduction: false,
            retry_count: 0,
            job_type: Some(JobType::FastPipeline),
        };

        let json = serde_json::to_string(&job).unwrap();
        let restored: PipelineJob = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.job_id, "job-1");
        assert_eq!(restored.job_type, Some(JobType::FastPipeline));
    }

    #[tokio::test]
    async fn test_disabled_queue() {
        let queue = QueueService::connect("").await;
        assert!(!queue.is_available());
        assert_eq!(queue.queue_depth(JobType::SlowPipeline).await, 0);
        assert!(!queue.should_throttle(50).await);
        assert_eq!(queue.dlq_count().await, 0);
    }
}
