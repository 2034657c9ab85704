//! In-process pipeline metrics: success rates, per-stage durations, token
//! totals per provider/model and cost projections.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;

/// USD per 1K tokens (input, output), keyed by provider.
const COST_TABLE: [(&str, f64, f64); 4] = [
    ("openai", 0.0025, 0.01),
    ("gemini", 0.0001, 0.0004),
    ("claude", 0.003, 0.015),
    ("embedding", 0.00002, 0.0),
];

#[derive(Debug, Clone)]
struct PipelineRecord {
    pipeline_type: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    success: Option<bool>,
    error_code: Option<String>,
    stage_durations_ms: HashMap<String, i64>,
    is_retry: bool,
}

#[derive(Debug, Default, Clone)]
struct LlmTally {
    calls: u64,
    input_tokens: u64,
    output_tokens: u64,
}

pub struct MetricsService {
    pipelines: DashMap<String, PipelineRecord>,
    /// (provider, model) -> tally
    llm_usage: Mutex<HashMap<(String, String), LlmTally>>,
}

impl MetricsService {
    pub fn new() -> Self {
        Self { pipelines: DashMap::new(), llm_usage: Mutex::new(HashMap::new()) }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub fn start_pipeline(&self, pipeline_id: &str, pipeline_type: &str, is_retry: bool) {
        self.pipelines.insert(
            pipeline_id.to_string(),
            PipelineRecord {
                pipeline_type: pipeline_type.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                success: None,
                error_code: None,
                stage_durations_ms: HashMap::new(),
                is_retry,
            },
        );
    }

    pub fn record_stage(&self, pipeline_id: &str, stage: &str, duration_ms: i64) {
        if let Some(mut record) = self.pipelines.get_mut(pipeline_id) {
            record.stage_durations_ms.insert(stage.to_string(), duration_ms);
        }
    }

    pub fn record_llm_call(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        let mut usage = self.llm_usage.lock().expect("llm usage lock");
        let tally = usage.entry((provider.to_string(), model.to_string())).or_default();
        tally.calls += 1;
        tally.input_tokens += input_tokens;
        tally.output_tokens += output_tokens;
    }

    pub fn complete_pipeline(&self, pipeline_id: &str, success: bool, error_code: Option<&str>) {
        if let Some(mut record) = self.pipelines.get_mut(pipeline_id) {
            record.completed_at = Some(Utc::now());
            record.success = Some(success);
            record.error_code = error_code.map(str::to_string);
        }
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Aggregates over completed pipelines within the window, optionally
    /// filtered by pipeline type.
    pub fn summary(&self, window_minutes: i64, pipeline_type: Option<&str>) -> Value {
        let cutoff = Utc::now() - chrono::Duration::minutes(window_minutes.max(1));

        let records: Vec<PipelineRecord> = self
            .pipelines
            .iter()
            .filter(|entry| entry.started_at >= cutoff)
            .filter(|entry| {
                pipeline_type.map(|t| entry.pipeline_type == t).unwrap_or(true)
            })
            .map(|entry| entry.value().clone())
            .collect();

        let completed: Vec<&PipelineRecord> =
            records.iter().filter(|r| r.success.is_some()).collect();
        let successes = completed.iter().filter(|r| r.success == Some(true)).count();
        let success_rate = if completed.is_empty() {
            0.0
        } else {
            successes as f64 / completed.len() as f64
        };

        // stage -> (mean, min, max)
        let mut stage_samples: HashMap<&str, Vec<i64>> = HashMap::new();
        for record in &records {
            for (stage, duration) in &record.stage_durations_ms {
                stage_samples.entry(stage.as_str()).or_default().push(*duration);
            }
        }
        let stage_stats: HashMap<&str, Value> = stage_samples
            .into_iter()
            .map(|(stage, samples)| {
                let sum: i64 = samples.iter().sum();
                let mean = sum as f64 / samples.len() as f64;
                let min = samples.iter().min().copied().unwrap_or(0);
                let max = samples.iter().max().copied().unwrap_or(0);
                (stage, json!({"mean_ms": mean, "min_ms": min, "max_ms": max}))
            })
            .collect();

        let retries = records.iter().filter(|r| r.is_retry).count();
        let mut error_counts: HashMap<String, usize> = HashMap::new();
        for record in &records {
            if let Some(code) = &record.error_code {
                *error_counts.entry(code.clone()).or_insert(0) += 1;
            }
        }

        json!({
            "window_minutes": window_minutes,
            "total": records.len(),
            "completed": completed.len(),
            "success_rate": success_rate,
            "retries": retries,
            "stages": stage_stats,
            "errors": error_counts,
        })
    }

    /// Token totals and cost projections by provider and model.
    pub fn llm_cost_report(&self) -> Value {
        let usage = self.llm_usage.lock().expect("llm usage lock");

        let mut per_provider: HashMap<String, Value> = HashMap::new();
        let mut total_cost = 0.0f64;

        for ((provider, model), tally) in usage.iter() {
            let (input_rate, output_rate) = COST_TABLE
                .iter()
                .find(|(name, _, _)| name == provider)
                .map(|(_, input, output)| (*input, *output))
                .unwrap_or((0.0, 0.0));
            let cost = tally.input_tokens as f64 / 1000.0 * input_rate
                + tally.output_tokens as f64 / 1000.0 * output_rate;
            total_cost += cost;

            per_provider.insert(
                format!("{}/{}", provider, model),
                json!({
                    "calls": tally.calls,
                    "input_tokens": tally.input_tokens,
                    "output_tokens": tally.output_tokens,
                    "cost_usd": cost,
                }),
            );
        }

        // Projection assumes current totals accrued over the last hour
        json!({
            "by_provider": per_provider,
            "total_cost_usd": total_cost,
            "projection": {
                "hourly_usd": total_cost,
                "daily_usd": total_cost * 24.0,
                "monthly_usd": total_cost * 24.0 * 30.0,
            }
        })
    }

    pub fn recent(&self, limit: usize) -> Value {
        let mut records: Vec<(String, PipelineRecord)> = self
            .pipelines
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        records.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));
        records.truncate(limit);

        json!(records
            .into_iter()
            .map(|(id, r)| {
                json!({
                    "pipeline_id": id,
                    "type": r.pipeline_type,
                    "started_at": r.started_at.to_rfc3339(),
                    "success": r.success,
                    "error_code": r.error_code,
                    "duration_ms": r.completed_at.map(|end| (end - r.started_at).num_milliseconds()),
                })
            })
            .collect::<Vec<_>>())
    }

    /// Evict records older than the retention window.
    pub fn prune(&self, retention_minutes: i64) {
        let cutoff = Utc::now() - chrono::Duration::minutes(retention_minutes);
        self.pipelines.retain(|_, record| record.started_at >= cutoff);
    }
}

impl Default for MetricsService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let metrics = MetricsService::new();
        metrics.start_pipeline("p1", "new", false);
        metrics.complete_pipeline("p1", true, None);
        metrics.start_pipeline("p2", "new", false);
        metrics.complete_pipeline("p2", false, Some("PARSE_FAILED"));

        let summary = metrics.summary(60, None);
        assert_eq!(summary["total"], 2);
        assert_eq!(summary["success_rate"], 0.5);
        assert_eq!(summary["errors"]["PARSE_FAILED"], 1);
    }

    #[test]
    fn test_stage_stats() {
        let metrics = MetricsService::new();
        metrics.start_pipeline("p1", "new", false);
        metrics.record_stage("p1", "analysis", 100);
        metrics.start_pipeline("p2", "new", false);
        metrics.record_stage("p2", "analysis", 300);

        let summary = metrics.summary(60, None);
        assert_eq!(summary["stages"]["analysis"]["mean_ms"], 200.0);
        assert_eq!(summary["stages"]["analysis"]["min_ms"], 100);
        assert_eq!(summary["stages"]["analysis"]["max_ms"], 300);
    }

    #[test]
    fn test_type_filter() {
        let metrics = MetricsService::new();
        metrics.start_pipeline("p1", "new", false);
        metrics.start_pipeline("p2", "legacy", false);

        assert_eq!(metrics.summary(60, Some("new"))["total"], 1);
        assert_eq!(metrics.summary(60, None)["total"], 2);
    }

    #[test]
    fn test_llm_cost_attribution() {
        let metrics = MetricsService::new();
        metrics.record_llm_call("openai", "gpt-4o", 1000, 1000);
        metrics.record_llm_call("gemini", "gemini-2.0-flash", 1000, 1000);

        let report = metrics.llm_cost_report();
        let openai = &report["by_provider"]["openai/gpt-4o"];
        assert_eq!(openai["calls"], 1);
        // 1k input * 0.0025 + 1k output * 0.01
        assert!((openai["cost_usd"].as_f64().unwrap() - 0.0125).abs() < 1e-9);
        assert_eq!(
            report["projection"]["daily_usd"].as_f64().unwrap(),
            report["projection"]["hourly_usd"].as_f64().unwrap() * 24.0
        );
    }

    #[test]
    fn test_prune() {
        let metrics = MetricsService::new();
        metrics.start_pipeline("p1", "new", false);
        metrics.prune(0);
        assert_eq!(metrics.summary(60, None)["total"], 0);
    }
}
