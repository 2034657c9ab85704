//! Feature flags with percentage rollout and a user whitelist.
//!
//! Routing order: main flag off means legacy; whitelisted users always get
//! the new path; otherwise a deterministic hash of the job id keeps one
//! job on one path across retries.

use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub use_new_pipeline: bool,
    pub use_llm_validation: bool,
    pub use_agent_messaging: bool,
    pub use_hallucination_detection: bool,
    pub use_evidence_tracking: bool,
    /// 0.0..=1.0
    pub new_pipeline_rollout_percentage: f64,
    pub new_pipeline_user_ids: HashSet<String>,
    pub debug_pipeline: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_new_pipeline: false,
            use_llm_validation: false,
            use_agent_messaging: false,
            use_hallucination_detection: true,
            use_evidence_tracking: true,
            new_pipeline_rollout_percentage: 0.0,
            new_pipeline_user_ids: HashSet::new(),
            debug_pipeline: false,
        }
    }
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        let parse_bool = |key: &str, default: bool| -> bool {
            match std::env::var(key).unwrap_or_default().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            }
        };
        let parse_float = |key: &str| -> f64 {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(0.0)
        };
        let parse_csv = |key: &str| -> HashSet<String> {
            std::env::var(key)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let flags = Self {
            use_new_pipeline: parse_bool("USE_NEW_PIPELINE", false),
            use_llm_validation: parse_bool("USE_LLM_VALIDATION", false),
            use_agent_messaging: parse_bool("USE_AGENT_MESSAGING", false),
            use_hallucination_detection: parse_bool("USE_HALLUCINATION_DETECTION", true),
            use_evidence_tracking: parse_bool("USE_EVIDENCE_TRACKING", true),
            new_pipeline_rollout_percentage: parse_float("NEW_PIPELINE_ROLLOUT_PERCENTAGE")
                .clamp(0.0, 1.0),
            new_pipeline_user_ids: parse_csv("NEW_PIPELINE_USER_IDS"),
            debug_pipeline: parse_bool("DEBUG_PIPELINE", false),
        };
        flags.log_status();
        flags
    }

    pub fn log_status(&self) {
        tracing::info!(
            "[flags] new_pipeline={} llm_validation={} hallucination={} evidence={} rollout={:.0}% whitelist={}",
            self.use_new_pipeline,
            self.use_llm_validation,
            self.use_hallucination_detection,
            self.use_evidence_tracking,
            self.new_pipeline_rollout_percentage * 100.0,
            self.new_pipeline_user_ids.len()
        );
    }

    /// Stable routing decision for one job.
    pub fn should_use_new_pipeline(&self, user_id: Option<&str>, job_id: Option<&str>) -> bool {
        if !self.use_new_pipeline {
            return false;
        }

        if let Some(user_id) = user_id {
            if self.new_pipeline_user_ids.contains(user_id) {
                return true;
            }
        }

        if self.new_pipeline_rollout_percentage > 0.0 {
            if let Some(job_id) = job_id {
                let digest = md5::compute(job_id.as_bytes());
                // Low 8 bytes of the digest, mod 100: stable bucket per job
                let bucket = u64::from_be_bytes(
                    digest.0[8..16].try_into().expect("md5 digest is 16 bytes"),
                ) % 100;
                let threshold = (self.new_pipeline_rollout_percentage * 100.0) as u64;
                return bucket < threshold;
            }
            return self.new_pipeline_rollout_percentage >= 1.0;
        }

        self.use_new_pipeline
    }
}

/// Reloadable holder so `/feature-flags/reload` can re-read the
/// environment without a restart.
#[derive(Debug, Default)]
pub struct FeatureFlagStore {
    flags: RwLock<FeatureFlags>,
}

impl FeatureFlagStore {
    pub fn new(flags: FeatureFlags) -> Self {
        Self { flags: RwLock::new(flags) }
    }

    pub fn current(&self) -> FeatureFlags {
        self.flags.read().expect("flags lock").clone()
    }

    pub fn reload_from_env(&self) -> FeatureFlags {
        let fresh = FeatureFlags::from_env();
        *self.flags.write().expect("flags lock") = fresh.clone();
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_flag_always_legacy() {
        let flags = FeatureFlags { use_new_pipeline: false, ..Default::default() };
        assert!(!flags.should_use_new_pipeline(Some("user"), Some("job")));
    }

    #[test]
    fn test_whitelist_wins() {
        let mut flags = FeatureFlags {
            use_new_pipeline: true,
            new_pipeline_rollout_percentage: 0.0,
            ..Default::default()
        };
        flags.new_pipeline_user_ids.insert("vip".to_string());

        assert!(flags.should_use_new_pipeline(Some("vip"), None));
        // Non-whitelisted with 0% rollout falls through to the main flag
        assert!(flags.should_use_new_pipeline(Some("other"), None));
    }

    #[test]
    fn test_rollout_is_deterministic() {
        let flags = FeatureFlags {
            use_new_pipeline: true,
            new_pipeline_rollout_percentage: 0.5,
            ..Default::default()
        };

        for job_id in ["job-1", "job-2", "job-xyz"] {
            let first = flags.should_use_new_pipeline(None, Some(job_id));
            for _ in 0..10 {
                assert_eq!(flags.should_use_new_pipeline(None, Some(job_id)), first);
            }
        }
    }

    #[test]
    fn test_rollout_extremes() {
        let all = FeatureFlags {
            use_new_pipeline: true,
            new_pipeline_rollout_percentage: 1.0,
            ..Default::default()
        };
        let none = FeatureFlags {
            use_new_pipeline: true,
            new_pipeline_rollout_percentage: 0.001,
            ..Default::default()
        };

        let mut all_count = 0;
        let mut none_count = 0;
        for i in 0..100 {
            let job_id = format!("job-{}", i);
            if all.should_use_new_pipeline(None, Some(&job_id)) {
                all_count += 1;
            }
            if none.should_use_new_pipeline(None, Some(&job_id)) {
                none_count += 1;
            }
        }
        assert_eq!(all_count, 100);
        assert_eq!(none_count, 0);
    }

    #[test]
    fn test_store_reload() {
        let store = FeatureFlagStore::new(FeatureFlags::default());
        assert!(!store.current().use_new_pipeline);
    }
}
