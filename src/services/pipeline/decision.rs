//! Proposal / decision arbitration.
//!
//! Agents propose per-field values; the manager resolves each field to one
//! `Decision`. Conflicts go through the resolution ladder: unanimity,
//! majority vote, then authority level with confidence as tie breaker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub agent_name: String,
    pub field_name: String,
    pub proposed_value: Value,
    pub confidence: f64,
    pub reasoning: String,
    pub evidence_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    None,
    SingleProposal,
    Unanimous,
    MajorityVote,
    AuthorityThenConfidence,
}

impl DecisionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SingleProposal => "single_proposal",
            Self::Unanimous => "unanimous",
            Self::MajorityVote => "majority_vote",
            Self::AuthorityThenConfidence => "authority_then_confidence",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub field_name: String,
    pub final_value: Value,
    pub final_confidence: f64,
    pub decided_by: String,
    pub method: DecisionMethod,
    pub proposal_count: usize,
    pub had_conflict: bool,
    pub conflict_resolution: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Authority level per agent; higher wins ties. Regex-derived PII outranks
/// LLM analysts.
fn authority_level(agent_name: &str) -> u32 {
    match agent_name {
        "orchestrator" => 100,
        "pii_extractor" => 90,
        "regex_extractor" => 85,
        name if name.starts_with("analyst") => 80,
        "validation_agent" | "validation_wrapper" => 70,
        "fallback" => 10,
        _ => 50,
    }
}

#[derive(Debug, Default)]
pub struct DecisionManager {
    proposals: HashMap<String, Vec<Proposal>>,
    decisions: HashMap<String, Decision>,
    conflict_count: u32,
}

impl DecisionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a proposal. A later proposal from the same agent for the same
    /// field replaces the earlier one.
    pub fn propose(
        &mut self,
        agent_name: &str,
        field_name: &str,
        value: Value,
        confidence: f64,
        reasoning: &str,
    ) {
        let proposal = Proposal {
            agent_name: agent_name.to_string(),
            field_name: field_name.to_string(),
            proposed_value: value,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.to_string(),
            evidence_ids: Vec::new(),
            timestamp: Utc::now(),
        };

        let list = self.proposals.entry(field_name.to_string()).or_default();
        list.retain(|p| p.agent_name != agent_name);
        list.push(proposal);

        // A new proposal invalidates any earlier decision for the field
        self.decisions.remove(field_name);
    }

    pub fn proposals_for(&self, field_name: &str) -> &[Proposal] {
        self.proposals.get(field_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_conflict(&self, field_name: &str) -> bool {
        let proposals = self.proposals_for(field_name);
        if proposals.len() <= 1 {
            return false;
        }
        let first = proposals[0].proposed_value.to_string();
        proposals.iter().any(|p| p.proposed_value.to_string() != first)
    }

    pub fn make_decision(&mut self, field_name: &str) -> Decision {
        if let Some(existing) = self.decisions.get(field_name) {
            return existing.clone();
        }

        let proposals = self.proposals_for(field_name).to_vec();

        let decision = match proposals.len() {
            0 => Decision {
                field_name: field_name.to_string(),
                final_value: Value::Null,
                final_confidence: 0.0,
                decided_by: "no_proposal".to_string(),
                method: DecisionMethod::None,
                proposal_count: 0,
                had_conflict: false,
                conflict_resolution: None,
                timestamp: Utc::now(),
            },
            1 => Decision {
                field_name: field_name.to_string(),
                final_value: proposals[0].proposed_value.clone(),
                final_confidence: proposals[0].confidence,
                decided_by: proposals[0].agent_name.clone(),
                method: DecisionMethod::SingleProposal,
                proposal_count: 1,
                had_conflict: false,
                conflict_resolution: None,
                timestamp: Utc::now(),
            },
            _ => {
                let unique: std::collections::HashSet<String> =
                    proposals.iter().map(|p| p.proposed_value.to_string()).collect();
                if unique.len() == 1 {
                    self.unanimous_decision(field_name, &proposals)
                } else {
                    self.conflict_count += 1;
                    self.resolve_conflict(field_name, &proposals)
                }
            },
        };

        tracing::info!(
            "[decision] {} = {} (confidence {:.2}, method {}, conflict {})",
            field_name,
            decision.final_value,
            decision.final_confidence,
            decision.method.as_str(),
            decision.had_conflict
        );

        self.decisions.insert(field_name.to_string(), decision.clone());
        decision
    }

    fn unanimous_decision(&self, field_name: &str, proposals: &[Proposal]) -> Decision {
        let avg = proposals.iter().map(|p| p.confidence).sum::<f64>() / proposals.len() as f64;
        Decision {
            field_name: field_name.to_string(),
            final_value: proposals[0].proposed_value.clone(),
            final_confidence: (avg * 1.1).min(1.0),
            decided_by: "unanimous".to_string(),
            method: DecisionMethod::Unanimous,
            proposal_count: proposals.len(),
            had_conflict: false,
            conflict_resolution: None,
            timestamp: Utc::now(),
        }
    }

    fn resolve_conflict(&self, field_name: &str, proposals: &[Proposal]) -> Decision {
        // Group by value
        let mut groups: HashMap<String, Vec<&Proposal>> = HashMap::new();
        for p in proposals {
            groups.entry(p.proposed_value.to_string()).or_default().push(p);
        }

        // Majority first
        if let Some((_, winners)) = groups
            .iter()
            .max_by_key(|(_, members)| members.len())
            .filter(|(_, members)| members.len() * 2 > proposals.len())
        {
            let avg =
                winners.iter().map(|p| p.confidence).sum::<f64>() / winners.len() as f64;
            return Decision {
                field_name: field_name.to_string(),
                final_value: winners[0].proposed_value.clone(),
                final_confidence: avg * 0.95,
                decided_by: "majority_vote".to_string(),
                method: DecisionMethod::MajorityVote,
                proposal_count: proposals.len(),
                had_conflict: true,
                conflict_resolution: Some(format!("{}/{} majority", winners.len(), proposals.len())),
                timestamp: Utc::now(),
            };
        }

        // No majority: authority level, then confidence
        let best = proposals
            .iter()
            .max_by(|a, b| {
                (authority_level(&a.agent_name), a.confidence)
                    .partial_cmp(&(authority_level(&b.agent_name), b.confidence))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty proposals");

        Decision {
            field_name: field_name.to_string(),
            final_value: best.proposed_value.clone(),
            final_confidence: best.confidence * 0.9,
            decided_by: best.agent_name.clone(),
            method: DecisionMethod::AuthorityThenConfidence,
            proposal_count: proposals.len(),
            had_conflict: true,
            conflict_resolution: Some(format!("authority winner: {}", best.agent_name)),
            timestamp: Utc::now(),
        }
    }

    /// Decide every field that has proposals. Existing decisions are reused.
    pub fn decide_all(&mut self) -> Vec<Decision> {
        let fields: Vec<String> = self.proposals.keys().cloned().collect();
        fields.iter().map(|f| self.make_decision(f)).collect()
    }

    pub fn decision_for(&self, field_name: &str) -> Option<&Decision> {
        self.decisions.get(field_name)
    }

    pub fn decisions(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.values()
    }

    pub fn conflict_count(&self) -> u32 {
        self.conflict_count
    }

    pub fn field_count(&self) -> usize {
        self.proposals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_proposal() {
        let mut manager = DecisionManager::new();
        manager.propose("pii_extractor", "phone", json!("010-1234-5678"), 0.9, "regex");

        let decision = manager.make_decision("phone");
        assert_eq!(decision.method, DecisionMethod::SingleProposal);
        assert_eq!(decision.final_confidence, 0.9);
        assert!(!decision.had_conflict);
    }

    #[test]
    fn test_unanimous_bonus_capped() {
        let mut manager = DecisionManager::new();
        manager.propose("analyst_openai", "name", json!("Kim"), 0.95, "");
        manager.propose("analyst_gemini", "name", json!("Kim"), 0.95, "");

        let decision = manager.make_decision("name");
        assert_eq!(decision.method, DecisionMethod::Unanimous);
        assert_eq!(decision.final_confidence, 1.0);
    }

    #[test]
    fn test_majority_vote() {
        let mut manager = DecisionManager::new();
        manager.propose("analyst_openai", "email", json!("a@b.com"), 0.9, "");
        manager.propose("analyst_gemini", "email", json!("a@b.com"), 0.8, "");
        manager.propose("analyst_claude", "email", json!("x@y.com"), 0.9, "");

        let decision = manager.make_decision("email");
        assert_eq!(decision.method, DecisionMethod::MajorityVote);
        assert_eq!(decision.final_value, json!("a@b.com"));
        assert!(decision.had_conflict);
        // avg(0.9, 0.8) * 0.95
        assert!((decision.final_confidence - 0.8075).abs() < 1e-9);
    }

    #[test]
    fn test_authority_breaks_even_split() {
        let mut manager = DecisionManager::new();
        manager.propose("analyst_openai", "name", json!("Kim"), 0.99, "");
        manager.propose("pii_extractor", "name", json!("Lee"), 0.7, "filename");

        let decision = manager.make_decision("name");
        assert_eq!(decision.method, DecisionMethod::AuthorityThenConfidence);
        // pii_extractor (90) outranks analyst (80) despite lower confidence
        assert_eq!(decision.final_value, json!("Lee"));
        assert!((decision.final_confidence - 0.63).abs() < 1e-9);
        assert!(decision.had_conflict);
    }

    #[test]
    fn test_same_agent_replaces_own_proposal() {
        let mut manager = DecisionManager::new();
        manager.propose("analyst_openai", "exp_years", json!(5), 0.6, "first pass");
        manager.propose("analyst_openai", "exp_years", json!(7), 0.8, "second pass");

        assert_eq!(manager.proposals_for("exp_years").len(), 1);
        let decision = manager.make_decision("exp_years");
        assert_eq!(decision.final_value, json!(7));
    }

    #[test]
    fn test_new_proposal_invalidates_decision() {
        let mut manager = DecisionManager::new();
        manager.propose("analyst_openai", "summary", json!("v1"), 0.7, "");
        let first = manager.make_decision("summary");
        assert_eq!(first.final_value, json!("v1"));

        manager.propose("validation_agent", "summary", json!("v1"), 0.8, "");
        let second = manager.make_decision("summary");
        assert_eq!(second.method, DecisionMethod::Unanimous);
        assert_eq!(second.proposal_count, 2);
    }

    #[test]
    fn test_empty_decision() {
        let mut manager = DecisionManager::new();
        let decision = manager.make_decision("ghost");
        assert_eq!(decision.method, DecisionMethod::None);
        assert_eq!(decision.final_value, Value::Null);
    }

    #[test]
    fn test_conflict_count() {
        let mut manager = DecisionManager::new();
        manager.propose("analyst_openai", "phone", json!("1"), 0.9, "");
        manager.propose("analyst_gemini", "phone", json!("2"), 0.9, "");
        manager.make_decision("phone");
        assert_eq!(manager.conflict_count(), 1);
    }
}
