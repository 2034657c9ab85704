//! Candidate record types.
//!
//! `ResumeData` is the typed shape of an analyzed résumé. LLM responses are
//! merged as loose JSON first (providers disagree about shape more often
//! than about content) and converted into this struct once a final payload
//! exists.

use serde::{Deserialize, Serialize};

/// Candidate row lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Processing,
    Parsed,
    Analyzed,
    Completed,
    Failed,
    Deleted,
    Rejected,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Parsed => "parsed",
            Self::Analyzed => "analyzed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse_status(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "parsed" => Self::Parsed,
            "analyzed" => Self::Analyzed,
            "completed" => Self::Completed,
            "deleted" => Self::Deleted,
            "rejected" => Self::Rejected,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CareerEntry {
    pub company: String,
    pub position: Option<String>,
    pub department: Option<String>,
    /// Normalized to YYYY-MM by the validator
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub is_current: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EducationEntry {
    pub school: String,
    pub major: Option<String>,
    pub degree: Option<String>,
    pub graduation_year: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectEntry {
    pub name: String,
    pub role: Option<String>,
    pub period: Option<String>,
    pub technologies: Vec<String>,
    pub description: Option<String>,
}

/// Fully analyzed candidate payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeData {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub birth_year: Option<i32>,
    pub location_city: Option<String>,
    pub address: Option<String>,

    pub exp_years: Option<f64>,
    pub current_company: Option<String>,
    pub current_position: Option<String>,
    pub last_company: Option<String>,
    pub last_position: Option<String>,

    pub careers: Vec<CareerEntry>,
    pub educations: Vec<EducationEntry>,
    pub skills: Vec<String>,
    pub certifications: Vec<serde_json::Value>,
    pub projects: Vec<ProjectEntry>,

    pub education_level: Option<String>,
    pub education_school: Option<String>,
    pub education_major: Option<String>,

    pub summary: Option<String>,
    pub strengths: Vec<String>,
    /// One-sentence recruiter-facing hook ("Aha Moment")
    pub match_reason: Option<String>,

    pub portfolio_url: Option<String>,
    pub github_url: Option<String>,
    pub linkedin_url: Option<String>,
}

impl ResumeData {
    /// Lenient conversion from a merged LLM payload. Unknown keys are
    /// dropped, missing keys default.
    pub fn from_merged(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            CandidateStatus::Processing,
            CandidateStatus::Parsed,
            CandidateStatus::Analyzed,
            CandidateStatus::Completed,
            CandidateStatus::Failed,
            CandidateStatus::Deleted,
            CandidateStatus::Rejected,
        ] {
            assert_eq!(CandidateStatus::parse_status(status.as_str()), status);
        }
        assert_eq!(CandidateStatus::parse_status("garbage"), CandidateStatus::Failed);
    }

    #[test]
    fn test_from_merged_is_lenient() {
        let value = json!({
            "name": "Kim Chulsoo",
            "exp_years": 7.5,
            "careers": [{"company": "Acme", "is_current": true}],
            "skills": ["Rust", "Python"],
            "unexpected_key": {"deep": true}
        });

        let data = ResumeData::from_merged(&value);
        assert_eq!(data.name.as_deref(), Some("Kim Chulsoo"));
        assert_eq!(data.exp_years, Some(7.5));
        assert_eq!(data.careers.len(), 1);
        assert!(data.careers[0].is_current);
        assert_eq!(data.skills.len(), 2);
    }

    #[test]
    fn test_from_merged_bad_shape_defaults() {
        let data = ResumeData::from_merged(&json!("not an object"));
        assert!(data.name.is_none());
        assert!(data.careers.is_empty());
    }
}
