//! Context-level invariants: decision backing, confidence math, warning
//! coupling, LLM-call accounting and the PII boundary.

use serde_json::json;

use crate::services::pipeline::PipelineContext;
use crate::services::pipeline::layers::CONFIDENCE_WEIGHTS;
use crate::services::pipeline::warnings::WarningCode;

fn resume_text() -> String {
    "박영희\n휴대폰: 010-9876-5432\n이메일: park@example.com\n\
     카카오에서 5년간 데이터 엔지니어로 근무했습니다.\n\
     기술: Python, Spark, Airflow"
        .to_string()
}

#[test]
fn test_every_current_field_is_backed_by_a_decision() {
    let mut ctx = PipelineContext::new();
    ctx.propose("analyst", "summary", json!("데이터 엔지니어"), 0.9, "");
    ctx.propose("analyst", "exp_years", json!(5.0), 0.8, "");
    ctx.propose("analyst", "skills", json!(["Python", "Spark"]), 0.85, "");
    ctx.decide_all();

    let current = ctx.current_data.data.to_value();
    for field in ["summary", "exp_years", "skills"] {
        let decision = ctx.decision_manager.decision_for(field).expect("decision exists");
        assert_eq!(
            current[field], decision.final_value,
            "field {} must equal its decision",
            field
        );
    }
}

#[test]
fn test_overall_confidence_matches_weighted_mean_within_one_percent() {
    let mut ctx = PipelineContext::new();
    ctx.propose("analyst", "name", json!("박영희"), 0.92, "");
    ctx.propose("analyst", "exp_years", json!(5.0), 0.81, "");
    ctx.propose("analyst", "careers", json!([{"company": "카카오"}]), 0.77, "");
    ctx.propose("analyst", "skills", json!(["Python"]), 0.66, "");
    ctx.decide_all();

    let overall = ctx.current_data.calculate_overall_confidence() as f64;

    // Independent recomputation from the stored per-field scores
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (field, weight) in CONFIDENCE_WEIGHTS {
        if let Some(score) = ctx.current_data.confidence_scores.get(field) {
            numerator += *score as f64 * weight;
            denominator += weight;
        }
    }
    let expected = numerator / denominator;
    assert!((overall - expected).abs() <= 1.0, "overall {} vs expected {}", overall, expected);
}

#[test]
fn test_conflicting_decision_always_has_a_disagreement_warning() {
    let mut ctx = PipelineContext::new();
    ctx.propose("analyst_openai", "phone", json!("010-1234-5678"), 0.9, "");
    ctx.propose("analyst_gemini", "phone", json!("010-1234-5679"), 0.9, "");

    let decision = ctx.decide("phone");
    assert!(decision.had_conflict);

    let disagreements = ctx.warnings.by_code(WarningCode::LlmDisagreement);
    assert!(!disagreements.is_empty());
    assert_eq!(disagreements[0].field_name.as_deref(), Some("phone"));
}

#[test]
fn test_llm_call_total_equals_per_stage_sum() {
    let mut ctx = PipelineContext::new();
    ctx.record_llm_call("analysis", 1000, 0.01);
    ctx.record_llm_call("analysis", 800, 0.01);
    ctx.record_llm_call("validation", 300, 0.0);

    let per_stage: u32 = ctx.guardrails.llm_calls_by_stage().values().sum();
    assert_eq!(ctx.metadata.total_llm_calls, per_stage);
    assert_eq!(ctx.metadata.total_tokens_used, 2100);
}

#[test]
fn test_no_extracted_pii_substring_reaches_llm_text() {
    let mut ctx = PipelineContext::new();
    ctx.set_parsed_text(resume_text(), None);
    ctx.extract_pii();

    let llm_text = ctx.text_for_llm();
    if let Some(name) = &ctx.pii_store.name {
        assert!(!llm_text.contains(name.as_str()));
    }
    if let Some(phone) = &ctx.pii_store.phone {
        for variant in crate::services::pipeline::layers::phone_variants(phone) {
            assert!(!llm_text.contains(&variant), "variant {} leaked", variant);
        }
    }
    if let Some(email) = &ctx.pii_store.email {
        assert!(!llm_text.contains(email.as_str()));
    }
}

#[test]
fn test_finalize_assembles_candidate_from_decisions_and_pii() {
    let mut ctx = PipelineContext::new();
    ctx.set_parsed_text(resume_text(), None);
    ctx.extract_pii();
    ctx.propose("analyst", "exp_years", json!(5.0), 0.8, "");
    ctx.propose("analyst", "summary", json!("데이터 엔지니어"), 0.9, "");

    let result = ctx.finalize();

    assert_eq!(result.candidate["phone"], json!("010-9876-5432"));
    assert_eq!(result.candidate["email"], json!("park@example.com"));
    assert_eq!(result.candidate["exp_years"], json!(5.0));
    assert!(result.confidence > 0);
    assert!(!result.pipeline_id.is_empty());
}

#[test]
fn test_audit_log_stays_bounded_through_heavy_activity() {
    let mut ctx = PipelineContext::new();
    for i in 0..1000 {
        ctx.propose("analyst", &format!("field_{}", i % 40), json!(i), 0.5, "");
    }
    assert!(ctx.audit_log.len() <= 500);
}
