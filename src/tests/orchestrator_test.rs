//! Orchestrator flows that terminate before any external call: credit
//! gate, routing rejections, text-length checks and identity rejection.

use super::common::{build_orchestrator, create_test_db, seed_user};
use crate::config::AnalysisMode;
use crate::services::pipeline::{PipelineRequest, ProcessTextRequest};

fn pdf_bytes() -> Vec<u8> {
    b"%PDF-1.4\n<< /Type /Page >>\nBT (short) Tj ET\n%%EOF".to_vec()
}

fn text_request(text: &str, user: &str) -> ProcessTextRequest {
    ProcessTextRequest {
        text: text.to_string(),
        user_id: user.to_string(),
        job_id: Some("job-1".to_string()),
        mode: AnalysisMode::Phase1,
        generate_embeddings: false,
        mask_pii: true,
        save_to_db: false,
        source_file: None,
        file_type: None,
    }
}

#[tokio::test]
async fn test_insufficient_credits_rejects_before_any_work() {
    let pool = create_test_db().await;
    let orchestrator = build_orchestrator(&pool);

    // No user row at all: the credit gate fires first
    let outcome = orchestrator
        .run(PipelineRequest {
            file_bytes: pdf_bytes(),
            filename: "resume.pdf".to_string(),
            user_id: "ghost".to_string(),
            job_id: "job-credit".to_string(),
            mode: AnalysisMode::Phase1,
            candidate_id: None,
            is_retry: false,
            skip_credit_deduction: false,
        })
        .await;

    assert!(!outcome.success);
    assert!(outcome.rejected);
    assert_eq!(outcome.error_code.as_deref(), Some("INSUFFICIENT_CREDITS"));
    assert!(outcome.user_message.is_some());
}

#[tokio::test]
async fn test_unsupported_file_fails_without_consuming_credit() {
    let pool = create_test_db().await;
    seed_user(&pool, "user-1", 5).await;
    let orchestrator = build_orchestrator(&pool);

    let outcome = orchestrator
        .run(PipelineRequest {
            file_bytes: b"just some plain text".to_vec(),
            filename: "notes.txt".to_string(),
            user_id: "user-1".to_string(),
            job_id: "job-bad-type".to_string(),
            mode: AnalysisMode::Phase1,
            candidate_id: None,
            is_retry: false,
            skip_credit_deduction: false,
        })
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("UNSUPPORTED_TYPE"));

    // Credit is only ever debited after a successful save
    let (credits,): (i64,) = sqlx::query_as("SELECT credits FROM users WHERE id = 'user-1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(credits, 5);
}

#[tokio::test]
async fn test_scanned_pdf_classified_from_empty_text() {
    let pool = create_test_db().await;
    seed_user(&pool, "user-1", 5).await;
    let orchestrator = build_orchestrator(&pool);

    // A valid PDF with no extractable text runs
    let outcome = orchestrator
        .run(PipelineRequest {
            file_bytes: b"%PDF-1.4\n<< /Type /Page >>\nno text operators here\n%%EOF".to_vec(),
            filename: "scan.pdf".to_string(),
            user_id: "user-1".to_string(),
            job_id: "job-scan".to_string(),
            mode: AnalysisMode::Phase1,
            candidate_id: None,
            is_retry: false,
            skip_credit_deduction: false,
        })
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("SCANNED_IMAGE"));
}

#[tokio::test]
async fn test_short_text_fails_with_text_too_short() {
    let pool = create_test_db().await;
    let orchestrator = build_orchestrator(&pool);

    let outcome = orchestrator.run_text(text_request("too short", "user-1")).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("TEXT_TOO_SHORT"));
}

#[tokio::test]
async fn test_multi_identity_rejected_without_db_row() {
    let pool = create_test_db().await;
    let orchestrator = build_orchestrator(&pool);

    let text = "지원자 명단입니다. \
                김철수 연락처 010-1111-2222 이메일 kim@a.com 백엔드 개발 7년 경력이며 \
                박영희 연락처 010-3333-4444 이메일 park@b.com 프론트엔드 5년 경력입니다. \
                두 사람 모두 서울 거주 중이고 즉시 입사 가능합니다.";
    let outcome = orchestrator.run_text(text_request(text, "user-1")).await;

    assert!(!outcome.success);
    assert!(outcome.rejected);
    assert_eq!(outcome.error_code.as_deref(), Some("MULTI_IDENTITY"));

    // Nothing was persisted
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM candidates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_analysis_without_providers_fails_as_llm_error() {
    let pool = create_test_db().await;
    let orchestrator = build_orchestrator(&pool);

    let text = "김철수 단일 지원자입니다. 연락처 010-1111-2222, 이메일 kim@a.com. \
                네이버에서 백엔드 엔지니어로 7년간 근무했으며 Rust와 Python을 주로 사용했습니다. \
                대규모 트래픽 처리와 검색 인프라 운영 경험이 있습니다.";
    let outcome = orchestrator.run_text(text_request(text, "user-1")).await;

    // No API keys are configured in the test harness: analysis is the
    // first stage that must fail
    assert!(!outcome.success);
    assert_eq!(outcome.error_code.as_deref(), Some("LLM_ERROR"));
}
