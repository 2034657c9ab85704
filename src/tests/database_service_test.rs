//! Persistence tests: dedup waterfall, version stacking, compensation
//! replay, soft delete and the credit ledger.

use serde_json::json;
use std::collections::HashMap;

use super::common::{create_test_db, seed_candidate, seed_user};
use crate::services::database_service::{
    CompensationLog, DatabaseService, DbError, DedupKeys,
};
use crate::services::embedding_service::{Chunk, ChunkType};
use crate::services::{DuplicateMatchType, PrivacyService};

fn sample_payload() -> serde_json::Value {
    json!({
        "name": "김철수",
        "phone": "010-****-5678",
        "email": "ki*@example.com",
        "exp_years": 7.0,
        "careers": [{"company": "Acme", "position": "Engineer"}],
        "skills": ["Rust"],
        "summary": "백엔드 엔지니어"
    })
}

fn keys_for(phone: &str, email: &str) -> DedupKeys {
    let privacy = PrivacyService::new("").unwrap();
    DedupKeys {
        phone_hash: Some(privacy.hash_for_dedup(phone)),
        email_hash: Some(privacy.hash_for_dedup(email)),
        name: Some("김철수".to_string()),
        phone: Some(phone.to_string()),
        birth_year: Some(1990),
    }
}

async fn save(
    db: &DatabaseService,
    user_id: &str,
    keys: &DedupKeys,
    compensation: &mut CompensationLog,
) -> Result<crate::services::database_service::SaveRecord, DbError> {
    db.save_candidate(
        user_id,
        &sample_payload(),
        0.9,
        &json!({"name": 0.9}),
        &json!([]),
        &HashMap::new(),
        keys,
        "resume.pdf",
        "pdf",
        "phase_1",
        None,
        compensation,
    )
    .await
}

#[tokio::test]
async fn test_first_save_inserts_latest_row() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    let mut compensation = CompensationLog::new();
    let record = save(&db, "user-1", &keys, &mut compensation).await.unwrap();
    compensation.commit();

    assert!(!record.is_update);
    assert!(record.parent_id.is_none());

    let (is_latest, status): (bool, String) =
        sqlx::query_as("SELECT is_latest, status FROM candidates WHERE id = ?")
            .bind(&record.candidate_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(is_latest);
    assert_eq!(status, "completed");
}

#[tokio::test]
async fn test_duplicate_phone_stacks_version() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    seed_candidate(&pool, "prior", "user-1", keys.phone_hash.as_deref(), None).await;

    let dup = db.check_duplicate("user-1", &keys).await.unwrap();
    assert!(dup.is_duplicate);
    assert_eq!(dup.match_type, DuplicateMatchType::PhoneHash);
    assert_eq!(dup.confidence, 1.0);

    let mut compensation = CompensationLog::new();
    let record = save(&db, "user-1", &keys, &mut compensation).await.unwrap();
    compensation.commit();

    assert!(record.is_update);
    assert_eq!(record.parent_id.as_deref(), Some("prior"));

    // Exactly one latest row in the chain after commit
    let (latest_count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM candidates WHERE user_id = 'user-1' AND is_latest = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(latest_count, 1);

    let (prior_latest,): (bool,) =
        sqlx::query_as("SELECT is_latest FROM candidates WHERE id = 'prior'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(!prior_latest);
}

#[tokio::test]
async fn test_email_match_is_second_priority() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    seed_candidate(&pool, "by-email", "user-1", None, keys.email_hash.as_deref()).await;

    let dup = db.check_duplicate("user-1", &keys).await.unwrap();
    assert_eq!(dup.match_type, DuplicateMatchType::EmailHash);
    assert_eq!(dup.confidence, 0.95);
}

#[tokio::test]
async fn test_dedup_scoped_per_user() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    seed_candidate(&pool, "other-user-row", "user-2", keys.phone_hash.as_deref(), None).await;

    let dup = db.check_duplicate("user-1", &keys).await.unwrap();
    assert!(!dup.is_duplicate);
}

#[tokio::test]
async fn test_superseded_rows_never_rematch() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    // A row another writer already flipped out of latest is invisible to
    // the waterfall
    seed_candidate(&pool, "prior", "user-1", keys.phone_hash.as_deref(), None).await;
    sqlx::query("UPDATE candidates SET is_latest = 0 WHERE id = 'prior'")
        .execute(&pool)
        .await
        .unwrap();

    let dup = db.check_duplicate("user-1", &keys).await.unwrap();
    assert!(!dup.is_duplicate);

    // A clean save inserts a fresh latest row with no parent
    let mut compensation = CompensationLog::new();
    let record = save(&db, "user-1", &keys, &mut compensation).await.unwrap();
    compensation.commit();
    assert!(!record.is_update);
    assert!(record.parent_id.is_none());
}

#[tokio::test]
async fn test_missing_required_fields_rejected() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());

    let keys = DedupKeys::default(); // no identity at all
    let mut compensation = CompensationLog::new();
    let result = db
        .save_candidate(
            "user-1",
            &sample_payload(),
            0.9,
            &json!({}),
            &json!([]),
            &HashMap::new(),
            &keys,
            "f.pdf",
            "pdf",
            "phase_1",
            None,
            &mut compensation,
        )
        .await;

    assert!(matches!(result, Err(DbError::MissingRequiredFields(_))));
}

#[tokio::test]
async fn test_compensation_rollback_removes_insert_and_restores_update() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    seed_candidate(&pool, "prior", "user-1", keys.phone_hash.as_deref(), None).await;

    let mut compensation = CompensationLog::new();
    let record = save(&db, "user-1", &keys, &mut compensation).await.unwrap();
    assert!(compensation.pending() >= 2);

    // Downstream failure: replay instead of commit
    compensation.rollback(&pool).await;

    let (new_row,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM candidates WHERE id = ?")
        .bind(&record.candidate_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(new_row, 0);

    let (prior_latest,): (bool,) =
        sqlx::query_as("SELECT is_latest FROM candidates WHERE id = 'prior'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(prior_latest);
}

#[tokio::test]
async fn test_chunks_save_and_replace() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    seed_candidate(&pool, "cand", "user-1", None, None).await;

    let chunk = |index: u32| Chunk {
        chunk_type: ChunkType::Career,
        chunk_index: index,
        content: format!("career {}", index),
        metadata: json!({}),
        embedding: Some(vec![0.0; 4]),
    };

    let mut compensation = CompensationLog::new();
    let saved = db.save_chunks("cand", &[chunk(0), chunk(1)], &mut compensation).await.unwrap();
    compensation.commit();
    assert_eq!(saved, 2);
    assert_eq!(db.chunk_count("cand").await.unwrap(), 2);

    // Replace-all: delete then insert a fresh set
    db.delete_chunks("cand").await.unwrap();
    let mut compensation = CompensationLog::new();
    db.save_chunks("cand", &[chunk(0)], &mut compensation).await.unwrap();
    compensation.commit();
    assert_eq!(db.chunk_count("cand").await.unwrap(), 1);
}

#[tokio::test]
async fn test_chunk_rollback_deletes_batch() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    seed_candidate(&pool, "cand", "user-1", None, None).await;

    let chunk = Chunk {
        chunk_type: ChunkType::Summary,
        chunk_index: 0,
        content: "summary".to_string(),
        metadata: json!({}),
        embedding: None,
    };

    let mut compensation = CompensationLog::new();
    db.save_chunks("cand", &[chunk], &mut compensation).await.unwrap();
    compensation.rollback(&pool).await;
    assert_eq!(db.chunk_count("cand").await.unwrap(), 0);
}

#[tokio::test]
async fn test_soft_delete_restores_parent() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    let keys = keys_for("010-1234-5678", "kim@example.com");

    seed_candidate(&pool, "parent", "user-1", keys.phone_hash.as_deref(), None).await;
    let mut compensation = CompensationLog::new();
    let record = save(&db, "user-1", &keys, &mut compensation).await.unwrap();
    compensation.commit();

    db.soft_delete_candidate(&record.candidate_id, "LLM_ERROR", "analysis failed")
        .await
        .unwrap();

    let (status, is_latest): (String, bool) =
        sqlx::query_as("SELECT status, is_latest FROM candidates WHERE id = ?")
            .bind(&record.candidate_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "deleted");
    assert!(!is_latest);

    // The parent becomes the usable latest row again
    let (parent_latest,): (bool,) =
        sqlx::query_as("SELECT is_latest FROM candidates WHERE id = 'parent'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(parent_latest);
}

#[tokio::test]
async fn test_purge_respects_retention_floor() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());

    seed_candidate(&pool, "dead", "user-1", None, None).await;
    db.soft_delete_candidate("dead", "PARSE_FAILED", "boom").await.unwrap();

    // Freshly deleted rows survive the purge even when asked for 0 days
    let purged = db.purge_soft_deleted(0).await.unwrap();
    assert_eq!(purged, 0);

    // Age the deletion past the window and purge again
    sqlx::query("UPDATE candidates SET deleted_at = '2000-01-01T00:00:00+00:00' WHERE id = 'dead'")
        .execute(&pool)
        .await
        .unwrap();
    let purged = db.purge_soft_deleted(7).await.unwrap();
    assert_eq!(purged, 1);
}

#[tokio::test]
async fn test_credit_spare_then_monthly() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    seed_user(&pool, "user-1", 1).await;

    assert!(db.check_credit_available("user-1").await.unwrap());

    // First debit consumes the spare credit
    assert!(db.deduct_credit("user-1", None).await.unwrap());
    let (credits, used): (i64, i64) =
        sqlx::query_as("SELECT credits, credits_used_this_month FROM users WHERE id = 'user-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(credits, 0);
    assert_eq!(used, 0);

    // Second debit rolls into monthly usage
    assert!(db.deduct_credit("user-1", None).await.unwrap());
    let (credits, used): (i64, i64) =
        sqlx::query_as("SELECT credits, credits_used_this_month FROM users WHERE id = 'user-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(credits, 0);
    assert_eq!(used, 1);

    // Ledger has both transactions
    let (tx_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM credit_transactions WHERE user_id = 'user-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(tx_count, 2);
}

#[tokio::test]
async fn test_credit_cap_enforced() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    sqlx::query(
        "INSERT INTO users (id, plan, credits, credits_used_this_month) VALUES ('maxed', 'starter', 0, 50)",
    )
    .execute(&pool)
    .await
    .unwrap();

    assert!(!db.check_credit_available("maxed").await.unwrap());
    assert!(!db.deduct_credit("maxed", None).await.unwrap());
}

#[tokio::test]
async fn test_unknown_user_has_no_credit() {
    let pool = create_test_db().await;
    let db = DatabaseService::new(pool.clone());
    assert!(!db.check_credit_available("ghost").await.unwrap());
}
