//! Persistence: candidate rows, dedup waterfall, version stacking and the
//! compensating-action log.
//!
//! There is no distributed transaction across the row insert, the chunk
//! batch and the credit debit, so every successful write is tracked in a
//! `CompensationLog` and replayed in reverse when a later step fails. The
//! version-stacking flip uses a CAS guard (`WHERE is_latest = 1`) plus a
//! verify read; losing the race aborts the save without consuming credit.

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use super::embedding_service::Chunk;
use crate::models::CandidateStatus;
use crate::utils::normalize_digits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMatchType {
    PhoneHash,
    EmailHash,
    NamePhonePrefix,
    NameBirth,
    None,
}

impl DuplicateMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhoneHash => "phone_hash",
            Self::EmailHash => "email_hash",
            Self::NamePhonePrefix => "name_phone",
            Self::NameBirth => "name_birth",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateCheckResult {
    pub is_duplicate: bool,
    pub match_type: DuplicateMatchType,
    pub existing_candidate_id: Option<String>,
    pub confidence: f64,
}

impl DuplicateCheckResult {
    fn none() -> Self {
        Self {
            is_duplicate: false,
            match_type: DuplicateMatchType::None,
            existing_candidate_id: None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveRecord {
    pub candidate_id: String,
    pub is_update: bool,
    pub parent_id: Option<String>,
}

/// Identity values used only for dedup key derivation (pre-mask).
#[derive(Debug, Clone, Default)]
pub struct DedupKeys {
    pub phone_hash: Option<String>,
    pub email_hash: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub birth_year: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("duplicate check failed: {0}")]
    DuplicateCheck(String),
    #[error("race condition: candidate already updated")]
    RaceCondition,
    #[error("missing required fields: {0}")]
    MissingRequiredFields(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

// ============================================================================
// Compensating transaction log
// ============================================================================

#[derive(Debug, Clone)]
enum RollbackAction {
    /// A successful INSERT: rollback deletes the row
    Delete { table: &'static str, id: String },
    /// A successful UPDATE: rollback restores the captured columns
    Restore { id: String, is_latest: bool, updated_at: String },
}

/// Tracks completed writes for one job. `commit` clears the list; dropping
/// without commit leaves replay to the caller via `rollback`.
#[derive(Debug, Default)]
pub struct CompensationLog {
    actions: Vec<RollbackAction>,
    committed: bool,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn track_insert(&mut self, table: &'static str, id: &str) {
        self.actions.push(RollbackAction::Delete { table, id: id.to_string() });
    }

    fn track_candidate_update(&mut self, id: &str, is_latest: bool, updated_at: &str) {
        self.actions.push(RollbackAction::Restore {
            id: id.to_string(),
            is_latest,
            updated_at: updated_at.to_string(),
        });
    }

    pub fn commit(&mut self) {
        self.actions.clear();
        self.committed = true;
    }

    pub fn pending(&self) -> usize {
        self.actions.len()
    }

    /// Replay the inverse operations in reverse order. Individual replay
    /// failures are logged and skipped so one bad action cannot strand the
    /// rest.
    pub async fn rollback(&mut self, pool: &SqlitePool) {
        if self.committed {
            return;
        }

        for action in self.actions.iter().rev() {
            let result = match action {
                RollbackAction::Delete { table, id } => match *table {
                    "candidates" => {
                        sqlx::query("DELETE FROM candidates WHERE id = ?")
                            .bind(id)
                            .execute(pool)
                            .await
                    },
                    "candidate_chunks" => {
                        sqlx::query("DELETE FROM candidate_chunks WHERE id = ?")
                            .bind(id)
                            .execute(pool)
                            .await
                    },
                    other => {
                        tracing::error!("[rollback] unknown table {}", other);
                        continue;
                    },
                },
                RollbackAction::Restore { id, is_latest, updated_at } => {
                    sqlx::query("UPDATE candidates SET is_latest = ?, updated_at = ? WHERE id = ?")
                        .bind(is_latest)
                        .bind(updated_at)
                        .bind(id)
                        .execute(pool)
                        .await
                },
            };

            match result {
                Ok(_) => tracing::info!("[rollback] replayed {:?}", action),
                Err(e) => tracing::error!("[rollback] failed to replay {:?}: {}", action, e),
            }
        }

        self.actions.clear();
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct DatabaseService {
    pool: SqlitePool,
}

impl DatabaseService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Dedup key helpers
    // ------------------------------------------------------------------

    /// Digits-only phone; 82-prefixed international numbers fold into the
    /// domestic leading zero.
    pub fn normalize_phone(phone: &str) -> Option<String> {
        let digits = normalize_digits(phone);
        if digits.len() == 12 && digits.starts_with("82") {
            return Some(format!("0{}", &digits[2..]));
        }
        if digits.len() >= 10 { Some(digits) } else { None }
    }

    /// First 4 digits after the national prefix.
    pub fn phone_prefix(phone: &str) -> Option<String> {
        let normalized = Self::normalize_phone(phone)?;
        if normalized.len() >= 7 { Some(normalized[3..7].to_string()) } else { None }
    }

    fn normalize_name(name: &str) -> String {
        name.split_whitespace().collect::<String>().to_lowercase()
    }

    pub fn name_phone_hash(name: &str, phone: &str) -> Option<String> {
        let prefix = Self::phone_prefix(phone)?;
        let combined = format!("{}:{}", Self::normalize_name(name), prefix);
        Some(sha256_hex(&combined))
    }

    pub fn name_birth_hash(name: &str, birth_year: i32) -> String {
        sha256_hex(&format!("{}:{}", Self::normalize_name(name), birth_year))
    }

    // ------------------------------------------------------------------
    // Dedup waterfall
    // ------------------------------------------------------------------

    /// Waterfall over `is_latest = 1` rows within one user's scope. First
    /// match wins: phone hash (1.0), email hash (0.95), name + phone
    /// prefix (0.85), name + birth year (0.70).
    pub async fn check_duplicate(
        &self,
        user_id: &str,
        keys: &DedupKeys,
    ) -> Result<DuplicateCheckResult, DbError> {
        if let Some(phone_hash) = &keys.phone_hash {
            if let Some(id) = self.find_latest_by("phone_hash", user_id, phone_hash).await? {
                return Ok(DuplicateCheckResult {
                    is_duplicate: true,
                    match_type: DuplicateMatchType::PhoneHash,
                    existing_candidate_id: Some(id),
                    confidence: 1.0,
                });
            }
        }

        if let Some(email_hash) = &keys.email_hash {
            if let Some(id) = self.find_latest_by("email_hash", user_id, email_hash).await? {
                return Ok(DuplicateCheckResult {
                    is_duplicate: true,
                    match_type: DuplicateMatchType::EmailHash,
                    existing_candidate_id: Some(id),
                    confidence: 0.95,
                });
            }
        }

        if let (Some(name), Some(phone)) = (&keys.name, &keys.phone) {
            if let Some(hash) = Self::name_phone_hash(name, phone) {
                if let Some(id) = self.find_latest_by("name_phone_hash", user_id, &hash).await? {
                    return Ok(DuplicateCheckResult {
                        is_duplicate: true,
                        match_type: DuplicateMatchType::NamePhonePrefix,
                        existing_candidate_id: Some(id),
                        confidence: 0.85,
                    });
                }
            }
        }

        if let (Some(name), Some(birth_year)) = (&keys.name, keys.birth_year) {
            let hash = Self::name_birth_hash(name, birth_year);
            if let Some(id) = self.find_latest_by("name_birth_hash", user_id, &hash).await? {
                return Ok(DuplicateCheckResult {
                    is_duplicate: true,
                    match_type: DuplicateMatchType::NameBirth,
                    existing_candidate_id: Some(id),
                    confidence: 0.70,
                });
            }
        }

        Ok(DuplicateCheckResult::none())
    }

    async fn find_latest_by(
        &self,
        column: &str,
        user_id: &str,
        value: &str,
    ) -> Result<Option<String>, DbError> {
        let query = format!(
            "SELECT id FROM candidates WHERE user_id = ? AND {} = ? AND is_latest = 1 \
             ORDER BY created_at DESC LIMIT 1",
            column
        );
        let row: Option<(String,)> = sqlx::query_as(&query)
            .bind(user_id)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::DuplicateCheck(e.to_string()))?;
        Ok(row.map(|(id,)| id))
    }

    // ------------------------------------------------------------------
    // Version stacking
    // ------------------------------------------------------------------

    /// Flip the superseded row to `is_latest = 0`. Backup first (for the
    /// compensation log), guard the update with `is_latest = 1`, then
    /// verify the transition. A row already flipped means another writer
    /// won; the caller aborts with `RaceCondition`.
    async fn stack_version(
        &self,
        existing_id: &str,
        compensation: &mut CompensationLog,
    ) -> Result<(), DbError> {
        let existing: Option<(bool, String)> =
            sqlx::query_as("SELECT is_latest, updated_at FROM candidates WHERE id = ?")
                .bind(existing_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((is_latest, updated_at)) = existing else {
            return Err(DbError::RaceCondition);
        };
        if !is_latest {
            tracing::warn!("[db] version stacking race: {} already superseded", existing_id);
            return Err(DbError::RaceCondition);
        }

        compensation.track_candidate_update(existing_id, is_latest, &updated_at);

        let result = sqlx::query(
            "UPDATE candidates SET is_latest = 0, updated_at = ? WHERE id = ? AND is_latest = 1",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(existing_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(DbError::RaceCondition);
        }

        // Verify read: another writer may have slipped between our backup
        // and the guard
        let verify: Option<(bool,)> =
            sqlx::query_as("SELECT is_latest FROM candidates WHERE id = ?")
                .bind(existing_id)
                .fetch_optional(&self.pool)
                .await?;
        match verify {
            Some((false,)) => {
                tracing::info!("[db] version stacking: {} marked as old version", existing_id);
                Ok(())
            },
            _ => Err(DbError::RaceCondition),
        }
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Insert (or fill a pre-created row for) the analyzed candidate.
    /// Runs the dedup waterfall first and stacks the superseded version.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_candidate(
        &self,
        user_id: &str,
        analyzed_data: &Value,
        confidence_score: f64,
        field_confidence: &Value,
        warnings: &Value,
        encrypted_store: &HashMap<String, String>,
        dedup_keys: &DedupKeys,
        source_file: &str,
        file_type: &str,
        analysis_mode: &str,
        candidate_id: Option<&str>,
        compensation: &mut CompensationLog,
    ) -> Result<SaveRecord, DbError> {
        // Partial-success floor: an identity anchor (name or a contact) and
        // at least one career
        let has_identity = [dedup_keys.name.as_deref(), dedup_keys.phone.as_deref()]
            .iter()
            .any(|v| v.map(|s| !s.is_empty()).unwrap_or(false))
            || dedup_keys.email_hash.is_some();
        let has_career = analyzed_data
            .get("careers")
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if !has_identity || !has_career {
            return Err(DbError::MissingRequiredFields(
                if has_identity { "careers" } else { "name/phone/email" }.to_string(),
            ));
        }

        let dup = self.check_duplicate(user_id, dedup_keys).await?;
        let mut parent_id = None;
        let mut is_update = false;

        if let Some(existing_id) = dup.existing_candidate_id.as_deref() {
            // The pre-created row itself is not its own duplicate
            if Some(existing_id) != candidate_id {
                self.stack_version(existing_id, compensation).await?;
                parent_id = Some(existing_id.to_string());
                is_update = true;
                tracing::info!(
                    "[db] duplicate detected via {} (confidence {:.2}), stacking on {}",
                    dup.match_type.as_str(),
                    dup.confidence,
                    existing_id
                );
            }
        }

        let name_phone_hash = match (&dedup_keys.name, &dedup_keys.phone) {
            (Some(name), Some(phone)) => Self::name_phone_hash(name, phone),
            _ => None,
        };
        let name_birth_hash = dedup_keys
            .name
            .as_deref()
            .zip(dedup_keys.birth_year)
            .map(|(name, year)| Self::name_birth_hash(name, year));

        let display_name = analyzed_data
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("이름 미확인")
            .to_string();

        let final_id = match candidate_id {
            Some(id) => {
                self.fill_candidate_row(
                    id,
                    &display_name,
                    analyzed_data,
                    confidence_score,
                    field_confidence,
                    warnings,
                    encrypted_store,
                    dedup_keys,
                    name_phone_hash.as_deref(),
                    name_birth_hash.as_deref(),
                    source_file,
                    file_type,
                    analysis_mode,
                    parent_id.as_deref(),
                )
                .await?;
                id.to_string()
            },
            None => {
                let id = Uuid::new_v4().to_string();
                self.insert_candidate_row(
                    &id,
                    user_id,
                    &display_name,
                    analyzed_data,
                    confidence_score,
                    field_confidence,
                    warnings,
                    encrypted_store,
                    dedup_keys,
                    name_phone_hash.as_deref(),
                    name_birth_hash.as_deref(),
                    source_file,
                    file_type,
                    analysis_mode,
                    parent_id.as_deref(),
                )
                .await?;
                compensation.track_insert("candidates", &id);
                id
            },
        };

        tracing::info!(
            "[db] saved candidate {}{}",
            final_id,
            parent_id.as_deref().map(|p| format!(" (supersedes {})", p)).unwrap_or_default()
        );

        Ok(SaveRecord { candidate_id: final_id, is_update, parent_id })
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_candidate_row(
        &self,
        id: &str,
        user_id: &str,
        display_name: &str,
        data: &Value,
        confidence_score: f64,
        field_confidence: &Value,
        warnings: &Value,
        encrypted_store: &HashMap<String, String>,
        keys: &DedupKeys,
        name_phone_hash: Option<&str>,
        name_birth_hash: Option<&str>,
        source_file: &str,
        file_type: &str,
        analysis_mode: &str,
        parent_id: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO candidates (
                id, user_id, name, birth_year, location_city,
                phone_masked, email_masked, address_masked,
                phone_encrypted, email_encrypted, address_encrypted,
                phone_hash, email_hash, name_phone_hash, name_birth_hash,
                exp_years, last_company, last_position,
                careers, educations, skills, certifications, projects,
                education_level, education_school, education_major,
                summary, strengths, match_reason,
                portfolio_url, github_url, linkedin_url,
                confidence_score, field_confidence, warnings,
                source_file, file_type, analysis_mode,
                status, is_latest, parent_id,
                analysis_completed_at, created_at, updated_at
            ) VALUES (
                ?, ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?,
                'completed', 1, ?,
                ?, ?, ?
            )
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(display_name)
        .bind(data.get("birth_year").and_then(Value::as_i64))
        .bind(data.get("location_city").and_then(Value::as_str))
        .bind(data.get("phone").and_then(Value::as_str))
        .bind(data.get("email").and_then(Value::as_str))
        .bind(data.get("address").and_then(Value::as_str))
        .bind(encrypted_store.get("phone"))
        .bind(encrypted_store.get("email"))
        .bind(encrypted_store.get("address"))
        .bind(&keys.phone_hash)
        .bind(&keys.email_hash)
        .bind(name_phone_hash)
        .bind(name_birth_hash)
        .bind(data.get("exp_years").and_then(Value::as_f64))
        .bind(data.get("last_company").and_then(Value::as_str))
        .bind(data.get("last_position").and_then(Value::as_str))
        .bind(data.get("careers").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("educations").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("skills").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("certifications").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("projects").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("education_level").and_then(Value::as_str))
        .bind(data.get("education_school").and_then(Value::as_str))
        .bind(data.get("education_major").and_then(Value::as_str))
        .bind(data.get("summary").and_then(Value::as_str))
        .bind(data.get("strengths").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("match_reason").and_then(Value::as_str))
        .bind(data.get("portfolio_url").and_then(Value::as_str))
        .bind(data.get("github_url").and_then(Value::as_str))
        .bind(data.get("linkedin_url").and_then(Value::as_str))
        .bind(confidence_score)
        .bind(field_confidence.to_string())
        .bind(warnings.to_string())
        .bind(source_file)
        .bind(file_type)
        .bind(analysis_mode)
        .bind(parent_id)
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fill_candidate_row(
        &self,
        id: &str,
        display_name: &str,
        data: &Value,
        confidence_score: f64,
        field_confidence: &Value,
        warnings: &Value,
        encrypted_store: &HashMap<String, String>,
        keys: &DedupKeys,
        name_phone_hash: Option<&str>,
        name_birth_hash: Option<&str>,
        source_file: &str,
        file_type: &str,
        analysis_mode: &str,
        parent_id: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE candidates SET
                name = ?, birth_year = ?, location_city = ?,
                phone_masked = ?, email_masked = ?, address_masked = ?,
                phone_encrypted = ?, email_encrypted = ?, address_encrypted = ?,
                phone_hash = ?, email_hash = ?, name_phone_hash = ?, name_birth_hash = ?,
                exp_years = ?, last_company = ?, last_position = ?,
                careers = ?, educations = ?, skills = ?, certifications = ?, projects = ?,
                education_level = ?, education_school = ?, education_major = ?,
                summary = ?, strengths = ?, match_reason = ?,
                portfolio_url = ?, github_url = ?, linkedin_url = ?,
                confidence_score = ?, field_confidence = ?, warnings = ?,
                source_file = ?, file_type = ?, analysis_mode = ?,
                status = 'completed', is_latest = 1, parent_id = ?,
                analysis_completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(display_name)
        .bind(data.get("birth_year").and_then(Value::as_i64))
        .bind(data.get("location_city").and_then(Value::as_str))
        .bind(data.get("phone").and_then(Value::as_str))
        .bind(data.get("email").and_then(Value::as_str))
        .bind(data.get("address").and_then(Value::as_str))
        .bind(encrypted_store.get("phone"))
        .bind(encrypted_store.get("email"))
        .bind(encrypted_store.get("address"))
        .bind(&keys.phone_hash)
        .bind(&keys.email_hash)
        .bind(name_phone_hash)
        .bind(name_birth_hash)
        .bind(data.get("exp_years").and_then(Value::as_f64))
        .bind(data.get("last_company").and_then(Value::as_str))
        .bind(data.get("last_position").and_then(Value::as_str))
        .bind(data.get("careers").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("educations").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("skills").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("certifications").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("projects").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("education_level").and_then(Value::as_str))
        .bind(data.get("education_school").and_then(Value::as_str))
        .bind(data.get("education_major").and_then(Value::as_str))
        .bind(data.get("summary").and_then(Value::as_str))
        .bind(data.get("strengths").cloned().unwrap_or(json!([])).to_string())
        .bind(data.get("match_reason").and_then(Value::as_str))
        .bind(data.get("portfolio_url").and_then(Value::as_str))
        .bind(data.get("github_url").and_then(Value::as_str))
        .bind(data.get("linkedin_url").and_then(Value::as_str))
        .bind(confidence_score)
        .bind(field_confidence.to_string())
        .bind(warnings.to_string())
        .bind(source_file)
        .bind(file_type)
        .bind(analysis_mode)
        .bind(parent_id)
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------

    /// Batch-insert chunks for a candidate, tracked in the compensation
    /// log. Only chunks with an embedding are searchable; chunks without
    /// one are stored with a NULL vector.
    pub async fn save_chunks(
        &self,
        candidate_id: &str,
        chunks: &[Chunk],
        compensation: &mut CompensationLog,
    ) -> Result<usize, DbError> {
        let mut saved = 0usize;
        for chunk in chunks {
            let id = Uuid::new_v4().to_string();
            let embedding_json = chunk
                .embedding
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));

            sqlx::query(
                r#"
                INSERT INTO candidate_chunks
                    (id, candidate_id, chunk_type, chunk_index, content, metadata, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(candidate_id)
            .bind(chunk.chunk_type.as_str())
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.metadata.to_string())
            .bind(embedding_json)
            .execute(&self.pool)
            .await?;

            compensation.track_insert("candidate_chunks", &id);
            saved += 1;
        }

        tracing::info!("[db] saved {}/{} chunks for candidate {}", saved, chunks.len(), candidate_id);
        Ok(saved)
    }

    /// Replace-all semantics on the update path: the superseded (or
    /// re-filled) candidate's chunks are removed before new ones land.
    pub async fn delete_chunks(&self, candidate_id: &str) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM candidate_chunks WHERE candidate_id = ?")
            .bind(candidate_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn chunk_count(&self, candidate_id: &str) -> Result<i64, DbError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM candidate_chunks WHERE candidate_id = ?")
                .bind(candidate_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Status transitions and soft delete
    // ------------------------------------------------------------------

    pub async fn create_processing_job(&self, job_id: &str, user_id: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT OR IGNORE INTO processing_jobs (id, user_id, status) VALUES (?, ?, 'queued')",
        )
        .bind(job_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: &str,
        candidate_id: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = ?,
                candidate_id = COALESCE(?, candidate_id),
                error_code = COALESCE(?, error_code),
                error_message = COALESCE(?, error_message),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(candidate_id)
        .bind(error_code)
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Progressive status walk: processing -> parsed -> analyzed ->
    /// completed, with the stage timestamps the UI polls on.
    pub async fn update_candidate_status(
        &self,
        candidate_id: &str,
        status: CandidateStatus,
        quick_extracted: Option<&Value>,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let parsing_ts = matches!(status, CandidateStatus::Parsed).then(|| now.clone());
        let analysis_ts = matches!(status, CandidateStatus::Analyzed | CandidateStatus::Completed)
            .then(|| now.clone());

        sqlx::query(
            r#"
            UPDATE candidates
            SET status = ?,
                quick_extracted = COALESCE(?, quick_extracted),
                parsing_completed_at = COALESCE(?, parsing_completed_at),
                analysis_completed_at = COALESCE(?, analysis_completed_at),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(quick_extracted.map(|v| v.to_string()))
        .bind(parsing_ts)
        .bind(analysis_ts)
        .bind(now)
        .bind(candidate_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft delete a failed candidate row. When the dead row supersedes a
    /// parent, the parent is restored to latest so the user keeps a usable
    /// version.
    pub async fn soft_delete_candidate(
        &self,
        candidate_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE candidates
            SET status = 'deleted', is_latest = 0, error_code = ?, error_message = ?,
                deleted_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error_code)
        .bind(error_message)
        .bind(&now)
        .bind(&now)
        .bind(candidate_id)
        .execute(&self.pool)
        .await?;

        let parent: Option<(Option<String>,)> =
            sqlx::query_as("SELECT parent_id FROM candidates WHERE id = ?")
                .bind(candidate_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((Some(parent_id),)) = parent {
            sqlx::query("UPDATE candidates SET is_latest = 1, updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(&parent_id)
                .execute(&self.pool)
                .await?;
            tracing::info!("[db] restored parent {} after soft delete of {}", parent_id, candidate_id);
        }
        Ok(())
    }

    /// Batch purge of soft-deleted rows older than the retention window.
    pub async fn purge_soft_deleted(&self, older_than_days: i64) -> Result<u64, DbError> {
        let older_than_days = older_than_days.max(7);
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();

        sqlx::query(
            "DELETE FROM candidate_chunks WHERE candidate_id IN \
             (SELECT id FROM candidates WHERE status = 'deleted' AND deleted_at < ?)",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;

        let result =
            sqlx::query("DELETE FROM candidates WHERE status = 'deleted' AND deleted_at < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Credits
    // ------------------------------------------------------------------

    /// Plan base allowances.
    fn plan_cap(plan: &str) -> i64 {
        match plan {
            "pro" => 150,
            "enterprise" => 300,
            _ => 50,
        }
    }

    pub async fn check_credit_available(&self, user_id: &str) -> Result<bool, DbError> {
        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT credits, credits_used_this_month, plan FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((credits, used, plan)) = row else { return Ok(false) };
        Ok((Self::plan_cap(&plan) - used) + credits > 0)
    }

    /// Atomic debit: spend the spare balance first, otherwise increment
    /// monthly usage up to the plan cap. Exactly one row mutates in one
    /// statement; a second concurrent debit simply sees the new balance.
    pub async fn deduct_credit(
        &self,
        user_id: &str,
        candidate_id: Option<&str>,
    ) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let spare = sqlx::query("UPDATE users SET credits = credits - 1 WHERE id = ? AND credits > 0")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let debited = if spare.rows_affected() == 1 {
            true
        } else {
            let monthly = sqlx::query(
                r#"
                UPDATE users SET credits_used_this_month = credits_used_this_month + 1
                WHERE id = ? AND credits_used_this_month <
                    CASE plan WHEN 'pro' THEN 150 WHEN 'enterprise' THEN 300 ELSE 50 END
                "#,
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            monthly.rows_affected() == 1
        };

        if !debited {
            tx.rollback().await?;
            tracing::warn!("[db] credit deduction failed for {} - insufficient credits", user_id);
            return Ok(false);
        }

        let balance: (i64,) = sqlx::query_as("SELECT credits FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO credit_transactions (user_id, type, amount, balance_after, description, candidate_id) \
             VALUES (?, 'usage', -1, ?, '이력서 분석', ?)",
        )
        .bind(user_id)
        .bind(balance.0)
        .bind(candidate_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!("[db] credit deducted for user {}", user_id);
        Ok(true)
    }
}

fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(DatabaseService::normalize_phone("010-1234-5678").as_deref(), Some("01012345678"));
        assert_eq!(
            DatabaseService::normalize_phone("+82-10-1234-5678").as_deref(),
            Some("01012345678")
        );
        assert_eq!(DatabaseService::normalize_phone("123"), None);
    }

    #[test]
    fn test_phone_prefix() {
        assert_eq!(DatabaseService::phone_prefix("010-1234-5678").as_deref(), Some("1234"));
        assert_eq!(DatabaseService::phone_prefix("12"), None);
    }

    #[test]
    fn test_name_hashes_deterministic() {
        let a = DatabaseService::name_phone_hash("김 철수", "010-1234-5678").unwrap();
        let b = DatabaseService::name_phone_hash("김철수", "01012345678").unwrap();
        assert_eq!(a, b);

        let c = DatabaseService::name_birth_hash("Kim Chulsoo", 1990);
        let d = DatabaseService::name_birth_hash("kimchulsoo", 1990);
        assert_eq!(c, d);
        assert_ne!(c, DatabaseService::name_birth_hash("kimchulsoo", 1991));
    }

    #[test]
    fn test_plan_caps() {
        assert_eq!(DatabaseService::plan_cap("starter"), 50);
        assert_eq!(DatabaseService::plan_cap("pro"), 150);
        assert_eq!(DatabaseService::plan_cap("enterprise"), 300);
        assert_eq!(DatabaseService::plan_cap("unknown"), 50);
    }
}
