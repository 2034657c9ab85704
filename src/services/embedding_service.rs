//! Semantic chunking and vector embedding.
//!
//! Chunk layout per candidate: one summary, one per career, one per
//! project, one skill, one education, one bounded raw_full and a sliding
//! window of raw_section chunks. Hangul-dominant text gets a wider window.
//! Embeddings are requested in one batch; failed chunks are retried
//! individually with exponential back-off under a monotonic deadline.

use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};

use crate::config::{ChunkingConfig, LlmConfig};
use crate::utils::{hangul_ratio, truncate_chars};

pub const EMBEDDING_DIMENSIONS: usize = 1536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Summary,
    Career,
    Project,
    Skill,
    Education,
    RawFull,
    RawSection,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Career => "career",
            Self::Project => "project",
            Self::Skill => "skill",
            Self::Education => "education",
            Self::RawFull => "raw_full",
            Self::RawSection => "raw_section",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_type: ChunkType,
    pub chunk_index: u32,
    pub content: String,
    pub metadata: Value,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Default)]
pub struct EmbeddingOutcome {
    pub success: bool,
    pub chunks: Vec<Chunk>,
    pub total_tokens: u64,
    pub total_chunks: usize,
    pub embedded_chunks: usize,
    pub failed_chunks: usize,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl EmbeddingOutcome {
    /// At least one chunk embedded and at least one failed.
    pub fn is_partial_success(&self) -> bool {
        self.success && self.failed_chunks > 0
    }
}

pub struct EmbeddingService {
    http_client: Client,
    api_key: String,
    model: String,
    base_url: String,
    chunking: ChunkingConfig,
}

impl EmbeddingService {
    pub fn new(http_client: Client, llm: &LlmConfig, chunking: ChunkingConfig) -> Self {
        if llm.openai_api_key.is_empty() {
            tracing::warn!("[embedding] no API key configured - embedding disabled");
        }
        Self {
            http_client,
            api_key: llm.openai_api_key.clone(),
            model: llm.embedding_model.clone(),
            base_url: llm.openai_base_url.clone(),
            chunking,
        }
    }

    pub fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Chunk the candidate payload (plus raw text) and embed every chunk.
    pub async fn process_candidate(
        &self,
        data: &Value,
        generate_embeddings: bool,
        raw_text: Option<&str>,
    ) -> EmbeddingOutcome {
        let mut chunks = self.create_chunks(data, raw_text);

        if chunks.is_empty() {
            // Even an empty payload gets one searchable fallback chunk
            chunks.push(Chunk {
                chunk_type: ChunkType::Summary,
                chunk_index: 0,
                content: "이력서 데이터".to_string(),
                metadata: json!({"fallback": true}),
                embedding: None,
            });
        }

        let mut outcome = EmbeddingOutcome {
            success: true,
            total_chunks: chunks.len(),
            ..Default::default()
        };

        if raw_text.map(|t| t.chars().count() > self.chunking.max_raw_full_chars).unwrap_or(false) {
            outcome.warnings.push(format!(
                "TRUNCATION: raw text exceeds {} chars; tail excluded from raw_full",
                self.chunking.max_raw_full_chars
            ));
        }

        if !generate_embeddings {
            outcome.chunks = chunks;
            return outcome;
        }
        if !self.is_available() {
            outcome.warnings.push("embedding client not configured".to_string());
            outcome.chunks = chunks;
            return outcome;
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        outcome.total_tokens = texts.iter().map(|t| estimate_tokens(t)).sum();

        let embeddings = self.create_embeddings_batch(&texts).await;
        let mut failed_indices = Vec::new();
        for (i, embedding) in embeddings.into_iter().enumerate() {
            match embedding {
                Some(vector) => {
                    chunks[i].embedding = Some(vector);
                    outcome.embedded_chunks += 1;
                },
                None => failed_indices.push(i),
            }
        }

        // Individual retries for chunks the batch failed on
        for index in failed_indices {
            match self.create_embedding_with_retry(&chunks[index].content).await {
                Some(vector) => {
                    chunks[index].embedding = Some(vector);
                    outcome.embedded_chunks += 1;
                    tracing::info!("[embedding] chunk {} succeeded on retry", index);
                },
                None => {
                    outcome.failed_chunks += 1;
                    tracing::warn!("[embedding] chunk {} failed after retries", index);
                },
            }
        }

        if outcome.failed_chunks > 0 {
            if outcome.embedded_chunks == 0 {
                outcome.success = false;
                outcome.error = Some("all chunks failed to embed".to_string());
            } else {
                outcome.warnings.push(format!(
                    "{} chunks failed to embed and are excluded from search",
                    outcome.failed_chunks
                ));
            }
        }

        outcome.chunks = chunks;
        outcome
    }

    // ========================================================================
    // Embedding calls
    // ========================================================================

    async fn create_embeddings_batch(&self, texts: &[&str]) -> Vec<Option<Vec<f32>>> {
        let truncated: Vec<&str> = texts.iter().map(|t| truncate_chars(t, 8000)).collect();
        match self.request_embeddings(&truncated).await {
            Ok(vectors) => vectors,
            Err(error) => {
                tracing::error!("[embedding] batch request failed: {}", error);
                vec![None; texts.len()]
            },
        }
    }

    /// Plain retry loop bounded by a monotonic deadline; delays follow the
    /// standard back-off shape (base 1s, doubled, jittered, capped).
    async fn create_embedding_with_retry(&self, text: &str) -> Option<Vec<f32>> {
        let deadline = Instant::now() + Duration::from_secs_f64(
            self.chunking.retry_max_wait_secs * (self.chunking.max_embedding_retries as f64 + 1.0),
        );

        for attempt in 0..=self.chunking.max_embedding_retries {
            match self.request_embeddings(&[truncate_chars(text, 8000)]).await {
                Ok(mut vectors) => {
                    if let Some(Some(vector)) = vectors.pop() {
                        return Some(vector);
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        "[embedding] retry {}/{}: {}",
                        attempt + 1,
                        self.chunking.max_embedding_retries,
                        error
                    );
                },
            }

            if attempt >= self.chunking.max_embedding_retries {
                break;
            }
            let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
            let delay = (self.chunking.retry_base_wait_secs * 2f64.powi(attempt as i32) + jitter)
                .min(self.chunking.retry_max_wait_secs);
            if Instant::now() + Duration::from_secs_f64(delay) > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        None
    }

    async fn request_embeddings(&self, inputs: &[&str]) -> Result<Vec<Option<Vec<f32>>>, String> {
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingItem>,
        }
        #[derive(Deserialize)]
        struct EmbeddingItem {
            index: usize,
            embedding: Vec<f32>,
        }

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(60))
            .json(&json!({"model": self.model, "input": inputs}))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("API error {}: {:.200}", status, body));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| e.to_string())?;
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        for item in parsed.data {
            if item.index < vectors.len() && item.embedding.len() == EMBEDDING_DIMENSIONS {
                vectors[item.index] = Some(item.embedding);
            }
        }
        Ok(vectors)
    }

    // ========================================================================
    // Chunker
    // ========================================================================

    pub fn create_chunks(&self, data: &Value, raw_text: Option<&str>) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        if let Some(chunk) = self.build_summary_chunk(data) {
            chunks.push(chunk);
        }
        chunks.extend(self.build_career_chunks(data));
        chunks.extend(self.build_project_chunks(data));
        if let Some(chunk) = self.build_skill_chunk(data) {
            chunks.push(chunk);
        }
        if let Some(chunk) = self.build_education_chunk(data) {
            chunks.push(chunk);
        }
        if let Some(raw_text) = raw_text {
            chunks.extend(self.build_raw_text_chunks(raw_text));
        }

        chunks
    }

    fn build_summary_chunk(&self, data: &Value) -> Option<Chunk> {
        let mut parts = Vec::new();

        if let Some(name) = data.get("name").and_then(Value::as_str) {
            parts.push(format!("이름: {}", name));
        }
        if let Some(years) = data.get("exp_years").and_then(Value::as_f64) {
            parts.push(format!("총 경력: {}년", years));
        }
        if let Some(company) = data.get("last_company").and_then(Value::as_str) {
            parts.push(format!("최근 직장: {}", company));
        }
        if let Some(position) = data.get("last_position").and_then(Value::as_str) {
            parts.push(format!("최근 직책: {}", position));
        }
        if let Some(summary) = data.get("summary").and_then(Value::as_str) {
            parts.push(format!("\n요약: {}", summary));
        }
        if let Some(strengths) = data.get("strengths").and_then(Value::as_array) {
            let items: Vec<&str> = strengths.iter().filter_map(Value::as_str).collect();
            if !items.is_empty() {
                parts.push(format!("\n강점: {}", items.join(", ")));
            }
        }
        if let Some(skills) = data.get("skills").and_then(Value::as_array) {
            let top: Vec<&str> = skills.iter().filter_map(Value::as_str).take(5).collect();
            if !top.is_empty() {
                parts.push(format!("\n핵심 기술: {}", top.join(", ")));
            }
        }

        let content = parts.join("\n");
        if content.trim().is_empty() {
            return None;
        }

        Some(Chunk {
            chunk_type: ChunkType::Summary,
            chunk_index: 0,
            content: truncate_chars(&content, self.chunking.max_structured_chunk_chars).to_string(),
            metadata: json!({
                "name": data.get("name"),
                "exp_years": data.get("exp_years"),
                "last_company": data.get("last_company"),
            }),
            embedding: None,
        })
    }

    fn build_career_chunks(&self, data: &Value) -> Vec<Chunk> {
        let Some(careers) = data.get("careers").and_then(Value::as_array) else {
            return Vec::new();
        };

        careers
            .iter()
            .enumerate()
            .filter_map(|(i, career)| {
                let mut parts = Vec::new();
                let company = career.get("company").and_then(Value::as_str).unwrap_or("");
                if !company.is_empty() {
                    parts.push(format!("회사: {}", company));
                }
                if let Some(position) = career.get("position").and_then(Value::as_str) {
                    parts.push(format!("직책: {}", position));
                }
                if let Some(department) = career.get("department").and_then(Value::as_str) {
                    parts.push(format!("부서: {}", department));
                }

                let start = career.get("start_date").and_then(Value::as_str).unwrap_or("");
                let is_current =
                    career.get("is_current").and_then(Value::as_bool).unwrap_or(false);
                let end = career
                    .get("end_date")
                    .and_then(Value::as_str)
                    .unwrap_or(if is_current { "현재" } else { "" });
                if !start.is_empty() || !end.is_empty() {
                    parts.push(format!("기간: {} ~ {}", start, end));
                }

                if let Some(description) = career.get("description").and_then(Value::as_str) {
                    parts.push(format!("\n업무 내용:\n{}", description));
                }

                let content = parts.join("\n");
                if content.trim().is_empty() {
                    return None;
                }

                Some(Chunk {
                    chunk_type: ChunkType::Career,
                    chunk_index: i as u32,
                    content: truncate_chars(&content, self.chunking.max_structured_chunk_chars)
                        .to_string(),
                    metadata: json!({
                        "company": company,
                        "position": career.get("position"),
                        "is_current": is_current,
                    }),
                    embedding: None,
                })
            })
            .collect()
    }

    fn build_project_chunks(&self, data: &Value) -> Vec<Chunk> {
        let Some(projects) = data.get("projects").and_then(Value::as_array) else {
            return Vec::new();
        };

        projects
            .iter()
            .enumerate()
            .filter_map(|(i, project)| {
                let mut parts = Vec::new();
                let name = project.get("name").and_then(Value::as_str).unwrap_or("");
                if !name.is_empty() {
                    parts.push(format!("프로젝트: {}", name));
                }
                if let Some(role) = project.get("role").and_then(Value::as_str) {
                    parts.push(format!("역할: {}", role));
                }
                if let Some(period) = project.get("period").and_then(Value::as_str) {
                    parts.push(format!("기간: {}", period));
                }
                if let Some(technologies) = project.get("technologies").and_then(Value::as_array) {
                    let items: Vec<&str> =
                        technologies.iter().filter_map(Value::as_str).collect();
                    if !items.is_empty() {
                        parts.push(format!("기술: {}", items.join(", ")));
                    }
                }
                if let Some(description) = project.get("description").and_then(Value::as_str) {
                    parts.push(format!("\n설명:\n{}", description));
                }

                let content = parts.join("\n");
                if content.trim().is_empty() {
                    return None;
                }

                Some(Chunk {
                    chunk_type: ChunkType::Project,
                    chunk_index: i as u32,
                    content: truncate_chars(&content, self.chunking.max_structured_chunk_chars)
                        .to_string(),
                    metadata: json!({
                        "project_name": name,
                        "role": project.get("role"),
                    }),
                    embedding: None,
                })
            })
            .collect()
    }

    fn build_skill_chunk(&self, data: &Value) -> Option<Chunk> {
        let skills: Vec<&str> = data
            .get("skills")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(Value::as_str)
            .collect();
        if skills.is_empty() {
            return None;
        }

        let categorized = categorize_skills(&skills);
        let mut parts = vec!["기술 스택".to_string()];
        for (category, members) in &categorized {
            parts.push(format!("\n{}: {}", category, members.join(", ")));
        }

        Some(Chunk {
            chunk_type: ChunkType::Skill,
            chunk_index: 0,
            content: truncate_chars(&parts.join("\n"), self.chunking.max_structured_chunk_chars)
                .to_string(),
            metadata: json!({
                "skill_count": skills.len(),
                "skills": skills.iter().take(20).collect::<Vec<_>>(),
            }),
            embedding: None,
        })
    }

    fn build_education_chunk(&self, data: &Value) -> Option<Chunk> {
        let mut parts = Vec::new();

        if let Some(level) = data.get("education_level").and_then(Value::as_str) {
            parts.push(format!("최종 학력: {}", level));
        }
        if let Some(school) = data.get("education_school").and_then(Value::as_str) {
            parts.push(format!("학교: {}", school));
        }
        if let Some(major) = data.get("education_major").and_then(Value::as_str) {
            parts.push(format!("전공: {}", major));
        }

        if let Some(educations) = data.get("educations").and_then(Value::as_array) {
            if !educations.is_empty() {
                parts.push("\n학력 상세:".to_string());
                for education in educations {
                    let mut line = Vec::new();
                    for key in ["school", "major", "degree"] {
                        if let Some(value) = education.get(key).and_then(Value::as_str) {
                            line.push(value.to_string());
                        }
                    }
                    if let Some(year) = education.get("graduation_year").and_then(Value::as_i64) {
                        line.push(format!("({})", year));
                    }
                    if !line.is_empty() {
                        parts.push(format!("- {}", line.join(" / ")));
                    }
                }
            }
        }

        let content = parts.join("\n");
        if content.trim().is_empty() {
            return None;
        }

        Some(Chunk {
            chunk_type: ChunkType::Education,
            chunk_index: 0,
            content: truncate_chars(&content, self.chunking.max_structured_chunk_chars).to_string(),
            metadata: json!({
                "education_level": data.get("education_level"),
                "school": data.get("education_school"),
            }),
            embedding: None,
        })
    }

    fn build_raw_text_chunks(&self, raw_text: &str) -> Vec<Chunk> {
        let cfg = &self.chunking;
        let total_chars = raw_text.chars().count();
        if raw_text.trim().chars().count() < cfg.raw_text_min_length {
            return Vec::new();
        }

        let mut chunks = Vec::new();

        // raw_full, bounded
        let truncated = total_chars > cfg.max_raw_full_chars;
        if truncated {
            tracing::warn!(
                "[embedding] TRUNCATION: raw text is {} chars, {} excluded from raw_full",
                total_chars,
                total_chars - cfg.max_raw_full_chars
            );
        }
        chunks.push(Chunk {
            chunk_type: ChunkType::RawFull,
            chunk_index: 0,
            content: truncate_chars(raw_text, cfg.max_raw_full_chars).to_string(),
            metadata: json!({
                "original_length": total_chars,
                "truncated": truncated,
                "truncated_chars": total_chars.saturating_sub(cfg.max_raw_full_chars),
            }),
            embedding: None,
        });

        // raw_section sliding window; Hangul-dominant text widens it
        let korean = hangul_ratio(raw_text) >= cfg.korean_threshold;
        let (window, overlap) = if korean {
            (cfg.korean_chunk_size, cfg.korean_overlap)
        } else {
            (cfg.raw_section_chunk_size, cfg.raw_section_overlap)
        };

        if total_chars > window {
            let all_chars: Vec<char> = raw_text.chars().collect();
            let stride = window - overlap;
            let mut section_index = 0u32;
            let mut start = 0usize;
            while start < total_chars {
                let end = (start + window).min(total_chars);
                let section: String = all_chars[start..end].iter().collect();
                if section.trim().chars().count() >= cfg.raw_section_min_length {
                    chunks.push(Chunk {
                        chunk_type: ChunkType::RawSection,
                        chunk_index: section_index,
                        content: section,
                        metadata: json!({
                            "start_pos": start,
                            "end_pos": end,
                            "is_korean_optimized": korean,
                        }),
                        embedding: None,
                    });
                    section_index += 1;
                }
                if end == total_chars {
                    break;
                }
                start += stride;
            }
        }

        chunks
    }
}

/// Token estimate without a tokenizer: Hangul counts 2.5, everything else
/// a quarter token per char.
pub fn estimate_tokens(text: &str) -> u64 {
    let korean = text.chars().filter(|c| ('\u{AC00}'..='\u{D7A3}').contains(c)).count();
    let other = text.chars().count() - korean;
    (korean as f64 * 2.5 + other as f64 / 4.0) as u64
}

/// Bucket skills into coarse categories for the skill chunk.
fn categorize_skills<'a>(skills: &[&'a str]) -> Vec<(&'static str, Vec<&'a str>)> {
    const PROGRAMMING: [&str; 12] = [
        "python", "java", "javascript", "typescript", "c++", "c#", "go", "rust", "kotlin",
        "swift", "php", "ruby",
    ];
    const FRAMEWORKS: [&str; 10] = [
        "react", "vue", "angular", "next.js", "spring", "django", "flask", "fastapi", "express",
        "node.js",
    ];
    const DATABASES: [&str; 7] =
        ["mysql", "postgresql", "mongodb", "redis", "oracle", "sqlite", "elasticsearch"];
    const CLOUD: [&str; 8] =
        ["aws", "gcp", "azure", "docker", "kubernetes", "terraform", "jenkins", "ci/cd"];

    let mut buckets: Vec<(&'static str, Vec<&str>)> = vec![
        ("프로그래밍", Vec::new()),
        ("프레임워크", Vec::new()),
        ("데이터베이스", Vec::new()),
        ("클라우드/인프라", Vec::new()),
        ("기타", Vec::new()),
    ];

    for skill in skills {
        let lower = skill.to_lowercase();
        let index = if PROGRAMMING.iter().any(|p| lower.contains(p)) {
            0
        } else if FRAMEWORKS.iter().any(|f| lower.contains(f)) {
            1
        } else if DATABASES.iter().any(|d| lower.contains(d)) {
            2
        } else if CLOUD.iter().any(|c| lower.contains(c)) {
            3
        } else {
            4
        };
        buckets[index].1.push(skill);
    }

    buckets.retain(|(_, members)| !members.is_empty());
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EmbeddingService {
        EmbeddingService::new(Client::new(), &LlmConfig::default(), ChunkingConfig::default())
    }

    fn sample_data() -> Value {
        json!({
            "name": "김철수",
            "exp_years": 7.0,
            "last_company": "네이버",
            "last_position": "백엔드 리드",
            "summary": "대규모 트래픽 처리 경험이 풍부한 백엔드 엔지니어",
            "strengths": ["설계", "성능 최적화"],
            "skills": ["Rust", "Python", "PostgreSQL", "AWS", "협상"],
            "careers": [
                {"company": "네이버", "position": "리드", "start_date": "2020-01", "is_current": true,
                 "description": "검색 인프라 운영"},
                {"company": "스타트업", "position": "개발자", "start_date": "2017-01", "end_date": "2019-12"}
            ],
            "projects": [
                {"name": "검색 고도화", "role": "리드", "technologies": ["Rust"], "description": "지연시간 50% 개선"}
            ],
            "educations": [{"school": "서울대", "major": "컴퓨터공학", "degree": "Bachelor"}],
            "education_level": "Bachelor"
        })
    }

    #[test]
    fn test_chunk_composition() {
        let chunks = service().create_chunks(&sample_data(), None);
        let count = |t: ChunkType| chunks.iter().filter(|c| c.chunk_type == t).count();

        assert_eq!(count(ChunkType::Summary), 1);
        assert_eq!(count(ChunkType::Career), 2);
        assert_eq!(count(ChunkType::Project), 1);
        assert_eq!(count(ChunkType::Skill), 1);
        assert_eq!(count(ChunkType::Education), 1);
        assert_eq!(count(ChunkType::RawFull), 0);
    }

    #[test]
    fn test_raw_chunk_count_matches_window_formula() {
        // Non-Korean text so window=1500 overlap=300
        let text = "a".repeat(5000);
        let chunks = service().create_chunks(&json!({}), Some(&text));

        let raw_full = chunks.iter().filter(|c| c.chunk_type == ChunkType::RawFull).count();
        let sections: Vec<&Chunk> =
            chunks.iter().filter(|c| c.chunk_type == ChunkType::RawSection).collect();
        assert_eq!(raw_full, 1);

        // ceil((5000 - 1500) / 1200) + 1 boundary sections, minus any below
        // the minimum length; the tail (5000-4800=200) survives
        assert_eq!(sections.len(), 4);

        // Coverage: sections start at stride multiples and overlap by 300
        for (i, section) in sections.iter().enumerate() {
            assert_eq!(section.metadata["start_pos"], json!(i * 1200));
        }
    }

    #[test]
    fn test_korean_text_uses_wide_window() {
        let text = "가".repeat(4000);
        let chunks = service().create_chunks(&json!({}), Some(&text));
        let section = chunks.iter().find(|c| c.chunk_type == ChunkType::RawSection).unwrap();
        assert_eq!(section.metadata["is_korean_optimized"], json!(true));
        assert_eq!(section.content.chars().count(), 2000);
    }

    #[test]
    fn test_raw_full_truncated_with_metadata() {
        let text = "b".repeat(9000);
        let chunks = service().create_chunks(&json!({}), Some(&text));
        let raw_full = chunks.iter().find(|c| c.chunk_type == ChunkType::RawFull).unwrap();
        assert_eq!(raw_full.content.chars().count(), 8000);
        assert_eq!(raw_full.metadata["truncated"], json!(true));
        assert_eq!(raw_full.metadata["truncated_chars"], json!(1000));
    }

    #[test]
    fn test_short_raw_text_skipped() {
        let chunks = service().create_chunks(&json!({}), Some("too short"));
        assert!(chunks.iter().all(|c| c.chunk_type != ChunkType::RawFull));
    }

    #[test]
    fn test_token_estimate() {
        // 4 Hangul chars -> 10 tokens
        assert_eq!(estimate_tokens("가나다라"), 10);
        // 8 ASCII chars -> 2 tokens
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_skill_categorization() {
        let buckets = categorize_skills(&["Rust", "React", "PostgreSQL", "AWS", "협상"]);
        let names: Vec<&str> = buckets.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec!["프로그래밍", "프레임워크", "데이터베이스", "클라우드/인프라", "기타"]
        );
    }

    #[tokio::test]
    async fn test_process_without_embeddings() {
        let outcome = service().process_candidate(&sample_data(), false, None).await;
        assert!(outcome.success);
        assert!(outcome.total_chunks >= 5);
        assert_eq!(outcome.embedded_chunks, 0);
        assert!(!outcome.is_partial_success());
    }

    #[tokio::test]
    async fn test_empty_payload_gets_fallback_chunk() {
        let outcome = service().process_candidate(&json!({}), false, None).await;
        assert_eq!(outcome.total_chunks, 1);
        assert_eq!(outcome.chunks[0].chunk_type, ChunkType::Summary);
        assert_eq!(outcome.chunks[0].metadata["fallback"], json!(true));
    }
}
