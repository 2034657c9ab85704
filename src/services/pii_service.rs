//! Regex-based PII extraction. No network calls.
//!
//! Name resolution order: filename, then the first 200 characters of the
//! text, excluding a blacklist of section headings. Phone numbers are
//! normalized to digits and re-hyphenated into a canonical form.

use once_cell::sync::Lazy;
use regex::Regex;

use super::pipeline::layers::{PiiSource, PiiStore};
use crate::utils::normalize_digits;

static KOREAN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[가-힣]{2,4}$").expect("static regex"));
static LATIN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]+(?:[\s\-.][A-Za-z]+)+$").expect("static regex"));
static KOREAN_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[가-힣]{2,4}").expect("static regex"));
static PHONE: Lazy<Regex> = Lazy::new(|| {
    // Mobile formats: domestic 01x, international +82, 9-12 digits total
    Regex::new(r"(?:\+?82[\s\-.]?)?0?1[0-9][\s\-.]?\d{3,4}[\s\-.]?\d{4}").expect("static regex")
});
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}").expect("static regex")
});
static FILENAME_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[_\-\s]*(이력서|경력기술서|자기소개서|지원서|resume|cv|履歴書|简历).*")
        .expect("static regex")
});
static FILENAME_SERIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_\d{6,}.*$").expect("static regex"));
static EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(pdf|hwpx?|docx?)$").expect("static regex"));

/// Section headings and label words that must not be mistaken for a name.
const NAME_BLACKLIST: [&str; 16] = [
    "이력서", "경력서", "자기소", "개서", "성명", "이름", "생년월", "휴대폰", "이메일", "주소",
    "경력", "학력", "기술", "자격", "프로", "젝트",
];

/// Extract name, phone and email into the store. Confidence per source:
/// filename 0.85, text header 0.70, phone 0.90, email 0.95.
pub fn extract_into(store: &mut PiiStore, text: &str, filename: Option<&str>) {
    extract_name(store, text, filename);
    extract_phone(store, text);
    extract_email(store, text);
    store.extracted_at = Some(chrono::Utc::now());

    tracing::info!(
        "[pii] extracted - name: {}, phone: {}, email: {}",
        store.name.is_some(),
        store.phone.is_some(),
        store.email.is_some()
    );
}

fn extract_name(store: &mut PiiStore, text: &str, filename: Option<&str>) {
    // 1. Filename
    if let Some(filename) = filename {
        if let Some(candidate) = name_from_filename(filename) {
            store.name = Some(candidate);
            store.name_confidence = 0.85;
            store.name_source = Some(PiiSource::Filename);
            return;
        }
    }

    // 2. First 200 characters of the text
    let head: String = text.chars().take(200).collect();
    for token in KOREAN_TOKEN.find_iter(&head) {
        let token = token.as_str();
        if !NAME_BLACKLIST.contains(&token) {
            store.name = Some(token.to_string());
            store.name_confidence = 0.70;
            store.name_source = Some(PiiSource::TextHeader);
            return;
        }
    }
}

fn name_from_filename(filename: &str) -> Option<String> {
    let without_ext = EXTENSION.replace(filename, "");
    let without_noise = FILENAME_NOISE.replace(&without_ext, "");
    let cleaned = FILENAME_SERIAL.replace(&without_noise, "");
    let candidate = cleaned.trim_matches(['_', '-', ' ']).to_string();

    if KOREAN_NAME.is_match(&candidate) || LATIN_NAME.is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

fn extract_phone(store: &mut PiiStore, text: &str) {
    if let Some(found) = PHONE.find(text) {
        if let Some(canonical) = canonicalize_phone(found.as_str()) {
            store.phone = Some(canonical);
            store.phone_confidence = 0.90;
        }
    }
}

/// Normalize to digits, fold +82 into the leading 0, then re-hyphenate.
pub fn canonicalize_phone(raw: &str) -> Option<String> {
    let mut digits = normalize_digits(raw);
    if digits.starts_with("82") && digits.len() >= 11 {
        digits = format!("0{}", &digits[2..]);
    }

    match digits.len() {
        11 => Some(format!("{}-{}-{}", &digits[..3], &digits[3..7], &digits[7..])),
        10 => Some(format!("{}-{}-{}", &digits[..3], &digits[3..6], &digits[6..])),
        9..=12 => Some(digits),
        _ => None,
    }
}

fn extract_email(store: &mut PiiStore, text: &str) {
    if let Some(found) = EMAIL.find(text) {
        store.email = Some(found.as_str().to_string());
        store.email_confidence = 0.95;
    }
}

// ============================================================================
// Multi-identity check
// ============================================================================

#[derive(Debug, Clone)]
pub struct IdentityCheck {
    pub person_count: usize,
    pub should_reject: bool,
    pub reason: String,
}

/// Detect documents carrying more than one person's identity: several
/// distinct mobile numbers combined with several distinct emails (or
/// several distinct header names) reject the document.
pub fn check_identities(text: &str) -> IdentityCheck {
    let mut phones: Vec<String> = PHONE
        .find_iter(text)
        .filter_map(|m| canonicalize_phone(m.as_str()))
        .collect();
    phones.sort();
    phones.dedup();

    let mut emails: Vec<String> =
        EMAIL.find_iter(text).map(|m| m.as_str().to_lowercase()).collect();
    emails.sort();
    emails.dedup();

    let head: String = text.chars().take(400).collect();
    let mut names: Vec<String> = KOREAN_TOKEN
        .find_iter(&head)
        .map(|m| m.as_str().to_string())
        .filter(|t| !NAME_BLACKLIST.contains(&t.as_str()))
        .collect();
    names.sort();
    names.dedup();

    let person_count = phones.len().max(emails.len()).max(1);
    let should_reject =
        (phones.len() >= 2 && emails.len() >= 2) || (phones.len() >= 2 && names.len() >= 2);

    let reason = if should_reject {
        format!(
            "{} distinct phones, {} distinct emails, {} candidate names",
            phones.len(),
            emails.len(),
            names.len()
        )
    } else {
        String::new()
    };

    IdentityCheck { person_count, should_reject, reason }
}
