//! PII masking and field encryption.
//!
//! Masking keeps records displayable (phone keeps first block + last 4,
//! email keeps 2 leading chars + domain, address keeps 2 tokens). Contact
//! originals are stored AES-256-GCM encrypted with a per-record salt;
//! deterministic SHA-256 hashes back the dedup waterfall.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::utils::normalize_digits;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;

static PHONE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"010[-.\s]?\d{4}[-.\s]?\d{4}",
        r"01[1-9][-.\s]?\d{3,4}[-.\s]?\d{4}",
        r"0\d{1,2}[-.\s]?\d{3,4}[-.\s]?\d{4}",
        r"\+82[-.\s]?10[-.\s]?\d{4}[-.\s]?\d{4}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});
static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}").expect("static regex")
});
static SSN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{6}[-.\s]?[1-4]\d{6}").expect("static regex"));
static CARD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}[-.\s]?\d{4}[-.\s]?\d{4}[-.\s]?\d{4}").expect("static regex"));
static PASSPORT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{1,2}\d{7,8}\b").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Phone,
    Email,
    Ssn,
    Card,
    Address,
    Passport,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PiiMatch {
    pub pii_type: PiiType,
    pub masked: String,
}

#[derive(Debug)]
pub struct PrivacyResult {
    pub masked_data: Value,
    pub pii_found: Vec<PiiMatch>,
    /// field -> base64(salt || nonce || ciphertext+tag)
    pub encrypted_store: HashMap<String, String>,
    pub warnings: Vec<String>,
}

impl PrivacyResult {
    pub fn pii_types(&self) -> Vec<PiiType> {
        let mut types: Vec<PiiType> = self.pii_found.iter().map(|m| m.pii_type).collect();
        types.sort_by_key(|t| format!("{:?}", t));
        types.dedup();
        types
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrivacyError {
    #[error("encryption key not configured")]
    NoKey,
    #[error("invalid master key: {0}")]
    InvalidKey(&'static str),
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("invalid base64 payload")]
    BadEncoding,
}

pub struct PrivacyService {
    master_key: Option<Vec<u8>>,
}

impl PrivacyService {
    /// `master_key` is either 64 hex chars or a raw 32 byte string; empty
    /// disables encryption (masking and hashing still work).
    pub fn new(master_key: &str) -> Result<Self, PrivacyError> {
        if master_key.is_empty() {
            tracing::warn!("[privacy] no encryption key configured - encryption disabled");
            return Ok(Self { master_key: None });
        }

        let bytes = if master_key.len() == 64 {
            hex::decode(master_key).map_err(|_| PrivacyError::InvalidKey("bad hex"))?
        } else if master_key.len() == KEY_SIZE {
            master_key.as_bytes().to_vec()
        } else {
            return Err(PrivacyError::InvalidKey("must be 64 hex chars or 32 bytes"));
        };

        Ok(Self { master_key: Some(bytes) })
    }

    pub fn can_encrypt(&self) -> bool {
        self.master_key.is_some()
    }

    // ========================================================================
    // Record processing
    // ========================================================================

    /// Mask contact fields, scan nested text for stray PII, and encrypt the
    /// originals of phone/email/address.
    pub fn process(&self, data: &Value) -> PrivacyResult {
        let mut masked_data = data.clone();
        let mut pii_found = Vec::new();
        let mut encrypted_store = HashMap::new();
        let mut warnings = Vec::new();

        for field in ["phone", "email", "address"] {
            let Some(original) = data.get(field).and_then(Value::as_str) else { continue };
            if original.is_empty() {
                continue;
            }

            let (masked, matched) = match field {
                "phone" => mask_phone(original),
                "email" => mask_email(original),
                _ => mask_address(original),
            };

            if let Some(matched) = matched {
                pii_found.push(matched);
            }
            masked_data[field] = Value::String(masked);

            if self.can_encrypt() {
                match self.encrypt(original) {
                    Ok(ciphertext) => {
                        encrypted_store.insert(field.to_string(), ciphertext);
                    },
                    Err(e) => warnings.push(format!("failed to encrypt {}: {}", field, e)),
                }
            }
        }

        // Stray PII inside free text
        if let Some(summary) = masked_data.get("summary").and_then(Value::as_str) {
            let (scanned, matches) = scan_and_mask_text(summary);
            if !matches.is_empty() {
                warnings.push("PII detected in summary".to_string());
                pii_found.extend(matches);
                masked_data["summary"] = Value::String(scanned);
            }
        }

        for list_field in ["careers", "projects"] {
            if let Some(items) = masked_data.get_mut(list_field).and_then(Value::as_array_mut) {
                for item in items {
                    let Some(description) = item.get("description").and_then(Value::as_str) else {
                        continue;
                    };
                    let (scanned, matches) = scan_and_mask_text(description);
                    if !matches.is_empty() {
                        pii_found.extend(matches);
                        item["description"] = Value::String(scanned);
                    }
                }
            }
        }

        PrivacyResult { masked_data, pii_found, encrypted_store, warnings }
    }

    // ========================================================================
    // AES-256-GCM
    // ========================================================================

    /// Wire format: base64(salt || nonce || ciphertext+tag). Salt and nonce
    /// are random per call; the AES key is PBKDF2-HMAC-SHA256 derived from
    /// the master key and the salt.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, PrivacyError> {
        let master = self.master_key.as_ref().ok_or(PrivacyError::NoKey)?;

        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = derive_key(master, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| PrivacyError::DecryptFailed)?;

        let mut payload = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&salt);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, PrivacyError> {
        let master = self.master_key.as_ref().ok_or(PrivacyError::NoKey)?;

        let payload = BASE64.decode(encoded).map_err(|_| PrivacyError::BadEncoding)?;
        if payload.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(PrivacyError::CiphertextTooShort);
        }

        let (salt, rest) = payload.split_at(SALT_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let key = derive_key(master, salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PrivacyError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| PrivacyError::DecryptFailed)
    }

    // ========================================================================
    // Dedup hashes
    // ========================================================================

    /// Deterministic key: SHA-256 of the lower-cased, whitespace-stripped
    /// value, first 16 hex chars.
    pub fn hash_for_dedup(&self, value: &str) -> String {
        let normalized: String =
            value.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
        let digest = Sha256::digest(normalized.as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

fn derive_key(master: &[u8], salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(master, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

// ============================================================================
// Masking
// ============================================================================

/// 010-1234-5678 -> 010-****-5678
pub fn mask_phone(phone: &str) -> (String, Option<PiiMatch>) {
    let digits = normalize_digits(phone);
    if digits.len() < 10 {
        return (phone.to_string(), None);
    }

    let masked = match digits.len() {
        11 => format!("{}-****-{}", &digits[..3], &digits[7..]),
        10 => format!("{}-****-{}", &digits[..2], &digits[6..]),
        _ => format!("{}-****-{}", &digits[..3], &digits[digits.len() - 4..]),
    };
    let matched = PiiMatch { pii_type: PiiType::Phone, masked: masked.clone() };
    (masked, Some(matched))
}

/// user@example.com -> us**@example.com
pub fn mask_email(email: &str) -> (String, Option<PiiMatch>) {
    let Some((local, domain)) = email.split_once('@') else {
        return (email.to_string(), None);
    };

    let masked_local = if local.chars().count() <= 2 {
        format!("{}*", local.chars().next().unwrap_or('*'))
    } else {
        let visible: String = local.chars().take(2).collect();
        let stars = "*".repeat(local.chars().count() - 2);
        format!("{}{}", visible, stars)
    };

    let masked = format!("{}@{}", masked_local, domain);
    let matched = PiiMatch { pii_type: PiiType::Email, masked: masked.clone() };
    (masked, Some(matched))
}

/// Keep the first two whitespace-delimited tokens, star the rest.
pub fn mask_address(address: &str) -> (String, Option<PiiMatch>) {
    let parts: Vec<&str> = address.split_whitespace().collect();
    if parts.len() <= 2 {
        return (address.to_string(), None);
    }

    let mut tokens: Vec<String> = parts[..2].iter().map(|s| s.to_string()).collect();
    tokens.extend(parts[2..].iter().map(|p| "*".repeat(p.chars().count())));
    let masked = tokens.join(" ");
    let matched = PiiMatch { pii_type: PiiType::Address, masked: masked.clone() };
    (masked, Some(matched))
}

/// Scan free text for SSN / phone / email / card / passport patterns and
/// mask in place.
pub fn scan_and_mask_text(text: &str) -> (String, Vec<PiiMatch>) {
    let mut masked_text = text.to_string();
    let mut matches = Vec::new();

    for m in SSN_PATTERN.find_iter(text) {
        let original = m.as_str();
        let masked = format!("{}-*******", &original[..6]);
        masked_text = masked_text.replace(original, &masked);
        matches.push(PiiMatch { pii_type: PiiType::Ssn, masked });
    }

    for pattern in PHONE_PATTERNS.iter() {
        let found: Vec<String> =
            pattern.find_iter(&masked_text).map(|m| m.as_str().to_string()).collect();
        for original in found {
            let (masked, matched) = mask_phone(&original);
            if let Some(matched) = matched {
                masked_text = masked_text.replace(&original, &masked);
                matches.push(matched);
            }
        }
    }

    let found: Vec<String> =
        EMAIL_PATTERN.find_iter(&masked_text).map(|m| m.as_str().to_string()).collect();
    for original in found {
        let (masked, matched) = mask_email(&original);
        if let Some(matched) = matched {
            masked_text = masked_text.replace(&original, &masked);
            matches.push(matched);
        }
    }

    let found: Vec<String> =
        CARD_PATTERN.find_iter(&masked_text).map(|m| m.as_str().to_string()).collect();
    for original in found {
        let digits = normalize_digits(&original);
        if digits.len() == 16 {
            let masked = format!("{}-****-****-{}", &digits[..4], &digits[12..]);
            masked_text = masked_text.replace(&original, &masked);
            matches.push(PiiMatch { pii_type: PiiType::Card, masked });
        }
    }

    let found: Vec<String> =
        PASSPORT_PATTERN.find_iter(&masked_text).map(|m| m.as_str().to_string()).collect();
    for original in found {
        let visible: String = original.chars().take(2).collect();
        let masked = format!("{}{}", visible, "*".repeat(original.chars().count() - 2));
        masked_text = masked_text.replace(&original, &masked);
        matches.push(PiiMatch { pii_type: PiiType::Passport, masked });
    }

    (masked_text, matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> PrivacyService {
        PrivacyService::new(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let svc = service();
        for plaintext in ["", "010-1234-5678", "한글 텍스트", &"x".repeat(10_000)] {
            let encrypted = svc.encrypt(plaintext).unwrap();
            assert_eq!(svc.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_independent_salts_per_call() {
        let svc = service();
        let a = svc.encrypt("same value").unwrap();
        let b = svc.encrypt("same value").unwrap();
        assert_ne!(a, b);
        assert_eq!(svc.decrypt(&a).unwrap(), svc.decrypt(&b).unwrap());
    }

    #[test]
    fn test_short_payload_rejected() {
        let svc = service();
        let short = BASE64.encode([0u8; SALT_SIZE + NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(svc.decrypt(&short), Err(PrivacyError::CiphertextTooShort)));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let svc = service();
        let encrypted = svc.encrypt("secret").unwrap();
        let mut bytes = BASE64.decode(&encrypted).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let tampered = BASE64.encode(bytes);
        assert!(svc.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_dedup_hash_normalization() {
        let svc = service();
        assert_eq!(svc.hash_for_dedup("Kim@Example.COM"), svc.hash_for_dedup("kim@example.com "));
        assert_ne!(svc.hash_for_dedup("a@b.com"), svc.hash_for_dedup("b@a.com"));
        assert_eq!(svc.hash_for_dedup("x").len(), 16);
    }

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("010-1234-5678").0, "010-****-5678");
        assert_eq!(mask_phone("0212345678").0, "02-****-5678");
        assert_eq!(mask_phone("123").0, "123");
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("user@example.com").0, "us**@example.com");
        assert_eq!(mask_email("ab@x.io").0, "a*@x.io");
        assert_eq!(mask_email("not-an-email").0, "not-an-email");
    }

    #[test]
    fn test_mask_address_keeps_city() {
        let (masked, _) = mask_address("서울시 강남구 테헤란로 123 45동 678호");
        assert!(masked.starts_with("서울시 강남구"));
        assert!(!masked.contains("테헤란로"));
    }

    #[test]
    fn test_scan_masks_nested_descriptions() {
        let svc = service();
        let data = json!({
            "phone": "010-1234-5678",
            "email": "kim@example.com",
            "summary": "연락처는 010-1234-5678 입니다",
            "careers": [
                {"company": "Acme", "description": "문의: admin@acme.com"}
            ],
            "projects": []
        });

        let result = svc.process(&data);
        assert_eq!(result.masked_data["phone"], "010-****-5678");
        assert_eq!(result.masked_data["email"], "ki*@example.com");
        assert!(!result.masked_data["summary"].as_str().unwrap().contains("010-1234-5678"));
        assert!(
            !result.masked_data["careers"][0]["description"]
                .as_str()
                .unwrap()
                .contains("admin@acme.com")
        );
        assert!(result.encrypted_store.contains_key("phone"));
        assert!(result.encrypted_store.contains_key("email"));

        // Originals recoverable
        assert_eq!(svc.decrypt(&result.encrypted_store["phone"]).unwrap(), "010-1234-5678");
    }

    #[test]
    fn test_card_number_masking() {
        let (masked, matches) = scan_and_mask_text("카드번호 1234-5678-9012-3456 으로 결제");
        assert!(masked.contains("1234-****-****-3456"));
        assert!(matches.iter().any(|m| m.pii_type == PiiType::Card));
    }

    #[test]
    fn test_no_key_disables_encryption_only() {
        let svc = PrivacyService::new("").unwrap();
        assert!(!svc.can_encrypt());
        assert!(svc.encrypt("x").is_err());
        // Masking and hashing still work
        assert_eq!(svc.hash_for_dedup("v").len(), 16);
        let result = svc.process(&json!({"phone": "010-1234-5678"}));
        assert_eq!(result.masked_data["phone"], "010-****-5678");
        assert!(result.encrypted_store.is_empty());
    }
}
