//! Content-addressed identity for customers and uploaded files.
//!
//! The customer key is a SHA-256 over the best available contact field
//! (email > phone > internal id). The ingestion key binds a customer to the
//! exact bytes they sent, so the same upload always maps to the same key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HashError;

/// Country code assumed for national-format phone numbers.
pub const DEFAULT_COUNTRY_CODE: &str = "353";

/// Contact fields available for a customer. Any subset may be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerIdentity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Hex SHA-256 of a customer's normalized identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerKey(String);

impl CustomerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 over `customer_key || file_sha256`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestionKey(String);

impl IngestionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IngestionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IngestionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one (customer, file) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub file_sha256: String,
    pub ingestion_key: IngestionKey,
}

/// Computes customer and ingestion keys.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    default_country_code: String,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRY_CODE)
    }
}

impl ContentHasher {
    pub fn new(default_country_code: impl Into<String>) -> Self {
        Self {
            default_country_code: default_country_code.into(),
        }
    }

    /// Hash the highest-priority usable identity field.
    pub fn hash_customer(&self, customer: &CustomerIdentity) -> Result<CustomerKey, HashError> {
        let normalized = customer
            .email
            .as_deref()
            .and_then(normalize_email)
            .or_else(|| {
                customer
                    .phone
                    .as_deref()
                    .and_then(|p| normalize_phone(p, &self.default_country_code))
            })
            .or_else(|| {
                customer
                    .id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
            })
            .ok_or(HashError::NoIdentity)?;

        Ok(CustomerKey(sha256_hex(normalized.as_bytes())))
    }

    /// Hash file bytes and bind them to a customer.
    pub fn hash_ingestion(&self, customer_key: &CustomerKey, file_bytes: &[u8]) -> FileIdentity {
        let file_sha256 = sha256_hex(file_bytes);

        let mut hasher = Sha256::new();
        hasher.update(customer_key.as_str().as_bytes());
        hasher.update(file_sha256.as_bytes());
        let ingestion_key = IngestionKey(hex::encode(hasher.finalize()));

        FileIdentity {
            file_sha256,
            ingestion_key,
        }
    }
}

/// Lower-case hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Trim and lower-case an email. Returns `None` if it doesn't look like one.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Some(email),
        _ => None,
    }
}

/// Reduce a phone number to `+<country code><subscriber digits>`.
///
/// `+353 87 …` and `00353 87 …` keep their country code; a single leading
/// trunk `0` is replaced with `default_country_code`.
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    let international = if trimmed.starts_with('+') {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("{default_country_code}{rest}")
    } else {
        digits
    };

    if international.is_empty() {
        None
    } else {
        Some(format!("+{international}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(email: Option<&str>, phone: Option<&str>, id: Option<&str>) -> CustomerIdentity {
        CustomerIdentity {
            email: email.map(String::from),
            phone: phone.map(String::from),
            id: id.map(String::from),
        }
    }

    #[test]
    fn email_is_case_insensitive() {
        let hasher = ContentHasher::default();
        let a = hasher
            .hash_customer(&customer(Some("Alice@Example.com "), None, None))
            .unwrap();
        let b = hasher
            .hash_customer(&customer(Some("alice@example.com"), None, None))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn email_takes_priority_over_phone_and_id() {
        let hasher = ContentHasher::default();
        let with_all = hasher
            .hash_customer(&customer(
                Some("bob@example.com"),
                Some("+353871234567"),
                Some("cust-1"),
            ))
            .unwrap();
        let email_only = hasher
            .hash_customer(&customer(Some("bob@example.com"), None, None))
            .unwrap();
        assert_eq!(with_all, email_only);
    }

    #[test]
    fn phone_formats_converge() {
        let hasher = ContentHasher::default();
        let keys: Vec<_> = ["+353 87 123 4567", "00353871234567", "087-123-4567"]
            .iter()
            .map(|p| hasher.hash_customer(&customer(None, Some(p), None)).unwrap())
            .collect();
        assert_eq!(keys[0], keys[1]);
        assert_eq!(keys[1], keys[2]);
    }

    #[test]
    fn invalid_email_falls_back_to_phone() {
        let hasher = ContentHasher::default();
        let a = hasher
            .hash_customer(&customer(Some("not-an-email"), Some("+353871234567"), None))
            .unwrap();
        let b = hasher
            .hash_customer(&customer(None, Some("+353871234567"), None))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn id_is_last_resort() {
        let hasher = ContentHasher::default();
        let key = hasher
            .hash_customer(&customer(None, Some("  "), Some("cust-42")))
            .unwrap();
        assert_eq!(key.as_str(), sha256_hex(b"cust-42"));
    }

    #[test]
    fn no_identity_is_an_error() {
        let hasher = ContentHasher::default();
        let err = hasher.hash_customer(&customer(None, None, Some(" ")));
        assert!(matches!(err, Err(HashError::NoIdentity)));
    }

    #[test]
    fn ingestion_key_is_deterministic() {
        let hasher = ContentHasher::default();
        let key = hasher
            .hash_customer(&customer(Some("carol@example.com"), None, None))
            .unwrap();
        let first = hasher.hash_ingestion(&key, b"%PDF-1.7 bill");
        let second = hasher.hash_ingestion(&key, b"%PDF-1.7 bill");
        assert_eq!(first, second);
        assert_eq!(first.file_sha256, sha256_hex(b"%PDF-1.7 bill"));
    }

    #[test]
    fn different_bytes_give_different_keys() {
        let hasher = ContentHasher::default();
        let key = hasher
            .hash_customer(&customer(Some("carol@example.com"), None, None))
            .unwrap();
        let a = hasher.hash_ingestion(&key, b"bill one");
        let b = hasher.hash_ingestion(&key, b"bill two");
        assert_ne!(a.ingestion_key, b.ingestion_key);
    }

    #[test]
    fn same_file_different_customers_differ() {
        let hasher = ContentHasher::default();
        let alice = hasher
            .hash_customer(&customer(Some("alice@example.com"), None, None))
            .unwrap();
        let bob = hasher
            .hash_customer(&customer(Some("bob@example.com"), None, None))
            .unwrap();
        let a = hasher.hash_ingestion(&alice, b"shared bytes");
        let b = hasher.hash_ingestion(&bob, b"shared bytes");
        assert_eq!(a.file_sha256, b.file_sha256);
        assert_ne!(a.ingestion_key, b.ingestion_key);
    }

    #[test]
    fn normalize_phone_rules() {
        assert_eq!(
            normalize_phone("(087) 123 4567", "353").as_deref(),
            Some("+353871234567")
        );
        assert_eq!(normalize_phone("+44 20 7946 0958", "353").as_deref(), Some("+442079460958"));
        assert_eq!(normalize_phone("ext.", "353"), None);
    }
}
