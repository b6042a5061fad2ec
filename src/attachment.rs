//! Customer-sent file references.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable reference to a file attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub url: String,
    pub media_type: String,
    pub byte_size: u64,
}

impl Attachment {
    /// Last path segment of the URL, used as the upload file name.
    pub fn file_name(&self) -> String {
        file_name_from_url(&self.url)
    }
}

/// Best-effort file name from a URL (`document` when there is none).
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(String::from)
        .unwrap_or_else(|| "document".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_strips_query() {
        assert_eq!(
            file_name_from_url("https://cdn.example.com/u/42/bill.pdf?sig=abc"),
            "bill.pdf"
        );
    }

    #[test]
    fn file_name_falls_back() {
        assert_eq!(file_name_from_url("https://cdn.example.com/"), "document");
        assert_eq!(file_name_from_url("https:"), "document");
    }
}
