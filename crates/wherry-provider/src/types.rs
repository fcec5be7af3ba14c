use serde::{Deserialize, Serialize};

/// One page of the provider's newest-first message-id listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Raw provider message envelope, as returned by the full-fetch call.
/// The parser consumes this; nothing else interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Option<Vec<String>>,
    #[serde(default)]
    pub snippet: Option<String>,
    /// Milliseconds since epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<RawPart>,
}

/// The recursive content tree: a part is either a leaf carrying body
/// bytes or a container of child parts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<RawHeader>>,
    #[serde(default)]
    pub body: Option<RawBody>,
    #[serde(default)]
    pub parts: Option<Vec<RawPart>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBody {
    #[serde(default)]
    pub size: Option<u64>,
    /// Base64url-encoded content for inline leaves.
    #[serde(default)]
    pub data: Option<String>,
    /// Present instead of `data` when the content must be fetched
    /// through the attachment endpoint.
    #[serde(default)]
    pub attachment_id: Option<String>,
}

/// Response body of the attachment fetch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttachment {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub data: Option<String>,
}

impl RawPart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }
}

/// Decode provider body data, repairing the common encoding drift:
/// `-`/`_` mapped back to `+`/`/` and padding restored to a multiple
/// of four before the standard alphabet is tried.
pub fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    if data.is_empty() {
        return Some(Vec::new());
    }

    let mut repaired = data.replace('-', "+").replace('_', "/");
    while repaired.len() % 4 != 0 {
        repaired.push('=');
    }

    STANDARD.decode(repaired).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_urlsafe_alphabet_without_padding() {
        // "ab?de>" encodes to YWI/ZGU+ in the standard alphabet.
        assert_eq!(decode_base64url("YWI_ZGU-").as_deref(), Some(&b"ab?de>"[..]));
        assert_eq!(decode_base64url("aGk").as_deref(), Some(&b"hi"[..]));
        assert_eq!(decode_base64url("").as_deref(), Some(&b""[..]));
        assert!(decode_base64url("!!!!").is_none());
    }
}
