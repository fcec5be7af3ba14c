//! Turns raw provider payloads into normalized [`MailMessage`] records.
//!
//! Parsing is total: malformed input produces a message with the
//! failing field left empty, never an error, so one bad message cannot
//! abort a batch. The only async step is inline-image embedding, which
//! needs the provider's attachment endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};
use uuid::Uuid;
use wherry_core::{Account, Credential, MailAddress, MailAttachment, MailMessage, MessageFlags};
use wherry_provider::{decode_base64url, MailProvider, ProviderError, RawMessage, RawPart};

const NO_SUBJECT: &str = "(no subject)";
const SNIPPET_MAX_CHARS: usize = 200;
const TEXT_RENDER_WIDTH: usize = 120;

/// An inline part referenced from the HTML body by content-id, to be
/// embedded by [`embed_inline_images`].
#[derive(Debug, Clone)]
pub struct InlinePart {
    pub content_id: String,
    pub mime_type: String,
    /// Base64url content when the leaf carried it directly.
    pub data: Option<String>,
    /// Provider handle when the content must be fetched.
    pub attachment_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message: MailMessage,
    pub inline_parts: Vec<InlinePart>,
}

/// Normalize one raw payload. Never fails; decode problems degrade to
/// empty fields and a log line.
pub fn parse(account_id: Uuid, raw: &RawMessage) -> ParsedMessage {
    let now = Utc::now();
    let labels = raw.label_ids.clone().unwrap_or_default();

    let mut visitor = PartVisitor::default();
    if let Some(payload) = &raw.payload {
        visitor.visit(payload);
    } else {
        debug!(message_id = %raw.id, "payload missing, storing envelope only");
    }

    let PartVisitor {
        mut body_text,
        body_html,
        attachments,
        inline_parts,
        ..
    } = visitor;

    if body_text.is_none() {
        body_text = body_html.as_deref().and_then(derive_text_from_html);
    }

    let root = raw.payload.as_ref();
    let subject = normalize_subject(root.and_then(|part| part.header("Subject")));
    let sender = root
        .and_then(|part| part.header("From"))
        .map(parse_address_list)
        .unwrap_or_default()
        .into_iter()
        .next();
    let to = root
        .and_then(|part| part.header("To"))
        .map(parse_address_list)
        .unwrap_or_default();
    let cc = root
        .and_then(|part| part.header("Cc"))
        .map(parse_address_list)
        .unwrap_or_default();
    let bcc = root
        .and_then(|part| part.header("Bcc"))
        .map(parse_address_list)
        .unwrap_or_default();

    let date_sent = parse_date(raw, root);

    let mut flags = flags_from_labels(&labels);
    flags.has_tls = root.is_some_and(detect_tls);

    let snippet = match raw.snippet.as_deref().filter(|text| !text.is_empty()) {
        Some(snippet) => decode_entities(snippet),
        None => body_text
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(SNIPPET_MAX_CHARS)
            .collect(),
    };

    let message = MailMessage {
        id: Uuid::new_v4(),
        account_id,
        provider_message_id: raw.id.clone(),
        thread_id: raw.thread_id.clone().unwrap_or_else(|| raw.id.clone()),
        subject,
        sender,
        to,
        cc,
        bcc,
        date_sent,
        body_text,
        body_html,
        processed_html: None,
        snippet,
        flags,
        attachments,
        labels,
        raw_metadata: serde_json::json!({
            "internalDate": raw.internal_date,
            "labelIds": raw.label_ids,
        }),
        created_at: now,
        updated_at: now,
    };

    ParsedMessage {
        message,
        inline_parts,
    }
}

/// Resolve `cid:` references in the HTML body to embedded data URIs,
/// producing `processed_html`. A part that cannot be fetched or
/// decoded keeps its original `cid:` reference.
pub async fn embed_inline_images(
    provider: &dyn MailProvider,
    account: &Account,
    credential: &Credential,
    parsed: &mut ParsedMessage,
) {
    let Some(html) = parsed.message.body_html.clone() else {
        return;
    };

    let mut processed = html;
    for part in &parsed.inline_parts {
        let bytes = match inline_bytes(provider, account, credential, &parsed.message, part).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    message_id = %parsed.message.provider_message_id,
                    content_id = %part.content_id,
                    "inline image left unresolved: {err}"
                );
                continue;
            }
        };

        let data_uri = format!(
            "data:{};base64,{}",
            part.mime_type,
            STANDARD.encode(&bytes)
        );
        processed = processed.replace(&format!("cid:{}", part.content_id), &data_uri);
    }

    parsed.message.processed_html = Some(processed);
}

async fn inline_bytes(
    provider: &dyn MailProvider,
    account: &Account,
    credential: &Credential,
    message: &MailMessage,
    part: &InlinePart,
) -> Result<Vec<u8>, ProviderError> {
    if let Some(data) = part.data.as_deref() {
        if let Some(bytes) = decode_base64url(data) {
            return Ok(bytes);
        }
    }

    let attachment_ref = part.attachment_ref.as_deref().ok_or_else(|| {
        ProviderError::Endpoint("inline part has neither data nor attachment ref".to_string())
    })?;

    provider
        .get_attachment(
            account,
            credential,
            &message.provider_message_id,
            attachment_ref,
        )
        .await
}

// ---- content tree ---------------------------------------------------------

/// A part is either a leaf carrying content or a container of child
/// parts; classifying up front keeps the traversal in one place.
enum PartNode<'a> {
    Leaf(&'a RawPart),
    Container(&'a [RawPart]),
}

fn classify(part: &RawPart) -> PartNode<'_> {
    match part.parts.as_deref() {
        Some(children) if !children.is_empty() => PartNode::Container(children),
        _ => PartNode::Leaf(part),
    }
}

/// Single recursive walk over the part tree: first text/plain leaf,
/// first text/html leaf, attachment descriptors, inline cid leaves.
#[derive(Default)]
struct PartVisitor {
    body_text: Option<String>,
    body_html: Option<String>,
    attachments: Vec<MailAttachment>,
    inline_parts: Vec<InlinePart>,
}

impl PartVisitor {
    fn visit(&mut self, part: &RawPart) {
        match classify(part) {
            PartNode::Container(children) => {
                for child in children {
                    self.visit(child);
                }
            }
            PartNode::Leaf(leaf) => self.visit_leaf(leaf),
        }
    }

    fn visit_leaf(&mut self, part: &RawPart) {
        let mime_type = part
            .mime_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        let filename = part.filename.as_deref().unwrap_or("");
        let content_id = part
            .header("Content-ID")
            .map(|value| value.trim_matches(['<', '>']).to_string())
            .filter(|value| !value.is_empty());
        let disposition = part
            .header("Content-Disposition")
            .map(|value| value.to_ascii_lowercase());
        let is_inline = match disposition.as_deref() {
            Some(value) => value.starts_with("inline"),
            // Senders often omit the disposition on cid-referenced parts.
            None => content_id.is_some(),
        };

        if is_inline && content_id.is_some() {
            let body = part.body.as_ref();
            self.inline_parts.push(InlinePart {
                content_id: content_id.unwrap_or_default(),
                mime_type: mime_type.clone(),
                data: body.and_then(|body| body.data.clone()),
                attachment_ref: body.and_then(|body| body.attachment_id.clone()),
            });
            return;
        }

        if !filename.is_empty() {
            let body = part.body.as_ref();
            self.attachments.push(MailAttachment {
                filename: filename.to_string(),
                mime_type: mime_type.clone(),
                size: body.and_then(|body| body.size).unwrap_or(0),
                attachment_ref: body
                    .and_then(|body| body.attachment_id.clone())
                    .unwrap_or_default(),
                is_inline,
            });
            return;
        }

        let data = part.body.as_ref().and_then(|body| body.data.as_deref());
        let Some(data) = data.filter(|data| !data.is_empty()) else {
            return;
        };

        match mime_type.as_str() {
            "text/plain" if self.body_text.is_none() => match decode_text(data) {
                Some(text) => self.body_text = Some(text),
                None => warn!("undecodable text/plain leaf skipped"),
            },
            "text/html" if self.body_html.is_none() => match decode_text(data) {
                Some(html) => self.body_html = Some(html),
                None => warn!("undecodable text/html leaf skipped"),
            },
            _ => {}
        }
    }
}

/// Base64url repair then UTF-8, falling back to a lossy single-byte
/// decode rather than dropping the body.
fn decode_text(data: &str) -> Option<String> {
    let bytes = decode_base64url(data)?;
    Some(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&byte| byte as char).collect(),
    })
}

fn derive_text_from_html(html: &str) -> Option<String> {
    let rendered = html2text::config::plain()
        .string_from_read(html.as_bytes(), TEXT_RENDER_WIDTH)
        .ok()?;
    let text = rendered
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    (!text.is_empty()).then_some(text)
}

// ---- headers --------------------------------------------------------------

fn normalize_subject(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return NO_SUBJECT.to_string();
    };

    let decoded = decode_rfc2047(raw);
    let trimmed = decoded.trim().trim_matches('"').trim();
    if trimmed.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Decode RFC2047 encoded words by round-tripping the value through a
/// synthetic header.
fn decode_rfc2047(input: &str) -> String {
    let fake_header = format!("X: {input}");
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => input.to_string(),
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"))
}

/// Split an address header on commas (quote-aware) and keep the
/// entries with a syntactically plausible email; the rest are dropped
/// rather than propagated as garbage.
fn parse_address_list(raw: &str) -> Vec<MailAddress> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if let Some(address) = parse_address(current.trim()) {
                    entries.push(address);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if let Some(address) = parse_address(current.trim()) {
        entries.push(address);
    }

    entries
}

fn parse_address(entry: &str) -> Option<MailAddress> {
    if entry.is_empty() {
        return None;
    }

    if let (Some(lt), Some(gt)) = (entry.rfind('<'), entry.rfind('>')) {
        if lt < gt {
            let address = entry[lt + 1..gt].trim().to_string();
            if !email_regex().is_match(&address) {
                return None;
            }
            let name = decode_rfc2047(entry[..lt].trim())
                .trim()
                .trim_matches('"')
                .trim()
                .to_string();
            return Some(MailAddress {
                name: (!name.is_empty()).then_some(name),
                address,
            });
        }
    }

    let bare = entry.trim_matches('"').trim();
    email_regex().is_match(bare).then(|| MailAddress {
        name: None,
        address: bare.to_string(),
    })
}

fn parse_date(raw: &RawMessage, root: Option<&RawPart>) -> Option<DateTime<Utc>> {
    if let Some(millis) = raw
        .internal_date
        .as_deref()
        .and_then(|value| value.parse::<i64>().ok())
    {
        if let Some(date) = Utc.timestamp_millis_opt(millis).single() {
            return Some(date);
        }
    }

    root.and_then(|part| part.header("Date"))
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|date| date.with_timezone(&Utc))
}

// ---- flags ----------------------------------------------------------------

/// Fixed label-to-flag mapping; `UNREAD` is the one inverted entry.
fn flags_from_labels(labels: &[String]) -> MessageFlags {
    let mut flags = MessageFlags {
        is_read: true,
        ..MessageFlags::default()
    };

    for label in labels {
        match label.as_str() {
            "UNREAD" => flags.is_read = false,
            "STARRED" => flags.is_starred = true,
            "IMPORTANT" => flags.is_important = true,
            "DRAFT" => flags.is_draft = true,
            _ => {}
        }
    }

    flags
}

/// Transport-security heuristic over the trace headers; not a
/// cryptographic verification.
fn detect_tls(root: &RawPart) -> bool {
    let headers = root.headers.as_deref().unwrap_or_default();

    headers.iter().any(|header| {
        if header.name.eq_ignore_ascii_case("Received") {
            let value = header.value.to_ascii_uppercase();
            value.contains("ESMTPS") || value.contains("TLS") || value.contains("SSL")
        } else {
            header.name.to_ascii_lowercase().starts_with("tls-report")
        }
    })
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
}
