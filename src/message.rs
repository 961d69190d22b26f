//! Signed article codec.
//!
//! An article is an RFC-5322-style message whose identity-bearing headers are
//! covered by an ed25519 signature. The signature input is a canonical byte
//! stream: the signed fields in a fixed order, a blank line, then the body
//! with line endings normalised to CRLF and MIME parts re-emitted against the
//! declared boundary. The same canonical form is derived on both ends, so a
//! message survives relaying through servers that rewrite line endings.

use std::collections::HashMap;

use chrono::Utc;
use data_encoding::BASE32;
use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use crate::keys::{self, NodeKey};

/// Header that carries the base32 article signature.
pub const SIGNATURE_HEADER: &str = "X-Kothawoc-Signature";

/// The signed header fields, in canonical order. Only these are covered by
/// the signature; everything else may be rewritten in transit.
pub const SIGNATURE_FIELDS: [&str; 13] = [
    "From",
    "Newsgroups",
    "Date",
    "Subject",
    "Approved",
    "Control",
    "Distribution",
    "Message-Id",
    "Supersedes",
    "Sender",
    "Mime-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
];

fn is_signature_field(name: &str) -> bool {
    SIGNATURE_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("article is not signed")]
    MissingSignature,
    #[error("article signature did not verify")]
    BadSignature,
    #[error(transparent)]
    Key(#[from] crate::keys::KeyError),
}

// ─── Headers ──────────────────────────────────────────────────────────────────

/// Insertion-ordered header map with case-insensitive names.
///
/// Order is preserved so that re-emission of an unsigned header block is
/// stable across a parse/emit round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Parse a header block. Continuation lines (leading whitespace) are
    /// unfolded into the preceding value.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let mut headers = Headers::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.0.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => return Err(CodecError::MalformedHeader(line.to_string())),
                }
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
            headers.0.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(headers)
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of `name` with a single value, keeping the position
    /// of the first occurrence; appends when absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(idx) => {
                self.0[idx].1 = value;
                let mut i = idx + 1;
                while i < self.0.len() {
                    if self.0[i].0.eq_ignore_ascii_case(name) {
                        self.0.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ─── Content-Type ─────────────────────────────────────────────────────────────

/// Split a Content-Type value into the media type and its parameters.
pub fn parse_content_type(value: &str) -> (String, HashMap<String, String>) {
    let mut segments = value.split(';');
    let mediatype = segments.next().unwrap_or("").trim().to_lowercase();
    let mut params = HashMap::new();
    for segment in segments {
        if let Some((key, val)) = segment.split_once('=') {
            params.insert(
                key.trim().to_lowercase(),
                val.trim().trim_matches('"').to_string(),
            );
        }
    }
    (mediatype, params)
}

// ─── Message ──────────────────────────────────────────────────────────────────

/// One MIME part of a multipart article body. Content is raw bytes so
/// binary parts canonicalise and sign without a text detour.
#[derive(Debug, Clone, Default)]
pub struct MimePart {
    pub headers: Headers,
    pub content: Vec<u8>,
}

/// A parsed article: headers, body preamble and MIME parts.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub headers: Headers,
    pub preamble: String,
    pub parts: Vec<MimePart>,
}

/// The current time formatted for a `Date` header (RFC 1123 with zone offset).
pub fn date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

impl Message {
    /// An empty message with a fresh `Date` header.
    pub fn new() -> Self {
        let mut headers = Headers::new();
        headers.set("Date", date_now());
        Message { headers, preamble: String::new(), parts: Vec::new() }
    }

    /// Parse a complete wire-form article.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let (head, body) = split_head_body(raw);
        let headers = Headers::parse(head)?;
        Message::from_headers_body(headers, body)
    }

    /// Build a message from an already-parsed header block and a raw body.
    pub fn from_headers_body(headers: Headers, body: &str) -> Result<Self, CodecError> {
        let mut msg = Message { headers, preamble: String::new(), parts: Vec::new() };
        msg.parse_body(body)?;
        Ok(msg)
    }

    fn boundary(&self) -> Option<String> {
        let ct = self.headers.get("Content-Type")?;
        let (_, params) = parse_content_type(ct);
        params.get("boundary").cloned()
    }

    fn is_multipart(&self) -> bool {
        self.headers
            .get("Content-Type")
            .map(|ct| parse_content_type(ct).0.starts_with("multipart/"))
            .unwrap_or(false)
    }

    fn parse_body(&mut self, body: &str) -> Result<(), CodecError> {
        let Some(boundary) = self.boundary() else {
            self.preamble = body.to_string();
            return Ok(());
        };
        let delim = format!("--{boundary}");
        let close = format!("--{boundary}--");

        let mut preamble_lines: Vec<&str> = Vec::new();
        let mut part_texts: Vec<Vec<&str>> = Vec::new();
        let mut in_part = false;
        for line in body.lines() {
            let marker = line.trim_end();
            if marker == close {
                break;
            }
            if marker == delim {
                part_texts.push(Vec::new());
                in_part = true;
                continue;
            }
            if in_part {
                part_texts.last_mut().expect("a part is open").push(line);
            } else {
                preamble_lines.push(line);
            }
        }
        self.preamble = preamble_lines.join("\n");

        for text in part_texts {
            let split = text.iter().position(|l| l.trim_end().is_empty());
            let (head, content) = match split {
                Some(idx) => (&text[..idx], &text[idx + 1..]),
                None => (&text[..], &[][..]),
            };
            let headers = Headers::parse(&head.join("\n"))?;
            self.parts.push(MimePart { headers, content: content.join("\n").into_bytes() });
        }
        Ok(())
    }

    /// The canonical byte stream. With `signing` only the signed header
    /// fields appear; on the wire every other header follows the signed
    /// block in insertion order.
    pub fn canonical_bytes(&self, signing: bool) -> Vec<u8> {
        let mut buf = Vec::new();

        for field in SIGNATURE_FIELDS {
            for value in self.headers.values(field) {
                push_header(&mut buf, field, value);
            }
        }
        if !signing {
            for (name, value) in self.headers.iter() {
                if !is_signature_field(name) {
                    push_header(&mut buf, name, value);
                }
            }
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(normalize(&self.preamble).as_bytes());

        if self.parts.len() > 1 && self.is_multipart() {
            if let Some(boundary) = self.boundary() {
                buf.extend_from_slice(b"\r\n");
                for (i, part) in self.parts.iter().enumerate() {
                    if i > 0 {
                        buf.extend_from_slice(b"\r\n");
                    }
                    buf.extend_from_slice(b"--");
                    buf.extend_from_slice(boundary.as_bytes());
                    buf.extend_from_slice(b"\r\n");
                    let mut header_lines: Vec<(&str, &str)> = part.headers.iter().collect();
                    header_lines.sort_by(|a, b| a.0.cmp(b.0));
                    for (name, value) in header_lines {
                        push_header(&mut buf, name, value);
                    }
                    buf.extend_from_slice(b"\r\n");
                    buf.extend_from_slice(&normalize_bytes(&part.content));
                }
                buf.extend_from_slice(b"\r\n--");
                buf.extend_from_slice(boundary.as_bytes());
                buf.extend_from_slice(b"--\r\n");
            }
        }
        buf
    }

    /// The complete wire form, signed block first. Part bytes that are not
    /// valid UTF-8 are replaced here; everything parsed off the text
    /// protocol round-trips unchanged.
    pub fn to_wire(&self) -> String {
        String::from_utf8_lossy(&self.canonical_bytes(false)).into_owned()
    }

    /// Stamp `Approved` and `From` from the key, sign the canonical form and
    /// store the signature header. Returns the wire form.
    ///
    /// Must be called once, after every signed header is final.
    pub fn sign(&mut self, key: &NodeKey) -> Result<String, CodecError> {
        self.headers.set("Approved", hex::encode(key.public_key().as_bytes()));
        self.headers.set("From", key.node_id());
        let canonical = self.canonical_bytes(true);
        let signature = key.sign(&canonical)?;
        self.headers.set(SIGNATURE_HEADER, BASE32.encode(&signature.to_bytes()));
        Ok(self.to_wire())
    }

    /// Re-derive the canonical bytes and check them against `Approved` and
    /// the signature header. Also requires `From` to be the node id of the
    /// approving key.
    pub fn check_signature(&self) -> Result<(), CodecError> {
        let sig_b32 = self.headers.get(SIGNATURE_HEADER).ok_or(CodecError::MissingSignature)?;
        let sig_raw = BASE32
            .decode(sig_b32.as_bytes())
            .map_err(|_| CodecError::BadSignature)?;
        let sig_bytes: [u8; 64] = sig_raw.as_slice().try_into().map_err(|_| CodecError::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        let approved = self.headers.get("Approved").ok_or(CodecError::MissingSignature)?;
        let pk_raw = hex::decode(approved).map_err(|_| CodecError::BadSignature)?;
        let pk_bytes: [u8; 32] = pk_raw.as_slice().try_into().map_err(|_| CodecError::BadSignature)?;
        let pubkey = VerifyingKey::from_bytes(&pk_bytes).map_err(|_| CodecError::BadSignature)?;

        if self.headers.get("From") != Some(keys::onion_from_pubkey(&pubkey).as_str()) {
            return Err(CodecError::BadSignature);
        }
        if !keys::verify(&pubkey, &self.canonical_bytes(true), &signature) {
            return Err(CodecError::BadSignature);
        }
        Ok(())
    }

    pub fn verify(&self) -> bool {
        self.check_signature().is_ok()
    }

    /// The signature string, which doubles as the article's content address.
    pub fn signature(&self) -> Option<&str> {
        self.headers.get(SIGNATURE_HEADER)
    }

    /// Comma-separated `Newsgroups`, split and trimmed.
    pub fn newsgroups(&self) -> Vec<String> {
        self.headers
            .get("Newsgroups")
            .map(|v| v.split(',').map(|g| g.trim().to_string()).filter(|g| !g.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Split an article at the first blank line into head and body.
fn split_head_body(raw: &str) -> (&str, &str) {
    if let Some(idx) = raw.find("\r\n\r\n") {
        (&raw[..idx], &raw[idx + 4..])
    } else if let Some(idx) = raw.find("\n\n") {
        (&raw[..idx], &raw[idx + 2..])
    } else {
        (raw, "")
    }
}

/// Strip carriage returns and re-terminate every line with CRLF.
fn normalize(text: &str) -> String {
    text.replace('\r', "").replace('\n', "\r\n")
}

/// Byte-level [`normalize`], for part content that need not be UTF-8.
fn normalize_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match byte {
            b'\r' => (),
            b'\n' => out.extend_from_slice(b"\r\n"),
            other => out.push(other),
        }
    }
    out
}

fn push_header(buf: &mut Vec<u8>, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let mut msg = Message::new();
        msg.headers.set("Newsgroups", "alt.misc.test");
        msg.headers.set("Subject", "Codec test");
        msg.headers.set("Message-Id", "<test-1@example>");
        msg.headers.set("Mime-Version", "1.0");
        msg.headers.set("Content-Type", "multipart/mixed; boundary=\"nxtprt\"");
        msg.headers.set("Content-Transfer-Encoding", "8bit");
        msg.preamble = "This is a multipart message.".to_string();

        let mut info = MimePart::default();
        info.headers.set("Content-Type", "application/news-groupinfo;charset=UTF-8");
        info.content = b"For your newsgroups file:\ngroup description".to_vec();
        msg.parts.push(info);

        let mut text = MimePart::default();
        text.headers.set("Content-Type", "text/plain;charset=UTF-8");
        text.content = b"A quick brown fox\njumps over the lazy\ndog.".to_vec();
        msg.parts.push(text);

        msg
    }

    #[test]
    fn headers_parse_and_unfold() {
        let headers = Headers::parse("Subject: hello\r\n world\r\nFrom: a\r\n").unwrap();
        assert_eq!(headers.get("subject"), Some("hello world"));
        assert_eq!(headers.get("FROM"), Some("a"));
    }

    #[test]
    fn header_without_colon_is_malformed() {
        assert!(matches!(
            Headers::parse("this is not a header"),
            Err(CodecError::MalformedHeader(_))
        ));
    }

    #[test]
    fn set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.append("X-Test", "one");
        headers.append("x-test", "two");
        headers.set("X-Test", "three");
        assert_eq!(headers.values("X-Test").collect::<Vec<_>>(), vec!["three"]);
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let key = NodeKey::generate();
        let mut msg = sample_message();
        let wire = msg.sign(&key).unwrap();
        assert!(msg.verify());

        // The wire form parses back into a message that still verifies.
        let parsed = Message::parse(&wire).unwrap();
        assert!(parsed.verify());
        assert_eq!(parsed.headers.get("From"), Some(key.node_id().as_str()));
        assert_eq!(parsed.parts.len(), 2);
    }

    #[test]
    fn tampered_signed_header_fails_verification() {
        let key = NodeKey::generate();
        let mut msg = sample_message();
        let wire = msg.sign(&key).unwrap();

        let mut parsed = Message::parse(&wire).unwrap();
        parsed.headers.set("Subject", "Tampered subject");
        assert!(!parsed.verify());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let key = NodeKey::generate();
        let mut msg = sample_message();
        let wire = msg.sign(&key).unwrap();

        let mut parsed = Message::parse(&wire).unwrap();
        parsed.parts[1].content.extend_from_slice(b"\nextra line");
        assert!(!parsed.verify());

        let mut parsed = Message::parse(&wire).unwrap();
        parsed.preamble = "Swapped preamble".to_string();
        assert!(!parsed.verify());
    }

    #[test]
    fn forged_from_header_fails_verification() {
        let key = NodeKey::generate();
        let other = NodeKey::generate();
        let mut msg = sample_message();
        msg.sign(&key).unwrap();

        // Re-point From at another identity; the signature still matches the
        // canonical bytes only if From is included, and the id check catches
        // a pubkey/From mismatch either way.
        msg.headers.set("From", other.node_id());
        assert!(!msg.verify());
    }

    #[test]
    fn unsigned_message_reports_missing_signature() {
        let msg = sample_message();
        assert!(matches!(msg.check_signature(), Err(CodecError::MissingSignature)));
    }

    #[test]
    fn unsigned_headers_not_covered_by_signature() {
        let key = NodeKey::generate();
        let mut msg = sample_message();
        let wire = msg.sign(&key).unwrap();

        // Path is rewritten in transit and must not break the signature.
        let mut parsed = Message::parse(&wire).unwrap();
        parsed.headers.set("Path", "someid!.POSTED");
        assert!(parsed.verify());
    }

    #[test]
    fn line_ending_normalisation_is_stable() {
        let key = NodeKey::generate();
        let mut msg = sample_message();
        msg.preamble = "bare\nnewlines\nonly".to_string();
        let wire = msg.sign(&key).unwrap();

        // Relay that strips CRs: canonicalisation must still converge.
        let mangled = wire.replace("\r\n", "\n");
        let parsed = Message::parse(&mangled).unwrap();
        assert!(parsed.verify());
    }

    #[test]
    fn simple_body_without_mime_roundtrips() {
        let key = NodeKey::generate();
        let mut msg = Message::new();
        msg.headers.set("Newsgroups", "misc.test");
        msg.headers.set("Subject", "plain");
        msg.headers.set("Message-Id", "<plain-1@example>");
        msg.preamble = "Just a plain body.\nTwo lines.".to_string();
        let wire = msg.sign(&key).unwrap();

        let parsed = Message::parse(&wire).unwrap();
        assert!(parsed.verify());
        assert!(parsed.parts.is_empty());
        assert_eq!(parsed.preamble.replace('\r', ""), "Just a plain body.\nTwo lines.");
    }

    #[test]
    fn binary_part_content_signs_and_verifies() {
        let key = NodeKey::generate();
        let mut msg = sample_message();
        msg.parts[1].content = vec![0xde, 0xad, b'\n', 0xbe, 0xef];
        msg.sign(&key).unwrap();
        assert!(msg.verify());

        // The canonical form covers the raw bytes.
        msg.parts[1].content[0] ^= 0xff;
        assert!(!msg.verify());
    }

    #[test]
    fn content_type_params() {
        let (mt, params) = parse_content_type("multipart/mixed; boundary=\"nxtprt\"");
        assert_eq!(mt, "multipart/mixed");
        assert_eq!(params.get("boundary").map(String::as_str), Some("nxtprt"));
    }
}
