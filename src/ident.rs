//! Deterministic identifiers.
//!
//! Every derived artifact is addressed by a value computed purely from stable
//! inputs, which makes all store writes idempotent upserts: replaying a stage
//! can never mint a second identity for the same thing.
//!
//! The four functions here mirror the provenance chain: a document id hashes
//! the normalized URL, a chunk id appends the byte offset, a mention id hashes
//! its position inside a chunk, and an entity id hashes the normalized surface
//! form together with its type.

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::EngineError;
use crate::model::EntityType;

/// Query parameters stripped during normalization (session/tracking noise).
const QUERY_DENY_LIST: &[&str] = &[
    "fbclid", "gclid", "phpsessid", "ref", "sessionid", "sid",
];

/// Normalize a URL for identity purposes.
///
/// Lowercases scheme and host, resolves percent-encoding in the path, sorts
/// query parameters by key, drops deny-listed and `utm_*` parameters, strips
/// the fragment and any trailing slash.
pub fn normalize_url(raw: &str) -> Result<String, EngineError> {
    let parsed = Url::parse(raw.trim()).map_err(|err| EngineError::Validation {
        reason: format!("invalid url {raw:?}: {err}"),
    })?;
    if !parsed.has_host() {
        return Err(EngineError::validation(format!(
            "url {raw:?} has no host"
        )));
    }

    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed
        .host_str()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let port = match (parsed.port(), scheme.as_str()) {
        (Some(443), "https") | (Some(80), "http") | (None, _) => String::new(),
        (Some(p), _) => format!(":{p}"),
    };

    let path = percent_decode(parsed.path());
    let path = path.trim_end_matches('/');

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            !key.starts_with("utm_") && !QUERY_DENY_LIST.contains(&key.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    let query = if params.is_empty() {
        String::new()
    } else {
        let joined = params
            .iter()
            .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
            .collect::<Vec<_>>()
            .join("&");
        format!("?{joined}")
    };

    Ok(format!("{scheme}://{host}{port}{path}{query}"))
}

/// Best-effort percent-decoding; invalid escapes are kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// `doc_id = SHA-256(normalize(url))`, hex-lowercase.
pub fn doc_id(url: &str) -> Result<String, EngineError> {
    let normalized = normalize_url(url)?;
    Ok(sha256_hex(&[normalized.as_bytes()]))
}

/// `chunk_id = doc_id ":" start_offset` with the offset zero-padded to 10.
pub fn chunk_id(doc_id: &str, start_offset: usize) -> String {
    format!("{doc_id}:{start_offset:010}")
}

/// `mention_id = SHA-256(chunk_id \0 normalized_surface \0 start_in_chunk)`.
pub fn mention_id(chunk_id: &str, normalized_surface: &str, start_in_chunk: usize) -> String {
    let offset = start_in_chunk.to_string();
    sha256_hex(&[
        chunk_id.as_bytes(),
        b"\0",
        normalized_surface.as_bytes(),
        b"\0",
        offset.as_bytes(),
    ])
}

/// `entity_id = SHA-256(lower(collapse_whitespace(surface)) \0 type)`.
pub fn entity_id(surface: &str, entity_type: EntityType) -> String {
    let normalized = normalize_surface(surface);
    sha256_hex(&[
        normalized.as_bytes(),
        b"\0",
        entity_type.as_str().as_bytes(),
    ])
}

/// `rel_id = SHA-256(subject \0 predicate \0 object \0 evidence_chunk_id)`.
///
/// The evidence chunk participates in the identity, so the same claim backed
/// by two different chunks yields two distinct edges.
pub fn relation_id(
    subject_entity_id: &str,
    predicate: crate::model::Predicate,
    object_entity_id: &str,
    evidence_chunk_id: &str,
) -> String {
    sha256_hex(&[
        subject_entity_id.as_bytes(),
        b"\0",
        predicate.as_str().as_bytes(),
        b"\0",
        object_entity_id.as_bytes(),
        b"\0",
        evidence_chunk_id.as_bytes(),
    ])
}

/// Canonical surface normalization shared by the id service and the linker:
/// lowercase, whitespace collapsed to single spaces, boundary punctuation
/// stripped.
pub fn normalize_surface(surface: &str) -> String {
    let collapsed = surface
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_stable_across_equivalent_urls() {
        let a = normalize_url("HTTPS://Example.COM/About/?b=2&a=1").unwrap();
        let b = normalize_url("https://example.com/About?a=1&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "https://example.com/About?a=1&b=2");
    }

    #[test]
    fn tracking_params_and_fragments_are_dropped() {
        let url = normalize_url(
            "https://example.com/post?utm_source=x&gclid=abc&id=7#section-2",
        )
        .unwrap();
        assert_eq!(url, "https://example.com/post?id=7");
    }

    #[test]
    fn default_ports_are_elided() {
        assert_eq!(
            normalize_url("https://example.com:443/a").unwrap(),
            "https://example.com/a"
        );
        assert_eq!(
            normalize_url("http://example.com:8080/a").unwrap(),
            "http://example.com:8080/a"
        );
    }

    #[test]
    fn percent_encoding_is_decoded() {
        assert_eq!(
            normalize_url("https://example.com/a%20b").unwrap(),
            "https://example.com/a b"
        );
    }

    #[test]
    fn doc_ids_agree_when_normalizations_agree() {
        let a = doc_id("https://example.com/about/").unwrap();
        let b = doc_id("HTTPS://EXAMPLE.com/about").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn malformed_urls_are_validation_errors() {
        let err = doc_id("not a url").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn chunk_ids_are_zero_padded() {
        assert_eq!(chunk_id("abc", 42), "abc:0000000042");
        assert_eq!(chunk_id("abc", 0), "abc:0000000000");
    }

    #[test]
    fn mention_ids_depend_on_offset() {
        let a = mention_id("c:0000000000", "openai", 10);
        let b = mention_id("c:0000000000", "openai", 11);
        assert_ne!(a, b);
    }

    #[test]
    fn entity_ids_collapse_case_and_whitespace() {
        let a = entity_id("OpenAI", EntityType::Org);
        let b = entity_id("  openai ", EntityType::Org);
        assert_eq!(a, b);
        assert_ne!(a, entity_id("openai", EntityType::Person));
    }
}
