//! Translation between request headers and stored metadata.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use mss_storage::Metadata;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;

pub const X_AUTH_USER: &str = "x-auth-user";
pub const X_AUTH_KEY: &str = "x-auth-key";
pub const X_AUTH_TOKEN: &str = "x-auth-token";
pub const X_STORAGE_URL: &str = "x-storage-url";

pub const CONTAINER_META_PREFIX: &str = "x-container-meta-";
pub const OBJECT_META_PREFIX: &str = "x-object-meta-";

/// Characters left alone when escaping a value for a response header. This is
/// the path segment set: unreserved characters plus the sub-delimiters that
/// are legal inside a segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

/// Returns a header as a string when present and printable.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Collects every `X-Container-Meta-*` and `X-Object-Meta-*` header into a
/// metadata map. Both prefixes are honored whatever the target kind is.
pub fn parse_metadata(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        let name = name.as_str();
        let Some(key) = name
            .strip_prefix(CONTAINER_META_PREFIX)
            .or_else(|| name.strip_prefix(OBJECT_META_PREFIX))
        else {
            continue;
        };
        if key.is_empty() {
            continue;
        }

        let value = match std::str::from_utf8(value.as_bytes()) {
            Ok(text) => decode_value(text),
            Err(err) => {
                let lossy = String::from_utf8_lossy(value.as_bytes()).into_owned();
                warn!("Metadata {} is not UTF-8 ({}), keeping as is: {}", key, err, lossy);
                lossy
            }
        };
        metadata.insert(canonical_key(key), value);
    }
    metadata
}

/// Canonical MIME form: the first letter and every letter after a hyphen are
/// upper case, the rest lower case.
pub fn canonical_key(key: &str) -> String {
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Percent-decodes a metadata value. A malformed escape or a result that is
/// not UTF-8 keeps the raw value.
pub fn decode_value(value: &str) -> String {
    if !has_valid_escapes(value) {
        warn!("Strange encoding, returning as is: {}", value);
        return value.to_string();
    }
    match percent_decode_str(value).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(err) => {
            warn!("Strange encoding ({}), returning as is: {}", err, value);
            value.to_string()
        }
    }
}

fn has_valid_escapes(value: &str) -> bool {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match bytes.get(i + 1..i + 3) {
                Some(pair) if pair.iter().all(u8::is_ascii_hexdigit) => i += 3,
                _ => return false,
            }
        } else {
            i += 1;
        }
    }
    true
}

pub fn escape_value(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// Writes `metadata` into `headers` under `prefix`. Keys that cannot form a
/// header name are skipped.
pub fn emit_metadata(headers: &mut HeaderMap, prefix: &str, metadata: &Metadata) {
    for (key, value) in metadata {
        let name = HeaderName::try_from(format!("{prefix}{key}"));
        let value = HeaderValue::try_from(escape_value(value));
        match (name, value) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Skipping metadata key {:?}, not a valid header", key),
        }
    }
}
