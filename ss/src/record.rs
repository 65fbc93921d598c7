//! Record trait and identifier encoding

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A document persisted as one file in the store
///
/// Records with an empty `collection_name` are singletons stored at the
/// root of the state directory (`<root>/<id>.record`).
pub trait Record: Serialize + DeserializeOwned {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Directory name for this record type
    fn collection_name() -> &'static str;

    /// Structural validation applied on every load and save
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Encode an identifier into a file-name-safe string
///
/// ASCII alphanumerics, `-` and `_` pass through; `.` passes through except
/// in first position; every other byte becomes `%XX`.
pub fn encode_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Reverse of [`encode_id`]; `None` when the input is not a valid encoding
pub fn decode_id(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_id_unchanged() {
        assert_eq!(encode_id("t1"), "t1");
        assert_eq!(encode_id("session_2-b"), "session_2-b");
    }

    #[test]
    fn test_encode_branch_name() {
        let encoded = encode_id("feature/P3-t1-add-oauth");
        assert_eq!(encoded, "feature%2FP3-t1-add-oauth");
        assert_eq!(decode_id(&encoded).as_deref(), Some("feature/P3-t1-add-oauth"));
    }

    #[test]
    fn test_encode_leading_dot() {
        assert_eq!(encode_id(".hidden"), "%2Ehidden");
        assert_eq!(encode_id("a.b"), "a.b");
    }

    #[test]
    fn test_decode_rejects_truncated_escape() {
        assert_eq!(decode_id("abc%2"), None);
        assert_eq!(decode_id("abc%zz"), None);
    }

    #[test]
    fn test_round_trip_unicode() {
        let id = "fix/naïve-ünïcode";
        assert_eq!(decode_id(&encode_id(id)).as_deref(), Some(id));
    }
}
