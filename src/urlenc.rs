//! Minimal percent-encoding for query-string values (container/image paths,
//! refs). Only the bytes that would otherwise break a `key=value&...` query
//! string are escaped; container paths and image refs are internally
//! produced, not arbitrary user input, so a full RFC 3986 encoder isn't
//! warranted here.

pub fn encode_query_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b':' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reserved_query_characters() {
        assert_eq!(encode_query_value("/tmp/app name"), "/tmp/app%20name");
        assert_eq!(encode_query_value("repo:tag&x"), "repo:tag%26x");
    }
}
