use std::collections::HashMap;

/// Parse a pre-response byte stream of concatenated `key:"value"` pairs.
///
/// Unknown keys are kept; callers pick out the ones they understand
/// (`timeout` being the only key the protocol currently defines). Returns
/// `None` when the bytes do not scan as a pre-response.
pub fn parse_pre_response(bytes: &[u8]) -> Option<HashMap<String, String>> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut pairs = HashMap::new();
    let mut rest = text;
    while !rest.is_empty() {
        let colon = rest.find(':')?;
        let key = &rest[..colon];
        if key.is_empty() || key.contains('"') {
            return None;
        }
        rest = &rest[colon + 1..];
        if !rest.starts_with('"') {
            return None;
        }
        rest = &rest[1..];
        let close = rest.find('"')?;
        pairs.insert(key.to_string(), rest[..close].to_string());
        rest = &rest[close + 1..];
    }
    Some(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timeout() {
        let pairs = parse_pre_response(b"timeout:\"42000\"").unwrap();
        assert_eq!(pairs.get("timeout").unwrap(), "42000");
    }

    #[test]
    fn tolerates_unknown_keys() {
        let pairs = parse_pre_response(b"timeout:\"3000\"other:\"x\"").unwrap();
        assert_eq!(pairs.get("timeout").unwrap(), "3000");
        assert_eq!(pairs.get("other").unwrap(), "x");
    }

    #[test]
    fn rejects_json() {
        assert!(parse_pre_response(b"{\"result\":null}").is_none());
    }
}
