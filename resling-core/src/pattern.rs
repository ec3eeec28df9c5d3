//! Resource patterns and group templates.
//!
//! A pattern is a dot-delimited sequence of segments: literals, `$name`
//! placeholders matching a single token, and a terminal `>` full wildcard
//! matching one or more trailing tokens. Patterns are validated when a
//! handler is registered; an invalid pattern is a programmer error and
//! panics at registration.

use std::collections::HashMap;

/// One parsed pattern segment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    /// Matches the token exactly.
    Literal(String),
    /// Matches any one non-empty token, binding it to the name.
    Param(String),
    /// Matches one or more trailing tokens. Only valid as the last segment.
    FullWildcard,
}

/// A validated resource pattern.
#[derive(Debug, Clone)]
pub(crate) struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Whether `c` may appear in a pattern segment or subject token.
fn valid_token_char(c: char) -> bool {
    !c.is_whitespace() && c != '.' && c != '*' && c != '?' && c != '>'
}

/// Validate a single concrete subject token (no placeholders, no wildcards).
pub(crate) fn valid_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(valid_token_char)
}

/// Validate a concrete dotted identifier such as a resource name, service
/// name, or connection ID. No wildcards, no empty tokens.
pub(crate) fn valid_dotted(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(valid_token)
}

impl Pattern {
    /// Parse and validate a pattern string.
    ///
    /// The empty pattern is the root: it addresses the router's own prefix
    /// with no extra tokens. Empty segments inside a non-empty pattern
    /// remain invalid.
    ///
    /// Returns an error message describing the violation; registration turns
    /// that into a panic.
    pub(crate) fn parse(raw: &str) -> Result<Pattern, String> {
        if raw.is_empty() {
            return Ok(Pattern {
                raw: String::new(),
                segments: Vec::new(),
            });
        }
        let tokens: Vec<&str> = raw.split('.').collect();
        let mut segments = Vec::with_capacity(tokens.len());
        let mut names: Vec<&str> = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(format!("pattern {:?} contains an empty segment", raw));
            }
            if *token == ">" {
                if i != tokens.len() - 1 {
                    return Err(format!(
                        "pattern {:?} has a full wildcard before the last segment",
                        raw
                    ));
                }
                segments.push(Segment::FullWildcard);
            } else if let Some(name) = token.strip_prefix('$') {
                if name.is_empty() {
                    return Err(format!("pattern {:?} has a placeholder with no name", raw));
                }
                if !name.chars().all(valid_token_char) {
                    return Err(format!(
                        "pattern {:?} has invalid characters in placeholder ${}",
                        raw, name
                    ));
                }
                if names.contains(&name) {
                    return Err(format!(
                        "pattern {:?} declares placeholder ${} twice",
                        raw, name
                    ));
                }
                names.push(name);
                segments.push(Segment::Param(name.to_string()));
            } else {
                if !token.chars().all(valid_token_char) {
                    return Err(format!(
                        "pattern {:?} has invalid characters in segment {:?}",
                        raw, token
                    ));
                }
                segments.push(Segment::Literal(token.to_string()));
            }
        }
        Ok(Pattern {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The pattern string as given at registration.
    pub(crate) fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the pattern declares the given placeholder name.
    pub(crate) fn has_param(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Param(n) if n == name))
    }

    /// Match a concrete subject against this pattern.
    ///
    /// On success returns the placeholder bindings and, when the pattern ends
    /// in a full wildcard, the matched remainder.
    pub(crate) fn matches(
        &self,
        subject: &str,
    ) -> Option<(HashMap<String, String>, Option<String>)> {
        if self.segments.is_empty() {
            // The root pattern matches the bare prefix and nothing else.
            if subject.is_empty() {
                return Some((HashMap::new(), None));
            }
            return None;
        }
        let tokens: Vec<&str> = subject.split('.').collect();
        let mut params = HashMap::new();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(lit) => {
                    if tokens.get(i)? != &lit.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let token = tokens.get(i)?;
                    if token.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), token.to_string());
                }
                Segment::FullWildcard => {
                    if tokens.len() <= i {
                        return None;
                    }
                    return Some((params, Some(tokens[i..].join("."))));
                }
            }
        }
        if tokens.len() != self.segments.len() {
            return None;
        }
        Some((params, None))
    }

    /// Re-bind captured placeholders (and wildcard remainder) into the
    /// pattern, producing the concrete subject it matched.
    pub(crate) fn resolve(
        &self,
        params: &HashMap<String, String>,
        rest: Option<&str>,
    ) -> Option<String> {
        let mut out = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push(lit.clone()),
                Segment::Param(name) => out.push(params.get(name)?.clone()),
                Segment::FullWildcard => out.push(rest?.to_string()),
            }
        }
        Some(out.join("."))
    }
}

/// One parsed group template part.
#[derive(Debug, Clone, PartialEq)]
enum GroupPart {
    Literal(String),
    Param(String),
}

/// A validated group template.
///
/// Literal text with `${name}` references to placeholders declared in the
/// owning pattern. `$name` without braces is not accepted.
#[derive(Debug, Clone)]
pub(crate) struct GroupTemplate {
    parts: Vec<GroupPart>,
}

impl GroupTemplate {
    /// Parse a group template, validating every reference against `pattern`.
    pub(crate) fn parse(raw: &str, pattern: &Pattern) -> Result<GroupTemplate, String> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('{') => {}
                _ => {
                    return Err(format!(
                        "group {:?} uses $ without braces; write ${{name}}",
                        raw
                    ));
                }
            }
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => name.push(c),
                    None => return Err(format!("group {:?} has an unterminated ${{", raw)),
                }
            }
            if name.is_empty() {
                return Err(format!("group {:?} has an empty ${{}} reference", raw));
            }
            if !pattern.has_param(&name) {
                return Err(format!(
                    "group {:?} references ${{{}}} which pattern {:?} does not declare",
                    raw,
                    name,
                    pattern.raw()
                ));
            }
            if !literal.is_empty() {
                parts.push(GroupPart::Literal(std::mem::take(&mut literal)));
            }
            parts.push(GroupPart::Param(name));
        }
        if !literal.is_empty() {
            parts.push(GroupPart::Literal(literal));
        }
        Ok(GroupTemplate { parts })
    }

    /// Expand the template against captured placeholder values.
    pub(crate) fn expand(&self, params: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                GroupPart::Literal(lit) => out.push_str(lit),
                GroupPart::Param(name) => {
                    if let Some(v) = params.get(name) {
                        out.push_str(v);
                    }
                }
            }
        }
        out
    }
}
