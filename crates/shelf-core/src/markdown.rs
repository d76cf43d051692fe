//! Markdown parsing and serialization with frontmatter support.
//!
//! Handles the conversion between raw note files and structured data
//! (frontmatter YAML + body text). Frontmatter keys keep their order so a
//! rendered note serializes to the same bytes every time.

use serde_yaml::{Mapping, Value};

/// Frontmatter as an ordered YAML mapping.
pub type Frontmatter = Mapping;

/// Parsed markdown document
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMarkdown {
    /// Frontmatter (None if absent, empty, or not valid YAML)
    pub frontmatter: Option<Frontmatter>,
    /// Markdown body (everything after frontmatter)
    pub body: String,
}

/// Split a note into its frontmatter YAML and body without parsing the YAML.
///
/// The block must open with `---` on the first line and close with a line that
/// is exactly `---`.
pub fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let after_open = match raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    {
        Some(rest) => rest,
        None => return (None, raw),
    };

    let mut pos = 0;
    for line in after_open.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed == "---" {
            let yaml = &after_open[..pos];
            let body = &after_open[pos + line.len()..];
            return (Some(yaml), body);
        }
        pos += line.len();
    }

    (None, raw)
}

/// Parse a note into frontmatter and body.
///
/// ```markdown
/// ---
/// shelf-id: mal:anime:1245
/// title: One Punch Man
/// ---
///
/// # Content here
/// ```
pub fn parse(content: &str) -> ParsedMarkdown {
    let (yaml, body) = split_frontmatter(content);
    let Some(yaml) = yaml else {
        return ParsedMarkdown {
            frontmatter: None,
            body: content.to_string(),
        };
    };

    let frontmatter = match serde_yaml::from_str::<Value>(yaml) {
        Ok(Value::Mapping(map)) if !map.is_empty() => Some(map),
        // Empty, scalar or invalid YAML: treat as no frontmatter
        _ => None,
    };

    ParsedMarkdown {
        frontmatter,
        body: body.trim_start_matches(['\n', '\r']).to_string(),
    }
}

/// Serialize frontmatter and body back to markdown.
pub fn serialize(frontmatter: Option<&Frontmatter>, body: &str) -> String {
    match frontmatter {
        Some(fm) if !fm.is_empty() => {
            let yaml = serde_yaml::to_string(fm).unwrap_or_default();
            format!("---\n{}---\n\n{}", yaml, body)
        }
        _ => body.to_string(),
    }
}

/// Look up a frontmatter field as a string. Numbers are rendered as text.
pub fn field_str(frontmatter: &Frontmatter, key: &str) -> Option<String> {
    match frontmatter.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_frontmatter() {
        let content = r#"---
shelf-id: mal:anime:1245
tags:
  - anime
---

# One Punch Man

Body."#;

        let parsed = parse(content);
        let fm = parsed.frontmatter.expect("frontmatter");
        assert_eq!(field_str(&fm, "shelf-id").as_deref(), Some("mal:anime:1245"));
        assert!(parsed.body.starts_with("# One Punch Man"));
    }

    #[test]
    fn test_parse_without_frontmatter() {
        let content = "# Just a heading\n\nSome content.";
        let parsed = parse(content);
        assert!(parsed.frontmatter.is_none());
        assert_eq!(parsed.body, content);
    }

    #[test]
    fn test_unclosed_frontmatter_is_body() {
        let content = "---\ntitle: x\nno closing line";
        let parsed = parse(content);
        assert!(parsed.frontmatter.is_none());
        assert_eq!(parsed.body, content);
    }

    #[test]
    fn test_closing_delimiter_must_be_whole_line() {
        let content = "---\ntitle: a---b\n---\nbody";
        let (yaml, body) = split_frontmatter(content);
        assert_eq!(yaml, Some("title: a---b\n"));
        assert_eq!(body, "body");
    }

    #[test]
    fn test_invalid_yaml_treated_as_missing() {
        let parsed = parse("---\n: : :\n  - [\n---\nbody");
        assert!(parsed.frontmatter.is_none());
    }

    #[test]
    fn test_crlf_frontmatter() {
        let parsed = parse("---\r\nshelf-id: mal:manga:3\r\n---\r\nbody");
        let fm = parsed.frontmatter.unwrap();
        assert_eq!(field_str(&fm, "shelf-id").as_deref(), Some("mal:manga:3"));
        assert_eq!(parsed.body, "body");
    }

    #[test]
    fn test_numeric_field_as_string() {
        let parsed = parse("---\nepisodes: 12\n---\n");
        let fm = parsed.frontmatter.unwrap();
        assert_eq!(field_str(&fm, "episodes").as_deref(), Some("12"));
        assert_eq!(field_str(&fm, "missing"), None);
    }

    #[test]
    fn test_serialize_keeps_key_order() {
        let mut fm = Frontmatter::new();
        fm.insert("shelf-id".into(), "mal:anime:1".into());
        fm.insert("title".into(), "Zeta".into());
        fm.insert("alpha".into(), "first?".into());

        let text = serialize(Some(&fm), "# Zeta\n");
        let id_pos = text.find("shelf-id").unwrap();
        let alpha_pos = text.find("alpha").unwrap();
        assert!(id_pos < alpha_pos);

        let parsed = parse(&text);
        assert_eq!(parsed.frontmatter.as_ref(), Some(&fm));
        assert_eq!(parsed.body, "# Zeta\n");
    }
}
