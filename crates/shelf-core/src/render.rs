//! Note rendering: catalog item -> markdown text.
//!
//! A rendered note has frontmatter holding the identifier, the title and the
//! item's fields (in that order), and a body produced from a template with
//! `{{field}}` placeholders. Re-rendering onto an existing note only replaces
//! the keys the renderer manages; keys the user added and the user's body are
//! kept.

use crate::catalog::CatalogItem;
use crate::identifier::Identifier;
use crate::index::DEFAULT_ID_FIELD;
use crate::markdown::{self, Frontmatter};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_yaml::Value;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\s*\}\}").expect("placeholder grammar is a valid regex")
});

/// Characters that are unsafe in file names or break wiki links.
const RESERVED_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '#', '^', '[', ']'];

pub const DEFAULT_BODY_TEMPLATE: &str = "# {{title}}\n";

#[derive(Debug, Clone)]
pub struct NoteRenderer {
    id_field: String,
    body_template: String,
}

impl Default for NoteRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FIELD, DEFAULT_BODY_TEMPLATE)
    }
}

impl NoteRenderer {
    pub fn new(id_field: impl Into<String>, body_template: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            body_template: body_template.into(),
        }
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Frontmatter keys written by the renderer, in output order.
    fn frontmatter(&self, id: &Identifier, item: &CatalogItem) -> Frontmatter {
        let mut fm = Frontmatter::new();
        fm.insert(self.id_field.as_str().into(), id.to_string().into());
        fm.insert("title".into(), item.title.as_str().into());
        for (key, value) in &item.fields {
            if key.as_str() == Some(self.id_field.as_str()) || key.as_str() == Some("title") {
                continue;
            }
            fm.insert(key.clone(), value.clone());
        }
        fm
    }

    /// Fill the body template from the item.
    pub fn render_body(&self, id: &Identifier, item: &CatalogItem) -> String {
        PLACEHOLDER_RE
            .replace_all(&self.body_template, |caps: &Captures| {
                match &caps[1] {
                    "id" => id.to_string(),
                    "title" => item.title.clone(),
                    "platform" => item.platform.clone(),
                    "category" => item.category.clone(),
                    key => item.fields.get(key).map(display_value).unwrap_or_default(),
                }
            })
            .into_owned()
    }

    /// Full text of a new note for `item`.
    pub fn render(&self, id: &Identifier, item: &CatalogItem) -> String {
        markdown::serialize(Some(&self.frontmatter(id, item)), &self.render_body(id, item))
    }

    /// Text of an existing note after applying `item`.
    ///
    /// Managed keys are rewritten in their usual order, followed by any other
    /// keys already present. A non-empty existing body is kept as is.
    pub fn render_onto(&self, existing: &str, id: &Identifier, item: &CatalogItem) -> String {
        let parsed = markdown::parse(existing);
        let mut fm = self.frontmatter(id, item);
        if let Some(previous) = parsed.frontmatter {
            for (key, value) in previous {
                if !fm.contains_key(&key) {
                    fm.insert(key, value);
                }
            }
        }
        let body = if parsed.body.trim().is_empty() {
            self.render_body(id, item)
        } else {
            parsed.body
        };
        markdown::serialize(Some(&fm), &body)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Sequence(items) => items
            .iter()
            .map(display_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Tagged(tagged) => display_value(&tagged.value),
        Value::Null | Value::Mapping(_) => String::new(),
    }
}

/// File name (with `.md`) for a note titled `title`.
///
/// Reserved characters become spaces, whitespace runs collapse, and leading
/// dots are dropped so the note never lands in a hidden path. Falls back to
/// `fallback` when nothing printable is left.
pub fn note_file_name(title: &str, fallback: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if RESERVED_CHARS.contains(&c) || c.is_control() {
                ' '
            } else {
                c
            }
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let stem = collapsed.trim_start_matches('.').trim();
    let stem = if stem.is_empty() {
        fallback.replace(RESERVED_CHARS, "-")
    } else {
        stem.to_string()
    };
    format!("{}.md", stem)
}
