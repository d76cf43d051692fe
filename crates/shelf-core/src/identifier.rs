//! Identifier: Stable key naming a remote catalog item inside the vault.
//!
//! Identifiers have the form `provider:category:external-id`, for example
//! `mal:anime:1245`. They are written into each note's frontmatter and are the
//! key of the identifier index.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z][a-z0-9_-]*):([a-z][a-z0-9_-]*):([1-9][0-9]*)$")
        .expect("identifier grammar is a valid regex")
});

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("token grammar is a valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("Invalid identifier {input:?}: {reason}")]
    Format { input: String, reason: &'static str },
}

impl IdentifierError {
    fn format(input: impl Into<String>, reason: &'static str) -> Self {
        Self::Format {
            input: input.into(),
            reason,
        }
    }
}

/// A validated `provider:category:external-id` key.
///
/// # Examples
/// ```
/// use shelf_core::Identifier;
///
/// let id = Identifier::new("mal", "anime", 1245).unwrap();
/// assert_eq!(id.to_string(), "mal:anime:1245");
///
/// let parsed: Identifier = "mal:anime:1245".parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    provider: String,
    category: String,
    external_id: u64,
}

impl Identifier {
    /// Build an identifier from its parts, validating each one.
    pub fn new(
        provider: &str,
        category: &str,
        external_id: u64,
    ) -> Result<Self, IdentifierError> {
        let display = format!("{}:{}:{}", provider, category, external_id);
        if !TOKEN_RE.is_match(provider) {
            return Err(IdentifierError::format(display, "provider must be a lowercase token"));
        }
        if !TOKEN_RE.is_match(category) {
            return Err(IdentifierError::format(display, "category must be a lowercase token"));
        }
        if external_id == 0 {
            return Err(IdentifierError::format(display, "external id must be positive"));
        }
        Ok(Self {
            provider: provider.to_string(),
            category: category.to_string(),
            external_id,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn external_id(&self) -> u64 {
        self.external_id
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.category, self.external_id)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = IDENTIFIER_RE
            .captures(s)
            .ok_or_else(|| IdentifierError::format(s, "expected provider:category:id"))?;

        let external_id = caps[3]
            .parse::<u64>()
            .map_err(|_| IdentifierError::format(s, "external id out of range"))?;

        Ok(Self {
            provider: caps[1].to_string(),
            category: caps[2].to_string(),
            external_id,
        })
    }
}

impl TryFrom<&str> for Identifier {
    type Error = IdentifierError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// Serialize as the canonical string so frontmatter and JSON agree
impl serde::Serialize for Identifier {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Identifier {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
