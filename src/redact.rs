//! Secret redaction applied to tool inputs on their way to the audit log.
//!
//! Redactors are pure transformations over JSON values: strings are scrubbed,
//! other scalars pass through unchanged, arrays are redacted element-wise with
//! order preserved, and object values are redacted recursively with keys kept
//! intact. The value returned to the caller of a guarded tool is never
//! redacted — only the copy bound for the audit sink is.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

/// Canonical replacement marker for redacted content.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// A pure transformer that masks sensitive content in a JSON value.
pub trait Redactor: Send + Sync {
    /// Produce a copy of `value` with sensitive content replaced by
    /// [`REDACTION_MARKER`].
    fn redact(&self, value: &Value) -> Value;
}

// ---------------------------------------------------------------------------
// Pattern-based redaction
// ---------------------------------------------------------------------------

/// Redacts string values matching an ordered list of secret-shaped patterns.
///
/// Patterns are applied in sequence; each match is replaced with
/// [`REDACTION_MARKER`]. A second pass over already-redacted text is a no-op
/// because the marker matches none of the default patterns.
#[derive(Debug, Clone)]
pub struct PatternRedactor {
    patterns: Vec<Regex>,
}

impl PatternRedactor {
    /// Create a pattern redactor from pre-compiled regular expressions.
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Compile a redactor from pattern strings, skipping any that fail to
    /// compile.
    pub fn from_patterns(patterns: &[&str]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        }
    }

    /// Apply every pattern in order to a single string.
    fn scrub(&self, text: &str) -> String {
        let mut sanitized = text.to_owned();
        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, REDACTION_MARKER)
                .to_string();
        }
        sanitized
    }
}

impl Default for PatternRedactor {
    fn default() -> Self {
        Self::from_patterns(DEFAULT_PATTERNS)
    }
}

impl Redactor for PatternRedactor {
    fn redact(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.scrub(text)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| (key.clone(), self.redact(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Default secret-shaped patterns, applied in order.
///
/// Vendor-specific API key shapes come first so their prefixes are consumed
/// before the generic long-token pattern runs.
const DEFAULT_PATTERNS: &[&str] = &[
    // Vendor API keys
    r"sk-ant-[A-Za-z0-9_\-]{10,}",
    r"sk-[A-Za-z0-9]{32,}",
    r"ghp_[A-Za-z0-9]{20,}",
    r"glpat-[A-Za-z0-9_\-]{16,}",
    r"xoxb-[A-Za-z0-9\-]{20,}",
    r"AKIA[0-9A-Z]{16}",
    // Generic long opaque tokens
    r"\b[A-Za-z0-9]{32,}\b",
    // Private key material
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
    // PII: email, SSN-shaped, card-shaped
    r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}",
    r"\b\d{3}-\d{2}-\d{4}\b",
    r"\b\d{16}\b",
];

// ---------------------------------------------------------------------------
// Field-based redaction
// ---------------------------------------------------------------------------

/// Redacts object values under sensitive field names.
///
/// Field names match case-insensitively at every nesting depth. A matching
/// key has its entire value replaced by [`REDACTION_MARKER`] without
/// recursing into it; sibling keys are redacted recursively as usual.
#[derive(Debug, Clone)]
pub struct FieldRedactor {
    /// Lowercased field names to mask.
    fields: HashSet<String>,
}

impl FieldRedactor {
    /// Create a field redactor masking the given field names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.into().to_lowercase())
                .collect(),
        }
    }

    /// A redactor covering commonly sensitive credential field names.
    pub fn sensitive_defaults() -> Self {
        Self::new([
            "password",
            "passphrase",
            "secret",
            "token",
            "api_key",
            "apikey",
            "authorization",
            "credential",
            "private_key",
        ])
    }
}

impl Redactor for FieldRedactor {
    fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| {
                        if self.fields.contains(&key.to_lowercase()) {
                            (key.clone(), Value::String(REDACTION_MARKER.to_owned()))
                        } else {
                            (key.clone(), self.redact(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Ordered composition of redactors.
///
/// Each stage sees the previous stage's output, so field-based removal can
/// run before or after pattern scrubbing depending on construction order.
#[derive(Clone)]
pub struct RedactorChain {
    stages: Vec<Arc<dyn Redactor>>,
}

impl RedactorChain {
    /// Compose the given redactors in order.
    pub fn new(stages: Vec<Arc<dyn Redactor>>) -> Self {
        Self { stages }
    }
}

impl std::fmt::Debug for RedactorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedactorChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl Redactor for RedactorChain {
    fn redact(&self, value: &Value) -> Value {
        let mut current = value.clone();
        for stage in &self.stages {
            current = stage.redact(&current);
        }
        current
    }
}

/// The default redactor used by the guard pipeline when none is supplied:
/// the full default pattern set, no field-based masking.
pub fn default_redactor() -> Arc<dyn Redactor> {
    Arc::new(PatternRedactor::default())
}
