//! Redaction
//!
//! Pure transform applied to user-supplied content immediately before it
//! is attached to a sink call. Full mode scrubs configured patterns out of
//! strings (recursively through JSON values); metadata-only mode replaces
//! content with a fixed placeholder; off passes content through.

use regex::Regex;
use serde_json::Value;

/// Placeholder inserted in place of scrubbed or withheld content.
pub const REDACTED_PLACEHOLDER: &str = "[redacted]";

/// How much content may leave the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedactionMode {
    /// Scrub configured patterns, keep the rest of the content.
    #[default]
    Full,
    /// Withhold content entirely; only structural metadata is exported.
    MetadataOnly,
    /// Export content untouched.
    Off,
}

/// Pattern-based content scrubber.
#[derive(Debug)]
pub struct Redactor {
    mode: RedactionMode,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Compile a redactor from raw pattern strings.
    pub fn new(mode: RedactionMode, patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { mode, patterns })
    }

    /// A pass-through redactor (off mode, no patterns).
    pub fn disabled() -> Self {
        Self {
            mode: RedactionMode::Off,
            patterns: Vec::new(),
        }
    }

    pub fn mode(&self) -> RedactionMode {
        self.mode
    }

    /// Redact a text payload according to the configured mode.
    pub fn text(&self, input: &str) -> String {
        match self.mode {
            RedactionMode::Off => input.to_owned(),
            RedactionMode::MetadataOnly => REDACTED_PLACEHOLDER.to_owned(),
            RedactionMode::Full => self.scrub(input),
        }
    }

    /// Redact a structured payload according to the configured mode.
    pub fn value(&self, input: &Value) -> Value {
        match self.mode {
            RedactionMode::Off => input.clone(),
            RedactionMode::MetadataOnly => Value::String(REDACTED_PLACEHOLDER.to_owned()),
            RedactionMode::Full => self.scrub_value(input),
        }
    }

    fn scrub(&self, input: &str) -> String {
        let mut out = input.to_owned();
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, REDACTED_PLACEHOLDER).into_owned();
        }
        out
    }

    fn scrub_value(&self, input: &Value) -> Value {
        match input {
            Value::String(s) => Value::String(self.scrub(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.scrub_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.scrub_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api_key_redactor(mode: RedactionMode) -> Redactor {
        Redactor::new(mode, &[r"sk-[A-Za-z0-9]+".to_owned()]).unwrap()
    }

    #[test]
    fn test_full_mode_scrubs_patterns() {
        let redactor = api_key_redactor(RedactionMode::Full);
        let out = redactor.text("token sk-abc123 in text");
        assert_eq!(out, format!("token {REDACTED_PLACEHOLDER} in text"));
    }

    #[test]
    fn test_full_mode_scrubs_nested_values() {
        let redactor = api_key_redactor(RedactionMode::Full);
        let out = redactor.value(&json!({
            "args": ["sk-deadbeef", 7],
            "nested": {"note": "keep this"}
        }));
        assert_eq!(
            out,
            json!({
                "args": [REDACTED_PLACEHOLDER, 7],
                "nested": {"note": "keep this"}
            })
        );
    }

    #[test]
    fn test_metadata_only_replaces_content() {
        let redactor = api_key_redactor(RedactionMode::MetadataOnly);
        assert_eq!(redactor.text("anything"), REDACTED_PLACEHOLDER);
        assert_eq!(
            redactor.value(&json!({"a": 1})),
            Value::String(REDACTED_PLACEHOLDER.to_owned())
        );
    }

    #[test]
    fn test_off_mode_passes_through() {
        let redactor = api_key_redactor(RedactionMode::Off);
        assert_eq!(redactor.text("sk-abc"), "sk-abc");
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        assert!(Redactor::new(RedactionMode::Full, &["(unclosed".to_owned()]).is_err());
    }
}
