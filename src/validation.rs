//! Input validation for `Task.prompt` and `Task.context` entries — the only
//! place the core touches the content of an opaque prompt string.
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;

use crate::constants::{MAX_CONTEXT_KEY_LENGTH, MAX_CONTEXT_VALUE_LENGTH, MAX_PROMPT_LENGTH};
use crate::error::WaahError;
use crate::Result;

static SAFE_PROMPT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
    "c:\\windows\\system32",
];

#[derive(Debug, Clone)]
pub struct PromptValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl PromptValidator {
    pub fn new() -> Result<Self> {
        let safe_content_regex = Regex::new(SAFE_PROMPT_REGEX)
            .map_err(|e| WaahError::Internal(anyhow::anyhow!("invalid regex pattern: {e}")))?;

        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();

        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    /// Returns the names of dangerous patterns found in `content`, for
    /// recording against a `security_events` row. Empty means clean.
    pub fn flag(&self, content: &str) -> Vec<String> {
        let lower = content.to_lowercase();
        self.dangerous_patterns
            .iter()
            .filter(|p| lower.contains(p.as_str()))
            .cloned()
            .collect()
    }

    pub fn validate_and_sanitize_prompt(&self, content: &str) -> Result<String> {
        if content.len() > MAX_PROMPT_LENGTH {
            return Err(WaahError::InvalidRouting(format!(
                "prompt exceeds maximum length of {MAX_PROMPT_LENGTH} characters"
            )));
        }

        if content.trim().is_empty() {
            return Err(WaahError::InvalidRouting("prompt cannot be empty".to_string()));
        }

        if !self.flag(content).is_empty() {
            return Err(WaahError::InvalidRouting(
                "prompt contains potentially dangerous patterns".to_string(),
            ));
        }

        if !self.safe_content_regex.is_match(content) {
            return Err(WaahError::InvalidRouting(
                "prompt contains invalid characters".to_string(),
            ));
        }

        Ok(encode_text(content).to_string())
    }

    pub fn validate_context_key(&self, key: &str) -> Result<()> {
        if key.is_empty() || key.len() > MAX_CONTEXT_KEY_LENGTH {
            return Err(WaahError::InvalidRouting(format!(
                "context key must be non-empty and under {MAX_CONTEXT_KEY_LENGTH} characters"
            )));
        }

        if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(WaahError::InvalidRouting(
                "context keys can only contain alphanumeric characters and underscores".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_and_sanitize_context_value(&self, value: &str) -> Result<String> {
        if value.len() > MAX_CONTEXT_VALUE_LENGTH {
            return Err(WaahError::InvalidRouting(format!(
                "context value exceeds maximum length of {MAX_CONTEXT_VALUE_LENGTH} characters"
            )));
        }

        if !self.flag(value).is_empty() {
            return Err(WaahError::InvalidRouting(
                "context value contains potentially dangerous patterns".to_string(),
            ));
        }

        Ok(encode_text(value).to_string())
    }
}

impl Default for PromptValidator {
    fn default() -> Self {
        Self::new().expect("static regex pattern is always valid")
    }
}
