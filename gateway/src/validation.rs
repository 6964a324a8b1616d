//! Input Validator (spec §4.3): a field-error accumulator plus the domain
//! checks surfaced to downstream handlers.

use std::collections::HashMap;

const AGENT_ID_MAX_LEN: usize = 128;
const TIME_RANGE_MAX_SECS: i64 = 90 * 24 * 3600;

#[derive(Debug, Default, Clone)]
pub struct ValidationErrors {
    errors: HashMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &HashMap<String, Vec<String>> {
        &self.errors
    }

    pub fn require_non_blank(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.add(field, "must not be blank");
        }
    }

    pub fn require_len(&mut self, field: &str, value: &str, min: usize, max: usize) {
        let len = value.chars().count();
        if len < min {
            self.add(field, format!("must be at least {min} characters"));
        } else if len > max {
            self.add(field, format!("must be at most {max} characters"));
        }
    }

    pub fn require_range(&mut self, field: &str, value: i64, min: i64, max: i64) {
        if value < min || value > max {
            self.add(field, format!("must be between {min} and {max}"));
        }
    }

    pub fn require_pattern(&mut self, field: &str, value: &str, matches: bool) {
        if !matches {
            self.add(field, "does not match the required pattern");
        }
    }
}

/// Agent-ID: non-empty, <= 128 chars, `^[A-Za-z0-9][A-Za-z0-9._-]*$`.
pub fn is_valid_agent_id(value: &str) -> bool {
    if value.is_empty() || value.chars().count() > AGENT_ID_MAX_LEN {
        return false;
    }
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRangeError;

/// Validate a `[start, end]` window in seconds since epoch: both
/// non-negative, `start <= end`, span <= 90 days.
pub fn validate_time_range(start: i64, end: i64) -> Result<(), TimeRangeError> {
    if start < 0 || end < 0 || start > end || (end - start) > TIME_RANGE_MAX_SECS {
        return Err(TimeRangeError);
    }
    Ok(())
}

/// Strip every character outside `[A-Za-z0-9_]`. For values destined to be
/// interpolated into dynamically constructed database identifiers only —
/// never for user-facing free text.
pub fn sanitize_identifier(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Drop ASCII control characters except tab/LF/CR, and DEL; keep everything
/// else (including non-ASCII code points) untouched.
pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|&c| {
            let code = c as u32;
            if code == 0x7F {
                return false;
            }
            if code < 0x20 {
                return c == '\t' || c == '\n' || c == '\r';
            }
            true
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_accepts_expected_shapes() {
        assert!(is_valid_agent_id("a1"));
        assert!(is_valid_agent_id("agent-1.local_host"));
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id("-leading-dash"));
        assert!(!is_valid_agent_id("has space"));
        assert!(!is_valid_agent_id(&"a".repeat(129)));
        assert!(is_valid_agent_id(&"a".repeat(128)));
    }

    #[test]
    fn time_range_boundaries() {
        let ninety_days = 90 * 24 * 3600;
        assert!(validate_time_range(0, ninety_days).is_ok());
        assert!(validate_time_range(0, ninety_days + 1).is_err());
        assert!(validate_time_range(10, 5).is_err());
        assert!(validate_time_range(-1, 10).is_err());
    }

    #[test]
    fn identifier_sanitisation_strips_disallowed_chars() {
        assert_eq!(sanitize_identifier("my-table; DROP"), "mytableDROP");
        assert_eq!(sanitize_identifier("col_1"), "col_1");
    }

    #[test]
    fn string_sanitisation_keeps_whitespace_and_unicode_drops_control_and_del() {
        let input = "hello\tworld\n\r\u{0007}\u{007F}café";
        let out = sanitize_string(input);
        assert_eq!(out, "hello\tworld\n\rcafé");
    }

    #[test]
    fn accumulator_tracks_field_errors() {
        let mut errors = ValidationErrors::new();
        assert!(!errors.has_errors());
        errors.require_non_blank("username", "   ");
        assert!(errors.has_errors());
        assert_eq!(errors.errors().get("username").unwrap().len(), 1);
    }
}
