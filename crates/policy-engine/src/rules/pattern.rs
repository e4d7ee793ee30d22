//! Patterns used by rule conditions.
//!
//! Syntax:
//! - `regex:...` - regular expression
//! - contains `*` - wildcard, case-insensitive
//! - otherwise - exact match, case-insensitive

use regex::Regex;

use crate::error::PolicyLoadError;

#[derive(Debug, Clone)]
pub enum Pattern {
    Exact { original: String, lowered: String },
    Wildcard { original: String, regex: Regex },
    Regex { original: String, regex: Regex },
}

impl Pattern {
    pub fn compile(pattern: &str) -> Result<Self, PolicyLoadError> {
        let original = pattern.to_string();
        if let Some(expr) = pattern.strip_prefix("regex:") {
            let regex = build_regex(pattern, expr)?;
            return Ok(Pattern::Regex { original, regex });
        }
        if pattern.contains('*') {
            let regex = build_regex(pattern, &glob_to_regex(pattern))?;
            return Ok(Pattern::Wildcard { original, regex });
        }
        Ok(Pattern::Exact {
            lowered: pattern.to_lowercase(),
            original,
        })
    }

    pub fn matches(&self, input: &str) -> bool {
        match self {
            Pattern::Exact { lowered, .. } => input.to_lowercase() == *lowered,
            Pattern::Wildcard { regex, .. } | Pattern::Regex { regex, .. } => regex.is_match(input),
        }
    }

    /// The pattern as written in the rule script.
    pub fn original(&self) -> &str {
        match self {
            Pattern::Exact { original, .. }
            | Pattern::Wildcard { original, .. }
            | Pattern::Regex { original, .. } => original,
        }
    }
}

/// Anchored, case-insensitive expression where `*` spans any characters.
fn glob_to_regex(glob: &str) -> String {
    let body: Vec<String> = glob.split('*').map(regex::escape).collect();
    format!("(?is)^{}$", body.join(".*"))
}

fn build_regex(pattern: &str, expr: &str) -> Result<Regex, PolicyLoadError> {
    Regex::new(expr).map_err(|e| PolicyLoadError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, input: &str) -> bool {
        Pattern::compile(pattern).unwrap().matches(input)
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches("mysql", "MYSQL"));
        assert!(matches("/bin/*", "/bin/bash"));
        assert!(matches("*.jsp", "/var/www/shell.JSP"));
        assert!(matches("*nc*", "/usr/bin/nc.openbsd"));
        assert!(matches("*/.ssh/*", "/home/user/.ssh/id_rsa"));
        assert!(matches("a*b*c", "a-x-b-y-c"));
        assert!(!matches("a*b*c", "a-x-c-y-b"));
        assert!(!matches("/bin/*", "/usr/bin/bash"));
    }

    #[test]
    fn test_anchored_end_does_not_overlap_prefix() {
        assert!(!matches("ab*ba", "aba"));
        assert!(matches("ab*ba", "abba"));
    }

    #[test]
    fn test_exact_is_case_insensitive() {
        assert!(matches("169.254.169.254", "169.254.169.254"));
        assert!(!matches("169.254.169.254", "169.254.169.2540"));
    }

    #[test]
    fn test_regex_pattern() {
        let pattern = r"regex:(?:^|/)(?:ba|z|da|k)?sh\s+-c(?:\s|$)";
        assert!(matches(pattern, "/bin/sh -c id"));
        assert!(matches(pattern, "bash -c 'curl x | sh'"));
        assert!(!matches(pattern, "/usr/bin/ssh -c aes128 host"));
        assert!(!matches(pattern, "/bin/ls -c"));
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        assert!(matches("*.php?x=*", "/var/www/index.PHP?x=1"));
        assert!(!matches("*.php", "/var/www/indexphp"));
        assert!(matches("*(evil)*", "run (evil) now"));
    }

    #[test]
    fn test_original_keeps_operator_text() {
        for text in ["/Bin/*", "Localhost", "regex:^A"] {
            assert_eq!(Pattern::compile(text).unwrap().original(), text);
        }
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = Pattern::compile("regex:(unclosed").unwrap_err();
        assert!(matches!(err, PolicyLoadError::InvalidRegex { .. }));
    }
}
