// Subject grammar shared by the client, the broker and permission checks.
use crate::{Error, Result};

pub const TOKEN_SEPARATOR: char = '.';
/// Matches exactly one token.
pub const PARTIAL_WILDCARD: &str = "*";
/// Matches one or more trailing tokens. Only valid as the last token.
pub const FULL_WILDCARD: &str = ">";

pub fn tokens(subject: &str) -> impl Iterator<Item = &str> {
    subject.split(TOKEN_SEPARATOR)
}

fn has_whitespace(value: &str) -> bool {
    value.chars().any(char::is_whitespace)
}

/// Validate a subject used for publishing: non-empty tokens and no wildcards.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || has_whitespace(subject) {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    for token in tokens(subject) {
        if token.is_empty() || token == PARTIAL_WILDCARD || token == FULL_WILDCARD {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Validate a subscription or permission pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() || has_whitespace(pattern) {
        return Err(Error::InvalidSubject(pattern.to_string()));
    }
    let mut iter = tokens(pattern).peekable();
    while let Some(token) = iter.next() {
        if token.is_empty() {
            return Err(Error::InvalidSubject(pattern.to_string()));
        }
        if token == FULL_WILDCARD && iter.peek().is_some() {
            return Err(Error::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

/// True when the subject carries no wildcard tokens.
pub fn is_literal(subject: &str) -> bool {
    tokens(subject).all(|token| token != PARTIAL_WILDCARD && token != FULL_WILDCARD)
}

/// Check whether `pattern` covers `subject`.
///
/// A `subject` may itself hold wildcards, in which case this is a subset
/// test: a `*` token is covered only by `*` or `>`, and a `>` token only by
/// `>`. So `foo.*` is covered by `foo.>` or `foo.*`, while `foo.>` is not
/// covered by `foo.*`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = tokens(subject);
    let mut pattern_tokens = tokens(pattern).peekable();
    while let Some(expected) = pattern_tokens.next() {
        if expected == FULL_WILDCARD && pattern_tokens.peek().is_none() {
            // `>` needs at least one remaining token.
            return subject_tokens.next().is_some();
        }
        let Some(actual) = subject_tokens.next() else {
            return false;
        };
        if actual.is_empty() {
            return false;
        }
        let covered = if expected == PARTIAL_WILDCARD {
            actual != FULL_WILDCARD
        } else {
            expected == actual
        };
        if !covered {
            return false;
        }
    }
    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_subjects_reject_wildcards_and_empty_tokens() {
        assert!(validate_subject("foo.bar").is_ok());
        assert!(validate_subject("foo").is_ok());
        for bad in ["", "foo.", ".foo", "foo..bar", "foo.*", "foo.>", "foo bar", "\t"] {
            assert!(validate_subject(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn full_wildcard_only_last() {
        assert!(validate_pattern("foo.>").is_ok());
        assert!(validate_pattern(">").is_ok());
        assert!(validate_pattern("*.bar.*").is_ok());
        assert!(validate_pattern("foo.>.bar").is_err());
        assert!(validate_pattern(">.foo").is_err());
        assert!(validate_pattern("foo..bar").is_err());
    }

    #[test]
    fn full_wildcard_covers_every_continuation() {
        assert!(matches("foo.>", "foo.bar"));
        assert!(matches("foo.>", "foo.bar.baz.qux"));
        assert!(matches(">", "anything.at.all"));
        assert!(!matches("foo.>", "foo"));
        assert!(!matches("foo.>", "bar.baz"));
    }

    #[test]
    fn partial_wildcard_covers_exactly_one_token() {
        for value in ["a", "bar", "12345", "x-y_z"] {
            let subject = format!("foo.{value}.end");
            assert!(matches("foo.*.end", &subject));
        }
        assert!(!matches("foo.*", "foo"));
        assert!(!matches("foo.*", "foo.bar.baz"));
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(matches("foo.bar", "foo.bar"));
        assert!(!matches("foo.bar", "foo.baz"));
        assert!(!matches("foo.bar", "foo.bar.baz"));
        assert!(!matches("foo", "foo."));
    }

    #[test]
    fn wildcards_in_subject_are_literal_tokens() {
        assert!(matches("foo.>", "foo.*"));
        assert!(matches("foo.*", "foo.*"));
        assert!(!matches("foo.bar", "foo.*"));
        assert!(matches(">", ">"));
        assert!(matches("*", "*"));
        assert!(is_literal("foo.bar"));
        assert!(!is_literal("foo.*"));
    }

    #[test]
    fn wider_subject_pattern_is_not_covered() {
        assert!(!matches("foo.*", "foo.>"));
        assert!(!matches("*", ">"));
        assert!(!matches("*.bar", ">"));
        assert!(!matches("foo.bar", "foo.>"));
        assert!(matches("foo.>", "foo.>"));
        assert!(matches("foo.>", "foo.*.>"));
        assert!(matches("*.*", "foo.*"));
    }
}
