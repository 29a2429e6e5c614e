//! Assertion rule parser
//!
//! Three textual forms are accepted:
//!
//! - `path=value` -- exact, case-sensitive equality
//! - `path=~pattern` -- unanchored regular expression search
//! - `path exists` -- the path resolves to any value
//!
//! Any input containing `=` is an equality or regex rule; everything else
//! must be the `exists` form.

use regex::Regex;
use thiserror::Error;

use super::path::JsonPath;
use super::{Assertion, Operator};

/// Why an assertion rule was rejected.
#[derive(Debug, Error)]
pub enum AssertionErrorKind {
    /// Blank input
    #[error("assertion cannot be empty")]
    Empty,

    /// Nothing before `=` or `exists`
    #[error("missing path before '{0}'")]
    MissingPath(&'static str),

    /// Nothing after `=`
    #[error("missing value after '='")]
    MissingValue,

    /// Nothing after `=~`
    #[error("missing regex pattern after '=~'")]
    MissingPattern,

    /// The pattern does not compile
    #[error("invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// Not one of the three forms
    #[error("expected 'path=value', 'path=~regex', or 'path exists'")]
    Malformed,
}

/// A rejected assertion rule together with the text the user supplied.
#[derive(Debug, Error)]
#[error("invalid assertion {input:?}: {kind}")]
pub struct AssertionError {
    /// The rule as supplied
    pub input: String,
    /// What was wrong with it
    pub kind: AssertionErrorKind,
}

impl AssertionError {
    fn new(input: &str, kind: AssertionErrorKind) -> Self {
        Self {
            input: input.to_string(),
            kind,
        }
    }
}

/// Parse one rule. `exit_code` is reported when the rule matches.
///
/// # Examples
///
/// ```
/// use gh_pulse::assertion::parse_assertion;
///
/// let rule = parse_assertion("action=~^(closed|merged)$", 0).unwrap();
/// assert_eq!(rule.to_string(), "action=~^(closed|merged)$");
///
/// assert!(parse_assertion("=value", 0).is_err());
/// ```
pub fn parse_assertion(input: &str, exit_code: i32) -> Result<Assertion, AssertionError> {
    let fail = |kind| AssertionError::new(input, kind);

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(fail(AssertionErrorKind::Empty));
    }

    if let Some((path, value)) = trimmed.split_once('=') {
        let path = path.trim();
        let value = value.trim();
        if path.is_empty() {
            return Err(fail(AssertionErrorKind::MissingPath("=")));
        }
        if value.is_empty() {
            return Err(fail(AssertionErrorKind::MissingValue));
        }

        let operator = match value.strip_prefix('~') {
            Some(pattern) => {
                let pattern = pattern.trim();
                if pattern.is_empty() {
                    return Err(fail(AssertionErrorKind::MissingPattern));
                }
                let regex = Regex::new(pattern).map_err(|e| fail(e.into()))?;
                Operator::Regex(regex)
            }
            None => Operator::Equals(value.to_string()),
        };

        return Ok(Assertion::new(JsonPath::new(path), operator, exit_code));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [path, "exists"] => Ok(Assertion::new(JsonPath::new(path), Operator::Exists, exit_code)),
        ["exists"] => Err(fail(AssertionErrorKind::MissingPath("exists"))),
        _ => Err(fail(AssertionErrorKind::Malformed)),
    }
}

/// Parse a list of rules that all report the same exit code.
///
/// Stops at the first invalid rule.
pub fn parse_assertions<S: AsRef<str>>(
    inputs: &[S],
    exit_code: i32,
) -> Result<Vec<Assertion>, AssertionError> {
    inputs
        .iter()
        .map(|input| parse_assertion(input.as_ref(), exit_code))
        .collect()
}
