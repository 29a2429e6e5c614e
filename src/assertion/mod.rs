//! Exit-condition assertions over incoming events
//!
//! An [`Assertion`] pairs a [`JsonPath`] with an [`Operator`] and the exit
//! code to report when it matches. A stream session holds an
//! [`AssertionSet`]: success rules are checked before failure rules and the
//! first rule that matches decides the exit code.
//!
//! # Modules
//!
//! - [`path`]: path resolution and scalar rendering
//! - [`parser`]: the textual rule grammar

pub mod parser;
pub mod path;

use std::fmt;

use regex::Regex;
use serde_json::Value;

pub use parser::{parse_assertion, parse_assertions, AssertionError, AssertionErrorKind};
pub use path::{stringify_scalar, JsonPath};

/// Exit code reported by success rules.
pub const SUCCESS_EXIT_CODE: i32 = 0;

/// Exit code reported by failure rules.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// How an assertion compares the value found at its path.
#[derive(Debug, Clone)]
pub enum Operator {
    /// Stringified scalar equals the literal exactly
    Equals(String),
    /// Pattern finds a match anywhere in the stringified scalar
    Regex(Regex),
    /// Path resolves to anything, including objects and arrays
    Exists,
}

/// One parsed, immutable exit rule.
#[derive(Debug, Clone)]
pub struct Assertion {
    path: JsonPath,
    operator: Operator,
    exit_code: i32,
}

impl Assertion {
    /// Build a rule from parts. Most callers use [`parse_assertion`].
    pub fn new(path: JsonPath, operator: Operator, exit_code: i32) -> Self {
        Self {
            path,
            operator,
            exit_code,
        }
    }

    /// The path this rule inspects.
    pub fn path(&self) -> &JsonPath {
        &self.path
    }

    /// The comparison operator.
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// The literal or pattern text; `None` for `exists`.
    pub fn value(&self) -> Option<&str> {
        match &self.operator {
            Operator::Equals(value) => Some(value),
            Operator::Regex(regex) => Some(regex.as_str()),
            Operator::Exists => None,
        }
    }

    /// Exit code to report when this rule matches.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Evaluate the rule against an event envelope.
    ///
    /// # Examples
    ///
    /// ```
    /// use gh_pulse::assertion::parse_assertion;
    /// use serde_json::json;
    ///
    /// let rule = parse_assertion("payload.state=~closed", 0).unwrap();
    /// assert!(rule.matches(&json!({"payload": {"state": "closed_merged"}})));
    /// assert!(!rule.matches(&json!({"payload": {"state": "open"}})));
    /// ```
    pub fn matches(&self, document: &Value) -> bool {
        let Some(found) = self.path.resolve(document) else {
            return false;
        };

        match &self.operator {
            Operator::Exists => true,
            Operator::Equals(expected) => {
                stringify_scalar(found).is_some_and(|actual| actual == *expected)
            }
            Operator::Regex(regex) => {
                stringify_scalar(found).is_some_and(|actual| regex.is_match(&actual))
            }
        }
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operator {
            Operator::Equals(value) => write!(f, "{}={}", self.path, value),
            Operator::Regex(regex) => write!(f, "{}=~{}", self.path, regex.as_str()),
            Operator::Exists => write!(f, "{} exists", self.path),
        }
    }
}

/// Return the first rule in `rules` that matches `document`.
pub fn first_match<'a>(rules: &'a [Assertion], document: &Value) -> Option<&'a Assertion> {
    rules.iter().find(|rule| rule.matches(document))
}

/// Which list the deciding rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A success rule matched
    Success(i32),
    /// A failure rule matched
    Failure(i32),
}

impl Verdict {
    /// Exit code carried by the matching rule.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success(code) | Self::Failure(code) => *code,
        }
    }
}

/// Success and failure rules of one session.
#[derive(Debug, Clone, Default)]
pub struct AssertionSet {
    success: Vec<Assertion>,
    failure: Vec<Assertion>,
}

impl AssertionSet {
    /// Bundle already parsed rules.
    pub fn new(success: Vec<Assertion>, failure: Vec<Assertion>) -> Self {
        Self { success, failure }
    }

    /// Parse `--success-on` and `--failure-on` rules with their default exit codes.
    pub fn parse<S: AsRef<str>>(success: &[S], failure: &[S]) -> Result<Self, AssertionError> {
        Ok(Self::new(
            parse_assertions(success, SUCCESS_EXIT_CODE)?,
            parse_assertions(failure, FAILURE_EXIT_CODE)?,
        ))
    }

    /// True when there are no rules at all.
    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.failure.is_empty()
    }

    /// Success rules, in evaluation order.
    pub fn success(&self) -> &[Assertion] {
        &self.success
    }

    /// Failure rules, in evaluation order.
    pub fn failure(&self) -> &[Assertion] {
        &self.failure
    }

    /// Decide whether `document` ends the session; success rules win ties.
    pub fn evaluate(&self, document: &Value) -> Option<Verdict> {
        if let Some(rule) = first_match(&self.success, document) {
            return Some(Verdict::Success(rule.exit_code()));
        }
        first_match(&self.failure, document).map(|rule| Verdict::Failure(rule.exit_code()))
    }
}
