//! Failure-classification taxonomy.
//!
//! Raw gate output is matched line-by-line against an ordered rule list;
//! the first matching rule decides the category. Messages are normalized
//! (numbers and long paths collapsed) so recurring failures aggregate into
//! one pattern instead of one entry per line number.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed taxonomy of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    MissingReference,
    TypeMismatch,
    AssertionFailure,
    UndefinedSymbol,
    SyntaxError,
    StyleViolation,
    BrokenDownstream,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::MissingReference => "missing-reference",
            FailureCategory::TypeMismatch => "type-mismatch",
            FailureCategory::AssertionFailure => "assertion-failure",
            FailureCategory::UndefinedSymbol => "undefined-symbol",
            FailureCategory::SyntaxError => "syntax-error",
            FailureCategory::StyleViolation => "style-violation",
            FailureCategory::BrokenDownstream => "broken-downstream",
        }
    }

    /// All categories, in ranking order for context building.
    pub fn all() -> &'static [FailureCategory] {
        &[
            FailureCategory::MissingReference,
            FailureCategory::TypeMismatch,
            FailureCategory::AssertionFailure,
            FailureCategory::UndefinedSymbol,
            FailureCategory::SyntaxError,
            FailureCategory::StyleViolation,
            FailureCategory::BrokenDownstream,
        ]
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error compiling the classification rules.
#[derive(Error, Debug)]
#[error("invalid classification pattern: {0}")]
pub struct RuleError(#[from] regex::Error);

/// One compiled classification rule.
pub(crate) struct Rule {
    pattern: Regex,
    category: FailureCategory,
    remedy: &'static str,
}

/// A single classified line of raw failure output.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub category: FailureCategory,
    /// Normalized message, the aggregation key within the category.
    pub message: String,
    /// Default remedy recorded when a new pattern is created.
    pub remedy: String,
}

/// Ordered rule table; first match wins.
pub(crate) fn compile_rules() -> Result<Vec<Rule>, RuleError> {
    let table: &[(&str, FailureCategory, &str)] = &[
        (
            r"(unresolved import|cannot find (crate|module)|no such file|module not found)",
            FailureCategory::MissingReference,
            "check that the referenced module or file exists and is declared",
        ),
        (
            r"(mismatched types|expected .* found|type annotations needed|trait bound .* not satisfied)",
            FailureCategory::TypeMismatch,
            "align the value's type with the declared signature",
        ),
        (
            r"(assertion (`.*` )?failed|assert_eq!|panicked at|test .* FAILED)",
            FailureCategory::AssertionFailure,
            "re-check the expected behavior against the acceptance criteria",
        ),
        (
            r"(cannot find (value|function|type|method)|not found in (this scope|scope)|undefined (reference|symbol))",
            FailureCategory::UndefinedSymbol,
            "define or import the missing symbol before use",
        ),
        (
            r"(syntax error|unexpected token|expected one of|unclosed delimiter|parse error)",
            FailureCategory::SyntaxError,
            "fix the malformed construct before rerunning",
        ),
        (
            r"(clippy::|warning: unused|rustfmt|style|lint)",
            FailureCategory::StyleViolation,
            "apply the linter's suggested cleanup",
        ),
        (
            r"(downstream|dependent (test|crate|module)|broke .* depending|regression in)",
            FailureCategory::BrokenDownstream,
            "inspect consumers of the changed interface",
        ),
    ];

    table
        .iter()
        .map(|&(pattern, category, remedy)| {
            Ok(Rule {
                pattern: Regex::new(&format!("(?i){}", pattern))?,
                category,
                remedy,
            })
        })
        .collect()
}

/// Collapse volatile detail so recurring failures share one key.
pub(crate) fn normalize_message(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_was_digit = false;
    for ch in line.trim().chars() {
        if ch.is_ascii_digit() {
            if !last_was_digit {
                out.push('N');
            }
            last_was_digit = true;
        } else {
            last_was_digit = false;
            out.push(ch);
        }
    }
    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() > 160 {
        let mut end = 160;
        while !collapsed.is_char_boundary(end) {
            end -= 1;
        }
        collapsed[..end].to_string()
    } else {
        collapsed
    }
}

/// Classify raw output into the taxonomy, one entry per distinct
/// (category, normalized message) pair, in first-seen order.
pub(crate) fn classify(rules: &[Rule], raw: &str) -> Vec<Classified> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        for rule in rules {
            if rule.pattern.is_match(line) {
                let message = normalize_message(line);
                if seen.insert((rule.category, message.clone())) {
                    out.push(Classified {
                        category: rule.category,
                        message,
                        remedy: rule.remedy.to_string(),
                    });
                }
                break;
            }
        }
    }
    out
}
