//! Stack filter pattern grammar (§3, §4.3's merge is unaffected by this but
//! the CLI surface and `SessionConfig` both carry a `FilterSpec`).
//!
//! A pattern is a disjunction of conjunctions. Each line is either the
//! literal token `OR`, which starts a new clause, or a predicate of the form
//! `KIND <regex>` where `KIND` is one of `SYM`, `EXEC`, `ANY`. Lines starting
//! with `#` (after trimming leading whitespace) are comments; blank lines are
//! ignored. The first clause starts implicitly at the first predicate line.

use std::fmt;
use std::path::PathBuf;

use regex::Regex;

use crate::error::{AdaptystError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Sym(String),
    Exec(String),
    Any(String),
}

impl Predicate {
    fn kind(&self) -> &'static str {
        match self {
            Predicate::Sym(_) => "SYM",
            Predicate::Exec(_) => "EXEC",
            Predicate::Any(_) => "ANY",
        }
    }

    fn pattern(&self) -> &str {
        match self {
            Predicate::Sym(p) | Predicate::Exec(p) | Predicate::Any(p) => p,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.pattern())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clause(pub Vec<Predicate>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPattern(pub Vec<Clause>);

impl FilterPattern {
    pub fn parse(text: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        let mut current = Clause::default();
        let mut current_started = false;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "OR" {
                if !current_started {
                    return Err(AdaptystError::User(format!(
                        "filter pattern line {}: 'OR' with no preceding clause",
                        lineno + 1
                    )));
                }
                clauses.push(std::mem::take(&mut current));
                current_started = false;
                continue;
            }

            let mut parts = line.splitn(2, char::is_whitespace);
            let kind = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("").trim();
            if rest.is_empty() {
                return Err(AdaptystError::User(format!(
                    "filter pattern line {}: missing regex after '{kind}'",
                    lineno + 1
                )));
            }
            // Validate the regex eagerly: "syntax error is fatal at load".
            Regex::new(rest).map_err(|e| {
                AdaptystError::User(format!(
                    "filter pattern line {}: invalid regex '{rest}': {e}",
                    lineno + 1
                ))
            })?;

            let predicate = match kind {
                "SYM" => Predicate::Sym(rest.to_string()),
                "EXEC" => Predicate::Exec(rest.to_string()),
                "ANY" => Predicate::Any(rest.to_string()),
                other => {
                    return Err(AdaptystError::User(format!(
                        "filter pattern line {}: unknown predicate kind '{other}'",
                        lineno + 1
                    )))
                }
            };
            current.0.push(predicate);
            current_started = true;
        }

        if current_started {
            clauses.push(current);
        } else if clauses.is_empty() {
            return Err(AdaptystError::User(
                "filter pattern is empty".to_string(),
            ));
        }

        Ok(FilterPattern(clauses))
    }

    /// Render back to the line-oriented format. Round-trips with `parse`
    /// modulo comments and whitespace (§8 round-trip law).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, clause) in self.0.iter().enumerate() {
            if i > 0 {
                out.push_str("OR\n");
            }
            for predicate in &clause.0 {
                out.push_str(&predicate.to_string());
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    None,
    Allow(FilterPattern),
    Deny(FilterPattern),
    Script(PathBuf),
}

impl FilterSpec {
    pub fn requires_mark_flag_host(&self) -> bool {
        !matches!(self, FilterSpec::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_clause() {
        let text = "# a comment\nSYM ^foo$\nEXEC bar.*\n";
        let pattern = FilterPattern::parse(text).unwrap();
        assert_eq!(pattern.0.len(), 1);
        assert_eq!(pattern.0[0].0.len(), 2);
        assert_eq!(pattern.0[0].0[0], Predicate::Sym("^foo$".to_string()));
    }

    #[test]
    fn parses_disjunction_preserving_order() {
        let text = "SYM a\nANY b\nOR\nEXEC c\n";
        let pattern = FilterPattern::parse(text).unwrap();
        assert_eq!(pattern.0.len(), 2);
        assert_eq!(pattern.0[0].0.len(), 2);
        assert_eq!(pattern.0[1].0, vec![Predicate::Exec("c".to_string())]);
    }

    #[test]
    fn round_trip_identity() {
        let text = "SYM a\nANY b\nOR\nEXEC c\n";
        let pattern = FilterPattern::parse(text).unwrap();
        let rendered = pattern.render();
        let reparsed = FilterPattern::parse(&rendered).unwrap();
        assert_eq!(pattern, reparsed);
    }

    #[test]
    fn rejects_bad_regex() {
        assert!(FilterPattern::parse("SYM (unterminated\n").is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(FilterPattern::parse("NOPE foo\n").is_err());
    }

    #[test]
    fn rejects_leading_or() {
        assert!(FilterPattern::parse("OR\nSYM a\n").is_err());
    }
}
