//! Label trigger configuration.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which handler a trigger dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Proposal,
    Approval,
    TaskExecution,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposal => "proposal",
            Self::Approval => "approval",
            Self::TaskExecution => "task_execution",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "proposal" | "planning" => Ok(Self::Proposal),
            "approval" => Ok(Self::Approval),
            "task_execution" | "execution" | "execute" => Ok(Self::TaskExecution),
            other => Err(format!("unknown handler '{other}'")),
        }
    }
}

/// Compiled label pattern: exact by default, glob when it contains `*` or `?`.
#[derive(Debug, Clone)]
pub enum LabelPattern {
    Exact(String),
    Glob { source: String, regex: Regex },
}

impl LabelPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        if !pattern.contains(['*', '?']) {
            return Ok(Self::Exact(pattern.to_string()));
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        Ok(Self::Glob {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    /// Case-sensitive match against a label name.
    pub fn matches(&self, label: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == label,
            Self::Glob { regex, .. } => regex.is_match(label),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Glob { source: s, .. } => s,
        }
    }

    pub fn is_glob(&self) -> bool {
        matches!(self, Self::Glob { .. })
    }
}

/// One configured trigger. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct LabelTrigger {
    /// Key of the trigger in the configuration
    pub name: String,
    pub pattern: LabelPattern,
    pub handler: HandlerKind,
    pub ai_enabled: bool,
    pub remove_on_complete: bool,
    pub success_label: Option<String>,
}

impl LabelTrigger {
    /// The label to apply when synthesizing an event for this trigger.
    pub fn exact_label(&self) -> Option<&str> {
        match &self.pattern {
            LabelPattern::Exact(label) => Some(label),
            LabelPattern::Glob { .. } => None,
        }
    }

    pub fn matches(&self, label: &str) -> bool {
        self.pattern.matches(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_is_case_sensitive() {
        let p = LabelPattern::compile("needs-planning").unwrap();
        assert!(!p.is_glob());
        assert!(p.matches("needs-planning"));
        assert!(!p.matches("Needs-Planning"));
        assert!(!p.matches("needs-planning-now"));
    }

    #[test]
    fn test_glob_is_anchored() {
        let p = LabelPattern::compile("exec*").unwrap();
        assert!(p.is_glob());
        assert!(p.matches("execute"));
        assert!(p.matches("exec"));
        assert!(!p.matches("re-execute"));

        let q = LabelPattern::compile("v?.approved").unwrap();
        assert!(q.matches("v1.approved"));
        assert!(!q.matches("v1xapproved"));
        assert!(!q.matches("v12.approved"));
    }

    #[test]
    fn test_handler_kind_parse() {
        assert_eq!("task_execution".parse(), Ok(HandlerKind::TaskExecution));
        assert_eq!("task-execution".parse(), Ok(HandlerKind::TaskExecution));
        assert_eq!("Proposal".parse(), Ok(HandlerKind::Proposal));
        assert!("deploy".parse::<HandlerKind>().is_err());
    }
}
