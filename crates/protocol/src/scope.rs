use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical channel a stream connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    /// Platform-wide events.
    Global,
    /// Events of a single agent.
    Agent(String),
}

/// Error returned when a scope string cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid scope {0:?} (expected \"global\" or \"agent:<id>\")")]
pub struct ScopeParseError(pub String);

impl Scope {
    pub fn agent(id: impl Into<String>) -> Self {
        Self::Agent(id.into())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Self::Global);
        }
        match s.strip_prefix("agent:") {
            Some(id) if !id.is_empty() => Ok(Self::Agent(id.to_string())),
            _ => Err(ScopeParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}
