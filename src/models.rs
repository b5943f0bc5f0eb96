//! Plain data shared between configuration, the control surface and the loop

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A configured feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    pub url: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Feed {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// How a rule's pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Case-insensitive substring
    #[default]
    Substring,
    /// Regular expression, case-sensitive unless the pattern says `(?i)`
    Regex,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Substring => "substring",
            PatternKind::Regex => "regex",
        }
    }
}

/// Serializable form of a rule, as written in config and accepted by rule CRUD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    /// Owning feed id
    pub feed: String,
    pub pattern: String,
    #[serde(default)]
    pub pattern_kind: PatternKind,
    /// Items matching this are never dispatched under the rule
    #[serde(default)]
    pub exclude: Option<String>,
    /// Also test the pattern against the item link
    #[serde(default)]
    pub match_link: bool,
    #[serde(default)]
    pub save_path: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            feed: String::new(),
            pattern: String::new(),
            pattern_kind: PatternKind::Substring,
            exclude: None,
            match_link: false,
            save_path: None,
            category: None,
            enabled: true,
        }
    }
}

/// Parameters passed to the remote client with an add-download request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchParams {
    pub save_path: Option<String>,
    pub category: Option<String>,
}

/// A record of an acknowledged dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub rule_id: String,
    pub item_id: String,
    pub title: String,
    pub download_url: String,
    pub dispatched_at: Option<String>,
}

fn default_interval_secs() -> u64 {
    900
}

fn default_enabled() -> bool {
    true
}
